//! Periodic driver for bond maintenance.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

use crate::registry::BondRegistry;
use crate::transport::MonotonicClock;

/// Tick `registry` until `stop` flips to `true` or its sender is dropped.
///
/// Each tick runs every bond's background tasks at `clock()` and sleeps for
/// the smallest monitor interval any bond asked for.
pub async fn run_maintenance<C>(
    registry: Arc<BondRegistry>,
    clock: C,
    mut stop: watch::Receiver<bool>,
) -> u64
where
    C: Fn() -> i64 + Send,
{
    let mut ticks: u64 = 0;
    tracing::info!("bond maintenance started");
    loop {
        if *stop.borrow() {
            break;
        }
        let next = registry.tick(clock());
        ticks += 1;
        tracing::trace!(ticks, next_ms = next, "maintenance tick");

        tokio::select! {
            _ = tokio::time::sleep(Duration::from_millis(u64::from(next))) => {}
            changed = stop.changed() => {
                if changed.is_err() || *stop.borrow() {
                    break;
                }
            }
        }
    }
    tracing::info!(ticks, "bond maintenance stopped");
    ticks
}

/// `run_maintenance` on a monotonic clock that reads zero at the first tick.
pub async fn run_maintenance_monotonic(
    registry: Arc<BondRegistry>,
    stop: watch::Receiver<bool>,
) -> u64 {
    let clock = MonotonicClock::new();
    run_maintenance(registry, move || clock.now_ms(), stop).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::control::StaticInterfaces;
    use crate::scheduler::BondingPolicy;
    use crate::transport::{NullTransport, PeerIdentity, PeerInfo};

    fn registry() -> Arc<BondRegistry> {
        Arc::new(BondRegistry::new(
            PeerIdentity(1),
            Arc::new(StaticInterfaces::new()),
            Arc::new(NullTransport),
        ))
    }

    #[tokio::test(start_paused = true)]
    async fn test_ticks_at_min_monitor_interval() {
        let registry = registry();
        registry.set_default_policy(BondingPolicy::ActiveBackup);
        let bond = registry.get_or_create_bond(PeerInfo::root(2)).unwrap();
        bond.set_failover_interval(1000);

        let (stop_tx, stop_rx) = watch::channel(false);
        let start = tokio::time::Instant::now();
        let clock = move || start.elapsed().as_millis() as i64;
        let handle = tokio::spawn(run_maintenance(registry.clone(), clock, stop_rx));

        tokio::time::sleep(Duration::from_millis(1100)).await;
        stop_tx.send(true).unwrap();
        let ticks = handle.await.unwrap();
        // t = 0, 250, 500, 750, 1000
        assert_eq!(ticks, 5);
        assert_eq!(registry.min_monitor_interval(), 250);
    }

    #[tokio::test(start_paused = true)]
    async fn test_monotonic_driver_ticks() {
        let registry = registry();
        registry.set_default_policy(BondingPolicy::ActiveBackup);
        let bond = registry.get_or_create_bond(PeerInfo::root(2)).unwrap();
        bond.set_failover_interval(1000);

        let (stop_tx, stop_rx) = watch::channel(false);
        let handle = tokio::spawn(run_maintenance_monotonic(registry.clone(), stop_rx));
        tokio::time::sleep(Duration::from_millis(600)).await;
        stop_tx.send(true).unwrap();
        // t = 0, 250, 500
        assert_eq!(handle.await.unwrap(), 3);
        assert_eq!(registry.min_monitor_interval(), 250);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stops_when_sender_dropped() {
        let (stop_tx, stop_rx) = watch::channel(false);
        let handle = tokio::spawn(run_maintenance(registry(), || 0, stop_rx));
        tokio::time::sleep(Duration::from_millis(10)).await;
        drop(stop_tx);
        assert_eq!(handle.await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_already_stopped() {
        let (_stop_tx, stop_rx) = watch::channel(true);
        assert_eq!(run_maintenance(registry(), || 0, stop_rx).await, 0);
    }
}
