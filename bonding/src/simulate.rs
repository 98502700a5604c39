//! Virtual-clock simulation of one bond over synthetic paths.

use anyhow::{bail, Context, Result};
use bonding_core::{
    BondRegistry, BondingConfig, BondingPolicy, PacketKind, Path, PathRef, PeerIdentity, PeerInfo,
    PeerTransport, QosRecord, StaticInterfaces,
};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::cli::SimulateArgs;

const STEP_MS: i64 = 10;
const PACKETS_PER_STEP: usize = 5;
const PACKET_LEN: u16 = 1200;

/// Counts the control messages the bond emits.
#[derive(Default)]
struct CountingTransport {
    sent: AtomicU64,
}

impl PeerTransport for CountingTransport {
    fn send_raw(&self, _peer: PeerIdentity, _path: &Path, _payload: &[u8]) {
        self.sent.fetch_add(1, Ordering::Relaxed);
    }
}

struct SimPath {
    path: PathRef,
    latency: i64,
    fail_at: Option<i64>,
    packets: u64,
    pending_acks: Vec<(i64, u64)>,
}

impl SimPath {
    fn up(&self, now: i64) -> bool {
        self.fail_at.map_or(true, |t| now < t)
    }
}

pub struct Report {
    pub policy: BondingPolicy,
    pub alias: String,
    pub total_packets: u64,
    pub unrouted: u64,
    pub control_messages: u64,
    pub paths: Vec<PathReport>,
    pub active_history: Vec<(i64, Option<SocketAddr>)>,
    pub healthy: bool,
}

pub struct PathReport {
    pub interface: String,
    pub address: SocketAddr,
    pub packets: u64,
    pub allocation: u8,
    pub latency_mean: f32,
    pub alive: bool,
    pub bonded: bool,
}

pub fn run(config: &BondingConfig, args: &SimulateArgs) -> Result<Report> {
    if args.paths == 0 {
        bail!("--paths must be at least 1");
    }
    if args.flows <= 0 {
        bail!("--flows must be positive");
    }

    let interfaces = (0..args.paths).fold(StaticInterfaces::new(), |r, i| {
        r.with(i as i64 + 1, format!("sim{i}"))
    });
    let transport = Arc::new(CountingTransport::default());
    let registry = BondRegistry::from_config(
        PeerIdentity(1),
        Arc::new(interfaces),
        transport.clone(),
        config,
    )
    .context("failed to apply config")?;

    let peer = PeerInfo::leaf(2);
    if let Some(base) = args.base_policy() {
        registry.set_default_policy(base);
    } else if registry.has_template(&args.policy) {
        registry.assign_policy_to_peer(peer.identity, &args.policy);
    } else {
        bail!("unknown policy or alias: {}", args.policy);
    }
    let bond = registry
        .get_or_create_bond(peer)
        .context("policy does not produce a bond")?;
    bond.reseed(args.seed);

    let mut paths: Vec<SimPath> = (0..args.paths)
        .map(|i| SimPath {
            path: Path::shared(
                i as i64 + 1,
                SocketAddr::from(([10, i as u8, 0, 1], 9993)),
                0,
            ),
            latency: 10 + 15 * i as i64,
            fail_at: (args.fail_path == Some(i)).then_some(args.fail_at_ms),
            packets: 0,
            pending_acks: Vec::new(),
        })
        .collect();
    for p in &paths {
        bond.nominate_path(&p.path, 0);
    }

    let mut rng = StdRng::seed_from_u64(args.seed);
    let mut packet_id: u64 = 0;
    let mut unrouted: u64 = 0;
    let mut next_tick: i64 = 0;
    let mut active_history: Vec<(i64, Option<SocketAddr>)> = Vec::new();

    let mut now: i64 = 0;
    while now <= args.duration_ms {
        for p in paths.iter_mut() {
            if p.up(now) {
                p.path.received(now);
            }
            let (due, later): (Vec<_>, Vec<_>) =
                p.pending_acks.drain(..).partition(|(at, _)| *at <= now);
            p.pending_acks = later;
            if !due.is_empty() && p.up(now) {
                let records: Vec<QosRecord> = due
                    .iter()
                    .map(|&(_, id)| QosRecord {
                        packet_id: id,
                        holding_time: 0,
                    })
                    .collect();
                bond.received_qos(&p.path, now, &records);
            }
        }

        if now >= next_tick {
            next_tick = now + i64::from(registry.tick(now)).max(STEP_MS);
        }

        let active = bond.active_path().map(|p| p.address());
        if active_history.last().map(|(_, a)| *a) != Some(active) {
            tracing::debug!(t = now, ?active, "active path changed");
            active_history.push((now, active));
        }

        for _ in 0..PACKETS_PER_STEP {
            let flow = rng.gen_range(0..args.flows);
            let targets: Vec<PathRef> = match bond.get_appropriate_path(now, Some(flow)) {
                Some(path) => vec![path],
                None if bond.policy() == BondingPolicy::Broadcast => bond.bonded_paths(),
                None => Vec::new(),
            };
            if targets.is_empty() {
                unrouted += 1;
            }
            packet_id += 1;
            for target in targets {
                bond.record_outgoing_packet(
                    &target,
                    packet_id,
                    PACKET_LEN,
                    PacketKind::Frame,
                    Some(flow),
                    now,
                );
                if let Some(p) = paths.iter_mut().find(|p| p.path.same_route(&target)) {
                    p.packets += 1;
                    if p.up(now) && packet_id % 2 == 1 {
                        p.pending_acks.push((now + p.latency, packet_id));
                    }
                }
            }
        }
        now += STEP_MS;
    }

    let status = bond.status();
    let by_address: HashMap<SocketAddr, _> =
        status.paths.iter().map(|s| (s.address, s)).collect();
    let reports = paths
        .iter()
        .map(|p| {
            let s = by_address.get(&p.path.address());
            PathReport {
                interface: s.map_or_else(|| "-".to_string(), |s| s.interface.clone()),
                address: p.path.address(),
                packets: p.packets,
                allocation: s.map_or(0, |s| s.allocation),
                latency_mean: s.map_or(0.0, |s| s.latency_mean),
                alive: s.is_some_and(|s| s.alive),
                bonded: s.is_some_and(|s| s.bonded),
            }
        })
        .collect();

    registry.shutdown();
    Ok(Report {
        policy: status.policy,
        alias: status.policy_alias,
        total_packets: packet_id,
        unrouted,
        control_messages: transport.sent.load(Ordering::Relaxed),
        paths: reports,
        active_history,
        healthy: status.healthy,
    })
}

pub fn print(report: &Report) {
    println!(
        "policy {} ({}), {} packets, {} unrouted, {} control messages, healthy={}",
        report.alias,
        report.policy,
        report.total_packets,
        report.unrouted,
        report.control_messages,
        report.healthy
    );
    println!(
        "{:<8} {:<18} {:>9} {:>7} {:>6} {:>9} {:>6} {:>6}",
        "iface", "address", "packets", "share", "alloc", "latency", "alive", "bonded"
    );
    for p in &report.paths {
        let share = if report.total_packets > 0 {
            100.0 * p.packets as f64 / report.total_packets as f64
        } else {
            0.0
        };
        println!(
            "{:<8} {:<18} {:>9} {:>6.1}% {:>6} {:>7.1}ms {:>6} {:>6}",
            p.interface,
            p.address,
            p.packets,
            share,
            p.allocation,
            p.latency_mean,
            p.alive,
            p.bonded
        );
    }
    if report.policy == BondingPolicy::ActiveBackup {
        println!("active path history:");
        for (t, active) in &report.active_history {
            match active {
                Some(addr) => println!("  {t:>8}ms  {addr}"),
                None => println!("  {t:>8}ms  (none)"),
            }
        }
    }
}
