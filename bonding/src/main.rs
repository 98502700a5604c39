use anyhow::{Context, Result};
use bonding_core::{BondRegistry, NullTransport, PeerIdentity, StaticInterfaces};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

mod cli;
mod config;
mod simulate;

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = <cli::Cli as clap::Parser>::parse();
    let config_path = match cli.config {
        Some(p) => p,
        None => config::default_config_path()?,
    };

    match cli.command {
        cli::Command::PrintConfigPath => {
            println!("{}", config_path.display());
            Ok(())
        }
        cli::Command::CheckConfig => {
            let cfg = config::load(&config_path)?;
            let registry = BondRegistry::from_config(
                PeerIdentity(0),
                Arc::new(StaticInterfaces::new()),
                Arc::new(NullTransport),
                &cfg,
            )
            .with_context(|| format!("invalid config: {}", config_path.display()))?;

            for policy in &cfg.policies {
                let params = policy.to_params()?;
                println!(
                    "{} (base {}): failover {}ms, monitor {}ms, {} link(s)",
                    policy.alias,
                    policy.base,
                    params.failover_interval(),
                    params.monitor_interval(),
                    registry.links().user_specified_links(&policy.alias).len()
                );
            }
            println!("default policy: {}", cfg.default_policy.as_deref().unwrap_or("none"));
            let raw = toml::to_string_pretty(&cfg).context("failed to serialize config to TOML")?;
            println!("---\n{raw}");
            Ok(())
        }
        cli::Command::Simulate(args) => {
            let cfg = config::load(&config_path)?;
            let report = simulate::run(&cfg, &args)?;
            simulate::print(&report);
            Ok(())
        }
    }
}
