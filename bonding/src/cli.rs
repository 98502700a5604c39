use bonding_core::BondingPolicy;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Debug, Parser)]
#[command(
    name = "bonding",
    version,
    about = "Inspect bonding policy files and simulate bonded peers"
)]
pub struct Cli {
    /// Path to config file (TOML)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Print the resolved config file path
    PrintConfigPath,

    /// Parse the config file, apply it to an empty registry and print the result
    CheckConfig,

    /// Run a bond against simulated paths on a virtual clock
    Simulate(SimulateArgs),
}

#[derive(Debug, Clone, clap::Args)]
pub struct SimulateArgs {
    /// Base policy, or a policy alias from the config file
    #[arg(long, default_value = "balance-aware")]
    pub policy: String,

    /// Number of paths, one per simulated interface
    #[arg(long, default_value_t = 3)]
    pub paths: usize,

    /// Simulated duration in milliseconds
    #[arg(long, default_value_t = 60_000)]
    pub duration_ms: i64,

    /// Path (0-based) that goes silent at --fail-at
    #[arg(long)]
    pub fail_path: Option<usize>,

    /// When the failing path goes silent, in milliseconds
    #[arg(long, default_value_t = 20_000)]
    pub fail_at_ms: i64,

    /// Number of distinct flows carrying traffic
    #[arg(long, default_value_t = 16)]
    pub flows: i32,

    /// Seed for the bond and traffic generator
    #[arg(long, default_value_t = 1)]
    pub seed: u64,
}

impl SimulateArgs {
    pub fn base_policy(&self) -> Option<BondingPolicy> {
        self.policy.parse().ok()
    }
}
