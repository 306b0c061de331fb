use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug, Clone)]
#[command(about = "Computes and publishes the network characteristics rules of a scenario")]
pub struct CliOpt {
    /// Path to the JSON file containing the scenario to activate
    #[arg(long)]
    pub scenario: PathBuf,

    /// Path to the JSON file listing the pods and services of the platform
    ///
    /// If not provided, every pod and service required by the scenario gets a generated address
    #[arg(long)]
    pub platform: Option<PathBuf>,

    /// Path to the JSON file containing the LB mapping (which instance serves each multi-group
    /// service, per pod)
    #[arg(long)]
    pub lb_mapping: Option<PathBuf>,

    /// The interval between two polls of the platform while discovery is in progress
    #[arg(long, default_value_t = 1000)]
    pub discovery_interval_ms: u64,

    /// Whether the run should be non-deterministic, i.e. using a non-constant seed for the random
    /// number generator
    #[arg(long)]
    pub non_deterministic: bool,

    /// The random seed used to generate addresses and throughput measurements
    #[arg(long, default_value_t = 42)]
    pub rng_seed: u64,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Print the topology and the pairwise network characteristics of the scenario
    Matrix,
    /// Print the shaping and load-balancing rules written for the scenario
    Rules(RulesOpt),
    /// Share bandwidth between the flows of the scenario for a number of periods
    BwSharing(BwSharingOpt),
}

#[derive(Parser, Debug, Clone)]
pub struct RulesOpt {
    /// Path to the JSON file containing an updated version of the scenario, activated once the
    /// first generation of rules is written
    #[arg(long)]
    pub scenario_update: Option<PathBuf>,
}

#[derive(Parser, Debug, Clone)]
pub struct BwSharingOpt {
    /// Path to the JSON file containing the bandwidth-sharing controls
    ///
    /// If not provided, sharing is started with the default settings
    #[arg(long)]
    pub controls: Option<PathBuf>,

    /// Path to the JSON file containing the throughput measured at each period
    ///
    /// If not provided, measurements are generated at random
    #[arg(long)]
    pub measurements: Option<PathBuf>,

    /// The number of recalculation periods to run
    #[arg(long, default_value_t = 5)]
    pub periods: u32,
}
