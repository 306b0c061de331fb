use crate::config::EngineInputs;
use crate::config::cli::CliOpt;
use clap::Parser;
use tracing_subscriber::EnvFilter;

mod config;
mod simulation;
mod util;

fn main() -> anyhow::Result<()> {
    // Logs go to stderr, stdout is reserved for the reports
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let options = CliOpt::parse();
    let inputs = EngineInputs::load(&options)?;

    // Paused time makes every run with the same inputs print the same report
    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .start_paused(true)
        .build()
        .expect("failed to initialize tokio");

    rt.block_on(simulation::run(&options, inputs))
}
