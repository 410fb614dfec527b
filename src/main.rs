// ABOUTME: CLI entry point - loads a TOML configuration and runs the simulation it describes
// ABOUTME: Exit code 0 on success, 1 on any validation, runtime, or allocation error

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use tracing::error;
use tracing_subscriber::EnvFilter;

use hydronet::engine::config::Config;
use hydronet::engine::network::builder::ModelBuilder;
use hydronet::engine::output::OutputStream;
use hydronet::engine::sim::{Simulation, SimulationOptions};

/// Network hydrological simulator.
#[derive(Debug, Parser)]
#[command(name = "hydronet", version, about)]
struct Cli {
    /// Path to the TOML configuration describing the simulation.
    toml_path: PathBuf,
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    match run(&cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(error) => {
            error!("{error}");
            eprintln!("error: {error}");
            ExitCode::FAILURE
        }
    }
}

fn run(cli: &Cli) -> Result<(), hydronet::HydronetError> {
    let config = Config::from_file(&cli.toml_path)?;

    let filter = EnvFilter::try_new(&config.logging.verbosity)
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let mut builder = ModelBuilder::from_spec(config.model.clone());
    if config.interpolation.flow_boundary == "block" {
        builder.block_flow_boundaries(config.interpolation.block_transition_period);
    }
    let built = builder.build()?;

    let options = SimulationOptions {
        t_end: config.duration_seconds()?,
        solver: config.solver_options(),
        saveat: config.solver.saveat,
        water_balance_abstol: config.solver.water_balance_abstol,
        water_balance_reltol: config.solver.water_balance_reltol,
        allocation: config
            .experimental
            .allocation
            .then(|| config.allocation_options()),
        subgrid_enabled: config.results.subgrid,
    };
    let output = OutputStream::disk(config.results_dir.clone())?;
    let mut simulation = Simulation::new(built, options, output)?;
    simulation.run()
}
