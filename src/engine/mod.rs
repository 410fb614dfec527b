// ABOUTME: Engine module organization - core simulation engine components
// ABOUTME: Provides clean internal structure for engine subsystems

pub mod allocation;
pub mod config;
pub mod control;
pub mod core;
pub mod network;
pub mod output;
pub mod physics;
pub mod solver;

// Main simulation struct - keep at engine level
pub mod sim;

pub use self::core::error::{HydronetError, ValidationIssue};
pub use config::Config;
pub use network::builder::{ModelBuilder, ModelSpec};
pub use sim::{Simulation, SimulationOptions};
