// ABOUTME: Library interface for the hydronet network hydrological simulation engine
// ABOUTME: Exposes clean public API for external use while keeping internal organization

pub mod engine;

// Re-export key engine components for library users
pub use engine::{Config, HydronetError, ModelBuilder, ModelSpec, Simulation, SimulationOptions};
pub use engine::output::OutputStream;
