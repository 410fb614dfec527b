// ABOUTME: Solver stack - state layout, right-hand side, Jacobian machinery, and the implicit stepper
// ABOUTME: Everything here operates on one dense state vector of cumulative volumes

pub mod integrator;
pub mod jacobian;
pub mod rhs;
pub mod state;

pub use integrator::{Algorithm, Integrator, SolverOptions, SolverStats};
pub use jacobian::{JacobianEngine, JacobianMode};
pub use rhs::HydroSystem;
pub use state::{FlowEntry, FlowEntryKind, StateLayout, StateMap};
