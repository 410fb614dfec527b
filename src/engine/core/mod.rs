// ABOUTME: Core engine foundation - errors, interpolation, and differentiation primitives
// ABOUTME: Provides basic building blocks for all other engine components

pub mod error;
pub mod interp;
pub mod math;

// Re-export key types for convenience
pub use error::{HydronetError, ValidationIssue};
pub use interp::{Extrapolation, Interpolation};
pub use math::Dual;
