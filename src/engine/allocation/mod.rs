// ABOUTME: Allocation optimizer - goal-programming linear programs distributing water across priorities
// ABOUTME: One long-lived model per subnetwork; demand collection couples secondaries to the primary network

pub mod lp;
pub mod model;

pub use lp::{LinearProgram, LpError, Relation};
pub use model::{
    AllocationModel, AllocationOptions, AllocationOutcome, SolvePass, SourcePriorities,
};
