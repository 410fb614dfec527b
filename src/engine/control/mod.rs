// ABOUTME: Control layer - discrete truth tables, continuous functional control, and PID setup
// ABOUTME: Control observes compound variables and patches node parameters; the ODE core only reads them

pub mod continuous;
pub mod discrete;
pub mod pid;

use crate::engine::network::id::NodeIndex;

pub use continuous::ContinuousControlParams;
pub use discrete::{CompoundVariable, ControlAction, DiscreteControlParams, SubVariable, Threshold};
pub use pid::PidControlParams;

/// Node variables a compound variable may listen to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenVariable {
    Level,
    Storage,
    FlowRate,
}

impl ListenVariable {
    pub fn as_str(&self) -> &'static str {
        match self {
            ListenVariable::Level => "level",
            ListenVariable::Storage => "storage",
            ListenVariable::FlowRate => "flow_rate",
        }
    }
}

/// Read access to the running simulation's observable quantities. The
/// simulation implements this; control code stays free of state layout
/// details.
pub trait ControlReadout {
    /// Value of `variable` at `node`, observed `look_ahead` seconds into
    /// the future for time-driven boundaries and at the current instant
    /// for everything else.
    fn observe(&self, node: NodeIndex, variable: ListenVariable, look_ahead: f64) -> f64;
}

/// All control node parameters, indexed by local node index.
#[derive(Debug, Default)]
pub struct ControlRegistry {
    pub discrete: Vec<DiscreteControlParams>,
    pub continuous: Vec<ContinuousControlParams>,
    pub pid: Vec<PidControlParams>,
}
