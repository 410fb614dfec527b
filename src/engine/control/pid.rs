// ABOUTME: PID controller parameters: drives a pump or outlet toward a basin level target
// ABOUTME: The error integral lives in the state vector; the output closes into the target's cumulative flow slot

use std::cell::Cell;

use crate::engine::core::interp::Interpolation;
use crate::engine::network::id::{NodeId, NodeIndex};

/// Which kind of regulated node a PID controller drives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PidTargetKind {
    Pump,
    Outlet,
}

#[derive(Debug)]
pub struct PidControlParams {
    pub node: NodeId,
    /// Local index of the listened basin.
    pub listen_basin: usize,
    /// The controlled node and its local parameter index.
    pub target_node: NodeIndex,
    pub target_kind: PidTargetKind,
    pub target_local: usize,
    /// Index of the controlled node's flow entry in the state layout;
    /// the controller writes its output into that derivative slot.
    pub target_entry: usize,
    /// Level setpoint over time [m].
    pub target_level: Interpolation,
    /// Gains over time: K_p [m³/s per m], K_i [m³/s per m·s], K_d [m³].
    pub proportional: Interpolation,
    pub integral: Interpolation,
    pub derivative: Interpolation,
    pub active: Cell<bool>,
}
