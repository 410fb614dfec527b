// ABOUTME: Connector flow laws - pure functions of water levels, storages, and node parameters
// ABOUTME: All kernels run on dual numbers so one code path serves the RHS, the Jacobian, and the allocation linearization

use crate::engine::core::math::Dual;
use crate::engine::physics::node::{
    LinearResistanceParams, ManningResistanceParams, RatingCurveParams, RegulatedParams,
    UserDemandParams,
};
use crate::engine::physics::smoothing::{
    low_storage_factor, reduction_factor, relaxed_sqrt, LEVEL_GATE_THRESHOLD_M,
    MANNING_RELAXATION,
};

/// Hydraulic conditions at a connector's two ends. Non-basin neighbors
/// (boundaries, terminals) report infinite storage so the low-storage
/// factor stays at one for them.
#[derive(Debug, Clone, Copy)]
pub struct ConnectorEnv {
    pub h_up: Dual,
    pub h_down: Dual,
    pub storage_up: Dual,
    pub storage_down: Dual,
    /// Channel invert levels [m], taken from the adjacent basin bottoms.
    pub bed_up: f64,
    pub bed_down: f64,
}

/// Q = Δh / R, clamped to ±max_flow_rate, with the donor side's
/// low-storage factor applied so the draining basin cannot go negative.
pub fn linear_resistance_flow(params: &LinearResistanceParams, env: &ConnectorEnv) -> Dual {
    if !params.active.get() {
        return Dual::ZERO;
    }
    let q = ((env.h_up - env.h_down) / params.resistance)
        .clamp(-params.max_flow_rate, params.max_flow_rate);
    let forward = q.max(Dual::ZERO) * low_storage_factor(env.storage_up);
    let backward = (-q).max(Dual::ZERO) * low_storage_factor(env.storage_down);
    forward - backward
}

/// Manning's equation on a trapezoidal cross-section, depths averaged
/// between both ends, with the signed square root relaxed near zero head
/// difference to stay C¹.
pub fn manning_resistance_flow(params: &ManningResistanceParams, env: &ConnectorEnv) -> Dual {
    let depth_up = (env.h_up - env.bed_up).max(Dual::ZERO);
    let depth_down = (env.h_down - env.bed_down).max(Dual::ZERO);
    let side = params.profile_slope;
    let width = params.profile_width;
    let wetted = |d: Dual| (d * side + width) * d;
    let perimeter = |d: Dual| d * (2.0 * (1.0 + side * side).sqrt()) + width;
    let area = (wetted(depth_up) + wetted(depth_down)) * 0.5;
    let perim = (perimeter(depth_up) + perimeter(depth_down)) * 0.5;
    let hydraulic_radius = area / perim;
    let gradient = (env.h_up - env.h_down) / params.length;
    area * hydraulic_radius.powf(2.0 / 3.0) * relaxed_sqrt(gradient, MANNING_RELAXATION)
        / params.manning_n
}

/// Q = f(h_up) through the active rating table; submerged crests never
/// draw water back upstream.
pub fn rating_curve_flow(params: &RatingCurveParams, env: &ConnectorEnv) -> Dual {
    let q = params
        .active_curve()
        .value_at_dual(env.h_up)
        .max(Dual::ZERO);
    q * low_storage_factor(env.storage_up)
}

/// Pump/Outlet: target rate clamped to capacity, scaled by the upstream
/// low-storage factor and the optional smoothed level gates.
pub fn regulated_flow(params: &RegulatedParams, target_rate: f64, env: &ConnectorEnv) -> Dual {
    if !params.active.get() {
        return Dual::ZERO;
    }
    let clamped = target_rate.clamp(params.min_flow_rate, params.max_flow_rate);
    let mut q = Dual::constant(clamped) * low_storage_factor(env.storage_up);
    if let Some(min_level) = params.min_upstream_level {
        q = q * reduction_factor(env.h_up - min_level, LEVEL_GATE_THRESHOLD_M);
    }
    if let Some(max_level) = params.max_downstream_level {
        q = q * reduction_factor(Dual::constant(max_level) - env.h_down, LEVEL_GATE_THRESHOLD_M);
    }
    q
}

/// UserDemand abstraction: the (possibly allocation-capped) demand,
/// shut down smoothly when the source empties or falls under min_level.
pub fn user_demand_flow(params: &UserDemandParams, t: f64, env: &ConnectorEnv) -> Dual {
    let mut q = Dual::constant(params.target_rate(t)) * low_storage_factor(env.storage_up);
    if let Some(min_level) = params.min_level {
        q = q * reduction_factor(env.h_up - min_level, LEVEL_GATE_THRESHOLD_M);
    }
    q
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::core::interp::{Extrapolation, Interpolation};
    use crate::engine::network::id::{NodeId, NodeType};
    use std::cell::Cell;

    fn env(h_up: f64, h_down: f64) -> ConnectorEnv {
        ConnectorEnv {
            h_up: Dual::constant(h_up),
            h_down: Dual::constant(h_down),
            storage_up: Dual::constant(f64::INFINITY),
            storage_down: Dual::constant(f64::INFINITY),
            bed_up: 0.0,
            bed_down: 0.0,
        }
    }

    #[test]
    fn linear_resistance_clamps_at_max_flow() {
        let params = LinearResistanceParams {
            node: NodeId::new(NodeType::LinearResistance, 1),
            resistance: 2.0,
            max_flow_rate: 3.0,
            active: Cell::new(true),
        };
        assert_eq!(
            linear_resistance_flow(&params, &env(4.0, 0.0)).re,
            2.0
        );
        assert_eq!(
            linear_resistance_flow(&params, &env(100.0, 0.0)).re,
            3.0
        );
        assert_eq!(
            linear_resistance_flow(&params, &env(0.0, 100.0)).re,
            -3.0
        );
    }

    #[test]
    fn linear_resistance_respects_donor_storage() {
        let params = LinearResistanceParams {
            node: NodeId::new(NodeType::LinearResistance, 1),
            resistance: 1.0,
            max_flow_rate: f64::INFINITY,
            active: Cell::new(true),
        };
        let mut dry = env(5.0, 0.0);
        dry.storage_up = Dual::constant(0.0);
        assert_eq!(linear_resistance_flow(&params, &dry).re, 0.0);
    }

    #[test]
    fn manning_flow_is_antisymmetric_in_head() {
        let params = ManningResistanceParams {
            node: NodeId::new(NodeType::ManningResistance, 1),
            length: 500.0,
            profile_width: 2.0,
            profile_slope: 1.0,
            manning_n: 0.03,
        };
        let forward = manning_resistance_flow(&params, &env(2.0, 1.0)).re;
        let backward = manning_resistance_flow(&params, &env(1.0, 2.0)).re;
        assert!(forward > 0.0);
        assert!((forward + backward).abs() < 1e-12);
    }

    #[test]
    fn rating_curve_never_flows_backwards() {
        let table = Interpolation::new(
            vec![0.0, 2.0],
            vec![0.0, 10.0],
            Extrapolation::Constant,
            Extrapolation::Linear,
            "test",
        )
        .unwrap();
        let params = RatingCurveParams {
            node: NodeId::new(NodeType::TabulatedRatingCurve, 1),
            tables: vec![("default".to_string(), table)],
            active: Cell::new(0),
        };
        assert_eq!(rating_curve_flow(&params, &env(-1.0, 0.0)).re, 0.0);
        assert_eq!(rating_curve_flow(&params, &env(1.0, 0.0)).re, 5.0);
    }

    #[test]
    fn regulated_gate_closes_below_min_upstream_level() {
        let params = RegulatedParams {
            node: NodeId::new(NodeType::Outlet, 1),
            rate: crate::engine::physics::node::ControllableRate::fixed(1.0),
            min_flow_rate: 0.0,
            max_flow_rate: f64::INFINITY,
            min_upstream_level: Some(5.0),
            max_downstream_level: None,
            active: Cell::new(true),
            pid_controlled: Cell::new(false),
            allocation_controlled: false,
        };
        assert_eq!(regulated_flow(&params, 1.0, &env(4.0, 0.0)).re, 0.0);
        assert_eq!(regulated_flow(&params, 1.0, &env(6.0, 0.0)).re, 1.0);
        // Inside the smoothing band the gate is partially open.
        let partial = regulated_flow(&params, 1.0, &env(5.01, 0.0)).re;
        assert!(partial > 0.0 && partial < 1.0);
    }
}
