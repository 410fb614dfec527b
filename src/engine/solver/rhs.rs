// ABOUTME: Right-hand side assembly: storages from cumulative state, levels from profiles, flows per entry
// ABOUTME: One dual-number evaluation path serves plain derivatives, Jacobian columns, and allocation partials

use std::cell::RefCell;

use nalgebra::DVector;

use crate::engine::control::pid::PidControlParams;
use crate::engine::control::ControlRegistry;
use crate::engine::core::math::Dual;
use crate::engine::network::graph::NetworkGraph;
use crate::engine::network::id::{NodeIndex, NodeType};
use crate::engine::physics::flow::{
    linear_resistance_flow, manning_resistance_flow, rating_curve_flow, regulated_flow,
    user_demand_flow, ConnectorEnv,
};
use crate::engine::physics::node::NodeRegistry;
use crate::engine::physics::smoothing::{
    low_storage_factor, reduction_factor_value, LOW_STORAGE_THRESHOLD_M3,
};
use crate::engine::solver::state::{FlowEntry, FlowEntryKind, StateMap};

/// Everything the RHS needs to turn (t, u) into du. Borrowed immutably by
/// the integrator; interior mutability is confined to the parameter cells
/// the control layer writes and to `s0`, rewritten at each save.
pub struct HydroSystem<'a> {
    pub graph: &'a NetworkGraph,
    pub registry: &'a NodeRegistry,
    pub controls: &'a ControlRegistry,
    pub map: &'a StateMap,
    /// Basin storages at t = 0; `storage = s0 + F·u`.
    pub s0: &'a RefCell<Vec<f64>>,
    /// Per UserDemand local index, the index of its inflow entry.
    user_inflow_entries: Vec<usize>,
}

impl<'a> HydroSystem<'a> {
    pub fn new(
        graph: &'a NetworkGraph,
        registry: &'a NodeRegistry,
        controls: &'a ControlRegistry,
        map: &'a StateMap,
        s0: &'a RefCell<Vec<f64>>,
    ) -> Self {
        let mut user_inflow_entries = vec![usize::MAX; registry.user_demands.len()];
        for (i, entry) in map.layout.flow_entries.iter().enumerate() {
            if entry.kind == FlowEntryKind::UserInflow {
                user_inflow_entries[entry.local] = i;
            }
        }
        Self {
            graph,
            registry,
            controls,
            map,
            s0,
            user_inflow_entries,
        }
    }

    pub fn n_states(&self) -> usize {
        self.map.layout.total
    }

    pub fn storages(&self, u: &DVector<f64>) -> Vec<f64> {
        self.map.storages(&self.s0.borrow(), u)
    }

    /// Full derivative evaluation.
    pub fn eval(&self, t: f64, u: &DVector<f64>, du: &mut DVector<f64>) {
        let storages = self.storages(u);
        let layout = &self.map.layout;

        for (b, basin) in self.registry.basins.iter().enumerate() {
            let rho = reduction_factor_value(storages[b], LOW_STORAGE_THRESHOLD_M3);
            let level = basin.profile.level_from_storage(storages[b]);
            du[layout.precipitation_index(b)] =
                basin.precipitation.value_at(t) * basin.profile.max_area();
            du[layout.evaporation_index(b)] =
                basin.potential_evaporation.value_at(t) * basin.profile.area_from_level(level) * rho;
            du[layout.drainage_index(b)] = basin.drainage.value_at(t);
            du[layout.infiltration_index(b)] = basin.infiltration.value_at(t) * rho;
        }

        for (i, entry) in layout.flow_entries.iter().enumerate() {
            let rate = self.entry_rate(entry, t, &storages, None, du).re;
            du[layout.flow_index(i)] = rate;
        }

        for (k, pid) in self.controls.pid.iter().enumerate() {
            self.apply_pid(k, pid, t, u, &storages, du);
        }
    }

    /// Instantaneous rate of one flow entry as a dual number. When
    /// `seed_basin` is set, the returned `eps` is the partial derivative
    /// of the rate with respect to that basin's storage.
    pub fn entry_rate(
        &self,
        entry: &FlowEntry,
        t: f64,
        storages: &[f64],
        seed_basin: Option<usize>,
        du: &DVector<f64>,
    ) -> Dual {
        let env = self.connector_env(entry, t, storages, seed_basin);
        match entry.kind {
            FlowEntryKind::RatingCurve => {
                rating_curve_flow(&self.registry.rating_curves[entry.local], &env)
            }
            FlowEntryKind::Pump => {
                let params = &self.registry.pumps[entry.local];
                regulated_flow(params, params.rate.target_at(t), &env)
            }
            FlowEntryKind::Outlet => {
                let params = &self.registry.outlets[entry.local];
                regulated_flow(params, params.rate.target_at(t), &env)
            }
            FlowEntryKind::LinearResistance => {
                linear_resistance_flow(&self.registry.linear_resistances[entry.local], &env)
            }
            FlowEntryKind::ManningResistance => {
                manning_resistance_flow(&self.registry.manning_resistances[entry.local], &env)
            }
            FlowEntryKind::UserInflow => {
                user_demand_flow(&self.registry.user_demands[entry.local], t, &env)
            }
            FlowEntryKind::UserReturn => {
                let params = &self.registry.user_demands[entry.local];
                let inflow_entry = self.user_inflow_entries[entry.local];
                match seed_basin {
                    // The return rate tracks the inflow rate, so its
                    // derivative is the inflow's scaled by the factor.
                    Some(_) => {
                        let inflow = self.entry_rate(
                            &self.map.layout.flow_entries[inflow_entry],
                            t,
                            storages,
                            seed_basin,
                            du,
                        );
                        inflow * params.return_factor
                    }
                    None => Dual::constant(
                        du[self.map.layout.flow_index(inflow_entry)] * params.return_factor,
                    ),
                }
            }
            FlowEntryKind::FlowBoundary => Dual::constant(
                self.registry.flow_boundaries[entry.local]
                    .schedule
                    .value_at(t),
            ),
        }
    }

    /// Hydraulic conditions at an entry's endpoints.
    fn connector_env(
        &self,
        entry: &FlowEntry,
        t: f64,
        storages: &[f64],
        seed_basin: Option<usize>,
    ) -> ConnectorEnv {
        let up = self.endpoint_state(entry.endpoint_up, entry.basin_up, t, storages, seed_basin);
        let down =
            self.endpoint_state(entry.endpoint_down, entry.basin_down, t, storages, seed_basin);
        let bed_up = up.bed.or(down.bed).unwrap_or(0.0);
        let bed_down = down.bed.or(up.bed).unwrap_or(0.0);
        ConnectorEnv {
            h_up: up.level,
            h_down: down.level,
            storage_up: up.storage,
            storage_down: down.storage,
            bed_up,
            bed_down,
        }
    }

    fn endpoint_state(
        &self,
        endpoint: Option<NodeIndex>,
        basin_local: Option<usize>,
        t: f64,
        storages: &[f64],
        seed_basin: Option<usize>,
    ) -> EndpointState {
        let Some(endpoint) = endpoint else {
            return EndpointState::unbounded();
        };
        if let Some(b) = basin_local {
            let storage = if seed_basin == Some(b) {
                Dual::seeded(storages[b])
            } else {
                Dual::constant(storages[b])
            };
            let profile = &self.registry.basins[b].profile;
            return EndpointState {
                level: profile.level_from_storage_dual(storage),
                storage,
                bed: Some(profile.bottom_level()),
            };
        }
        let node = self.graph.node(endpoint);
        match node.id.node_type {
            NodeType::LevelBoundary => {
                let level = self.registry.level_boundaries[node.local_index]
                    .level
                    .value_at(t);
                EndpointState {
                    level: Dual::constant(level),
                    storage: Dual::constant(f64::INFINITY),
                    bed: None,
                }
            }
            // Terminal and other absorbing endpoints impose nothing.
            _ => EndpointState::unbounded(),
        }
    }

    /// Close the PID equation and write the controller output into the
    /// target's derivative slot. The derivative term couples the output
    /// to the listened basin's storage rate, which itself contains the
    /// output; the resulting scalar linear equation is solved exactly.
    fn apply_pid(
        &self,
        k: usize,
        pid: &PidControlParams,
        t: f64,
        u: &DVector<f64>,
        storages: &[f64],
        du: &mut DVector<f64>,
    ) {
        let layout = &self.map.layout;
        let b = pid.listen_basin;
        let profile = &self.registry.basins[b].profile;
        let level = profile.level_from_storage(storages[b]);
        let error = pid.target_level.value_at(t) - level;
        du[layout.pid_integral_index(k)] = error;
        if !pid.active.get() {
            return;
        }
        let slot = layout.flow_index(pid.target_entry);
        let area = profile.area_from_level(level);
        let kp = pid.proportional.value_at(t);
        let ki = pid.integral.value_at(t);
        let kd = pid.derivative.value_at(t);
        let target_slope = pid.target_level.slope_at(t);
        let error_integral = u[layout.pid_integral_index(k)];
        let coefficient = self.map.projection_coefficient(b, slot);
        let base_rate = self.map.storage_rate_excluding(b, du, slot);
        let mut denominator = 1.0 + kd * coefficient / area;
        if denominator.abs() < 1e-12 {
            denominator = 1e-12_f64.copysign(denominator);
        }
        let numerator =
            kp * error + ki * error_integral + kd * target_slope - kd * base_rate / area;
        let q = numerator / denominator;
        let entry = &layout.flow_entries[pid.target_entry];
        let env = self.connector_env(entry, t, storages, None);
        let params = match pid.target_kind {
            crate::engine::control::pid::PidTargetKind::Pump => {
                &self.registry.pumps[pid.target_local]
            }
            crate::engine::control::pid::PidTargetKind::Outlet => {
                &self.registry.outlets[pid.target_local]
            }
        };
        du[slot] = regulated_flow(params, q, &env).re;
    }

    /// Low-storage factor of a basin at the current storages, for the
    /// accounting and allocation layers.
    pub fn basin_low_storage_factor(&self, storages: &[f64], basin: usize) -> f64 {
        low_storage_factor(Dual::constant(storages[basin])).re
    }

    /// User-facing id of a basin by local index.
    pub fn basin_name(&self, basin: usize) -> String {
        self.graph
            .nodes()
            .find(|n| n.id.node_type == NodeType::Basin && n.local_index == basin)
            .map(|n| n.id.to_string())
            .unwrap_or_else(|| format!("Basin[{basin}]"))
    }
}

/// Endpoint hydraulic state during entry evaluation.
struct EndpointState {
    level: Dual,
    storage: Dual,
    bed: Option<f64>,
}

impl EndpointState {
    fn unbounded() -> Self {
        Self {
            level: Dual::ZERO,
            storage: Dual::constant(f64::INFINITY),
            bed: None,
        }
    }
}
