// ABOUTME: Core simulation orchestrator - event loop over integration, control, allocation, and saving
// ABOUTME: Owns the state vector, the callback schedule, and the Basic Model Interface surface

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use nalgebra::DVector;
use tracing::{info, warn};

use crate::engine::allocation::lp::LpError;
use crate::engine::allocation::model::{
    AllocationModel, AllocationOptions, AllocationOutcome, SolvePass,
};
use crate::engine::control::discrete::ControlAction;
use crate::engine::control::{ControlReadout, ControlRegistry, ListenVariable};
use crate::engine::core::error::HydronetError;
use crate::engine::network::builder::BuiltModel;
use crate::engine::network::graph::{NetworkGraph, PRIMARY_SUBNETWORK};
use crate::engine::network::id::{NodeIndex, NodeType};
use crate::engine::output::{
    AllocationFlowRow, AllocationRow, BasinRow, BasinStateRow, ControlRow, CumulativeTracker,
    FlowRow, OutputStream, SolverStatsRow, SubgridRow,
};
use crate::engine::physics::node::NodeRegistry;
use crate::engine::physics::subgrid::SubgridElement;
use crate::engine::solver::integrator::{Integrator, SolverOptions, SolverStats};
use crate::engine::solver::jacobian::{JacobianEngine, PidRowSpec};
use crate::engine::solver::rhs::HydroSystem;
use crate::engine::solver::state::StateMap;

/// Event-time comparison slack [s].
const EVENT_EPSILON: f64 = 1e-6;

/// Run-level options distilled from the configuration.
#[derive(Debug, Clone)]
pub struct SimulationOptions {
    /// End of the simulated window [s since start].
    pub t_end: f64,
    pub solver: SolverOptions,
    /// Save interval [s]; 0 saves at every accepted step.
    pub saveat: f64,
    pub water_balance_abstol: f64,
    pub water_balance_reltol: f64,
    /// Allocation is off when absent.
    pub allocation: Option<AllocationOptions>,
    pub subgrid_enabled: bool,
}

impl Default for SimulationOptions {
    fn default() -> Self {
        Self {
            t_end: 86_400.0,
            solver: SolverOptions::default(),
            saveat: 86_400.0,
            water_balance_abstol: 1e-3,
            water_balance_reltol: 1e-2,
            allocation: None,
            subgrid_enabled: false,
        }
    }
}

/// The running simulation: network, parameters, state, callbacks.
pub struct Simulation {
    graph: NetworkGraph,
    registry: NodeRegistry,
    controls: ControlRegistry,
    map: StateMap,
    subgrid: Vec<SubgridElement>,
    /// Basin storages at t = 0; the state vector holds volumes
    /// accumulated since then, so storage is always s0 + F·u.
    s0: RefCell<Vec<f64>>,
    integrator: Integrator,
    jacobian: JacobianEngine,
    allocation_models: Vec<AllocationModel>,
    options: SimulationOptions,
    output: OutputStream,
    tracker: CumulativeTracker,
    /// Per node, its flow entry (for flow-rate observation and output).
    node_entries: BTreeMap<NodeIndex, usize>,
    /// Sorted forcing breakpoints used as integrator stop times.
    tstops: Vec<f64>,
    next_tstop: usize,
    last_save_t: f64,
    next_save: f64,
    last_allocation_t: f64,
    next_allocation: Option<f64>,
    stats_at_last_save: SolverStats,
    started: Instant,
    cancelled: Arc<AtomicBool>,
    /// BMI-visible caches, refreshed after every accepted step.
    storage_cache: Vec<f64>,
    level_cache: Vec<f64>,
    /// Storages at the previous save, for interval storage rates.
    last_save_storages: Vec<f64>,
    total_steps: u64,
    finalized: bool,
}

impl Simulation {
    pub fn new(
        built: BuiltModel,
        options: SimulationOptions,
        output: OutputStream,
    ) -> Result<Self, HydronetError> {
        let BuiltModel {
            graph,
            registry,
            controls,
            subgrid,
            map,
            initial_storages,
        } = built;

        let n = map.layout.total;
        let pid_rows: Vec<PidRowSpec> = controls
            .pid
            .iter()
            .enumerate()
            .map(|(index, pid)| PidRowSpec {
                index,
                listen_basin: pid.listen_basin,
                target_entry: pid.target_entry,
            })
            .collect();
        let jacobian = JacobianEngine::build(&map, controls.pid.len(), &pid_rows, options.solver.autodiff);
        let integrator = Integrator::new(
            options.solver.clone(),
            0.0,
            DVector::zeros(n),
            map.layout.n_basins,
        );

        let mut node_entries = BTreeMap::new();
        for (i, entry) in map.layout.flow_entries.iter().enumerate() {
            node_entries.entry(entry.node).or_insert(i);
        }

        // Forcing breakpoints become hard stops so no step straddles a
        // derivative discontinuity.
        let mut tstops = Vec::new();
        let horizon = options.t_end;
        for basin in &registry.basins {
            basin.precipitation.breakpoints_within(0.0, horizon, &mut tstops);
            basin
                .potential_evaporation
                .breakpoints_within(0.0, horizon, &mut tstops);
            basin.drainage.breakpoints_within(0.0, horizon, &mut tstops);
            basin.infiltration.breakpoints_within(0.0, horizon, &mut tstops);
        }
        for boundary in &registry.flow_boundaries {
            boundary.schedule.breakpoints_within(0.0, horizon, &mut tstops);
            if let crate::engine::physics::node::FlowSchedule::Linear(curve) = &boundary.schedule {
                let varies = curve.ys().windows(2).any(|w| w[0] != w[1]);
                if varies && !curve.covers(0.0, horizon) {
                    warn!(
                        node = %boundary.node,
                        "flow boundary time series does not cover the simulation window; extrapolating"
                    );
                }
            }
        }
        for boundary in &registry.level_boundaries {
            boundary.level.breakpoints_within(0.0, horizon, &mut tstops);
        }
        for pump in registry.pumps.iter().chain(registry.outlets.iter()) {
            if let Some(schedule) = pump.rate.schedule() {
                schedule.breakpoints_within(0.0, horizon, &mut tstops);
            }
        }
        tstops.sort_by(|a, b| a.partial_cmp(b).unwrap());
        tstops.dedup_by(|a, b| (*a - *b).abs() < EVENT_EPSILON);

        // One allocation model per subnetwork carrying the union of
        // demand priorities.
        let mut allocation_models = Vec::new();
        if let Some(allocation_options) = &options.allocation {
            let mut priorities: Vec<u32> = registry
                .user_demands
                .iter()
                .flat_map(|u| u.demands.iter().map(|d| d.priority))
                .chain(registry.flow_demands.iter().map(|d| d.priority))
                .chain(registry.level_demands.iter().map(|d| d.priority))
                .collect();
            priorities.sort_unstable();
            priorities.dedup();
            let mut issues = Vec::new();
            for subnetwork in graph.subnetwork_ids() {
                allocation_models.push(AllocationModel::build(
                    &graph,
                    &registry,
                    &map,
                    subnetwork,
                    &priorities,
                    allocation_options,
                    &mut issues,
                ));
            }
            if !issues.is_empty() {
                return Err(HydronetError::from_issues(issues));
            }
        }

        let storage_cache = initial_storages.clone();
        let level_cache: Vec<f64> = registry
            .basins
            .iter()
            .zip(initial_storages.iter())
            .map(|(basin, &storage)| basin.profile.level_from_storage(storage))
            .collect();

        let next_allocation = options
            .allocation
            .as_ref()
            .map(|allocation| allocation.timestep);
        let next_save = if options.saveat > 0.0 {
            options.saveat
        } else {
            0.0
        };

        Ok(Self {
            graph,
            registry,
            controls,
            map,
            subgrid,
            s0: RefCell::new(initial_storages),
            integrator,
            jacobian,
            allocation_models,
            options,
            output,
            tracker: CumulativeTracker::new(n),
            node_entries,
            tstops,
            next_tstop: 0,
            last_save_t: 0.0,
            next_save,
            last_allocation_t: 0.0,
            next_allocation,
            stats_at_last_save: SolverStats::default(),
            started: Instant::now(),
            cancelled: Arc::new(AtomicBool::new(false)),
            last_save_storages: storage_cache.clone(),
            storage_cache,
            level_cache,
            total_steps: 0,
            finalized: false,
        })
    }

    /// Current simulation time [s since start].
    pub fn time(&self) -> f64 {
        self.integrator.t
    }

    pub fn stats(&self) -> SolverStats {
        self.integrator.stats
    }

    pub fn output(&self) -> &OutputStream {
        &self.output
    }

    /// A flag that makes the driver exit at the next accepted step.
    pub fn cancellation_token(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.cancelled)
    }

    /// Serialized allocation LP per subnetwork (determinism regression).
    pub fn allocation_lps(&self) -> Vec<(u32, String)> {
        self.allocation_models
            .iter()
            .map(|model| (model.subnetwork, model.serialize_lp()))
            .collect()
    }

    /// Run from t = 0 to t_end, firing every scheduled callback.
    pub fn run(&mut self) -> Result<(), HydronetError> {
        info!(
            t_end = self.options.t_end,
            states = self.map.layout.total,
            basins = self.map.layout.n_basins,
            jacobian_nnz = self.jacobian.nnz(),
            "starting simulation"
        );
        self.save_snapshot()?;
        self.advance_until(self.options.t_end)?;
        self.finalize()?;
        Ok(())
    }

    /// BMI `update`: advance by exactly one accepted step.
    pub fn update(&mut self) -> Result<(), HydronetError> {
        let t_end = self.options.t_end;
        if self.time() >= t_end {
            return Ok(());
        }
        let target = self.next_event_time(t_end);
        self.step_once(target)?;
        self.fire_due_events()?;
        Ok(())
    }

    /// BMI `update_until`: time may only move forward.
    pub fn update_until(&mut self, t: f64) -> Result<(), HydronetError> {
        if t < self.time() {
            return Err(HydronetError::BmiTimeBackward {
                current: self.time(),
                requested: t,
            });
        }
        self.advance_until(t.min(self.options.t_end))
    }

    /// BMI `get_value_ptr`: borrow a named state array. The borrow lives
    /// as long as the model instance.
    pub fn get_value_ptr(&self, name: &str) -> Result<&[f64], HydronetError> {
        match name {
            "basin.storage" => Ok(&self.storage_cache),
            "basin.level" => Ok(&self.level_cache),
            other => Err(HydronetError::BmiUnknownVariable(other.to_string())),
        }
    }

    /// BMI `finalize`: flush pending output. Idempotent.
    pub fn finalize(&mut self) -> Result<(), HydronetError> {
        if self.finalized {
            return Ok(());
        }
        if self.time() > self.last_save_t + EVENT_EPSILON {
            self.save_snapshot()?;
        }
        self.finalized = true;
        Ok(())
    }

    fn advance_until(&mut self, t_target: f64) -> Result<(), HydronetError> {
        while self.time() < t_target - EVENT_EPSILON {
            if self.cancelled.load(Ordering::Relaxed) {
                info!(t = self.time(), "cancellation requested; stopping");
                break;
            }
            let event = self.next_event_time(t_target);
            while self.time() < event - EVENT_EPSILON {
                self.step_once(event)?;
                if self.options.saveat <= 0.0 {
                    self.save_snapshot()?;
                }
                if self.cancelled.load(Ordering::Relaxed) {
                    break;
                }
            }
            self.fire_due_events()?;
        }
        Ok(())
    }

    /// The next time any callback is due.
    fn next_event_time(&self, t_target: f64) -> f64 {
        let mut event = t_target;
        if self.options.saveat > 0.0 {
            event = event.min(self.next_save);
        }
        if let Some(next_allocation) = self.next_allocation {
            event = event.min(next_allocation);
        }
        if let Some(&tstop) = self.tstops.get(self.next_tstop) {
            if tstop > self.time() + EVENT_EPSILON {
                event = event.min(tstop);
            }
        }
        event
    }

    /// One accepted integrator step plus the per-step control callbacks.
    fn step_once(&mut self, t_stop: f64) -> Result<(), HydronetError> {
        {
            let system = HydroSystem::new(
                &self.graph,
                &self.registry,
                &self.controls,
                &self.map,
                &self.s0,
            );
            self.integrator
                .step_to(&system, &mut self.jacobian, t_stop)?;
        }
        self.total_steps += 1;
        if self.total_steps > self.options.solver.maxiters {
            return Err(HydronetError::DtLessThanMin {
                t: self.time(),
                dt: self.integrator.proposed_dt(),
                dtmin: self.options.solver.dtmin,
                bottlenecks: vec![format!(
                    "maxiters ({}) exceeded",
                    self.options.solver.maxiters
                )],
            });
        }
        self.refresh_caches();
        self.run_step_controls()?;
        Ok(())
    }

    fn refresh_caches(&mut self) {
        let storages = self.map.storages(&self.s0.borrow(), &self.integrator.u);
        for (b, storage) in storages.iter().enumerate() {
            self.storage_cache[b] = *storage;
            self.level_cache[b] = self.registry.basins[b].profile.level_from_storage(*storage);
        }
    }

    /// Fire any callback whose time has come, in the fixed order
    /// forcings → discrete control → allocation → save. Forcing refresh
    /// is implicit (interpolations are evaluated lazily); crossing a
    /// breakpoint only resets the step history.
    fn fire_due_events(&mut self) -> Result<(), HydronetError> {
        let t = self.time();
        while self
            .tstops
            .get(self.next_tstop)
            .map(|&tstop| tstop <= t + EVENT_EPSILON)
            .unwrap_or(false)
        {
            self.next_tstop += 1;
            self.integrator.reset_history();
        }
        // Discrete control already ran at the end of the last step.
        if let Some(next_allocation) = self.next_allocation {
            if t >= next_allocation - EVENT_EPSILON {
                if let Err(error) = self.run_allocation() {
                    if let HydronetError::AllocationInfeasible {
                        subnetwork,
                        objective,
                        t,
                        iis,
                    } = &error
                    {
                        let infeasibility = format!(
                            "Set of incompatible constraints found in subnetwork {subnetwork} \
                             while optimizing '{objective}' at t = {t} s:\n{}\n",
                            iis.join("\n")
                        );
                        let scaling = self
                            .allocation_models
                            .iter()
                            .map(|model| {
                                format!("subnetwork {}: flow scale derived from demand magnitude\n", model.subnetwork)
                            })
                            .collect::<String>();
                        let _ = self
                            .output
                            .write_allocation_analysis(&infeasibility, &scaling);
                        tracing::error!(
                            subnetwork = *subnetwork,
                            objective = objective.as_str(),
                            "allocation infeasible"
                        );
                    }
                    return Err(error);
                }
                let timestep = self
                    .options
                    .allocation
                    .as_ref()
                    .map(|a| a.timestep)
                    .unwrap_or(f64::INFINITY);
                self.last_allocation_t = t;
                self.next_allocation = Some(next_allocation + timestep);
            }
        }
        if self.options.saveat > 0.0 && t >= self.next_save - EVENT_EPSILON {
            self.save_snapshot()?;
            self.next_save += self.options.saveat;
        }
        Ok(())
    }

    /// Discrete transitions and continuous control after a step.
    fn run_step_controls(&mut self) -> Result<(), HydronetError> {
        let t = self.time();
        // Observe through a consistent snapshot of the current state.
        let mut du = DVector::zeros(self.map.layout.total);
        {
            let system = HydroSystem::new(
                &self.graph,
                &self.registry,
                &self.controls,
                &self.map,
                &self.s0,
            );
            system.eval(t, &self.integrator.u, &mut du);
        }
        let readout = ReadoutView {
            simulation: self,
            du: &du,
            t,
        };

        let mut control_rows = Vec::new();
        let mut pending_actions: Vec<ControlAction> = Vec::new();
        for discrete in &self.controls.discrete {
            if let Some((truth_state, control_state)) = discrete.transition(t, &readout) {
                control_rows.push(ControlRow {
                    time: t,
                    control_node_id: discrete.node.id,
                    truth_state,
                    control_state: control_state.clone(),
                });
                pending_actions.extend(discrete.actions_of(&control_state).iter().cloned());
            }
        }
        let mut continuous_updates = Vec::new();
        for continuous in &self.controls.continuous {
            continuous_updates.push((continuous.target, continuous.output(&readout)));
        }

        let transitioned = !control_rows.is_empty();
        for (target, value) in continuous_updates {
            self.set_flow_rate(target, value);
        }
        for action in pending_actions {
            self.apply_action(&action);
        }
        if transitioned {
            self.integrator.reset_history();
        }
        if !control_rows.is_empty() {
            self.output.write_control(control_rows)?;
        }
        Ok(())
    }

    fn set_flow_rate(&self, target: NodeIndex, value: f64) {
        let node = self.graph.node(target);
        match node.id.node_type {
            NodeType::Pump => self.registry.pumps[node.local_index].rate.set_override(value),
            NodeType::Outlet => self.registry.outlets[node.local_index]
                .rate
                .set_override(value),
            other => warn!(target = %node.id, node_type = %other, "flow_rate patch on unsupported node"),
        }
    }

    /// Apply one control-state patch atomically.
    fn apply_action(&self, action: &ControlAction) {
        match action {
            ControlAction::SetFlowRate { target, rate } => self.set_flow_rate(*target, *rate),
            ControlAction::SetActive { target, active } => {
                let node = self.graph.node(*target);
                match node.id.node_type {
                    NodeType::Pump => self.registry.pumps[node.local_index].active.set(*active),
                    NodeType::Outlet => {
                        self.registry.outlets[node.local_index].active.set(*active)
                    }
                    _ => warn!(target = %node.id, "active patch on unsupported node"),
                }
            }
            ControlAction::SetResistanceActive { target, active } => {
                let node = self.graph.node(*target);
                if node.id.node_type == NodeType::LinearResistance {
                    self.registry.linear_resistances[node.local_index]
                        .active
                        .set(*active);
                }
            }
            ControlAction::SetRatingTable { target, table } => {
                let node = self.graph.node(*target);
                if node.id.node_type == NodeType::TabulatedRatingCurve
                    && !self.registry.rating_curves[node.local_index].activate(table)
                {
                    warn!(target = %node.id, table = table.as_str(), "unknown rating table");
                }
            }
            ControlAction::SetPidActive { target, active } => {
                let node = self.graph.node(*target);
                if node.id.node_type == NodeType::PidControl {
                    self.controls.pid[node.local_index].active.set(*active);
                }
            }
        }
    }

    /// The full allocation pipeline: secondary demand collection, the
    /// primary solve, final secondary solves, writeback, result rows.
    fn run_allocation(&mut self) -> Result<(), HydronetError> {
        let t = self.time();
        let storages = self.map.storages(&self.s0.borrow(), &self.integrator.u);
        let elapsed = (t - self.last_allocation_t).max(0.0);

        // Mean boundary rates realized since the last allocation.
        let since = self
            .tracker
            .since_snapshot("allocation", &self.integrator.u);
        let mut boundary_means: BTreeMap<usize, f64> = BTreeMap::new();
        if elapsed > EVENT_EPSILON {
            for (i, entry) in self.map.layout.flow_entries.iter().enumerate() {
                if entry.kind == crate::engine::solver::state::FlowEntryKind::FlowBoundary {
                    boundary_means.insert(i, since[self.map.layout.flow_index(i)] / elapsed);
                }
            }
        }

        let mut outcomes: Vec<(u32, AllocationOutcome, SolvePass)> = Vec::new();
        {
            let system = HydroSystem::new(
                &self.graph,
                &self.registry,
                &self.controls,
                &self.map,
                &self.s0,
            );

            // 1. Demand collection on the secondaries.
            let mut collected: BTreeMap<u32, Vec<(u32, f64)>> = BTreeMap::new();
            let empty = BTreeMap::new();
            for model in self
                .allocation_models
                .iter_mut()
                .filter(|m| m.subnetwork != PRIMARY_SUBNETWORK)
            {
                model.prepare(&system, t, &storages, &boundary_means);
                let outcome = model
                    .solve(&self.graph, &self.registry, &self.map, SolvePass::Collect, &empty)
                    .map_err(|(objective, error, iis)| {
                        allocation_failure(model.subnetwork, objective, error, iis, t)
                    })?;
                let per_priority = collected.entry(model.subnetwork).or_default();
                for flows in outcome.inlet_allocated.values() {
                    for &(priority, rate) in flows {
                        match per_priority.iter_mut().find(|(p, _)| *p == priority) {
                            Some(slot) => slot.1 += rate,
                            None => per_priority.push((priority, rate)),
                        }
                    }
                }
                outcomes.push((model.subnetwork, outcome, SolvePass::Collect));
            }

            // 2. Primary solve with the collected demands installed.
            let mut granted: BTreeMap<usize, f64> = BTreeMap::new();
            if let Some(primary) = self
                .allocation_models
                .iter_mut()
                .find(|m| m.subnetwork == PRIMARY_SUBNETWORK)
            {
                primary.prepare(&system, t, &storages, &boundary_means);
                primary.set_inlet_demands(&collected);
                let outcome = primary
                    .solve(&self.graph, &self.registry, &self.map, SolvePass::Primary, &empty)
                    .map_err(|(objective, error, iis)| {
                        allocation_failure(PRIMARY_SUBNETWORK, objective, error, iis, t)
                    })?;
                for (&entry, per_priority) in &outcome.inlet_allocated {
                    let total: f64 = per_priority.iter().map(|(_, rate)| rate).sum();
                    granted.insert(entry, total);
                }
                outcomes.push((PRIMARY_SUBNETWORK, outcome, SolvePass::Primary));
            }

            // 3. Final secondary solves under the granted inlet caps.
            for model in self
                .allocation_models
                .iter_mut()
                .filter(|m| m.subnetwork != PRIMARY_SUBNETWORK)
            {
                let outcome = model
                    .solve(&self.graph, &self.registry, &self.map, SolvePass::Final, &granted)
                    .map_err(|(objective, error, iis)| {
                        allocation_failure(model.subnetwork, objective, error, iis, t)
                    })?;
                outcomes.push((model.subnetwork, outcome, SolvePass::Final));
            }
        }

        // Writeback and result rows.
        let mut allocation_rows = Vec::new();
        let mut allocation_flow_rows = Vec::new();
        for (subnetwork, outcome, pass) in &outcomes {
            let authoritative = *pass != SolvePass::Collect;
            if !authoritative {
                continue;
            }
            self.write_back(outcome);
            for &(node, priority, demand, allocated) in &outcome.allocations {
                let realized = self.realized_rate(node, elapsed, &since);
                allocation_rows.push(AllocationRow {
                    time: t,
                    subnetwork_id: *subnetwork,
                    node_type: node.node_type.to_string(),
                    node_id: node.id,
                    demand_priority: priority,
                    demand,
                    allocated,
                    realized,
                });
            }
            let optimization_type = match pass {
                SolvePass::Collect => "collect_demands",
                _ => "allocate",
            };
            for (&entry, &rate) in &outcome.entry_flows {
                for &link_index in &self.map.layout.flow_entries[entry].links {
                    let link = self.graph.link(link_index);
                    allocation_flow_rows.push(AllocationFlowRow {
                        time: t,
                        link_id: link_index.0,
                        from_node_id: self.graph.node(link.from).id.id,
                        from_node_type: self.graph.node(link.from).id.node_type.to_string(),
                        to_node_id: self.graph.node(link.to).id.id,
                        to_node_type: self.graph.node(link.to).id.node_type.to_string(),
                        subnetwork_id: link.subnetwork,
                        flow_rate: rate,
                        optimization_type: optimization_type.to_string(),
                    });
                }
            }
        }
        self.tracker.snapshot("allocation", &self.integrator.u);
        self.output.write_allocation(allocation_rows)?;
        self.output.write_allocation_flow(allocation_flow_rows)?;
        self.integrator.reset_history();
        Ok(())
    }

    /// Push optimized rates into the parameter cells the RHS reads.
    fn write_back(&self, outcome: &AllocationOutcome) {
        let layout = &self.map.layout;
        for (&entry_index, &rate) in &outcome.entry_flows {
            let entry = &layout.flow_entries[entry_index];
            match entry.kind {
                crate::engine::solver::state::FlowEntryKind::Pump => {
                    let pump = &self.registry.pumps[entry.local];
                    if pump.allocation_controlled && !pump.pid_controlled.get() {
                        pump.rate.set_override(rate);
                    }
                }
                crate::engine::solver::state::FlowEntryKind::Outlet => {
                    let outlet = &self.registry.outlets[entry.local];
                    if outlet.allocation_controlled && !outlet.pid_controlled.get() {
                        outlet.rate.set_override(rate);
                    }
                }
                _ => {}
            }
        }
        // Per-priority allocated rates cap the user abstractions.
        for user in &self.registry.user_demands {
            let mut allocated = user.allocated.borrow_mut();
            for (slot, demand) in allocated.iter_mut().zip(user.demands.iter()) {
                if let Some(&(_, _, _, value)) = outcome
                    .allocations
                    .iter()
                    .find(|(node, priority, _, _)| *node == user.node && *priority == demand.priority)
                {
                    *slot = value.max(0.0);
                }
            }
        }
    }

    /// Mean realized abstraction of a demand node since the previous
    /// allocation update.
    fn realized_rate(&self, node: crate::engine::network::id::NodeId, elapsed: f64, since: &[f64]) -> f64 {
        if elapsed <= EVENT_EPSILON {
            return 0.0;
        }
        let Some(index) = self.graph.index_of(node) else {
            return 0.0;
        };
        match self.node_entries.get(&index) {
            Some(&entry) => since[self.map.layout.flow_index(entry)] / elapsed,
            None => 0.0,
        }
    }

    /// Snapshot state and flows, run the water balance check, then reset
    /// the cumulative ranges.
    fn save_snapshot(&mut self) -> Result<(), HydronetError> {
        let t = self.time();
        let dt = t - self.last_save_t;
        let u = self.integrator.u.clone();
        let layout = &self.map.layout;
        let storages = self.map.storages(&self.s0.borrow(), &u);
        // State entries accumulate over the whole run; the volumes of
        // this save interval come from differencing against the
        // previous save's snapshot.
        let interval = self.tracker.since_snapshot("save", &u);
        let rate = |volume: f64| if dt > 0.0 { volume / dt } else { 0.0 };

        let stats = self.integrator.stats;
        let interval_accepted = stats.accepted_steps - self.stats_at_last_save.accepted_steps;
        let interval_rejected = stats.rejected_steps - self.stats_at_last_save.rejected_steps;
        let convergence = if interval_accepted + interval_rejected > 0 {
            interval_accepted as f64 / (interval_accepted + interval_rejected) as f64
        } else {
            1.0
        };

        let mut basin_rows = Vec::with_capacity(layout.n_basins);
        let mut basin_state_rows = Vec::with_capacity(layout.n_basins);
        for (b, basin) in self.registry.basins.iter().enumerate() {
            let storage = storages[b].max(0.0);
            let level = basin.profile.level_from_storage(storage);
            let mut inflow = 0.0;
            let mut outflow = 0.0;
            for (i, entry) in layout.flow_entries.iter().enumerate() {
                let volume = interval[layout.flow_index(i)];
                if entry.basin_down == Some(b) {
                    inflow += volume;
                }
                if entry.basin_up == Some(b) {
                    outflow += volume;
                }
            }
            let precipitation = interval[layout.precipitation_index(b)];
            let evaporation = interval[layout.evaporation_index(b)];
            let drainage = interval[layout.drainage_index(b)];
            let infiltration = interval[layout.infiltration_index(b)];
            let delta_storage = storages[b] - self.last_save_storages[b];
            let net_flux =
                inflow - outflow + precipitation + drainage - evaporation - infiltration;
            let balance_error = delta_storage - net_flux;
            let total_flux: f64 = inflow
                + outflow
                + precipitation
                + drainage
                + evaporation
                + infiltration;
            let relative_error = balance_error / total_flux.max(1e-12);
            if balance_error.abs() > self.options.water_balance_abstol
                && relative_error.abs() > self.options.water_balance_reltol
            {
                warn!(
                    basin = %basin.node,
                    t,
                    balance_error,
                    relative_error,
                    "water balance violated"
                );
            }
            basin_rows.push(BasinRow {
                time: t,
                node_id: basin.node.id,
                level,
                storage,
                inflow_rate: rate(inflow),
                outflow_rate: rate(outflow),
                storage_rate: rate(delta_storage),
                precipitation: rate(precipitation),
                evaporation: rate(evaporation),
                drainage: rate(drainage),
                infiltration: rate(infiltration),
                balance_error,
                relative_error,
                convergence,
            });
            basin_state_rows.push(BasinStateRow {
                node_id: basin.node.id,
                storage,
                level,
            });
        }

        let mut flow_rows = Vec::new();
        for (&link_index, entries) in &self.map.link_entries {
            let link = self.graph.link(link_index);
            let volume: f64 = entries
                .iter()
                .map(|&entry| interval[layout.flow_index(entry)])
                .sum();
            flow_rows.push(FlowRow {
                time: t,
                link_id: link_index.0,
                from_node_id: self.graph.node(link.from).id.id,
                to_node_id: self.graph.node(link.to).id.id,
                flow_rate: rate(volume),
                convergence,
            });
        }

        let mut subgrid_rows = Vec::new();
        if self.options.subgrid_enabled {
            for element in &self.subgrid {
                let basin_local = self.graph.node(element.basin).local_index;
                let basin_level = self.registry.basins[basin_local]
                    .profile
                    .level_from_storage(storages[basin_local]);
                subgrid_rows.push(SubgridRow {
                    time: t,
                    subgrid_id: element.subgrid_id,
                    subgrid_level: element.level_at(basin_level),
                });
            }
        }

        let stats_row = SolverStatsRow {
            time: t,
            computation_time: self.started.elapsed().as_secs_f64(),
            rhs_calls: stats.rhs_calls - self.stats_at_last_save.rhs_calls,
            linear_solves: stats.linear_solves - self.stats_at_last_save.linear_solves,
            accepted_timesteps: interval_accepted,
            rejected_timesteps: interval_rejected,
        };

        self.output.write_basin(basin_rows)?;
        self.output.write_flow(flow_rows)?;
        self.output.write_subgrid(subgrid_rows)?;
        self.output.write_solver_stats(vec![stats_row])?;
        self.output.write_basin_state(basin_state_rows)?;

        // Start the next interval: remember this save's totals and the
        // storages they imply. The state vector itself keeps growing so
        // the solver's relative error weights stay meaningful.
        self.tracker.snapshot("save", &u);
        self.last_save_storages = storages;
        self.stats_at_last_save = stats;
        self.last_save_t = t;
        Ok(())
    }
}

fn allocation_failure(
    subnetwork: u32,
    objective: String,
    error: LpError,
    iis: Vec<String>,
    t: f64,
) -> HydronetError {
    match error {
        LpError::Infeasible => HydronetError::AllocationInfeasible {
            subnetwork,
            objective,
            t,
            iis,
        },
        LpError::Unbounded => HydronetError::AllocationInfeasible {
            subnetwork,
            objective: format!("{objective} (unbounded)"),
            t,
            iis: vec!["objective is unbounded".to_string()],
        },
    }
}

/// Read access for control compound variables, backed by a consistent
/// snapshot of the state taken right after an accepted step.
struct ReadoutView<'a> {
    simulation: &'a Simulation,
    du: &'a DVector<f64>,
    t: f64,
}

impl ControlReadout for ReadoutView<'_> {
    fn observe(&self, node: NodeIndex, variable: ListenVariable, look_ahead: f64) -> f64 {
        let simulation = self.simulation;
        let node_ref = simulation.graph.node(node);
        match (node_ref.id.node_type, variable) {
            (NodeType::Basin, ListenVariable::Level) => {
                simulation.level_cache[node_ref.local_index]
            }
            (NodeType::Basin, ListenVariable::Storage) => {
                simulation.storage_cache[node_ref.local_index]
            }
            (NodeType::LevelBoundary, ListenVariable::Level) => simulation.registry.level_boundaries
                [node_ref.local_index]
                .level
                .value_at(self.t + look_ahead),
            (NodeType::FlowBoundary, ListenVariable::FlowRate) => simulation.registry
                .flow_boundaries[node_ref.local_index]
                .schedule
                .value_at(self.t + look_ahead),
            (_, ListenVariable::FlowRate) => simulation
                .node_entries
                .get(&node)
                .map(|&entry| self.du[simulation.map.layout.flow_index(entry)])
                .unwrap_or(0.0),
            (node_type, variable) => {
                warn!(
                    node = %node_ref.id,
                    node_type = %node_type,
                    variable = variable.as_str(),
                    "unsupported listen variable; observing 0"
                );
                0.0
            }
        }
    }
}
