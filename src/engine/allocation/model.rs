// ABOUTME: Per-subnetwork allocation model: LP construction, goal-programming solve loop, writeback
// ABOUTME: Secondary subnetworks collect demands with free inlets; the primary then settles what they receive

use std::collections::BTreeMap;

use nalgebra::DVector;
use tracing::debug;

use crate::engine::allocation::lp::{LinearProgram, LpError, Relation};
use crate::engine::core::error::ValidationIssue;
use crate::engine::network::graph::{NetworkGraph, PRIMARY_SUBNETWORK};
use crate::engine::network::id::{NodeId, NodeType};
use crate::engine::physics::node::NodeRegistry;
use crate::engine::solver::rhs::HydroSystem;
use crate::engine::solver::state::{FlowEntryKind, StateMap};

/// Stand-in for an unbounded magnitude; kept finite so the simplex works
/// over shifted non-negative variables, and small enough that tableau
/// round-off stays far under the feasibility tolerance.
const UNBOUNDED: f64 = 1e6;
/// Weight of the fairness deviation terms relative to the demand error.
const FAIRNESS_WEIGHT: f64 = 1e-2;
/// Weight of the source-priority tie-break term.
const SOURCE_PRIORITY_WEIGHT: f64 = 1e-4;
/// Weight of the route-preference term in the terminal objective.
const ROUTE_WEIGHT: f64 = 1e-6;

/// Numeric source priorities per source class; smaller values are
/// preferred sources.
#[derive(Debug, Clone, Copy)]
pub struct SourcePriorities {
    pub user_demand: u32,
    pub flow_boundary: u32,
    pub level_boundary: u32,
    pub basin: u32,
    pub subnetwork_inlet: u32,
}

impl Default for SourcePriorities {
    fn default() -> Self {
        // Basin storage ranks below subnetwork inlets so the cost of
        // drawing through an inlet always exceeds the credit for
        // banking the water in a basin.
        Self {
            user_demand: 1000,
            flow_boundary: 2000,
            level_boundary: 3000,
            subnetwork_inlet: 4000,
            basin: 5000,
        }
    }
}

#[derive(Debug, Clone)]
pub struct AllocationOptions {
    /// Seconds between allocation solves.
    pub timestep: f64,
    pub source_priorities: SourcePriorities,
}

impl Default for AllocationOptions {
    fn default() -> Self {
        Self {
            timestep: 86_400.0,
            source_priorities: SourcePriorities::default(),
        }
    }
}

/// A user demand's variables at one priority.
#[derive(Debug, Clone)]
struct UserAllocation {
    user_local: usize,
    priority: u32,
    alloc: usize,
    shortfall: usize,
    surplus: usize,
    /// alloc + shortfall >= demand / alloc - surplus <= demand.
    shortfall_constraint: usize,
    surplus_constraint: usize,
    /// The earliest priority may run negative to absorb reverse flow.
    negative_allowed: bool,
    /// Current demand rate, refreshed by `prepare`.
    demand: f64,
}

/// A flow demand's error variables (single priority).
#[derive(Debug, Clone)]
struct FlowDemandTerms {
    demand_local: usize,
    priority: u32,
    target_entry: usize,
    shortfall: usize,
    surplus: usize,
    shortfall_constraint: usize,
    surplus_constraint: usize,
    demand: f64,
}

/// A level demand's band-violation variables.
#[derive(Debug, Clone)]
struct LevelDemandTerms {
    demand_local: usize,
    basin_local: usize,
    priority: u32,
    lower_error: usize,
    upper_error: usize,
    lower_constraint: usize,
    upper_constraint: usize,
}

/// Primary-side coupling variables for one secondary inlet at one
/// priority; the demand is what the secondary collected.
#[derive(Debug, Clone)]
struct InletAllocation {
    entry: usize,
    secondary: u32,
    priority: u32,
    alloc: usize,
    shortfall: usize,
    shortfall_constraint: usize,
    demand: f64,
}

/// What one allocation solve produced, for the result tables and the
/// writeback pass.
#[derive(Debug, Clone, Default)]
pub struct AllocationOutcome {
    /// (node, priority, demand, allocated) rows.
    pub allocations: Vec<(NodeId, u32, f64, f64)>,
    /// Optimized mean rate per flow entry [m³/s].
    pub entry_flows: BTreeMap<usize, f64>,
    /// Per secondary inlet entry: allocated rate per priority.
    pub inlet_allocated: BTreeMap<usize, Vec<(u32, f64)>>,
}

/// How a solve pass treats subnetwork inlets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SolvePass {
    /// Secondary, inlets unbounded; records the inflow the subnetwork
    /// would take per priority.
    Collect,
    /// Secondary, inlets capped at what the primary granted.
    Final,
    /// The primary network, carrying the secondaries' collected demands.
    Primary,
}

/// The long-lived LP of one subnetwork plus the index maps into it.
pub struct AllocationModel {
    pub subnetwork: u32,
    lp: LinearProgram,
    /// Flow entries of this subnetwork, in state order.
    pub entries: Vec<usize>,
    entry_vars: BTreeMap<usize, usize>,
    /// Local basin indices of this subnetwork.
    basins: Vec<usize>,
    storage_vars: BTreeMap<usize, usize>,
    low_storage_vars: BTreeMap<usize, usize>,
    volume_constraints: BTreeMap<usize, usize>,
    /// (entry, constraint) pairs for the linearized connector relations.
    linearized: Vec<(usize, usize)>,
    user_allocations: Vec<UserAllocation>,
    flow_demand_terms: Vec<FlowDemandTerms>,
    level_demand_terms: Vec<LevelDemandTerms>,
    /// Goal-programming fix constraint per priority, reset each solve.
    fix_constraints: BTreeMap<u32, usize>,
    /// Inlet entries (flow from the primary into this subnetwork).
    pub inlet_entries: Vec<usize>,
    /// Primary only: coupling variables per (secondary inlet, priority).
    inlet_allocations: Vec<InletAllocation>,
    /// Flow scale [m³/s per LP unit].
    flow_scale: f64,
    /// All demand priorities seen by this subnetwork, ascending.
    priorities: Vec<u32>,
    options: AllocationOptions,
}

impl AllocationModel {
    /// Build the symbolic program for one subnetwork. `priorities` is
    /// the sorted union of demand priorities across the whole model (the
    /// primary also carries secondary priorities).
    #[allow(clippy::too_many_arguments)]
    pub fn build(
        graph: &NetworkGraph,
        registry: &NodeRegistry,
        map: &StateMap,
        subnetwork: u32,
        priorities: &[u32],
        options: &AllocationOptions,
        issues: &mut Vec<ValidationIssue>,
    ) -> Self {
        let layout = &map.layout;
        let mut lp = LinearProgram::new();

        // Ambiguous goal ordering: a flow demand and a level demand at
        // the same priority in one subnetwork is rejected outright.
        let flow_priorities: Vec<u32> = registry
            .flow_demands
            .iter()
            .filter(|d| {
                graph
                    .lookup(d.target)
                    .map(|(_, _, s)| s == subnetwork)
                    .unwrap_or(false)
            })
            .map(|d| d.priority)
            .collect();
        for level_demand in &registry.level_demands {
            let in_subnetwork = graph
                .lookup(level_demand.basin)
                .map(|(_, _, s)| s == subnetwork)
                .unwrap_or(false);
            if in_subnetwork && flow_priorities.contains(&level_demand.priority) {
                issues.push(ValidationIssue::AmbiguousPriority {
                    subnetwork,
                    priority: level_demand.priority,
                });
            }
        }

        // Sorted entry/basin orders make the emitted LP byte-identical
        // across runs.
        let entries: Vec<usize> = layout
            .flow_entries
            .iter()
            .enumerate()
            .filter(|(_, e)| {
                // An entry belongs to every subnetwork it touches: its
                // governing node, its links, or either endpoint. Inlets
                // therefore appear both in the primary (as a draw on its
                // basins) and in the secondary (as its supply).
                graph.node(e.node).subnetwork == subnetwork
                    || e.links.iter().any(|&l| graph.link(l).subnetwork == subnetwork)
                    || e.endpoint_up
                        .map(|n| graph.node(n).subnetwork == subnetwork)
                        .unwrap_or(false)
                    || e.endpoint_down
                        .map(|n| graph.node(n).subnetwork == subnetwork)
                        .unwrap_or(false)
            })
            .map(|(i, _)| i)
            .collect();
        let basins: Vec<usize> = graph
            .nodes()
            .filter(|n| n.id.node_type == NodeType::Basin && n.subnetwork == subnetwork)
            .map(|n| n.local_index)
            .collect();

        let mut entry_vars = BTreeMap::new();
        for &i in &entries {
            let entry = &layout.flow_entries[i];
            let name = format!("flow[{}]", graph.node(entry.node).id);
            let (lower, upper) = match entry.kind {
                FlowEntryKind::Pump | FlowEntryKind::Outlet => (0.0, UNBOUNDED),
                FlowEntryKind::RatingCurve
                | FlowEntryKind::UserInflow
                | FlowEntryKind::UserReturn
                | FlowEntryKind::FlowBoundary => (0.0, UNBOUNDED),
                FlowEntryKind::LinearResistance | FlowEntryKind::ManningResistance => {
                    (-UNBOUNDED, UNBOUNDED)
                }
            };
            entry_vars.insert(i, lp.add_variable(name, lower, upper));
        }

        let mut storage_vars = BTreeMap::new();
        let mut low_storage_vars = BTreeMap::new();
        for &b in &basins {
            let id = registry.basins[b].node;
            storage_vars.insert(
                b,
                lp.add_variable(format!("storage_change[{id}]"), -UNBOUNDED, UNBOUNDED),
            );
            low_storage_vars.insert(
                b,
                lp.add_variable(format!("low_storage_factor[{id}]"), 0.0, 1.0),
            );
        }

        // Volume conservation per basin; forcing terms and the signed
        // entry coefficients are refreshed in `prepare`.
        let mut volume_constraints = BTreeMap::new();
        for &b in &basins {
            let id = registry.basins[b].node;
            let mut terms = vec![(storage_vars[&b], -1.0)];
            for &i in &entries {
                let entry = &layout.flow_entries[i];
                let mut sign = 0.0;
                if entry.basin_up == Some(b) {
                    sign -= 1.0;
                }
                if entry.basin_down == Some(b) {
                    sign += 1.0;
                }
                if sign != 0.0 {
                    terms.push((entry_vars[&i], sign));
                }
            }
            terms.push((low_storage_vars[&b], 0.0));
            volume_constraints.insert(
                b,
                lp.add_constraint(format!("volume_conservation[{id}]"), terms, Relation::Eq, 0.0),
            );
        }

        // Linearized hydraulics for level-driven connectors.
        let mut linearized = Vec::new();
        for &i in &entries {
            let entry = &layout.flow_entries[i];
            if !matches!(
                entry.kind,
                FlowEntryKind::RatingCurve
                    | FlowEntryKind::LinearResistance
                    | FlowEntryKind::ManningResistance
            ) {
                continue;
            }
            let name = match entry.kind {
                FlowEntryKind::RatingCurve => "tabulated_rating_curve",
                FlowEntryKind::LinearResistance => "linear_resistance",
                _ => "manning_resistance",
            };
            let mut terms = vec![(entry_vars[&i], 1.0)];
            if let Some(b) = entry.basin_up {
                if let Some(&var) = storage_vars.get(&b) {
                    terms.push((var, 0.0));
                }
            }
            if let Some(b) = entry.basin_down {
                if let Some(&var) = storage_vars.get(&b) {
                    terms.push((var, 0.0));
                }
            }
            let constraint = lp.add_constraint(
                format!("{name}[{}]", graph.node(entry.node).id),
                terms,
                Relation::Eq,
                0.0,
            );
            linearized.push((i, constraint));
        }

        // User demand variables: per-priority allocations summing to the
        // abstraction, with L1 error variables on each.
        let mut user_allocations = Vec::new();
        for &i in &entries {
            let entry = &layout.flow_entries[i];
            if entry.kind != FlowEntryKind::UserInflow {
                continue;
            }
            let params = &registry.user_demands[entry.local];
            let id = params.node;
            let mut sum_terms = vec![(entry_vars[&i], -1.0)];
            let earliest = params.demands.iter().map(|d| d.priority).min();
            for demand_entry in &params.demands {
                let p = demand_entry.priority;
                // The earliest priority may run negative to absorb
                // reverse flow; later priorities are non-negative.
                let lower = if Some(p) == earliest { -UNBOUNDED } else { 0.0 };
                let alloc = lp.add_variable(format!("alloc[{id}, p{p}]"), lower, UNBOUNDED);
                let shortfall =
                    lp.add_variable(format!("shortfall[{id}, p{p}]"), 0.0, UNBOUNDED);
                let surplus = lp.add_variable(format!("surplus[{id}, p{p}]"), 0.0, UNBOUNDED);
                let shortfall_constraint = lp.add_constraint(
                    format!("demand_shortfall[{id}, p{p}]"),
                    vec![(alloc, 1.0), (shortfall, 1.0)],
                    Relation::Ge,
                    0.0,
                );
                let surplus_constraint = lp.add_constraint(
                    format!("demand_surplus[{id}, p{p}]"),
                    vec![(alloc, 1.0), (surplus, -1.0)],
                    Relation::Le,
                    0.0,
                );
                sum_terms.push((alloc, 1.0));
                user_allocations.push(UserAllocation {
                    user_local: entry.local,
                    priority: p,
                    alloc,
                    negative_allowed: Some(p) == earliest,
                    shortfall,
                    surplus,
                    shortfall_constraint,
                    surplus_constraint,
                    demand: 0.0,
                });
            }
            lp.add_constraint(format!("demand_sum[{id}]"), sum_terms, Relation::Eq, 0.0);
            // Return flow ties the outflow entry to the inflow entry.
            if let Some(return_entry) = layout
                .flow_entries
                .iter()
                .position(|e| e.kind == FlowEntryKind::UserReturn && e.local == entry.local)
            {
                if let Some(&return_var) = entry_vars.get(&return_entry) {
                    lp.add_constraint(
                        format!("return_flow[{id}]"),
                        vec![(return_var, 1.0), (entry_vars[&i], -params.return_factor)],
                        Relation::Eq,
                        0.0,
                    );
                }
            }
        }

        // Flow demands target a connector's throughflow.
        let mut flow_demand_terms = Vec::new();
        for (d, demand) in registry.flow_demands.iter().enumerate() {
            let Some(target_index) = graph.index_of(demand.target) else {
                issues.push(ValidationIssue::UnknownNode {
                    node: demand.target.to_string(),
                });
                continue;
            };
            let Some(target_entry) = layout
                .flow_entries
                .iter()
                .position(|e| e.node == target_index)
            else {
                continue;
            };
            if !entries.contains(&target_entry) {
                continue;
            }
            let p = demand.priority;
            let id = demand.node;
            let shortfall = lp.add_variable(format!("shortfall[{id}, p{p}]"), 0.0, UNBOUNDED);
            let surplus = lp.add_variable(format!("surplus[{id}, p{p}]"), 0.0, UNBOUNDED);
            let shortfall_constraint = lp.add_constraint(
                format!("flow_demand_shortfall[{id}, p{p}]"),
                vec![(entry_vars[&target_entry], 1.0), (shortfall, 1.0)],
                Relation::Ge,
                0.0,
            );
            let surplus_constraint = lp.add_constraint(
                format!("flow_demand_surplus[{id}, p{p}]"),
                vec![(entry_vars[&target_entry], 1.0), (surplus, -1.0)],
                Relation::Le,
                0.0,
            );
            flow_demand_terms.push(FlowDemandTerms {
                demand_local: d,
                priority: p,
                target_entry,
                shortfall,
                surplus,
                shortfall_constraint,
                surplus_constraint,
                demand: 0.0,
            });
        }

        // Level demands bound a basin's storage band.
        let mut level_demand_terms = Vec::new();
        for (d, demand) in registry.level_demands.iter().enumerate() {
            let Some((_, basin_local, demand_subnetwork)) = graph.lookup(demand.basin) else {
                issues.push(ValidationIssue::UnknownNode {
                    node: demand.basin.to_string(),
                });
                continue;
            };
            if demand_subnetwork != subnetwork {
                continue;
            }
            let p = demand.priority;
            let id = demand.node;
            let lower_error =
                lp.add_variable(format!("level_lower_error[{id}]"), 0.0, UNBOUNDED);
            let upper_error =
                lp.add_variable(format!("level_upper_error[{id}]"), 0.0, UNBOUNDED);
            // lower_error >= min_storage - (S_start + change)
            let lower_constraint = lp.add_constraint(
                format!("level_demand_lower[{id}]"),
                vec![(lower_error, 1.0), (storage_vars[&basin_local], 1.0)],
                Relation::Ge,
                0.0,
            );
            // upper_error >= (S_start + change) - max_storage
            let upper_constraint = lp.add_constraint(
                format!("level_demand_upper[{id}]"),
                vec![(upper_error, 1.0), (storage_vars[&basin_local], -1.0)],
                Relation::Ge,
                0.0,
            );
            level_demand_terms.push(LevelDemandTerms {
                demand_local: d,
                basin_local,
                priority: p,
                lower_error,
                upper_error,
                lower_constraint,
                upper_constraint,
            });
        }

        // Inlets from the primary network.
        let inlet_links = graph.inlet_links_of(subnetwork);
        let inlet_entries: Vec<usize> = entries
            .iter()
            .copied()
            .filter(|&i| {
                layout.flow_entries[i]
                    .links
                    .iter()
                    .any(|l| inlet_links.contains(l))
            })
            .collect();

        // In the primary model, every secondary inlet carries one
        // allocated variable per priority, fed by collected demands.
        let mut inlet_allocations = Vec::new();
        if subnetwork == PRIMARY_SUBNETWORK {
            for link in graph.links() {
                let secondary = link.subnetwork;
                if secondary == PRIMARY_SUBNETWORK
                    || graph.node(link.from).subnetwork != PRIMARY_SUBNETWORK
                {
                    continue;
                }
                let Some(entry) = layout
                    .flow_entries
                    .iter()
                    .position(|e| e.links.contains(&link.index))
                else {
                    continue;
                };
                let Some(&entry_var) = entry_vars.get(&entry) else {
                    continue;
                };
                let mut sum_terms = vec![(entry_var, -1.0)];
                for &p in priorities {
                    let alloc = lp.add_variable(
                        format!("inlet_alloc[subnetwork {secondary}, p{p}]"),
                        0.0,
                        UNBOUNDED,
                    );
                    let shortfall = lp.add_variable(
                        format!("inlet_shortfall[subnetwork {secondary}, p{p}]"),
                        0.0,
                        UNBOUNDED,
                    );
                    let shortfall_constraint = lp.add_constraint(
                        format!("inlet_demand[subnetwork {secondary}, p{p}]"),
                        vec![(alloc, 1.0), (shortfall, 1.0)],
                        Relation::Ge,
                        0.0,
                    );
                    sum_terms.push((alloc, 1.0));
                    inlet_allocations.push(InletAllocation {
                        entry,
                        secondary,
                        priority: p,
                        alloc,
                        shortfall,
                        shortfall_constraint,
                        demand: 0.0,
                    });
                }
                lp.add_constraint(
                    format!("inlet_sum[subnetwork {secondary}]"),
                    sum_terms,
                    Relation::Eq,
                    0.0,
                );
            }
        }

        // Pre-created goal fixes, one per priority, disabled by a huge
        // right-hand side until a priority has been optimized.
        let mut fix_constraints = BTreeMap::new();
        for &p in priorities {
            let mut terms = Vec::new();
            for ua in &user_allocations {
                if ua.priority == p {
                    terms.push((ua.shortfall, 1.0));
                    terms.push((ua.surplus, 1.0));
                }
            }
            for fd in &flow_demand_terms {
                if fd.priority == p {
                    terms.push((fd.shortfall, 1.0));
                    terms.push((fd.surplus, 1.0));
                }
            }
            for ld in &level_demand_terms {
                if ld.priority == p {
                    terms.push((ld.lower_error, 1.0));
                    terms.push((ld.upper_error, 1.0));
                }
            }
            for ia in &inlet_allocations {
                if ia.priority == p {
                    terms.push((ia.shortfall, 1.0));
                }
            }
            if terms.is_empty() {
                continue;
            }
            fix_constraints.insert(
                p,
                lp.add_constraint(
                    format!("goal_fix[p{p}]"),
                    terms,
                    Relation::Le,
                    UNBOUNDED,
                ),
            );
        }

        Self {
            subnetwork,
            lp,
            entries,
            entry_vars,
            basins,
            storage_vars,
            low_storage_vars,
            volume_constraints,
            linearized,
            user_allocations,
            flow_demand_terms,
            level_demand_terms,
            fix_constraints,
            inlet_entries,
            inlet_allocations,
            flow_scale: 1.0,
            priorities: priorities.to_vec(),
            options: options.clone(),
        }
    }

    /// Serialize the current program (for the determinism regression).
    pub fn serialize_lp(&self) -> String {
        self.lp.serialize()
    }

    /// Refresh bounds, right-hand sides, and linearization coefficients
    /// from the current simulation state. `boundary_means` holds the
    /// mean rate per flow-boundary entry over the elapsed allocation
    /// interval [m³/s].
    #[allow(clippy::too_many_arguments)]
    pub fn prepare(
        &mut self,
        system: &HydroSystem<'_>,
        t: f64,
        storages: &[f64],
        boundary_means: &BTreeMap<usize, f64>,
    ) {
        let dt = self.options.timestep;
        let layout = &system.map.layout;
        let registry = system.registry;

        // Scale from the demand magnitude so the tableau stays
        // well-conditioned.
        let max_demand = self
            .user_allocations
            .iter()
            .map(|ua| {
                registry.user_demands[ua.user_local]
                    .demands
                    .iter()
                    .find(|d| d.priority == ua.priority)
                    .map(|d| d.demand.value_at(t))
                    .unwrap_or(0.0)
            })
            .fold(0.0_f64, f64::max);
        self.flow_scale = if max_demand > 0.0 {
            10.0_f64.powf(max_demand.log10().round()).clamp(1e-3, 1e6)
        } else {
            1.0
        };
        let fs = self.flow_scale;

        // Reset goal-programming state.
        for &constraint in self.fix_constraints.values() {
            self.lp.set_rhs(constraint, UNBOUNDED);
        }

        // Basin bounds and volume conservation right-hand sides.
        for &b in &self.basins {
            let basin = &registry.basins[b];
            let storage_var = self.storage_vars[&b];
            let max_storage = basin.profile.max_storage();
            self.lp.set_bounds(
                storage_var,
                -storages[b] / (fs * dt),
                ((max_storage - storages[b]).max(0.0)) / (fs * dt),
            );
            let constraint = self.volume_constraints[&b];
            let level = basin.profile.level_from_storage(storages[b]);
            let area = basin.profile.area_from_level(level);
            let forcing_in = basin.precipitation.integrate(t, t + dt) / dt
                * basin.profile.max_area()
                + basin.drainage.integrate(t, t + dt) / dt;
            let forcing_out = basin.potential_evaporation.integrate(t, t + dt) / dt * area
                + basin.infiltration.integrate(t, t + dt) / dt;
            // Outgoing forcing scales with the optimized low-storage
            // factor, keeping the LP from promising water evaporation
            // will already have taken.
            self.lp.set_term(
                constraint,
                self.low_storage_vars[&b],
                -forcing_out / fs,
            );
            self.lp.set_rhs(constraint, -forcing_in / fs);
        }

        // Entry bounds and linearized relations at the current state.
        let du = DVector::zeros(layout.total);
        for (&i, &var) in &self.entry_vars {
            let entry = &layout.flow_entries[i];
            match entry.kind {
                FlowEntryKind::Pump => {
                    let p = &registry.pumps[entry.local];
                    let upper = if p.max_flow_rate.is_finite() {
                        p.max_flow_rate / fs
                    } else {
                        UNBOUNDED
                    };
                    self.lp.set_bounds(var, p.min_flow_rate / fs, upper);
                }
                FlowEntryKind::Outlet => {
                    let p = &registry.outlets[entry.local];
                    let upper = if p.max_flow_rate.is_finite() {
                        p.max_flow_rate / fs
                    } else {
                        UNBOUNDED
                    };
                    self.lp.set_bounds(var, p.min_flow_rate / fs, upper);
                }
                FlowEntryKind::FlowBoundary => {
                    let mean = boundary_means.get(&i).copied().unwrap_or_else(|| {
                        registry.flow_boundaries[entry.local]
                            .schedule
                            .integrate(t, t + dt)
                            / dt
                    });
                    self.lp.set_bounds(var, mean / fs, mean / fs);
                }
                _ => {}
            }
        }
        for &(i, constraint) in &self.linearized {
            let entry = &layout.flow_entries[i];
            let q0 = system.entry_rate(entry, t, storages, None, &du);
            let mut rhs = q0.re;
            if let Some(b) = entry.basin_up {
                if let Some(&storage_var) = self.storage_vars.get(&b) {
                    let partial = system.entry_rate(entry, t, storages, Some(b), &du).eps;
                    // storage_change is in scaled volume units (fs·dt m³);
                    // dq/dS · fs·dt converts it to scaled flow units.
                    self.lp.set_term(constraint, storage_var, -partial * dt);
                }
            }
            if let Some(b) = entry.basin_down {
                if let Some(&storage_var) = self.storage_vars.get(&b) {
                    let partial = system.entry_rate(entry, t, storages, Some(b), &du).eps;
                    self.lp.set_term(constraint, storage_var, -partial * dt);
                }
            }
            self.lp.set_rhs(constraint, rhs / fs);
        }

        // Demand right-hand sides. Allocations are hard-capped at the
        // demand so no node can ever be handed surplus water.
        for ua in &mut self.user_allocations {
            let params = &registry.user_demands[ua.user_local];
            let demand = params
                .demands
                .iter()
                .find(|d| d.priority == ua.priority)
                .map(|d| d.demand.value_at(t))
                .unwrap_or(0.0);
            ua.demand = demand;
            let lower = if ua.negative_allowed { -UNBOUNDED } else { 0.0 };
            self.lp.set_bounds(ua.alloc, lower, demand / fs);
            self.lp.set_rhs(ua.shortfall_constraint, demand / fs);
            self.lp.set_rhs(ua.surplus_constraint, demand / fs);
        }
        for fd in &mut self.flow_demand_terms {
            let demand = registry.flow_demands[fd.demand_local].demand.value_at(t);
            fd.demand = demand;
            self.lp.set_rhs(fd.shortfall_constraint, demand / fs);
            self.lp.set_rhs(fd.surplus_constraint, demand / fs);
        }
        for ld in &self.level_demand_terms {
            let params = &registry.level_demands[ld.demand_local];
            let profile = &registry.basins[ld.basin_local].profile;
            let min_storage = profile.storage_from_level(params.min_level.value_at(t));
            let max_storage = profile.storage_from_level(params.max_level.value_at(t));
            let start = storages[ld.basin_local];
            self.lp.set_rhs(
                ld.lower_constraint,
                (min_storage - start) / (fs * dt),
            );
            self.lp.set_rhs(
                ld.upper_constraint,
                (start - max_storage) / (fs * dt),
            );
        }
    }

    /// Install the collected secondary demands on the primary's inlet
    /// allocation variables.
    pub fn set_inlet_demands(&mut self, collected: &BTreeMap<u32, Vec<(u32, f64)>>) {
        let fs = self.flow_scale;
        for ia in &mut self.inlet_allocations {
            let demand = collected
                .get(&ia.secondary)
                .and_then(|per_priority| {
                    per_priority
                        .iter()
                        .find(|(p, _)| *p == ia.priority)
                        .map(|(_, d)| *d)
                })
                .unwrap_or(0.0);
            ia.demand = demand;
            self.lp.set_bounds(ia.alloc, 0.0, demand / fs);
            self.lp.set_rhs(ia.shortfall_constraint, demand / fs);
        }
    }

    /// Cap (Final) or free (Collect) the inlet entries.
    fn configure_inlets(&mut self, pass: SolvePass, granted: &BTreeMap<usize, f64>) {
        let fs = self.flow_scale;
        for &entry in &self.inlet_entries.clone() {
            let var = self.entry_vars[&entry];
            match pass {
                SolvePass::Collect => self.lp.set_bounds(var, 0.0, UNBOUNDED),
                SolvePass::Final => {
                    let cap = granted.get(&entry).copied().unwrap_or(0.0);
                    self.lp.set_bounds(var, 0.0, cap / fs);
                }
                SolvePass::Primary => {}
            }
        }
    }

    /// Run the goal-programming loop: one objective per priority in
    /// ascending order, each fixed before the next, then the terminal
    /// low-storage and route-preference objective.
    pub fn solve(
        &mut self,
        graph: &NetworkGraph,
        registry: &NodeRegistry,
        map: &StateMap,
        pass: SolvePass,
        granted: &BTreeMap<usize, f64>,
    ) -> Result<AllocationOutcome, (String, LpError, Vec<String>)> {
        self.configure_inlets(pass, granted);
        // Each pass is its own goal-programming sequence: clear any fix
        // left by the previous pass before optimizing again.
        for &constraint in self.fix_constraints.values() {
            self.lp.set_rhs(constraint, UNBOUNDED);
        }
        let fs = self.flow_scale;
        let mut outcome = AllocationOutcome::default();
        let mut collected_so_far: BTreeMap<usize, f64> = BTreeMap::new();

        let priorities = self.priorities.clone();
        for &p in &priorities {
            self.lp.clear_objective();
            let mut any_term = false;
            for ua in &self.user_allocations {
                if ua.priority == p {
                    self.lp.add_objective_term(ua.shortfall, 1.0);
                    self.lp.add_objective_term(ua.surplus, 1.0);
                    any_term = true;
                }
            }
            for fd in &self.flow_demand_terms {
                if fd.priority == p {
                    self.lp.add_objective_term(fd.shortfall, 1.0);
                    self.lp.add_objective_term(fd.surplus, 1.0);
                    any_term = true;
                }
            }
            for ld in &self.level_demand_terms {
                if ld.priority == p {
                    self.lp.add_objective_term(ld.lower_error, 1.0);
                    self.lp.add_objective_term(ld.upper_error, 1.0);
                    any_term = true;
                }
            }
            for ia in &self.inlet_allocations {
                if ia.priority == p {
                    self.lp.add_objective_term(ia.shortfall, 1.0);
                    any_term = true;
                }
            }
            if !any_term {
                continue;
            }
            self.add_fairness_terms(p);
            self.add_source_priority_terms(graph, map);

            let objective_name = format!("demand_priority[{p}]");
            let solution = self.lp.solve().map_err(|error| {
                let iis = if error == LpError::Infeasible {
                    self.lp.compute_iis()
                } else {
                    Vec::new()
                };
                (objective_name.clone(), error, iis)
            })?;
            debug!(
                subnetwork = self.subnetwork,
                priority = p,
                objective = solution.objective,
                "allocation objective solved"
            );

            // Fix this priority's achieved demand error before moving on.
            if let Some(&fix) = self.fix_constraints.get(&p) {
                let achieved: f64 = self
                    .demand_error_value(&solution.values, p);
                self.lp.set_rhs(fix, achieved + 1e-9);
            }

            // In the collection pass, what the inlets drew so far at this
            // priority becomes the secondary's demand on the primary.
            if pass == SolvePass::Collect {
                for &entry in &self.inlet_entries {
                    let flow = solution.values[self.entry_vars[&entry]] * fs;
                    let already = collected_so_far.get(&entry).copied().unwrap_or(0.0);
                    let increment = (flow - already).max(0.0);
                    outcome
                        .inlet_allocated
                        .entry(entry)
                        .or_default()
                        .push((p, increment));
                    collected_so_far.insert(entry, flow);
                }
            }

            // Record per-demand rows at this priority.
            for ua in &self.user_allocations {
                if ua.priority == p {
                    outcome.allocations.push((
                        registry.user_demands[ua.user_local].node,
                        p,
                        ua.demand,
                        solution.values[ua.alloc] * fs,
                    ));
                }
            }
            for fd in &self.flow_demand_terms {
                if fd.priority == p {
                    outcome.allocations.push((
                        registry.flow_demands[fd.demand_local].node,
                        p,
                        fd.demand,
                        solution.values[self.entry_vars[&fd.target_entry]] * fs,
                    ));
                }
            }
            for ld in &self.level_demand_terms {
                if ld.priority == p {
                    let shortfall = solution.values[ld.lower_error] * fs;
                    outcome.allocations.push((
                        registry.level_demands[ld.demand_local].node,
                        p,
                        0.0,
                        -shortfall,
                    ));
                }
            }
        }

        // Terminal objective: keep basins out of the low-storage regime
        // and bias flow off non-preferred routes.
        self.lp.clear_objective();
        for &var in self.low_storage_vars.values() {
            self.lp.add_objective_term(var, -1.0);
        }
        for &var in self.entry_vars.values() {
            self.lp.add_objective_term(var, ROUTE_WEIGHT);
        }
        let final_solution = self.lp.solve().map_err(|error| {
            let iis = if error == LpError::Infeasible {
                self.lp.compute_iis()
            } else {
                Vec::new()
            };
            ("terminal_low_storage".to_string(), error, iis)
        })?;
        for (&entry, &var) in &self.entry_vars {
            outcome
                .entry_flows
                .insert(entry, final_solution.values[var] * fs);
        }
        // Re-read the allocated values at the terminal optimum so the
        // writeback matches the flows actually chosen.
        for row in outcome.allocations.iter_mut() {
            if let Some(ua) = self
                .user_allocations
                .iter()
                .find(|ua| registry.user_demands[ua.user_local].node == row.0 && ua.priority == row.1)
            {
                row.3 = final_solution.values[ua.alloc] * fs;
            }
        }
        if pass == SolvePass::Primary {
            for ia in &self.inlet_allocations {
                outcome
                    .inlet_allocated
                    .entry(ia.entry)
                    .or_default()
                    .push((ia.priority, final_solution.values[ia.alloc] * fs));
                let inlet_node = graph.node(map.layout.flow_entries[ia.entry].node).id;
                outcome.allocations.push((
                    inlet_node,
                    ia.priority,
                    ia.demand,
                    final_solution.values[ia.alloc] * fs,
                ));
            }
        }
        Ok(outcome)
    }

    fn demand_error_value(&self, values: &[f64], priority: u32) -> f64 {
        let mut total = 0.0;
        for ua in &self.user_allocations {
            if ua.priority == priority {
                total += values[ua.shortfall] + values[ua.surplus];
            }
        }
        for fd in &self.flow_demand_terms {
            if fd.priority == priority {
                total += values[fd.shortfall] + values[fd.surplus];
            }
        }
        for ld in &self.level_demand_terms {
            if ld.priority == priority {
                total += values[ld.lower_error] + values[ld.upper_error];
            }
        }
        for ia in &self.inlet_allocations {
            if ia.priority == priority {
                total += values[ia.shortfall];
            }
        }
        total
    }

    /// Fairness: penalize deviations of each demand's relative shortfall
    /// from the priority's mean. Realized with the shortfall weights
    /// directly: demands are normalized by their magnitude so equal
    /// relative deficits cost the same.
    fn add_fairness_terms(&mut self, priority: u32) {
        for ua in &self.user_allocations {
            if ua.priority == priority && ua.demand > 0.0 {
                let fs = self.flow_scale;
                self.lp
                    .add_objective_term(ua.shortfall, FAIRNESS_WEIGHT * fs / ua.demand.max(1e-9));
            }
        }
    }

    /// Tie-break by source priority: Σ (1 / source_priority) · flow over
    /// the source entries of the subnetwork.
    fn add_source_priority_terms(&mut self, graph: &NetworkGraph, map: &StateMap) {
        let sp = self.options.source_priorities;
        for (&i, &var) in &self.entry_vars {
            let entry = &map.layout.flow_entries[i];
            let weight = match entry.kind {
                FlowEntryKind::FlowBoundary => Some(sp.flow_boundary),
                _ if self.inlet_entries.contains(&i) => Some(sp.subnetwork_inlet),
                _ => match entry.endpoint_up.map(|e| graph.node(e).id.node_type) {
                    Some(NodeType::LevelBoundary) => Some(sp.level_boundary),
                    _ => None,
                },
            };
            if let Some(weight) = weight {
                self.lp
                    .add_objective_term(var, SOURCE_PRIORITY_WEIGHT / weight as f64);
            }
        }
        // Basin storage as a source: release (negative storage change)
        // is priced by the basin source priority.
        for &var in self.storage_vars.values() {
            self.lp
                .add_objective_term(var, -(SOURCE_PRIORITY_WEIGHT / sp.basin as f64));
        }
    }
}
