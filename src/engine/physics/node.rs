// ABOUTME: Per-type node parameter tables and the controllable-rate cells the control layer writes
// ABOUTME: Parameters are immutable after construction except where control explicitly patches them

use std::cell::{Cell, RefCell};

use crate::engine::core::interp::Interpolation;
use crate::engine::network::id::NodeId;
use crate::engine::physics::profile::BasinProfile;

/// A flow-rate setpoint with three layers: an optional time schedule, a
/// static fallback, and a control/allocation override. The override wins
/// while present; the single-threaded scheduler serializes all writes.
#[derive(Debug, Clone)]
pub struct ControllableRate {
    schedule: Option<Interpolation>,
    fallback: f64,
    override_value: Cell<Option<f64>>,
}

impl ControllableRate {
    pub fn fixed(rate: f64) -> Self {
        Self {
            schedule: None,
            fallback: rate,
            override_value: Cell::new(None),
        }
    }

    pub fn scheduled(schedule: Interpolation) -> Self {
        Self {
            fallback: schedule.value_at(schedule.first_x()),
            schedule: Some(schedule),
            override_value: Cell::new(None),
        }
    }

    /// The target rate at simulation time t [s].
    pub fn target_at(&self, t: f64) -> f64 {
        if let Some(value) = self.override_value.get() {
            return value;
        }
        match &self.schedule {
            Some(curve) => curve.value_at(t),
            None => self.fallback,
        }
    }

    pub fn set_override(&self, value: f64) {
        self.override_value.set(Some(value));
    }

    pub fn clear_override(&self) {
        self.override_value.set(None);
    }

    pub fn schedule(&self) -> Option<&Interpolation> {
        self.schedule.as_ref()
    }
}

/// How a boundary time series is read between breakpoints.
#[derive(Debug, Clone)]
pub enum FlowSchedule {
    /// Piecewise-linear in time; the mean over a save interval matches
    /// the closed-form integral exactly.
    Linear(Interpolation),
    /// Piecewise-constant with a C¹ smoothstep ramp of `transition`
    /// seconds after each breakpoint.
    Block {
        steps: Interpolation,
        transition: f64,
    },
}

impl FlowSchedule {
    pub fn value_at(&self, t: f64) -> f64 {
        match self {
            FlowSchedule::Linear(curve) => curve.value_at(t),
            FlowSchedule::Block { steps, transition } => {
                let xs = steps.xs();
                let ys = steps.ys();
                if t <= xs[0] {
                    return ys[0];
                }
                let i = match xs.binary_search_by(|probe| probe.partial_cmp(&t).unwrap()) {
                    Ok(i) => i,
                    Err(i) => i - 1,
                };
                let target = ys[i.min(ys.len() - 1)];
                if i == 0 || *transition <= 0.0 {
                    return target;
                }
                let elapsed = t - xs[i];
                if elapsed >= *transition {
                    return target;
                }
                let previous = ys[i - 1];
                let p = elapsed / *transition;
                previous + (target - previous) * (3.0 * p * p - 2.0 * p * p * p)
            }
        }
    }

    /// Exact integral over [a, b]; ramps use the smoothstep antiderivative
    /// p³ − p⁴/2.
    pub fn integrate(&self, a: f64, b: f64) -> f64 {
        match self {
            FlowSchedule::Linear(curve) => curve.integrate(a, b),
            FlowSchedule::Block { steps, transition } => {
                let mut cuts = vec![a, b];
                let xs = steps.xs();
                for &x in xs {
                    if x > a && x < b {
                        cuts.push(x);
                    }
                    let ramp_end = x + *transition;
                    if ramp_end > a && ramp_end < b {
                        cuts.push(ramp_end);
                    }
                }
                cuts.sort_by(|p, q| p.partial_cmp(q).unwrap());
                cuts.dedup();
                let mut total = 0.0;
                for pair in cuts.windows(2) {
                    total += self.integrate_piece(pair[0], pair[1]);
                }
                total
            }
        }
    }

    /// Integral over a piece that contains no breakpoint or ramp end in
    /// its interior.
    fn integrate_piece(&self, a: f64, b: f64) -> f64 {
        let (steps, transition) = match self {
            FlowSchedule::Block { steps, transition } => (steps, *transition),
            FlowSchedule::Linear(curve) => return curve.integrate(a, b),
        };
        let xs = steps.xs();
        let ys = steps.ys();
        if a < xs[0] {
            return ys[0] * (b - a);
        }
        let i = match xs.binary_search_by(|probe| probe.partial_cmp(&a).unwrap()) {
            Ok(i) => i,
            Err(i) => i - 1,
        };
        let target = ys[i.min(ys.len() - 1)];
        if i == 0 || transition <= 0.0 || a >= xs[i] + transition {
            return target * (b - a);
        }
        // Inside the ramp after xs[i].
        let previous = ys[i - 1];
        let p0 = (a - xs[i]) / transition;
        let p1 = ((b - xs[i]) / transition).min(1.0);
        let smooth_area = |p: f64| p.powi(3) - 0.5 * p.powi(4);
        previous * (b - a) + (target - previous) * transition * (smooth_area(p1) - smooth_area(p0))
    }

    /// Derivative-discontinuity instants within (a, b), used as
    /// integrator stop times.
    pub fn breakpoints_within(&self, a: f64, b: f64, out: &mut Vec<f64>) {
        match self {
            FlowSchedule::Linear(curve) => curve.breakpoints_within(a, b, out),
            FlowSchedule::Block { steps, transition } => {
                for &x in steps.xs() {
                    if x > a && x < b {
                        out.push(x);
                    }
                    let ramp_end = x + *transition;
                    if ramp_end > a && ramp_end < b {
                        out.push(ramp_end);
                    }
                }
            }
        }
    }
}

/// Basin geometry plus its vertical flux time series. Rates are in SI:
/// precipitation and potential evaporation in m/s over the basin
/// footprint, drainage and infiltration in m³/s.
#[derive(Debug, Clone)]
pub struct BasinParams {
    pub node: NodeId,
    pub profile: BasinProfile,
    pub precipitation: Interpolation,
    pub potential_evaporation: Interpolation,
    pub drainage: Interpolation,
    pub infiltration: Interpolation,
}

#[derive(Debug, Clone)]
pub struct LinearResistanceParams {
    pub node: NodeId,
    /// Resistance R [s/m²]: Q = Δh / R.
    pub resistance: f64,
    pub max_flow_rate: f64,
    pub active: Cell<bool>,
}

#[derive(Debug, Clone)]
pub struct ManningResistanceParams {
    pub node: NodeId,
    /// Reach length [m].
    pub length: f64,
    /// Bottom width [m] of the trapezoidal cross-section.
    pub profile_width: f64,
    /// Side slope [m horizontal per m vertical]; 0 is rectangular.
    pub profile_slope: f64,
    /// Manning roughness n [s/m^{1/3}].
    pub manning_n: f64,
}

/// A named family of rating curves with one active member.
#[derive(Debug, Clone)]
pub struct RatingCurveParams {
    pub node: NodeId,
    /// (control state name, level→flow table), sorted by name.
    pub tables: Vec<(String, Interpolation)>,
    pub active: Cell<usize>,
}

impl RatingCurveParams {
    pub fn active_curve(&self) -> &Interpolation {
        &self.tables[self.active.get()].1
    }

    pub fn activate(&self, name: &str) -> bool {
        match self.tables.binary_search_by(|(n, _)| n.as_str().cmp(name)) {
            Ok(i) => {
                self.active.set(i);
                true
            }
            Err(_) => false,
        }
    }
}

/// Shared parameter shape for Pump and Outlet nodes: a target rate pushed
/// through capacity clamps and smoothed level gates.
#[derive(Debug, Clone)]
pub struct RegulatedParams {
    pub node: NodeId,
    pub rate: ControllableRate,
    pub min_flow_rate: f64,
    pub max_flow_rate: f64,
    pub min_upstream_level: Option<f64>,
    pub max_downstream_level: Option<f64>,
    pub active: Cell<bool>,
    pub pid_controlled: Cell<bool>,
    /// Set when the node sits in a subnetwork whose allocation writes its
    /// setpoint each allocation step.
    pub allocation_controlled: bool,
}

#[derive(Debug, Clone)]
pub struct FlowBoundaryParams {
    pub node: NodeId,
    pub schedule: FlowSchedule,
}

#[derive(Debug, Clone)]
pub struct LevelBoundaryParams {
    pub node: NodeId,
    pub level: Interpolation,
}

/// One priority slice of a user's demand.
#[derive(Debug, Clone)]
pub struct DemandEntry {
    pub priority: u32,
    pub demand: Interpolation,
}

#[derive(Debug, Clone)]
pub struct UserDemandParams {
    pub node: NodeId,
    /// Sorted by ascending priority value (most important first).
    pub demands: Vec<DemandEntry>,
    /// Fraction of the abstraction returned through the outflow link.
    pub return_factor: f64,
    /// Source level under which abstraction shuts down smoothly.
    pub min_level: Option<f64>,
    /// Allocated rate per demand entry; rewritten by each allocation
    /// solve. Infinity means "not under allocation", demand applies as-is.
    pub allocated: RefCell<Vec<f64>>,
}

impl UserDemandParams {
    /// Instantaneous abstraction target [m³/s] at time t: the sum over
    /// priorities of the demand, capped by allocation when present.
    pub fn target_rate(&self, t: f64) -> f64 {
        let allocated = self.allocated.borrow();
        self.demands
            .iter()
            .zip(allocated.iter())
            .map(|(entry, &alloc)| entry.demand.value_at(t).min(alloc))
            .sum()
    }
}

#[derive(Debug, Clone)]
pub struct FlowDemandParams {
    pub node: NodeId,
    /// The non-Basin node whose throughflow is demanded.
    pub target: NodeId,
    pub priority: u32,
    pub demand: Interpolation,
}

#[derive(Debug, Clone)]
pub struct LevelDemandParams {
    pub node: NodeId,
    /// The basin whose level band is demanded.
    pub basin: NodeId,
    pub priority: u32,
    pub min_level: Interpolation,
    pub max_level: Interpolation,
}

/// All per-type parameter tables, indexed by each node's local index.
#[derive(Debug, Default)]
pub struct NodeRegistry {
    pub basins: Vec<BasinParams>,
    pub linear_resistances: Vec<LinearResistanceParams>,
    pub manning_resistances: Vec<ManningResistanceParams>,
    pub rating_curves: Vec<RatingCurveParams>,
    pub pumps: Vec<RegulatedParams>,
    pub outlets: Vec<RegulatedParams>,
    pub flow_boundaries: Vec<FlowBoundaryParams>,
    pub level_boundaries: Vec<LevelBoundaryParams>,
    pub user_demands: Vec<UserDemandParams>,
    pub flow_demands: Vec<FlowDemandParams>,
    pub level_demands: Vec<LevelDemandParams>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::core::interp::Extrapolation;

    #[test]
    fn controllable_rate_override_wins() {
        let rate = ControllableRate::fixed(2.0);
        assert_eq!(rate.target_at(0.0), 2.0);
        rate.set_override(5.5);
        assert_eq!(rate.target_at(100.0), 5.5);
        rate.clear_override();
        assert_eq!(rate.target_at(100.0), 2.0);
    }

    #[test]
    fn block_schedule_ramps_between_steps() {
        let steps = Interpolation::new(
            vec![0.0, 100.0],
            vec![1.0, 3.0],
            Extrapolation::Constant,
            Extrapolation::Constant,
            "test",
        )
        .unwrap();
        let schedule = FlowSchedule::Block {
            steps,
            transition: 10.0,
        };
        assert_eq!(schedule.value_at(50.0), 1.0);
        assert_eq!(schedule.value_at(105.0), 2.0); // smoothstep midpoint
        assert_eq!(schedule.value_at(120.0), 3.0);
    }

    #[test]
    fn block_integral_accounts_for_the_ramp() {
        let steps = Interpolation::new(
            vec![0.0, 100.0],
            vec![0.0, 1.0],
            Extrapolation::Constant,
            Extrapolation::Constant,
            "test",
        )
        .unwrap();
        let schedule = FlowSchedule::Block {
            steps,
            transition: 10.0,
        };
        // Half the ramp area is lost relative to an instant switch.
        let total = schedule.integrate(0.0, 200.0);
        assert!((total - (100.0 - 5.0)).abs() < 1e-9);
    }

    #[test]
    fn user_demand_caps_at_allocated() {
        let params = UserDemandParams {
            node: NodeId::new(crate::engine::network::id::NodeType::UserDemand, 1),
            demands: vec![DemandEntry {
                priority: 1,
                demand: Interpolation::constant(4.0),
            }],
            return_factor: 0.5,
            min_level: None,
            allocated: RefCell::new(vec![f64::INFINITY]),
        };
        assert_eq!(params.target_rate(0.0), 4.0);
        *params.allocated.borrow_mut() = vec![1.5];
        assert_eq!(params.target_rate(0.0), 1.5);
    }
}
