// ABOUTME: Typed model construction: node/link specs, parameter assembly, aggregated validation
// ABOUTME: Specs are serde-friendly so a model can live inline in the configuration file

use std::cell::Cell;
use std::cell::RefCell;
use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::engine::control::continuous::ContinuousTarget;
use crate::engine::control::discrete::{ControlAction, Threshold};
use crate::engine::control::pid::{PidControlParams, PidTargetKind};
use crate::engine::control::{
    CompoundVariable, ContinuousControlParams, ControlRegistry, DiscreteControlParams,
    ListenVariable, SubVariable,
};
use crate::engine::core::error::{HydronetError, ValidationIssue};
use crate::engine::core::interp::{Extrapolation, Interpolation};
use crate::engine::network::graph::{NetworkGraph, PRIMARY_SUBNETWORK};
use crate::engine::network::id::{LinkType, NodeId, NodeType};
use crate::engine::physics::node::{
    BasinParams, ControllableRate, DemandEntry, FlowBoundaryParams, FlowSchedule,
    LevelBoundaryParams, LevelDemandParams, LinearResistanceParams, ManningResistanceParams,
    NodeRegistry, RatingCurveParams, RegulatedParams, UserDemandParams, FlowDemandParams,
};
use crate::engine::physics::profile::BasinProfile;
use crate::engine::physics::subgrid::SubgridElement;
use crate::engine::solver::state::StateMap;

/// How a scalar-over-time input is written in a spec: either one number
/// or a breakpoint table.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SeriesSpec {
    Constant(f64),
    Table {
        time: Vec<f64>,
        value: Vec<f64>,
        #[serde(default)]
        extrapolation: ExtrapolationSpec,
    },
}

impl Default for SeriesSpec {
    fn default() -> Self {
        SeriesSpec::Constant(0.0)
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ExtrapolationSpec {
    #[default]
    Constant,
    Linear,
    Periodic,
}

impl From<ExtrapolationSpec> for Extrapolation {
    fn from(spec: ExtrapolationSpec) -> Self {
        match spec {
            ExtrapolationSpec::Constant => Extrapolation::Constant,
            ExtrapolationSpec::Linear => Extrapolation::Linear,
            ExtrapolationSpec::Periodic => Extrapolation::Periodic,
        }
    }
}

impl SeriesSpec {
    fn to_interpolation(&self, context: &str, issues: &mut Vec<ValidationIssue>) -> Interpolation {
        match self {
            SeriesSpec::Constant(value) => Interpolation::constant(*value),
            SeriesSpec::Table {
                time,
                value,
                extrapolation,
            } => match Interpolation::new(
                time.clone(),
                value.clone(),
                (*extrapolation).into(),
                (*extrapolation).into(),
                context,
            ) {
                Ok(curve) => curve,
                Err(issue) => {
                    issues.push(issue);
                    Interpolation::constant(0.0)
                }
            },
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BasinSpec {
    pub node_id: i32,
    #[serde(default = "default_subnetwork")]
    pub subnetwork: u32,
    pub profile_level: Vec<f64>,
    pub profile_area: Vec<f64>,
    #[serde(default)]
    pub profile_storage: Option<Vec<f64>>,
    #[serde(default)]
    pub initial_storage: Option<f64>,
    #[serde(default)]
    pub initial_level: Option<f64>,
    #[serde(default)]
    pub precipitation: SeriesSpec,
    #[serde(default)]
    pub potential_evaporation: SeriesSpec,
    #[serde(default)]
    pub drainage: SeriesSpec,
    #[serde(default)]
    pub infiltration: SeriesSpec,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LinearResistanceSpec {
    pub node_id: i32,
    #[serde(default = "default_subnetwork")]
    pub subnetwork: u32,
    pub resistance: f64,
    #[serde(default = "default_infinite")]
    pub max_flow_rate: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ManningResistanceSpec {
    pub node_id: i32,
    #[serde(default = "default_subnetwork")]
    pub subnetwork: u32,
    pub length: f64,
    pub profile_width: f64,
    #[serde(default)]
    pub profile_slope: f64,
    pub manning_n: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RatingCurveTableSpec {
    #[serde(default = "default_table_name")]
    pub name: String,
    pub level: Vec<f64>,
    pub flow: Vec<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TabulatedRatingCurveSpec {
    pub node_id: i32,
    #[serde(default = "default_subnetwork")]
    pub subnetwork: u32,
    pub tables: Vec<RatingCurveTableSpec>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PumpSpec {
    pub node_id: i32,
    #[serde(default = "default_subnetwork")]
    pub subnetwork: u32,
    #[serde(default)]
    pub flow_rate: SeriesSpec,
    #[serde(default)]
    pub min_flow_rate: f64,
    #[serde(default = "default_infinite")]
    pub max_flow_rate: f64,
    #[serde(default)]
    pub min_upstream_level: Option<f64>,
    #[serde(default)]
    pub max_downstream_level: Option<f64>,
}

pub type OutletSpec = PumpSpec;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FlowBoundarySpec {
    pub node_id: i32,
    #[serde(default = "default_subnetwork")]
    pub subnetwork: u32,
    pub flow_rate: SeriesSpec,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LevelBoundarySpec {
    pub node_id: i32,
    #[serde(default = "default_subnetwork")]
    pub subnetwork: u32,
    pub level: SeriesSpec,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PassiveNodeSpec {
    pub node_id: i32,
    #[serde(default = "default_subnetwork")]
    pub subnetwork: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct UserDemandDemandSpec {
    pub priority: u32,
    pub demand: SeriesSpec,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct UserDemandSpec {
    pub node_id: i32,
    #[serde(default = "default_subnetwork")]
    pub subnetwork: u32,
    pub demands: Vec<UserDemandDemandSpec>,
    #[serde(default)]
    pub return_factor: f64,
    #[serde(default)]
    pub min_level: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FlowDemandSpec {
    pub node_id: i32,
    #[serde(default = "default_subnetwork")]
    pub subnetwork: u32,
    pub target_type: String,
    pub target_id: i32,
    pub priority: u32,
    pub demand: SeriesSpec,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LevelDemandSpec {
    pub node_id: i32,
    #[serde(default = "default_subnetwork")]
    pub subnetwork: u32,
    pub basin_id: i32,
    pub priority: u32,
    pub min_level: SeriesSpec,
    pub max_level: SeriesSpec,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SubVariableSpec {
    pub listen_type: String,
    pub listen_id: i32,
    #[serde(default = "default_variable")]
    pub variable: String,
    #[serde(default = "default_weight")]
    pub weight: f64,
    #[serde(default)]
    pub look_ahead: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CompoundVariableSpec {
    pub subvariables: Vec<SubVariableSpec>,
    pub thresholds: Vec<ThresholdSpec>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ThresholdSpec {
    pub value: SeriesSpec,
    #[serde(default)]
    pub hysteresis: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ControlActionSpec {
    pub target_type: String,
    pub target_id: i32,
    pub parameter: String,
    #[serde(default)]
    pub value: Option<f64>,
    #[serde(default)]
    pub table: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DiscreteControlSpec {
    pub node_id: i32,
    #[serde(default = "default_subnetwork")]
    pub subnetwork: u32,
    pub variables: Vec<CompoundVariableSpec>,
    /// Truth pattern (over 'T'/'F'/'*') to control state name.
    pub logic: BTreeMap<String, String>,
    pub states: BTreeMap<String, Vec<ControlActionSpec>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ContinuousControlSpec {
    pub node_id: i32,
    #[serde(default = "default_subnetwork")]
    pub subnetwork: u32,
    pub subvariables: Vec<SubVariableSpec>,
    pub function_input: Vec<f64>,
    pub function_output: Vec<f64>,
    pub target_type: String,
    pub target_id: i32,
    #[serde(default)]
    pub min_value: f64,
    #[serde(default = "default_infinite")]
    pub max_value: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PidControlSpec {
    pub node_id: i32,
    #[serde(default = "default_subnetwork")]
    pub subnetwork: u32,
    pub listen_basin_id: i32,
    pub target_type: String,
    pub target_id: i32,
    pub target_level: SeriesSpec,
    #[serde(default)]
    pub proportional: SeriesSpec,
    #[serde(default)]
    pub integral: SeriesSpec,
    #[serde(default)]
    pub derivative: SeriesSpec,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SubgridSpec {
    pub subgrid_id: i32,
    pub basin_id: i32,
    pub basin_level: Vec<f64>,
    pub subgrid_level: Vec<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LinkSpec {
    pub from_type: String,
    pub from_id: i32,
    pub to_type: String,
    pub to_id: i32,
}

/// The whole network written as data, e.g. inline in the TOML config.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct ModelSpec {
    pub basin: Vec<BasinSpec>,
    pub linear_resistance: Vec<LinearResistanceSpec>,
    pub manning_resistance: Vec<ManningResistanceSpec>,
    pub tabulated_rating_curve: Vec<TabulatedRatingCurveSpec>,
    pub pump: Vec<PumpSpec>,
    pub outlet: Vec<OutletSpec>,
    pub flow_boundary: Vec<FlowBoundarySpec>,
    pub level_boundary: Vec<LevelBoundarySpec>,
    pub terminal: Vec<PassiveNodeSpec>,
    pub junction: Vec<PassiveNodeSpec>,
    pub user_demand: Vec<UserDemandSpec>,
    pub flow_demand: Vec<FlowDemandSpec>,
    pub level_demand: Vec<LevelDemandSpec>,
    pub discrete_control: Vec<DiscreteControlSpec>,
    pub continuous_control: Vec<ContinuousControlSpec>,
    pub pid_control: Vec<PidControlSpec>,
    pub subgrid: Vec<SubgridSpec>,
    pub link: Vec<LinkSpec>,
}

fn default_subnetwork() -> u32 {
    PRIMARY_SUBNETWORK
}

fn default_infinite() -> f64 {
    f64::INFINITY
}

fn default_table_name() -> String {
    "default".to_string()
}

fn default_variable() -> String {
    "level".to_string()
}

fn default_weight() -> f64 {
    1.0
}

fn parse_node_type(name: &str) -> Option<NodeType> {
    Some(match name {
        "Basin" => NodeType::Basin,
        "LinearResistance" => NodeType::LinearResistance,
        "ManningResistance" => NodeType::ManningResistance,
        "TabulatedRatingCurve" => NodeType::TabulatedRatingCurve,
        "Pump" => NodeType::Pump,
        "Outlet" => NodeType::Outlet,
        "FlowBoundary" => NodeType::FlowBoundary,
        "LevelBoundary" => NodeType::LevelBoundary,
        "Terminal" => NodeType::Terminal,
        "Junction" => NodeType::Junction,
        "UserDemand" => NodeType::UserDemand,
        "FlowDemand" => NodeType::FlowDemand,
        "LevelDemand" => NodeType::LevelDemand,
        "DiscreteControl" => NodeType::DiscreteControl,
        "ContinuousControl" => NodeType::ContinuousControl,
        "PidControl" => NodeType::PidControl,
        _ => return None,
    })
}

/// The fully validated construction product handed to the simulation.
pub struct BuiltModel {
    pub graph: NetworkGraph,
    pub registry: NodeRegistry,
    pub controls: ControlRegistry,
    pub subgrid: Vec<SubgridElement>,
    pub map: StateMap,
    /// Initial storage per local basin index.
    pub initial_storages: Vec<f64>,
}

/// Accumulates a model spec, then validates and assembles everything in
/// one pass so every problem is reported together.
#[derive(Debug, Default)]
pub struct ModelBuilder {
    spec: ModelSpec,
    /// Warm-restart storages override initial conditions per node id.
    warm_storages: BTreeMap<i32, f64>,
    /// Block-interpolated flow boundaries with this transition period.
    block_transition: Option<f64>,
}

impl ModelBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_spec(spec: ModelSpec) -> Self {
        Self {
            spec,
            ..Self::default()
        }
    }

    pub fn spec_mut(&mut self) -> &mut ModelSpec {
        &mut self.spec
    }

    /// Interpret flow boundary tables as block schedules with the given
    /// smoothing transition period [s].
    pub fn block_flow_boundaries(&mut self, transition_period: f64) -> &mut Self {
        self.block_transition = Some(transition_period);
        self
    }

    /// Seed initial basin storages from a previous run's final state.
    pub fn warm_start(&mut self, storages: BTreeMap<i32, f64>) -> &mut Self {
        self.warm_storages = storages;
        self
    }

    pub fn add_basin(&mut self, spec: BasinSpec) -> &mut Self {
        self.spec.basin.push(spec);
        self
    }

    pub fn add_linear_resistance(&mut self, spec: LinearResistanceSpec) -> &mut Self {
        self.spec.linear_resistance.push(spec);
        self
    }

    pub fn add_manning_resistance(&mut self, spec: ManningResistanceSpec) -> &mut Self {
        self.spec.manning_resistance.push(spec);
        self
    }

    pub fn add_tabulated_rating_curve(&mut self, spec: TabulatedRatingCurveSpec) -> &mut Self {
        self.spec.tabulated_rating_curve.push(spec);
        self
    }

    pub fn add_pump(&mut self, spec: PumpSpec) -> &mut Self {
        self.spec.pump.push(spec);
        self
    }

    pub fn add_outlet(&mut self, spec: OutletSpec) -> &mut Self {
        self.spec.outlet.push(spec);
        self
    }

    pub fn add_flow_boundary(&mut self, spec: FlowBoundarySpec) -> &mut Self {
        self.spec.flow_boundary.push(spec);
        self
    }

    pub fn add_level_boundary(&mut self, spec: LevelBoundarySpec) -> &mut Self {
        self.spec.level_boundary.push(spec);
        self
    }

    pub fn add_terminal(&mut self, node_id: i32) -> &mut Self {
        self.spec.terminal.push(PassiveNodeSpec {
            node_id,
            subnetwork: PRIMARY_SUBNETWORK,
        });
        self
    }

    pub fn add_terminal_in(&mut self, node_id: i32, subnetwork: u32) -> &mut Self {
        self.spec.terminal.push(PassiveNodeSpec {
            node_id,
            subnetwork,
        });
        self
    }

    pub fn add_junction(&mut self, node_id: i32) -> &mut Self {
        self.spec.junction.push(PassiveNodeSpec {
            node_id,
            subnetwork: PRIMARY_SUBNETWORK,
        });
        self
    }

    pub fn add_user_demand(&mut self, spec: UserDemandSpec) -> &mut Self {
        self.spec.user_demand.push(spec);
        self
    }

    pub fn add_flow_demand(&mut self, spec: FlowDemandSpec) -> &mut Self {
        self.spec.flow_demand.push(spec);
        self
    }

    pub fn add_level_demand(&mut self, spec: LevelDemandSpec) -> &mut Self {
        self.spec.level_demand.push(spec);
        self
    }

    pub fn add_discrete_control(&mut self, spec: DiscreteControlSpec) -> &mut Self {
        self.spec.discrete_control.push(spec);
        self
    }

    pub fn add_continuous_control(&mut self, spec: ContinuousControlSpec) -> &mut Self {
        self.spec.continuous_control.push(spec);
        self
    }

    pub fn add_pid_control(&mut self, spec: PidControlSpec) -> &mut Self {
        self.spec.pid_control.push(spec);
        self
    }

    pub fn add_subgrid(&mut self, spec: SubgridSpec) -> &mut Self {
        self.spec.subgrid.push(spec);
        self
    }

    pub fn add_flow_link(&mut self, from: (&str, i32), to: (&str, i32)) -> &mut Self {
        self.spec.link.push(LinkSpec {
            from_type: from.0.to_string(),
            from_id: from.1,
            to_type: to.0.to_string(),
            to_id: to.1,
        });
        self
    }

    /// Validate everything and assemble the model, or report every issue
    /// found.
    pub fn build(&self) -> Result<BuiltModel, HydronetError> {
        let mut issues: Vec<ValidationIssue> = Vec::new();
        let mut graph = NetworkGraph::new();
        let mut registry = NodeRegistry::default();
        let spec = &self.spec;

        let mut add_node = |graph: &mut NetworkGraph,
                            issues: &mut Vec<ValidationIssue>,
                            node_type: NodeType,
                            node_id: i32,
                            subnetwork: u32| {
            let id = NodeId::new(node_type, node_id);
            if subnetwork == 0 {
                issues.push(ValidationIssue::NonPositiveParameter {
                    node: id.to_string(),
                    parameter: "subnetwork",
                    value: 0.0,
                });
            }
            if graph.add_node(id, subnetwork).is_none() {
                issues.push(ValidationIssue::DuplicateLink {
                    from: id.to_string(),
                    to: id.to_string(),
                });
            }
        };

        let mut initial_storages = Vec::new();
        for basin in &spec.basin {
            let id = NodeId::new(NodeType::Basin, basin.node_id);
            add_node(
                &mut graph,
                &mut issues,
                NodeType::Basin,
                basin.node_id,
                basin.subnetwork,
            );
            let context = id.to_string();
            let profile = BasinProfile::new(
                basin.profile_level.clone(),
                basin.profile_area.clone(),
                basin.profile_storage.clone(),
                &context,
                &mut issues,
            );
            let Some(profile) = profile else {
                initial_storages.push(0.0);
                registry.basins.push(BasinParams {
                    node: id,
                    profile: BasinProfile::new(
                        vec![0.0, 1.0],
                        vec![1.0, 1.0],
                        None,
                        &context,
                        &mut Vec::new(),
                    )
                    .unwrap(),
                    precipitation: Interpolation::constant(0.0),
                    potential_evaporation: Interpolation::constant(0.0),
                    drainage: Interpolation::constant(0.0),
                    infiltration: Interpolation::constant(0.0),
                });
                continue;
            };
            let storage = match self.warm_storages.get(&basin.node_id) {
                Some(&storage) => storage,
                None => match (basin.initial_storage, basin.initial_level) {
                    (Some(storage), _) => storage,
                    (None, Some(level)) => profile.storage_from_level(level),
                    (None, None) => 0.0,
                },
            };
            initial_storages.push(storage.max(0.0));
            registry.basins.push(BasinParams {
                node: id,
                precipitation: basin.precipitation.to_interpolation(&context, &mut issues),
                potential_evaporation: basin
                    .potential_evaporation
                    .to_interpolation(&context, &mut issues),
                drainage: basin.drainage.to_interpolation(&context, &mut issues),
                infiltration: basin.infiltration.to_interpolation(&context, &mut issues),
                profile,
            });
        }

        for lr in &spec.linear_resistance {
            let id = NodeId::new(NodeType::LinearResistance, lr.node_id);
            add_node(
                &mut graph,
                &mut issues,
                NodeType::LinearResistance,
                lr.node_id,
                lr.subnetwork,
            );
            if lr.resistance <= 0.0 {
                issues.push(ValidationIssue::NonPositiveParameter {
                    node: id.to_string(),
                    parameter: "resistance",
                    value: lr.resistance,
                });
            }
            registry.linear_resistances.push(LinearResistanceParams {
                node: id,
                resistance: lr.resistance,
                max_flow_rate: lr.max_flow_rate,
                active: Cell::new(true),
            });
        }

        for mr in &spec.manning_resistance {
            let id = NodeId::new(NodeType::ManningResistance, mr.node_id);
            add_node(
                &mut graph,
                &mut issues,
                NodeType::ManningResistance,
                mr.node_id,
                mr.subnetwork,
            );
            for (parameter, value) in [
                ("length", mr.length),
                ("profile_width", mr.profile_width),
                ("manning_n", mr.manning_n),
            ] {
                if value <= 0.0 {
                    issues.push(ValidationIssue::NonPositiveParameter {
                        node: id.to_string(),
                        parameter,
                        value,
                    });
                }
            }
            registry.manning_resistances.push(ManningResistanceParams {
                node: id,
                length: mr.length,
                profile_width: mr.profile_width,
                profile_slope: mr.profile_slope,
                manning_n: mr.manning_n,
            });
        }

        for rc in &spec.tabulated_rating_curve {
            let id = NodeId::new(NodeType::TabulatedRatingCurve, rc.node_id);
            add_node(
                &mut graph,
                &mut issues,
                NodeType::TabulatedRatingCurve,
                rc.node_id,
                rc.subnetwork,
            );
            let mut tables = Vec::new();
            for table in &rc.tables {
                if table
                    .level
                    .windows(2)
                    .any(|w| w[1] == w[0])
                {
                    issues.push(ValidationIssue::RatingCurveRepeatedLevel {
                        node: id.to_string(),
                        level: table
                            .level
                            .windows(2)
                            .find(|w| w[1] == w[0])
                            .map(|w| w[0])
                            .unwrap_or(0.0),
                    });
                }
                match Interpolation::new(
                    table.level.clone(),
                    table.flow.clone(),
                    Extrapolation::Constant,
                    Extrapolation::Linear,
                    &id.to_string(),
                ) {
                    Ok(curve) => tables.push((table.name.clone(), curve)),
                    Err(issue) => issues.push(issue),
                }
            }
            tables.sort_by(|(a, _), (b, _)| a.cmp(b));
            registry.rating_curves.push(RatingCurveParams {
                node: id,
                tables,
                active: Cell::new(0),
            });
        }

        let mut build_regulated =
            |issues: &mut Vec<ValidationIssue>, spec: &PumpSpec, node_type: NodeType| {
                let id = NodeId::new(node_type, spec.node_id);
                let rate = match &spec.flow_rate {
                    SeriesSpec::Constant(value) => ControllableRate::fixed(*value),
                    table => {
                        ControllableRate::scheduled(table.to_interpolation(&id.to_string(), issues))
                    }
                };
                RegulatedParams {
                    node: id,
                    rate,
                    min_flow_rate: spec.min_flow_rate,
                    max_flow_rate: spec.max_flow_rate,
                    min_upstream_level: spec.min_upstream_level,
                    max_downstream_level: spec.max_downstream_level,
                    active: Cell::new(true),
                    pid_controlled: Cell::new(false),
                    allocation_controlled: spec.subnetwork != PRIMARY_SUBNETWORK,
                }
            };

        for pump in &spec.pump {
            add_node(
                &mut graph,
                &mut issues,
                NodeType::Pump,
                pump.node_id,
                pump.subnetwork,
            );
            let params = build_regulated(&mut issues, pump, NodeType::Pump);
            registry.pumps.push(params);
        }
        for outlet in &spec.outlet {
            add_node(
                &mut graph,
                &mut issues,
                NodeType::Outlet,
                outlet.node_id,
                outlet.subnetwork,
            );
            let params = build_regulated(&mut issues, outlet, NodeType::Outlet);
            registry.outlets.push(params);
        }

        for fb in &spec.flow_boundary {
            let id = NodeId::new(NodeType::FlowBoundary, fb.node_id);
            add_node(
                &mut graph,
                &mut issues,
                NodeType::FlowBoundary,
                fb.node_id,
                fb.subnetwork,
            );
            let curve = fb.flow_rate.to_interpolation(&id.to_string(), &mut issues);
            if curve.ys().iter().any(|&q| q < 0.0) {
                issues.push(ValidationIssue::NonPositiveParameter {
                    node: id.to_string(),
                    parameter: "flow_rate",
                    value: curve.ys().iter().copied().fold(f64::INFINITY, f64::min),
                });
            }
            let schedule = match self.block_transition {
                Some(transition) => FlowSchedule::Block {
                    steps: curve,
                    transition,
                },
                None => FlowSchedule::Linear(curve),
            };
            registry
                .flow_boundaries
                .push(FlowBoundaryParams { node: id, schedule });
        }

        for lb in &spec.level_boundary {
            let id = NodeId::new(NodeType::LevelBoundary, lb.node_id);
            add_node(
                &mut graph,
                &mut issues,
                NodeType::LevelBoundary,
                lb.node_id,
                lb.subnetwork,
            );
            registry.level_boundaries.push(LevelBoundaryParams {
                node: id,
                level: lb.level.to_interpolation(&id.to_string(), &mut issues),
            });
        }

        for terminal in &spec.terminal {
            add_node(
                &mut graph,
                &mut issues,
                NodeType::Terminal,
                terminal.node_id,
                terminal.subnetwork,
            );
        }
        for junction in &spec.junction {
            add_node(
                &mut graph,
                &mut issues,
                NodeType::Junction,
                junction.node_id,
                junction.subnetwork,
            );
        }

        for user in &spec.user_demand {
            let id = NodeId::new(NodeType::UserDemand, user.node_id);
            add_node(
                &mut graph,
                &mut issues,
                NodeType::UserDemand,
                user.node_id,
                user.subnetwork,
            );
            if !(0.0..=1.0).contains(&user.return_factor) {
                issues.push(ValidationIssue::ReturnFactorOutOfRange {
                    node: id.to_string(),
                    value: user.return_factor,
                });
            }
            let mut demands: Vec<DemandEntry> = Vec::new();
            for demand in &user.demands {
                if demand.priority == 0 {
                    issues.push(ValidationIssue::NonPositivePriority {
                        node: id.to_string(),
                        priority: demand.priority as i64,
                    });
                }
                demands.push(DemandEntry {
                    priority: demand.priority,
                    demand: demand.demand.to_interpolation(&id.to_string(), &mut issues),
                });
            }
            demands.sort_by_key(|d| d.priority);
            let n = demands.len();
            registry.user_demands.push(UserDemandParams {
                node: id,
                demands,
                return_factor: user.return_factor,
                min_level: user.min_level,
                allocated: RefCell::new(vec![f64::INFINITY; n]),
            });
        }

        for fd in &spec.flow_demand {
            let id = NodeId::new(NodeType::FlowDemand, fd.node_id);
            add_node(
                &mut graph,
                &mut issues,
                NodeType::FlowDemand,
                fd.node_id,
                fd.subnetwork,
            );
            let Some(target_type) = parse_node_type(&fd.target_type) else {
                issues.push(ValidationIssue::UnknownNode {
                    node: format!("{id}: target type '{}'", fd.target_type),
                });
                continue;
            };
            if fd.priority == 0 {
                issues.push(ValidationIssue::NonPositivePriority {
                    node: id.to_string(),
                    priority: fd.priority as i64,
                });
            }
            registry.flow_demands.push(FlowDemandParams {
                node: id,
                target: NodeId::new(target_type, fd.target_id),
                priority: fd.priority,
                demand: fd.demand.to_interpolation(&id.to_string(), &mut issues),
            });
        }

        for ld in &spec.level_demand {
            let id = NodeId::new(NodeType::LevelDemand, ld.node_id);
            add_node(
                &mut graph,
                &mut issues,
                NodeType::LevelDemand,
                ld.node_id,
                ld.subnetwork,
            );
            if ld.priority == 0 {
                issues.push(ValidationIssue::NonPositivePriority {
                    node: id.to_string(),
                    priority: ld.priority as i64,
                });
            }
            registry.level_demands.push(LevelDemandParams {
                node: id,
                basin: NodeId::new(NodeType::Basin, ld.basin_id),
                priority: ld.priority,
                min_level: ld.min_level.to_interpolation(&id.to_string(), &mut issues),
                max_level: ld.max_level.to_interpolation(&id.to_string(), &mut issues),
            });
        }

        for dc in &spec.discrete_control {
            add_node(
                &mut graph,
                &mut issues,
                NodeType::DiscreteControl,
                dc.node_id,
                dc.subnetwork,
            );
        }
        for cc in &spec.continuous_control {
            add_node(
                &mut graph,
                &mut issues,
                NodeType::ContinuousControl,
                cc.node_id,
                cc.subnetwork,
            );
        }
        for pid in &spec.pid_control {
            add_node(
                &mut graph,
                &mut issues,
                NodeType::PidControl,
                pid.node_id,
                pid.subnetwork,
            );
        }

        // Links.
        for link in &spec.link {
            let from_type = parse_node_type(&link.from_type);
            let to_type = parse_node_type(&link.to_type);
            let (Some(from_type), Some(to_type)) = (from_type, to_type) else {
                issues.push(ValidationIssue::UnknownNode {
                    node: format!("link {} -> {}", link.from_type, link.to_type),
                });
                continue;
            };
            let from = graph.index_of(NodeId::new(from_type, link.from_id));
            let to = graph.index_of(NodeId::new(to_type, link.to_id));
            let (Some(from), Some(to)) = (from, to) else {
                issues.push(ValidationIssue::UnknownNode {
                    node: format!(
                        "link {} #{} -> {} #{}",
                        link.from_type, link.from_id, link.to_type, link.to_id
                    ),
                });
                continue;
            };
            graph.add_link(from, to, LinkType::Flow);
        }

        // Control links form the signalling graph: controller → target.
        let mut control_link = |graph: &mut NetworkGraph,
                                from_type: NodeType,
                                from_id: i32,
                                to_type: &str,
                                to_id: i32| {
            let from = graph.index_of(NodeId::new(from_type, from_id));
            let to = parse_node_type(to_type)
                .and_then(|node_type| graph.index_of(NodeId::new(node_type, to_id)));
            if let (Some(from), Some(to)) = (from, to) {
                graph.add_link(from, to, LinkType::Control);
            }
        };
        for dc in &spec.discrete_control {
            for actions in dc.states.values() {
                for action in actions {
                    control_link(
                        &mut graph,
                        NodeType::DiscreteControl,
                        dc.node_id,
                        &action.target_type,
                        action.target_id,
                    );
                }
            }
        }
        for cc in &spec.continuous_control {
            control_link(
                &mut graph,
                NodeType::ContinuousControl,
                cc.node_id,
                &cc.target_type,
                cc.target_id,
            );
        }
        for pid in &spec.pid_control {
            control_link(
                &mut graph,
                NodeType::PidControl,
                pid.node_id,
                &pid.target_type,
                pid.target_id,
            );
        }

        // Per-type neighbor bounds.
        for node in graph.nodes() {
            let ((in_min, in_max), (out_min, out_max)) = node.id.node_type.flow_neighbor_bounds();
            let inflow = graph.inflow_links(node.index).len();
            let outflow = graph.outflow_links(node.index).len();
            if inflow < in_min || inflow > in_max {
                issues.push(ValidationIssue::NeighborCount {
                    node: node.id.to_string(),
                    direction: "incoming",
                    min: in_min,
                    max: in_max.min(99),
                    actual: inflow,
                });
            }
            if outflow < out_min || outflow > out_max {
                issues.push(ValidationIssue::NeighborCount {
                    node: node.id.to_string(),
                    direction: "outgoing",
                    min: out_min,
                    max: out_max.min(99),
                    actual: outflow,
                });
            }
        }

        // Subnetwork structure: crossings only from the primary, every
        // subnetwork connected.
        for link in graph.flow_links() {
            let from_subnetwork = graph.node(link.from).subnetwork;
            let to_subnetwork = graph.node(link.to).subnetwork;
            if from_subnetwork != to_subnetwork && from_subnetwork != PRIMARY_SUBNETWORK {
                issues.push(ValidationIssue::SubnetworkBoundaryCrossing {
                    link: format!(
                        "{} -> {}",
                        graph.node(link.from).id,
                        graph.node(link.to).id
                    ),
                    from: from_subnetwork,
                    to: to_subnetwork,
                });
            }
        }
        for subnetwork in graph.subnetwork_ids() {
            if !graph.subnetwork_connected(subnetwork) {
                issues.push(ValidationIssue::SubnetworkDisconnected { subnetwork });
            }
        }

        // State layout (junction tracing validates topology details).
        let map = StateMap::build(&graph, spec.pid_control.len(), &mut issues);

        // Control registry; PID targets need the state layout.
        let mut controls = ControlRegistry::default();
        if let Some(map) = &map {
            self.build_controls(&graph, &registry, map, &mut controls, &mut issues);
        }

        if !issues.is_empty() {
            return Err(HydronetError::from_issues(issues));
        }
        let map = map.expect("no issues implies a state map");

        // Subgrid elements.
        let mut subgrid = Vec::new();
        for element in &spec.subgrid {
            let basin = graph.index_of(NodeId::new(NodeType::Basin, element.basin_id));
            let Some(basin) = basin else {
                return Err(HydronetError::from_issues(vec![
                    ValidationIssue::UnknownNode {
                        node: format!("subgrid element {}", element.subgrid_id),
                    },
                ]));
            };
            let mut subgrid_issues = Vec::new();
            if let Some(element) = SubgridElement::new(
                element.subgrid_id,
                basin,
                element.basin_level.clone(),
                element.subgrid_level.clone(),
                &mut subgrid_issues,
            ) {
                subgrid.push(element);
            }
            if !subgrid_issues.is_empty() {
                return Err(HydronetError::from_issues(subgrid_issues));
            }
        }

        Ok(BuiltModel {
            graph,
            registry,
            controls,
            subgrid,
            map,
            initial_storages,
        })
    }

    fn build_controls(
        &self,
        graph: &NetworkGraph,
        registry: &NodeRegistry,
        map: &StateMap,
        controls: &mut ControlRegistry,
        issues: &mut Vec<ValidationIssue>,
    ) {
        let spec = &self.spec;
        let resolve = |type_name: &str, node_id: i32, context: &str, issues: &mut Vec<ValidationIssue>| {
            parse_node_type(type_name)
                .and_then(|node_type| graph.index_of(NodeId::new(node_type, node_id)))
                .or_else(|| {
                    issues.push(ValidationIssue::UnknownNode {
                        node: format!("{context}: {type_name} #{node_id}"),
                    });
                    None
                })
        };

        let build_variable = |subvariables: &[SubVariableSpec],
                              context: &str,
                              issues: &mut Vec<ValidationIssue>| {
            let mut built = Vec::new();
            for sv in subvariables {
                let Some(listen) = resolve(&sv.listen_type, sv.listen_id, context, issues) else {
                    continue;
                };
                let variable = match sv.variable.as_str() {
                    "level" => ListenVariable::Level,
                    "storage" => ListenVariable::Storage,
                    "flow_rate" => ListenVariable::FlowRate,
                    other => {
                        issues.push(ValidationIssue::UnknownListenVariable {
                            node: context.to_string(),
                            target: format!("{} #{}", sv.listen_type, sv.listen_id),
                            variable: other.to_string(),
                        });
                        continue;
                    }
                };
                built.push(SubVariable {
                    listen,
                    variable,
                    weight: sv.weight,
                    look_ahead: sv.look_ahead,
                });
            }
            CompoundVariable {
                subvariables: built,
            }
        };

        for dc in &spec.discrete_control {
            let id = NodeId::new(NodeType::DiscreteControl, dc.node_id);
            let context = id.to_string();
            let mut variables = Vec::new();
            let mut thresholds = Vec::new();
            for variable in &dc.variables {
                variables.push(build_variable(&variable.subvariables, &context, issues));
                let mut variable_thresholds = Vec::new();
                for threshold in &variable.thresholds {
                    let curve = threshold.value.to_interpolation(&context, issues);
                    if threshold.hysteresis > 0.0 {
                        let half = threshold.hysteresis * 0.5;
                        let shift = |curve: &Interpolation, offset: f64| {
                            Interpolation::new(
                                curve.xs().to_vec(),
                                curve.ys().iter().map(|y| y + offset).collect(),
                                Extrapolation::Constant,
                                Extrapolation::Constant,
                                &context,
                            )
                            .unwrap_or_else(|_| Interpolation::constant(offset))
                        };
                        variable_thresholds
                            .push(Threshold::banded(shift(&curve, -half), shift(&curve, half)));
                    } else {
                        variable_thresholds.push(Threshold::sharp(curve));
                    }
                }
                thresholds.push(variable_thresholds);
            }
            let mut states = BTreeMap::new();
            for (state, actions) in &dc.states {
                let mut built_actions = Vec::new();
                for action in actions {
                    let Some(target) =
                        resolve(&action.target_type, action.target_id, &context, issues)
                    else {
                        continue;
                    };
                    let built = match action.parameter.as_str() {
                        "flow_rate" => ControlAction::SetFlowRate {
                            target,
                            rate: action.value.unwrap_or(0.0),
                        },
                        "active" => ControlAction::SetActive {
                            target,
                            active: action.value.unwrap_or(1.0) != 0.0,
                        },
                        "resistance_active" => ControlAction::SetResistanceActive {
                            target,
                            active: action.value.unwrap_or(1.0) != 0.0,
                        },
                        "rating_table" => ControlAction::SetRatingTable {
                            target,
                            table: action.table.clone().unwrap_or_default(),
                        },
                        "pid_active" => ControlAction::SetPidActive {
                            target,
                            active: action.value.unwrap_or(1.0) != 0.0,
                        },
                        other => {
                            issues.push(ValidationIssue::UnknownListenVariable {
                                node: context.clone(),
                                target: format!("{} #{}", action.target_type, action.target_id),
                                variable: other.to_string(),
                            });
                            continue;
                        }
                    };
                    built_actions.push(built);
                }
                states.insert(state.clone(), built_actions);
            }
            let logic: Vec<(String, String)> = dc
                .logic
                .iter()
                .map(|(pattern, state)| (pattern.clone(), state.clone()))
                .collect();
            if let Some(params) =
                DiscreteControlParams::new(id, variables, thresholds, &logic, states, issues)
            {
                controls.discrete.push(params);
            }
        }

        for cc in &spec.continuous_control {
            let id = NodeId::new(NodeType::ContinuousControl, cc.node_id);
            let context = id.to_string();
            let Some(target) = resolve(&cc.target_type, cc.target_id, &context, issues) else {
                continue;
            };
            let function = match Interpolation::new(
                cc.function_input.clone(),
                cc.function_output.clone(),
                Extrapolation::Constant,
                Extrapolation::Constant,
                &context,
            ) {
                Ok(curve) => curve,
                Err(issue) => {
                    issues.push(issue);
                    continue;
                }
            };
            controls.continuous.push(ContinuousControlParams {
                node: id,
                variable: build_variable(&cc.subvariables, &context, issues),
                function,
                target,
                target_parameter: ContinuousTarget::FlowRate,
                min_value: cc.min_value,
                max_value: cc.max_value,
            });
        }

        for pid in &spec.pid_control {
            let id = NodeId::new(NodeType::PidControl, pid.node_id);
            let context = id.to_string();
            let listen = graph.lookup(NodeId::new(NodeType::Basin, pid.listen_basin_id));
            let Some((_, listen_basin, _)) = listen else {
                issues.push(ValidationIssue::UnknownNode {
                    node: format!("{context}: Basin #{}", pid.listen_basin_id),
                });
                continue;
            };
            let Some(target_node) = resolve(&pid.target_type, pid.target_id, &context, issues)
            else {
                continue;
            };
            let target_kind = match graph.node(target_node).id.node_type {
                NodeType::Pump => PidTargetKind::Pump,
                NodeType::Outlet => PidTargetKind::Outlet,
                other => {
                    issues.push(ValidationIssue::UnknownNode {
                        node: format!("{context}: PID target must be Pump or Outlet, got {other}"),
                    });
                    continue;
                }
            };
            let Some(target_entry) = map
                .layout
                .flow_entries
                .iter()
                .position(|e| e.node == target_node)
            else {
                issues.push(ValidationIssue::UnknownNode {
                    node: format!("{context}: target has no flow entry"),
                });
                continue;
            };
            let target_local = graph.node(target_node).local_index;
            match target_kind {
                PidTargetKind::Pump => registry.pumps[target_local].pid_controlled.set(true),
                PidTargetKind::Outlet => registry.outlets[target_local].pid_controlled.set(true),
            }
            controls.pid.push(PidControlParams {
                node: id,
                listen_basin,
                target_node,
                target_kind,
                target_local,
                target_entry,
                target_level: pid.target_level.to_interpolation(&context, issues),
                proportional: pid.proportional.to_interpolation(&context, issues),
                integral: pid.integral.to_interpolation(&context, issues),
                derivative: pid.derivative.to_interpolation(&context, issues),
                active: Cell::new(true),
            });
        }
    }
}
