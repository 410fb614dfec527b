// ABOUTME: Discrete truth-table control over a filling basin with a hysteresis-banded pump
// ABOUTME: Transitions must alternate on/off and the pump flow must vanish in the off state

use std::collections::BTreeMap;

use hydronet::engine::network::builder::{
    BasinSpec, CompoundVariableSpec, ControlActionSpec, DiscreteControlSpec, FlowBoundarySpec,
    ModelBuilder, PumpSpec, SeriesSpec, SubVariableSpec, ThresholdSpec,
};
use hydronet::engine::output::OutputStream;
use hydronet::engine::sim::{Simulation, SimulationOptions};
use hydronet::engine::solver::integrator::SolverOptions;

const DAY: f64 = 86_400.0;
const INFLOW_M3S: f64 = 0.001;
const PUMP_ON_M3S: f64 = 0.002;

fn control_model() -> ModelBuilder {
    let mut builder = ModelBuilder::new();
    builder.add_flow_boundary(FlowBoundarySpec {
        node_id: 1,
        subnetwork: 1,
        flow_rate: SeriesSpec::Constant(INFLOW_M3S),
    });
    builder.add_basin(BasinSpec {
        node_id: 2,
        subnetwork: 1,
        profile_level: vec![0.0, 2.0],
        profile_area: vec![100.0, 100.0],
        profile_storage: None,
        initial_storage: None,
        initial_level: Some(0.2),
        precipitation: SeriesSpec::Constant(0.0),
        potential_evaporation: SeriesSpec::Constant(0.0),
        drainage: SeriesSpec::Constant(0.0),
        infiltration: SeriesSpec::Constant(0.0),
    });
    builder.add_pump(PumpSpec {
        node_id: 3,
        subnetwork: 1,
        flow_rate: SeriesSpec::Constant(0.0),
        min_flow_rate: 0.0,
        max_flow_rate: 1.0,
        min_upstream_level: None,
        max_downstream_level: None,
    });
    builder.add_terminal(4);
    builder.add_flow_link(("FlowBoundary", 1), ("Basin", 2));
    builder.add_flow_link(("Basin", 2), ("Pump", 3));
    builder.add_flow_link(("Pump", 3), ("Terminal", 4));

    let mut states = BTreeMap::new();
    states.insert(
        "off".to_string(),
        vec![ControlActionSpec {
            target_type: "Pump".to_string(),
            target_id: 3,
            parameter: "flow_rate".to_string(),
            value: Some(0.0),
            table: None,
        }],
    );
    states.insert(
        "on".to_string(),
        vec![ControlActionSpec {
            target_type: "Pump".to_string(),
            target_id: 3,
            parameter: "flow_rate".to_string(),
            value: Some(PUMP_ON_M3S),
            table: None,
        }],
    );
    let mut logic = BTreeMap::new();
    logic.insert("F".to_string(), "off".to_string());
    logic.insert("T".to_string(), "on".to_string());
    builder.add_discrete_control(DiscreteControlSpec {
        node_id: 5,
        subnetwork: 1,
        variables: vec![CompoundVariableSpec {
            subvariables: vec![SubVariableSpec {
                listen_type: "Basin".to_string(),
                listen_id: 2,
                variable: "level".to_string(),
                weight: 1.0,
                look_ahead: 0.0,
            }],
            thresholds: vec![ThresholdSpec {
                value: SeriesSpec::Constant(0.5),
                hysteresis: 0.1,
            }],
        }],
        logic,
        states,
    });
    builder
}

#[test]
fn pump_cycles_with_hysteresis_band() {
    let built = control_model().build().expect("control model must validate");
    let options = SimulationOptions {
        t_end: 2.0 * DAY,
        saveat: DAY / 8.0,
        solver: SolverOptions {
            dtmax: 900.0,
            ..SolverOptions::default()
        },
        ..SimulationOptions::default()
    };
    let mut simulation = Simulation::new(built, options, OutputStream::memory()).unwrap();
    simulation.run().unwrap();
    let output = simulation.output().memory_output().unwrap();

    let control_rows = &output.control;
    assert!(
        control_rows.len() >= 2,
        "expected at least one on/off cycle, got {} transitions",
        control_rows.len()
    );
    // First crossing is upward through the high edge of the band.
    assert_eq!(control_rows[0].control_state, "on");
    assert_eq!(control_rows[0].truth_state, "T");
    for pair in control_rows.windows(2) {
        assert_ne!(
            pair[0].control_state, pair[1].control_state,
            "states must alternate"
        );
    }
    // Transitions sit near the band edges (0.45 / 0.55), never outside.
    for row in control_rows {
        let basin_level_at = output
            .basin
            .iter()
            .min_by(|a, b| {
                (a.time - row.time)
                    .abs()
                    .partial_cmp(&(b.time - row.time).abs())
                    .unwrap()
            })
            .unwrap()
            .level;
        println!(
            "transition to '{}' at t = {:.0} s (nearest saved level {:.3})",
            row.control_state, row.time, basin_level_at
        );
    }

    // Level stays inside a generous neighbourhood of the band.
    for row in &output.basin {
        if row.time > 0.6 * DAY {
            assert!(
                row.level > 0.3 && row.level < 0.7,
                "level {} escaped the control band at t = {}",
                row.level,
                row.time
            );
        }
    }
}

#[test]
fn pump_flow_vanishes_outside_on_state() {
    let built = control_model().build().unwrap();
    let options = SimulationOptions {
        t_end: DAY / 4.0,
        saveat: DAY / 32.0,
        solver: SolverOptions {
            dtmax: 900.0,
            ..SolverOptions::default()
        },
        ..SimulationOptions::default()
    };
    let mut simulation = Simulation::new(built, options, OutputStream::memory()).unwrap();
    simulation.run().unwrap();
    let output = simulation.output().memory_output().unwrap();

    // The basin starts well below the threshold: no transition can have
    // fired yet, so pump flow is identically zero early on.
    let first_transition = output
        .control
        .first()
        .map(|row| row.time)
        .unwrap_or(f64::INFINITY);
    for row in &output.flow {
        if row.from_node_id == 2 && row.time < first_transition.min(DAY / 8.0) && row.time > 0.0 {
            assert!(
                row.flow_rate.abs() < 1e-12,
                "pump leaked {} m³/s at t = {} while off",
                row.flow_rate,
                row.time
            );
        }
    }
}
