// ABOUTME: PID level regulation and continuous functional control driven through the live simulation
// ABOUTME: Also checks the subgrid interpolator emitted at save points tracks the parent basin

use hydronet::engine::network::builder::{
    BasinSpec, ContinuousControlSpec, FlowBoundarySpec, LevelBoundarySpec, ModelBuilder,
    PidControlSpec, PumpSpec, SeriesSpec, SubVariableSpec, SubgridSpec,
};
use hydronet::engine::output::OutputStream;
use hydronet::engine::sim::{Simulation, SimulationOptions};
use hydronet::engine::solver::integrator::SolverOptions;

const DAY: f64 = 86_400.0;
const TARGET_LEVEL_M: f64 = 1.0;
const INFLOW_M3S: f64 = 0.5;

#[test]
fn pid_pump_settles_the_basin_on_its_target_level() {
    let mut builder = ModelBuilder::new();
    builder.add_flow_boundary(FlowBoundarySpec {
        node_id: 1,
        subnetwork: 1,
        flow_rate: SeriesSpec::Constant(INFLOW_M3S),
    });
    builder.add_basin(BasinSpec {
        node_id: 2,
        subnetwork: 1,
        profile_level: vec![0.0, 5.0],
        profile_area: vec![1000.0, 1000.0],
        profile_storage: None,
        initial_storage: None,
        initial_level: Some(2.0),
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
        max_flow_rate: 5.0,
        min_upstream_level: None,
        max_downstream_level: None,
    });
    builder.add_terminal(4);
    builder.add_flow_link(("FlowBoundary", 1), ("Basin", 2));
    builder.add_flow_link(("Basin", 2), ("Pump", 3));
    builder.add_flow_link(("Pump", 3), ("Terminal", 4));
    // The pump removes water from the listened basin, so the gains are
    // negative: a level above target must raise the pump rate.
    builder.add_pid_control(PidControlSpec {
        node_id: 5,
        subnetwork: 1,
        listen_basin_id: 2,
        target_type: "Pump".to_string(),
        target_id: 3,
        target_level: SeriesSpec::Constant(TARGET_LEVEL_M),
        proportional: SeriesSpec::Constant(-1.0),
        integral: SeriesSpec::Constant(-1e-3),
        derivative: SeriesSpec::Constant(0.0),
    });
    builder.add_subgrid(SubgridSpec {
        subgrid_id: 7,
        basin_id: 2,
        basin_level: vec![0.0, 5.0],
        subgrid_level: vec![10.0, 15.0],
    });
    let built = builder.build().expect("pid model must validate");

    let options = SimulationOptions {
        t_end: DAY,
        saveat: DAY / 4.0,
        subgrid_enabled: true,
        solver: SolverOptions {
            dtmax: 600.0,
            ..SolverOptions::default()
        },
        ..SimulationOptions::default()
    };
    let mut simulation = Simulation::new(built, options, OutputStream::memory()).unwrap();
    simulation.run().unwrap();
    let output = simulation.output().memory_output().unwrap();

    let final_row = output
        .basin
        .iter()
        .max_by(|a, b| a.time.partial_cmp(&b.time).unwrap())
        .unwrap();
    println!(
        "final level {:.4} m (target {TARGET_LEVEL_M}), pump settled near {:.4} m³/s",
        final_row.level, INFLOW_M3S
    );
    assert!(
        (final_row.level - TARGET_LEVEL_M).abs() < 0.05,
        "PID left the level at {} m",
        final_row.level
    );

    // At steady state the pump discharges what the boundary delivers.
    let pump_flow = output
        .flow
        .iter()
        .filter(|row| row.from_node_id == 2)
        .max_by(|a, b| a.time.partial_cmp(&b.time).unwrap())
        .unwrap()
        .flow_rate;
    assert!(
        (pump_flow - INFLOW_M3S).abs() < 0.05 * INFLOW_M3S,
        "pump settled at {pump_flow} m³/s"
    );

    // Subgrid levels are the basin level mapped through the table
    // (offset +10, slope 1 over this range).
    for row in &output.subgrid_level {
        let basin_level = output
            .basin
            .iter()
            .find(|b| b.time == row.time)
            .unwrap()
            .level;
        assert!(
            (row.subgrid_level - (10.0 + basin_level)).abs() < 1e-9,
            "subgrid level {} vs basin {}",
            row.subgrid_level,
            basin_level
        );
    }
    assert!(!output.subgrid_level.is_empty());
}

#[test]
fn continuous_control_maps_a_boundary_level_onto_a_pump_rate() {
    let mut builder = ModelBuilder::new();
    builder.add_level_boundary(LevelBoundarySpec {
        node_id: 1,
        subnetwork: 1,
        level: SeriesSpec::Table {
            time: vec![0.0, DAY],
            value: vec![0.0, 2.0],
            extrapolation: Default::default(),
        },
    });
    builder.add_pump(PumpSpec {
        node_id: 2,
        subnetwork: 1,
        flow_rate: SeriesSpec::Constant(0.0),
        min_flow_rate: 0.0,
        max_flow_rate: 1.0,
        min_upstream_level: None,
        max_downstream_level: None,
    });
    builder.add_terminal(3);
    builder.add_flow_link(("LevelBoundary", 1), ("Pump", 2));
    builder.add_flow_link(("Pump", 2), ("Terminal", 3));
    builder.add_continuous_control(ContinuousControlSpec {
        node_id: 4,
        subnetwork: 1,
        subvariables: vec![SubVariableSpec {
            listen_type: "LevelBoundary".to_string(),
            listen_id: 1,
            variable: "level".to_string(),
            weight: 1.0,
            look_ahead: 0.0,
        }],
        function_input: vec![0.0, 2.0],
        function_output: vec![0.0, 0.2],
        target_type: "Pump".to_string(),
        target_id: 2,
        min_value: 0.0,
        max_value: 1.0,
    });
    let built = builder.build().unwrap();

    let options = SimulationOptions {
        t_end: DAY,
        saveat: DAY / 4.0,
        solver: SolverOptions {
            dtmax: 600.0,
            ..SolverOptions::default()
        },
        ..SimulationOptions::default()
    };
    let mut simulation = Simulation::new(built, options, OutputStream::memory()).unwrap();
    simulation.run().unwrap();
    let output = simulation.output().memory_output().unwrap();

    // Boundary level ramps 0 → 2, so the pump rate ramps 0 → 0.2; each
    // save interval's mean flow is 0.1 × the interval's mean level.
    for (interval, row) in output
        .flow
        .iter()
        .filter(|row| row.time > 0.0 && row.from_node_id == 1)
        .enumerate()
    {
        let t_mid = (interval as f64 + 0.5) * DAY / 4.0;
        let expected = 0.1 * (2.0 * t_mid / DAY);
        assert!(
            (row.flow_rate - expected).abs() < 0.02,
            "interval {interval}: mean flow {} expected {expected}",
            row.flow_rate
        );
    }
}
