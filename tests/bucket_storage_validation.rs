// ABOUTME: Mass-balance validation on single-basin bucket models
// ABOUTME: An isolated bucket must hold its volume exactly; forced vertical fluxes must integrate to the closed form

use hydronet::engine::network::builder::{BasinSpec, ModelBuilder, SeriesSpec};
use hydronet::engine::output::OutputStream;
use hydronet::engine::sim::{Simulation, SimulationOptions};
use hydronet::engine::solver::integrator::SolverOptions;

const DAY: f64 = 86_400.0;
/// An untouched bucket must conserve volume to round-off.
const TRIVIAL_TOLERANCE: f64 = 1e-12;
/// Forced fluxes integrate to the closed form within 1%.
const FORCED_TOLERANCE: f64 = 0.01;

fn bucket_spec(initial_storage: f64) -> BasinSpec {
    BasinSpec {
        node_id: 1,
        subnetwork: 1,
        profile_level: vec![0.0, 10.0],
        profile_area: vec![1000.0, 1000.0],
        profile_storage: None,
        initial_storage: Some(initial_storage),
        initial_level: None,
        precipitation: SeriesSpec::Constant(0.0),
        potential_evaporation: SeriesSpec::Constant(0.0),
        drainage: SeriesSpec::Constant(0.0),
        infiltration: SeriesSpec::Constant(0.0),
    }
}

fn run_bucket(spec: BasinSpec, t_end: f64) -> Vec<hydronet::engine::output::BasinRow> {
    let mut builder = ModelBuilder::new();
    builder.add_basin(spec);
    let built = builder.build().expect("bucket model must validate");
    let options = SimulationOptions {
        t_end,
        saveat: DAY / 2.0,
        solver: SolverOptions {
            abstol: 1e-10,
            reltol: 1e-10,
            ..SolverOptions::default()
        },
        ..SimulationOptions::default()
    };
    let mut simulation = Simulation::new(built, options, OutputStream::memory()).unwrap();
    simulation.run().expect("bucket simulation must finish");
    simulation
        .output()
        .memory_output()
        .unwrap()
        .basin
        .clone()
}

#[test]
fn trivial_bucket_holds_its_storage() {
    let rows = run_bucket(bucket_spec(1.0), 3.0 * DAY);
    assert!(!rows.is_empty());
    for row in &rows {
        assert!(
            (row.storage - 1.0).abs() < TRIVIAL_TOLERANCE,
            "storage drifted to {} at t = {}",
            row.storage,
            row.time
        );
    }
}

#[test]
fn leaky_bucket_matches_closed_form() {
    // Constant drainage in, infiltration switching on at t = 1.5 d over
    // a one-second ramp.
    let mut spec = bucket_spec(1000.0);
    spec.drainage = SeriesSpec::Constant(0.003);
    spec.infiltration = SeriesSpec::Table {
        time: vec![0.0, 1.5 * DAY - 1.0, 1.5 * DAY],
        value: vec![0.0, 0.0, 0.001],
        extrapolation: Default::default(),
    };
    let t_end = 2.5 * DAY;
    let rows = run_bucket(spec, t_end);
    let last = rows.last().unwrap();
    // 2.5 days of drainage, one day of infiltration (1.5 d → 2.5 d).
    let expected = 1000.0 + 0.003 * t_end - 0.001 * DAY;
    let error = (last.storage - expected).abs() / expected;
    println!(
        "leaky bucket: storage {} expected {} ({} relative error)",
        last.storage, expected, error
    );
    assert!(error < FORCED_TOLERANCE);
}

#[test]
fn bucket_reports_zero_balance_error() {
    let mut spec = bucket_spec(500.0);
    spec.drainage = SeriesSpec::Constant(0.001);
    let rows = run_bucket(spec, 2.0 * DAY);
    for row in &rows {
        assert!(
            row.balance_error.abs() < 1e-6,
            "balance error {} at t = {}",
            row.balance_error,
            row.time
        );
    }
}
