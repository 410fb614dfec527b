// ABOUTME: Validates the clamped linear resistance against its closed-form drawdown solution
// ABOUTME: Storage first drains linearly at the flow cap, then relaxes exponentially toward the boundary level

use hydronet::engine::network::builder::{
    BasinSpec, LevelBoundarySpec, LinearResistanceSpec, ModelBuilder, SeriesSpec,
};
use hydronet::engine::output::OutputStream;
use hydronet::engine::sim::{Simulation, SimulationOptions};
use hydronet::engine::solver::integrator::SolverOptions;

/// Relative tolerance on the linear (clamped) phase.
const LINEAR_PHASE_TOLERANCE: f64 = 0.01;
/// Absolute tolerance [m³] on the exponential tail.
const TAIL_TOLERANCE_M3: f64 = 3.0;

const AREA_M2: f64 = 100.0;
const BOUNDARY_LEVEL_M: f64 = 1.0;
const RESISTANCE: f64 = 5.0;
const MAX_FLOW_M3S: f64 = 0.6;
const INITIAL_LEVEL_M: f64 = 10.0;

#[test]
fn clamped_resistance_decays_linearly_then_exponentially() {
    let mut builder = ModelBuilder::new();
    builder.add_basin(BasinSpec {
        node_id: 1,
        subnetwork: 1,
        profile_level: vec![0.0, 20.0],
        profile_area: vec![AREA_M2, AREA_M2],
        profile_storage: None,
        initial_storage: None,
        initial_level: Some(INITIAL_LEVEL_M),
        precipitation: SeriesSpec::Constant(0.0),
        potential_evaporation: SeriesSpec::Constant(0.0),
        drainage: SeriesSpec::Constant(0.0),
        infiltration: SeriesSpec::Constant(0.0),
    });
    builder.add_linear_resistance(LinearResistanceSpec {
        node_id: 2,
        subnetwork: 1,
        resistance: RESISTANCE,
        max_flow_rate: MAX_FLOW_M3S,
    });
    builder.add_level_boundary(LevelBoundarySpec {
        node_id: 3,
        subnetwork: 1,
        level: SeriesSpec::Constant(BOUNDARY_LEVEL_M),
    });
    builder.add_flow_link(("Basin", 1), ("LinearResistance", 2));
    builder.add_flow_link(("LinearResistance", 2), ("LevelBoundary", 3));
    let built = builder.build().expect("model must validate");

    let saveat = 100.0;
    let options = SimulationOptions {
        t_end: 3600.0,
        saveat,
        solver: SolverOptions {
            dtmax: 50.0,
            ..SolverOptions::default()
        },
        ..SimulationOptions::default()
    };
    let mut simulation = Simulation::new(built, options, OutputStream::memory()).unwrap();
    simulation.run().unwrap();
    let rows = &simulation.output().memory_output().unwrap().basin;

    let u0 = INITIAL_LEVEL_M * AREA_M2;
    // While Δh/R exceeds the cap the basin drains at exactly the cap.
    // The crossover sits where level - boundary = R * Q_max.
    let crossover_storage = AREA_M2 * (BOUNDARY_LEVEL_M + RESISTANCE * MAX_FLOW_M3S);
    let crossover_time = (u0 - crossover_storage) / MAX_FLOW_M3S;
    assert!(crossover_time > 2.0 * saveat, "test setup: need a linear phase");

    let equilibrium = AREA_M2 * BOUNDARY_LEVEL_M;
    let time_constant = AREA_M2 * RESISTANCE;
    for row in rows {
        let expected = if row.time <= crossover_time {
            u0 - MAX_FLOW_M3S * row.time
        } else {
            equilibrium
                + (crossover_storage - equilibrium)
                    * (-(row.time - crossover_time) / time_constant).exp()
        };
        let error = (row.storage - expected).abs();
        println!(
            "t = {:>6.0} s: storage {:>8.3} expected {:>8.3}",
            row.time, row.storage, expected
        );
        if row.time <= crossover_time {
            assert!(
                error / u0 < LINEAR_PHASE_TOLERANCE,
                "linear phase off by {error} m³ at t = {}",
                row.time
            );
        } else {
            assert!(
                error < TAIL_TOLERANCE_M3,
                "exponential tail off by {error} m³ at t = {}",
                row.time
            );
        }
    }

    // The basin never crosses the boundary level from above.
    let last = rows.last().unwrap();
    assert!(last.storage >= equilibrium - TAIL_TOLERANCE_M3);
}
