// ABOUTME: Physics validation against closed forms: sinusoidal boundary volumes and a Manning backwater profile
// ABOUTME: The backwater reference is a standard-step solve of the same discretized Manning relation

use hydronet::engine::core::math::Dual;
use hydronet::engine::network::builder::{
    BasinSpec, FlowBoundarySpec, LevelBoundarySpec, ManningResistanceSpec, ModelBuilder,
    SeriesSpec,
};
use hydronet::engine::output::OutputStream;
use hydronet::engine::physics::flow::{manning_resistance_flow, ConnectorEnv};
use hydronet::engine::physics::node::ManningResistanceParams;
use hydronet::engine::sim::{Simulation, SimulationOptions};
use hydronet::engine::solver::integrator::SolverOptions;

const DAY: f64 = 86_400.0;

fn still_basin(node_id: i32, area: f64, top_level: f64) -> BasinSpec {
    BasinSpec {
        node_id,
        subnetwork: 1,
        profile_level: vec![0.0, top_level],
        profile_area: vec![area, area],
        profile_storage: None,
        initial_storage: Some(0.0),
        initial_level: None,
        precipitation: SeriesSpec::Constant(0.0),
        potential_evaporation: SeriesSpec::Constant(0.0),
        drainage: SeriesSpec::Constant(0.0),
        infiltration: SeriesSpec::Constant(0.0),
    }
}

#[test]
fn sinusoidal_flow_boundary_mean_flows_match_the_integral() {
    // Six months of a seasonal sinusoid sampled daily, saved daily.
    let period_days = 180.0;
    let times: Vec<f64> = (0..=180).map(|d| d as f64 * DAY).collect();
    let values: Vec<f64> = times
        .iter()
        .map(|&t| 1.0 + 0.5 * (2.0 * std::f64::consts::PI * t / (period_days * DAY)).sin())
        .collect();

    let mut builder = ModelBuilder::new();
    builder.add_flow_boundary(FlowBoundarySpec {
        node_id: 1,
        subnetwork: 1,
        flow_rate: SeriesSpec::Table {
            time: times.clone(),
            value: values.clone(),
            extrapolation: Default::default(),
        },
    });
    // A huge receiving basin so levels stay trivial.
    builder.add_basin(still_basin(2, 1e9, 100.0));
    builder.add_flow_link(("FlowBoundary", 1), ("Basin", 2));
    let built = builder.build().unwrap();

    let t_end = period_days * DAY;
    let options = SimulationOptions {
        t_end,
        saveat: DAY,
        solver: SolverOptions {
            dtmax: 6.0 * 3600.0,
            ..SolverOptions::default()
        },
        ..SimulationOptions::default()
    };
    let mut simulation = Simulation::new(built, options, OutputStream::memory()).unwrap();
    simulation.run().unwrap();
    let output = simulation.output().memory_output().unwrap();

    // Total simulated volume vs the closed-form sinusoid integral.
    let simulated_total: f64 = output
        .flow
        .iter()
        .filter(|row| row.time > 0.0)
        .map(|row| row.flow_rate * DAY)
        .sum();
    let omega = 2.0 * std::f64::consts::PI / (period_days * DAY);
    let analytic_total = t_end + 0.5 / omega * (1.0 - (omega * t_end).cos());
    let relative_error = (simulated_total - analytic_total).abs() / analytic_total;
    println!(
        "simulated {simulated_total:.1} m³, analytic {analytic_total:.1} m³, relative error {relative_error:.5}"
    );
    assert!(relative_error < 0.005);

    // Each daily mean matches the trapezoid of the sampled curve.
    for (d, row) in output
        .flow
        .iter()
        .filter(|row| row.time > 0.0)
        .enumerate()
    {
        let expected = 0.5 * (values[d] + values[d + 1]);
        assert!(
            (row.flow_rate - expected).abs() < 1e-4,
            "day {d}: mean {} expected {expected}",
            row.flow_rate
        );
    }
}

/// Solve the same discretized Manning relation for the steady upstream
/// level of one segment by bisection.
fn standard_step_upstream(
    params: &ManningResistanceParams,
    h_down: f64,
    discharge: f64,
) -> f64 {
    let flow_at = |h_up: f64| {
        let env = ConnectorEnv {
            h_up: Dual::constant(h_up),
            h_down: Dual::constant(h_down),
            storage_up: Dual::constant(f64::INFINITY),
            storage_down: Dual::constant(f64::INFINITY),
            bed_up: 0.0,
            bed_down: 0.0,
        };
        manning_resistance_flow(params, &env).re
    };
    let mut lo = h_down;
    let mut hi = h_down + 50.0;
    for _ in 0..200 {
        let mid = 0.5 * (lo + hi);
        if flow_at(mid) < discharge {
            lo = mid;
        } else {
            hi = mid;
        }
    }
    0.5 * (lo + hi)
}

#[test]
fn manning_chain_converges_to_the_standard_step_backwater_profile() {
    const SEGMENTS: usize = 50;
    const SEGMENT_LENGTH_M: f64 = 20.0;
    const DISCHARGE_M3S: f64 = 5.0;
    const DOWNSTREAM_LEVEL_M: f64 = 2.0;
    const PROFILE_TOLERANCE_M: f64 = 0.02;

    let manning = |node_id: i32| ManningResistanceSpec {
        node_id,
        subnetwork: 1,
        length: SEGMENT_LENGTH_M,
        profile_width: 1.0,
        profile_slope: 0.0,
        manning_n: 0.04,
    };

    let mut builder = ModelBuilder::new();
    builder.add_flow_boundary(FlowBoundarySpec {
        node_id: 1,
        subnetwork: 1,
        flow_rate: SeriesSpec::Constant(DISCHARGE_M3S),
    });
    // Basin ids 100.., Manning ids 200..; plan area = width × length.
    for i in 0..SEGMENTS {
        builder.add_basin(still_basin(100 + i as i32, SEGMENT_LENGTH_M, 60.0));
        builder.add_manning_resistance(manning(200 + i as i32));
    }
    builder.add_level_boundary(LevelBoundarySpec {
        node_id: 3,
        subnetwork: 1,
        level: SeriesSpec::Constant(DOWNSTREAM_LEVEL_M),
    });
    builder.add_flow_link(("FlowBoundary", 1), ("Basin", 100));
    for i in 0..SEGMENTS {
        builder.add_flow_link(("Basin", 100 + i as i32), ("ManningResistance", 200 + i as i32));
        if i + 1 < SEGMENTS {
            builder.add_flow_link(
                ("ManningResistance", 200 + i as i32),
                ("Basin", 100 + i as i32 + 1),
            );
        }
    }
    builder.add_flow_link(
        ("ManningResistance", 200 + SEGMENTS as i32 - 1),
        ("LevelBoundary", 3),
    );
    let built = builder.build().unwrap();

    let options = SimulationOptions {
        t_end: 2.0 * DAY,
        saveat: DAY,
        solver: SolverOptions {
            dtmax: 3600.0,
            ..SolverOptions::default()
        },
        ..SimulationOptions::default()
    };
    let mut simulation = Simulation::new(built, options, OutputStream::memory()).unwrap();
    simulation.run().unwrap();
    let output = simulation.output().memory_output().unwrap();

    // Reference profile, marched upstream from the boundary. The last
    // Manning segment connects basin 49 to the boundary, so basin 49's
    // reference comes first.
    let params = ManningResistanceParams {
        node: hydronet::engine::network::id::NodeId::new(
            hydronet::engine::network::id::NodeType::ManningResistance,
            0,
        ),
        length: SEGMENT_LENGTH_M,
        profile_width: 1.0,
        profile_slope: 0.0,
        manning_n: 0.04,
    };
    let mut reference = vec![0.0; SEGMENTS];
    let mut h_down = DOWNSTREAM_LEVEL_M;
    for i in (0..SEGMENTS).rev() {
        let h_up = standard_step_upstream(&params, h_down, DISCHARGE_M3S);
        reference[i] = h_up;
        h_down = h_up;
    }

    let final_time = output
        .basin
        .iter()
        .map(|row| row.time)
        .fold(0.0, f64::max);
    for i in 0..SEGMENTS {
        let node_id = 100 + i as i32;
        let row = output
            .basin
            .iter()
            .find(|row| row.time == final_time && row.node_id == node_id)
            .unwrap();
        let error = (row.level - reference[i]).abs();
        if i % 10 == 0 {
            println!(
                "segment {i}: level {:.4} m, reference {:.4} m",
                row.level, reference[i]
            );
        }
        assert!(
            error < PROFILE_TOLERANCE_M,
            "segment {i}: level {} deviates {error} m from the standard-step reference",
            row.level
        );
    }
}
