// ABOUTME: Allocation pipeline validation: demand collection, priority goal programming, infeasibility reporting
// ABOUTME: Also pins down the byte-identical LP serialization the determinism contract requires

use hydronet::engine::allocation::model::AllocationOptions;
use hydronet::engine::core::error::HydronetError;
use hydronet::engine::network::builder::{
    BasinSpec, FlowBoundarySpec, LevelBoundarySpec, LinearResistanceSpec, ModelBuilder,
    OutletSpec, SeriesSpec, UserDemandDemandSpec, UserDemandSpec,
};
use hydronet::engine::output::OutputStream;
use hydronet::engine::sim::{Simulation, SimulationOptions};
use hydronet::engine::solver::integrator::SolverOptions;

const DAY: f64 = 86_400.0;
/// Allocated rates must hit the analytic split within this tolerance.
const ALLOCATION_TOLERANCE: f64 = 0.05;

fn basin(node_id: i32, subnetwork: u32, initial_storage: f64) -> BasinSpec {
    BasinSpec {
        node_id,
        subnetwork,
        profile_level: vec![0.0, 10.0],
        profile_area: vec![10_000.0, 10_000.0],
        profile_storage: None,
        initial_storage: Some(initial_storage),
        initial_level: None,
        precipitation: SeriesSpec::Constant(0.0),
        potential_evaporation: SeriesSpec::Constant(0.0),
        drainage: SeriesSpec::Constant(0.0),
        infiltration: SeriesSpec::Constant(0.0),
    }
}

/// Primary network with a 4.5 m³/s source feeding subnetwork 3 through
/// an outlet; the secondary's user wants [4.0, 0.5, 1.0] across three
/// priorities.
fn two_level_model() -> ModelBuilder {
    let mut builder = ModelBuilder::new();
    builder.add_flow_boundary(FlowBoundarySpec {
        node_id: 1,
        subnetwork: 1,
        flow_rate: SeriesSpec::Constant(4.5),
    });
    builder.add_basin(basin(2, 1, 1_000.0));
    builder.add_outlet(OutletSpec {
        node_id: 3,
        subnetwork: 3,
        flow_rate: SeriesSpec::Constant(0.0),
        min_flow_rate: 0.0,
        max_flow_rate: f64::INFINITY,
        min_upstream_level: None,
        max_downstream_level: None,
    });
    builder.add_basin(basin(4, 3, 0.0));
    builder.add_user_demand(UserDemandSpec {
        node_id: 5,
        subnetwork: 3,
        demands: vec![
            UserDemandDemandSpec {
                priority: 1,
                demand: SeriesSpec::Constant(4.0),
            },
            UserDemandDemandSpec {
                priority: 2,
                demand: SeriesSpec::Constant(0.5),
            },
            UserDemandDemandSpec {
                priority: 3,
                demand: SeriesSpec::Constant(1.0),
            },
        ],
        return_factor: 0.0,
        min_level: None,
    });
    builder.add_terminal_in(6, 3);
    builder.add_flow_link(("FlowBoundary", 1), ("Basin", 2));
    builder.add_flow_link(("Basin", 2), ("Outlet", 3));
    builder.add_flow_link(("Outlet", 3), ("Basin", 4));
    builder.add_flow_link(("Basin", 4), ("UserDemand", 5));
    builder.add_flow_link(("UserDemand", 5), ("Terminal", 6));
    builder
}

fn allocation_options() -> SimulationOptions {
    SimulationOptions {
        t_end: 2.0 * DAY,
        saveat: DAY,
        allocation: Some(AllocationOptions {
            timestep: DAY,
            ..AllocationOptions::default()
        }),
        solver: SolverOptions {
            dtmax: 3600.0,
            ..SolverOptions::default()
        },
        ..SimulationOptions::default()
    }
}

#[test]
fn secondary_demands_are_collected_and_allocated_by_priority() {
    let built = two_level_model().build().expect("model must validate");
    let mut simulation =
        Simulation::new(built, allocation_options(), OutputStream::memory()).unwrap();
    simulation.run().expect("allocation run must succeed");
    let output = simulation.output().memory_output().unwrap();

    let user_rows: Vec<_> = output
        .allocation
        .iter()
        .filter(|row| row.node_type == "UserDemand" && row.node_id == 5)
        .collect();
    assert!(!user_rows.is_empty(), "no allocation rows for the user");

    let allocated_at = |priority: u32| {
        user_rows
            .iter()
            .find(|row| row.demand_priority == priority)
            .map(|row| row.allocated)
            .unwrap_or_else(|| panic!("no allocation row at priority {priority}"))
    };
    let p1 = allocated_at(1);
    let p2 = allocated_at(2);
    let p3 = allocated_at(3);
    println!("allocated per priority: [{p1:.3}, {p2:.3}, {p3:.3}]");
    // The 4.5 m³/s source covers priority 1 fully, priority 2 with the
    // remainder, and leaves nothing for priority 3.
    assert!((p1 - 4.0).abs() < ALLOCATION_TOLERANCE);
    assert!((p2 - 0.5).abs() < ALLOCATION_TOLERANCE);
    assert!(p3.abs() < ALLOCATION_TOLERANCE);
    // Never allocate more than demanded.
    for row in &user_rows {
        assert!(row.allocated <= row.demand + 1e-9);
    }
}

#[test]
fn allocation_lp_serialization_is_byte_identical_across_builds() {
    let build_lps = || {
        let built = two_level_model().build().unwrap();
        let simulation =
            Simulation::new(built, allocation_options(), OutputStream::memory()).unwrap();
        simulation.allocation_lps()
    };
    let first = build_lps();
    let second = build_lps();
    assert_eq!(first.len(), second.len());
    for ((subnetwork_a, lp_a), (subnetwork_b, lp_b)) in first.iter().zip(second.iter()) {
        assert_eq!(subnetwork_a, subnetwork_b);
        assert_eq!(lp_a, lp_b, "LP for subnetwork {subnetwork_a} differs");
    }
}

#[test]
fn infeasible_volume_conservation_reports_an_iis() {
    // A fixed 1 m³/s inflow into a thimble-sized basin whose only outlet
    // is a resistance pinned at zero head difference: nothing can absorb
    // the water, so the first allocation objective is inconsistent.
    let mut builder = ModelBuilder::new();
    builder.add_basin(BasinSpec {
        node_id: 1,
        subnetwork: 1,
        profile_level: vec![0.0, 0.1],
        profile_area: vec![1.0, 1.0],
        profile_storage: None,
        initial_storage: Some(0.05),
        initial_level: None,
        precipitation: SeriesSpec::Constant(0.0),
        potential_evaporation: SeriesSpec::Constant(0.0),
        drainage: SeriesSpec::Constant(0.0),
        infiltration: SeriesSpec::Constant(0.0),
    });
    builder.add_linear_resistance(LinearResistanceSpec {
        node_id: 2,
        subnetwork: 1,
        resistance: 1000.0,
        max_flow_rate: 1e-6,
    });
    builder.add_level_boundary(LevelBoundarySpec {
        node_id: 4,
        subnetwork: 1,
        level: SeriesSpec::Constant(0.05),
    });
    builder.add_flow_boundary(FlowBoundarySpec {
        node_id: 3,
        subnetwork: 1,
        flow_rate: SeriesSpec::Constant(1.0),
    });
    builder.add_user_demand(UserDemandSpec {
        node_id: 5,
        subnetwork: 1,
        demands: vec![UserDemandDemandSpec {
            priority: 1,
            demand: SeriesSpec::Constant(1e-6),
        }],
        return_factor: 0.0,
        min_level: None,
    });
    builder.add_terminal(6);
    builder.add_flow_link(("FlowBoundary", 3), ("Basin", 1));
    builder.add_flow_link(("Basin", 1), ("LinearResistance", 2));
    builder.add_flow_link(("LinearResistance", 2), ("LevelBoundary", 4));
    builder.add_flow_link(("Basin", 1), ("UserDemand", 5));
    builder.add_flow_link(("UserDemand", 5), ("Terminal", 6));
    let built = builder.build().expect("model itself is valid");

    let mut simulation =
        Simulation::new(built, allocation_options(), OutputStream::memory()).unwrap();
    let error = simulation.run().expect_err("allocation must be infeasible");
    let message = error.to_string();
    println!("{message}");
    assert!(message.contains("Set of incompatible constraints found"));
    match error {
        HydronetError::AllocationInfeasible { iis, .. } => {
            assert!(
                iis.iter().any(|name| name == "volume_conservation[Basin #1]"),
                "IIS {iis:?} should name the basin's volume conservation"
            );
            assert!(
                iis.iter()
                    .any(|name| name == "linear_resistance[LinearResistance #2]"),
                "IIS {iis:?} should name the resistance relation"
            );
        }
        other => panic!("expected AllocationInfeasible, got {other}"),
    }
}
