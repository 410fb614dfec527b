// ABOUTME: Round-trip properties: storage/level profile inversion and warm-restart state reload
// ABOUTME: Sampled over randomized monotone profiles so segment boundaries get exercised

use std::collections::BTreeMap;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use hydronet::engine::network::builder::{BasinSpec, ModelBuilder, SeriesSpec};
use hydronet::engine::output::OutputStream;
use hydronet::engine::physics::profile::BasinProfile;
use hydronet::engine::sim::{Simulation, SimulationOptions};

const DAY: f64 = 86_400.0;
const ROUND_TRIP_TOLERANCE: f64 = 1e-8;

#[test]
fn storage_level_inversion_round_trips_on_random_profiles() {
    let mut rng = StdRng::seed_from_u64(20240117);
    for profile_index in 0..25 {
        // Random strictly increasing levels, non-decreasing areas.
        let segments = rng.gen_range(2..8);
        let mut levels = vec![rng.gen_range(-5.0..5.0)];
        let mut areas = vec![rng.gen_range(1.0..100.0)];
        for _ in 0..segments {
            levels.push(levels.last().unwrap() + rng.gen_range(0.1..3.0));
            areas.push(areas.last().unwrap() + rng.gen_range(0.0..200.0));
        }
        let mut issues = Vec::new();
        let profile = BasinProfile::new(levels, areas, None, "random", &mut issues)
            .expect("random profile must be valid");
        assert!(issues.is_empty());

        let max_storage = profile.max_storage();
        for sample in 0..40 {
            // Cover the interior and a stretch above the table.
            let storage = max_storage * 1.5 * sample as f64 / 39.0;
            let level = profile.level_from_storage(storage);
            let back = profile.storage_from_level(level);
            assert!(
                (back - storage).abs() < ROUND_TRIP_TOLERANCE * storage.max(1.0),
                "profile {profile_index}: storage {storage} -> level {level} -> {back}"
            );
        }
    }
}

fn two_bucket_model(initial: Option<(f64, f64)>, warm: Option<BTreeMap<i32, f64>>) -> Simulation {
    let (s1, s2) = initial.unwrap_or((800.0, 300.0));
    let mut builder = ModelBuilder::new();
    for (node_id, storage) in [(1, s1), (2, s2)] {
        builder.add_basin(BasinSpec {
            node_id,
            subnetwork: 1,
            profile_level: vec![0.0, 5.0],
            profile_area: vec![500.0, 700.0],
            profile_storage: None,
            initial_storage: Some(storage),
            initial_level: None,
            precipitation: SeriesSpec::Constant(0.0),
            potential_evaporation: SeriesSpec::Constant(0.0),
            drainage: SeriesSpec::Constant(0.0),
            infiltration: SeriesSpec::Constant(1e-4 * node_id as f64),
        });
    }
    if let Some(warm) = warm {
        builder.warm_start(warm);
    }
    let built = builder.build().unwrap();
    let options = SimulationOptions {
        t_end: DAY,
        saveat: DAY,
        ..SimulationOptions::default()
    };
    Simulation::new(built, options, OutputStream::memory()).unwrap()
}

#[test]
fn warm_restart_resumes_from_saved_basin_state() {
    let mut first = two_bucket_model(None, None);
    first.run().unwrap();
    let saved = first.output().memory_output().unwrap().basin_state.clone();
    assert_eq!(saved.len(), 2);

    let warm: BTreeMap<i32, f64> = saved.iter().map(|row| (row.node_id, row.storage)).collect();
    let mut second = two_bucket_model(None, Some(warm.clone()));
    second.run().unwrap();
    let rows = &second.output().memory_output().unwrap().basin;
    for row in rows.iter().filter(|row| row.time == 0.0) {
        let expected = warm[&row.node_id];
        assert!(
            (row.storage - expected).abs() < 1e-9,
            "basin {} restarted at {} instead of {}",
            row.node_id,
            row.storage,
            expected
        );
    }
    // The restarted run continues the drawdown rather than repeating it.
    let first_final = saved
        .iter()
        .map(|row| (row.node_id, row.storage))
        .collect::<BTreeMap<_, _>>();
    for row in rows.iter().filter(|row| row.time > 0.0) {
        assert!(row.storage < first_final[&row.node_id] + 1e-9);
    }
}
