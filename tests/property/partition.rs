//! Property-based tests for partition totals and region layout

use proptest::prelude::*;
use rand::rngs::StdRng;
use rand::SeedableRng;
use scenesync::balance::{LoadBalancer, WorkerProfile, Workload};

fn workers_strategy() -> impl Strategy<Value = Vec<WorkerProfile>> {
    prop::collection::vec((1e-4f64..1.0, 0.0f64..5.0), 1..7).prop_map(|coefficients| {
        coefficients
            .into_iter()
            .enumerate()
            .map(|(i, (k, setup))| WorkerProfile::new(format!("w{}", i), k, setup))
            .collect()
    })
}

#[test]
fn test_partition_invariants_property() {
    let mut runner = proptest::test_runner::TestRunner::default();

    runner
        .run(
            &(workers_strategy(), 0u64..2000, 1.0f64..500.0, 0u64..5, any::<u64>()),
            |(workers, extra_units, unit_work, margin, seed)| {
                let total = workers.len() as u64 + extra_units;
                let workload = Workload::new(total, unit_work);
                let partition = LoadBalancer::new(margin)
                    .partition(&workers, &workload, &mut StdRng::seed_from_u64(seed))
                    .unwrap();

                prop_assert_eq!(partition.allocations.len(), workers.len());
                prop_assert_eq!(partition.assigned_units(), total);

                let mut cursor = 0;
                for a in &partition.allocations {
                    prop_assert!(a.units >= 1);
                    prop_assert_eq!(a.range_start, cursor);
                    prop_assert_eq!(a.range_end - a.range_start, a.units);
                    prop_assert!(a.render_start <= a.range_start);
                    prop_assert!(a.render_end >= a.range_end);
                    prop_assert!(a.range_start - a.render_start <= margin);
                    prop_assert!(a.render_end <= total);
                    cursor = a.range_end;
                }
                prop_assert_eq!(cursor, total);
                Ok(())
            },
        )
        .unwrap();
}

#[test]
fn test_manual_fractions_are_honoured_property() {
    let mut runner = proptest::test_runner::TestRunner::default();

    runner
        .run(
            &(workers_strategy(), 0.05f64..0.5, 100u64..5000),
            |(mut workers, fraction, total)| {
                prop_assume!(workers.len() >= 2);
                workers[0].manual_fraction = Some(fraction);
                let workload = Workload::new(total, 1.0);
                let shares = LoadBalancer::new(0).shares(&workers, &workload).unwrap();

                let manual = shares[0].1;
                let expected = ((fraction * total as f64).round() as u64).max(1);
                prop_assert_eq!(manual, expected);
                prop_assert_eq!(shares.iter().map(|(_, u)| u).sum::<u64>(), total);
                Ok(())
            },
        )
        .unwrap();
}
