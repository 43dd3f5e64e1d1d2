//! Integration tests for partitioning and the job lifecycle

use rand::rngs::StdRng;
use rand::SeedableRng;
use scenesync::balance::{LoadBalancer, PerformanceModel, WorkerProfile, Workload};
use scenesync::error::{BalanceError, ScheduleError};
use scenesync::registry::{NodeRegistry, WorkerState};
use scenesync::scheduler::{Completion, JobState, Scheduler};
use std::time::Duration;

fn rng() -> StdRng {
    StdRng::seed_from_u64(7)
}

fn synced_registry(ids: &[&str]) -> NodeRegistry {
    let registry = NodeRegistry::new(Duration::from_secs(5));
    for id in ids {
        registry.register(*id);
        for state in [WorkerState::Connecting, WorkerState::Syncing, WorkerState::Synced] {
            registry.apply_status(id, state).unwrap();
        }
    }
    registry
}

#[test]
fn test_shares_follow_inverse_speed() {
    let workers = vec![WorkerProfile::new("fast", 1.0, 0.0), WorkerProfile::new("slow", 2.0, 0.0)];
    let partition = LoadBalancer::new(0)
        .partition(&workers, &Workload::new(300, 1.0), &mut rng())
        .unwrap();

    assert_eq!(partition.get("fast").unwrap().units, 200);
    assert_eq!(partition.get("slow").unwrap().units, 100);
    assert!((partition.target_time - 200.0).abs() < 1e-9);
    assert!((partition.makespan() - 200.0).abs() < 1e-9);
}

#[test]
fn test_regions_tile_the_frame_with_overlap_at_inner_edges() {
    let workers: Vec<WorkerProfile> = (1..=4)
        .map(|i| WorkerProfile::new(format!("w{}", i), i as f64 * 1e-4, 0.05))
        .collect();
    let workload = Workload::screen(1920, 1080, 4);
    let partition = LoadBalancer::new(3).partition(&workers, &workload, &mut rng()).unwrap();

    assert_eq!(partition.assigned_units(), 1920);
    let mut cursor = 0;
    for (i, a) in partition.allocations.iter().enumerate() {
        assert_eq!(a.range_start, cursor);
        assert_eq!(a.units, a.range_end - a.range_start);
        assert!(a.units >= 1);
        let expected_start = if i == 0 { a.range_start } else { a.range_start - 3 };
        let expected_end = if i == 3 { a.range_end } else { a.range_end + 3 };
        assert_eq!(a.render_start, expected_start);
        assert_eq!(a.render_end, expected_end);
        cursor = a.range_end;
    }
    assert_eq!(cursor, 1920);
}

#[test]
fn test_seeded_order_is_reproducible() {
    let workers: Vec<WorkerProfile> = (0..5).map(|i| WorkerProfile::new(format!("w{}", i), 1.0, 0.0)).collect();
    let workload = Workload::new(500, 1.0);
    let balancer = LoadBalancer::new(1);
    let a = balancer.partition(&workers, &workload, &mut StdRng::seed_from_u64(42)).unwrap();
    let b = balancer.partition(&workers, &workload, &mut StdRng::seed_from_u64(42)).unwrap();
    assert_eq!(a, b);
}

#[test]
fn test_disabled_and_manual_workers() {
    let workers = vec![
        WorkerProfile::new("a", 1.0, 0.0).with_manual_fraction(0.25),
        WorkerProfile::new("b", 1.0, 0.0),
        WorkerProfile::new("c", 1.0, 0.0),
        WorkerProfile::new("off", 0.1, 0.0).disabled(),
    ];
    let partition = LoadBalancer::new(0)
        .partition(&workers, &Workload::new(400, 1.0), &mut rng())
        .unwrap();

    assert!(partition.get("off").is_none());
    assert_eq!(partition.get("a").unwrap().units, 100);
    assert_eq!(partition.get("b").unwrap().units, 150);
    assert_eq!(partition.get("c").unwrap().units, 150);
}

#[test]
fn test_expensive_setup_is_clamped_to_one_unit() {
    let workers = vec![
        WorkerProfile::new("quick", 1.0, 0.0),
        WorkerProfile::new("steady", 1.0, 0.0),
        WorkerProfile::new("cold", 1.0, 10_000.0),
    ];
    let partition = LoadBalancer::new(0)
        .partition(&workers, &Workload::new(100, 1.0), &mut rng())
        .unwrap();

    assert_eq!(partition.get("cold").unwrap().units, 1);
    assert_eq!(partition.assigned_units(), 100);
    let quick = partition.get("quick").unwrap().units;
    let steady = partition.get("steady").unwrap().units;
    assert_eq!(quick + steady, 99);
    assert!(quick.abs_diff(steady) <= 1);
}

#[test]
fn test_invalid_inputs_are_rejected() {
    let balancer = LoadBalancer::new(0);
    let workload = Workload::new(2, 1.0);
    assert_eq!(
        balancer.partition(&[], &workload, &mut rng()).unwrap_err(),
        BalanceError::NoWorkersAvailable
    );
    let three: Vec<WorkerProfile> = (0..3).map(|i| WorkerProfile::new(format!("w{}", i), 1.0, 0.0)).collect();
    assert!(matches!(
        balancer.partition(&three, &workload, &mut rng()),
        Err(BalanceError::WorkloadTooSmall { .. })
    ));
    let over = vec![
        WorkerProfile::new("a", 1.0, 0.0).with_manual_fraction(0.7),
        WorkerProfile::new("b", 1.0, 0.0).with_manual_fraction(0.6),
    ];
    assert!(matches!(
        balancer.partition(&over, &Workload::new(100, 1.0), &mut rng()),
        Err(BalanceError::ManualOverCommit { .. })
    ));
}

#[test]
fn test_scheduler_learns_from_completions() {
    let registry = synced_registry(&["fast", "slow"]);
    let model = PerformanceModel::new("s1", "default", 10).with_defaults(1.0, 0.0);
    let mut scheduler = Scheduler::new(LoadBalancer::new(0), model);
    let workload = Workload::new(200, 1.0);

    let first = scheduler.plan(&registry, workload, &mut rng()).unwrap();
    let orders = scheduler.dispatch(first).unwrap();
    assert_eq!(orders.len(), 2);
    for order in &orders {
        assert_eq!(order.allocation.units, 100);
        let per_unit = if order.allocation.worker == "fast" { 0.01 } else { 0.03 };
        let completion = Completion {
            worker: order.allocation.worker.clone(),
            elapsed: Duration::from_secs_f64(per_unit * order.allocation.units as f64),
            setup: Duration::ZERO,
        };
        scheduler.on_completion(first, completion).unwrap();
    }
    assert_eq!(scheduler.job(first).unwrap().state, JobState::Finalized);

    let second = scheduler.plan(&registry, workload, &mut rng()).unwrap();
    let partition = &scheduler.job(second).unwrap().partition;
    assert_eq!(partition.get("fast").unwrap().units, 150);
    assert_eq!(partition.get("slow").unwrap().units, 50);
}

#[test]
fn test_only_synced_enabled_workers_are_planned() {
    let registry = synced_registry(&["a", "b", "c"]);
    registry.apply_status("b", WorkerState::Repairing).unwrap();
    registry.set_enabled("c", false).unwrap();
    let mut scheduler = Scheduler::new(LoadBalancer::new(0), PerformanceModel::new("s", "default", 5));

    let job = scheduler.plan(&registry, Workload::new(10, 1.0), &mut rng()).unwrap();
    let partition = &scheduler.job(job).unwrap().partition;
    assert_eq!(partition.allocations.len(), 1);
    assert_eq!(partition.allocations[0].worker, "a");

    let err = scheduler
        .on_completion(
            job,
            Completion {
                worker: "a".to_string(),
                elapsed: Duration::from_millis(5),
                setup: Duration::ZERO,
            },
        )
        .unwrap_err();
    assert!(matches!(err, ScheduleError::JobState { .. }));
}

#[test]
fn test_cancel_reports_outstanding_then_late_completion_finalizes() {
    let registry = synced_registry(&["a", "b"]);
    let mut scheduler = Scheduler::new(LoadBalancer::new(0), PerformanceModel::new("s", "default", 5));
    let job = scheduler.plan(&registry, Workload::new(20, 1.0), &mut rng()).unwrap();
    scheduler.dispatch(job).unwrap();
    let done = |worker: &str| Completion {
        worker: worker.to_string(),
        elapsed: Duration::from_millis(10),
        setup: Duration::ZERO,
    };

    assert!(scheduler.on_completion(job, done("a")).unwrap().is_none());
    assert_eq!(scheduler.cancel(job).unwrap(), vec!["b".to_string()]);
    assert_eq!(scheduler.job(job).unwrap().state, JobState::Cancelled);

    let summary = scheduler.on_completion(job, done("b")).unwrap().unwrap();
    assert_eq!(summary.regions, 2);
    assert_eq!(scheduler.job(job).unwrap().state, JobState::Finalized);
}
