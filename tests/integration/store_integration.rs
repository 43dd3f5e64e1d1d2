//! Integration tests for the performance history store

use scenesync::balance::{PerformanceModel, WorkerPerformance};
use scenesync::store::{MemoryPerfStore, PerfKey, PerfStore, SledPerfStore};
use tempfile::TempDir;

fn trained_model(session: &str) -> PerformanceModel {
    let mut model = PerformanceModel::new(session, "cycles", 4);
    model.record_completion("alpha", 100, 10.0, 2.0, 0.0);
    model.record_completion("alpha", 100, 10.0, 4.0, 0.0);
    model.record_completion("beta", 50, 10.0, 5.5, 0.5);
    model
}

#[test]
fn test_history_survives_reopen() {
    let dir = TempDir::new().unwrap();
    {
        let store = SledPerfStore::new(dir.path()).unwrap();
        assert_eq!(trained_model("night").save(&store), 2);
        store.flush().unwrap();
    }

    let store = SledPerfStore::new(dir.path()).unwrap();
    let alpha = store.get(&PerfKey::new("night", "cycles", "alpha")).unwrap().unwrap();
    assert_eq!(alpha.samples.len(), 2);
    assert!((alpha.k_estimate().unwrap() - 0.003).abs() < 1e-12);

    let mut fresh = PerformanceModel::new("night", "cycles", 4);
    let loaded = fresh
        .load(&store, &["alpha".to_string(), "beta".to_string(), "gamma".to_string()])
        .unwrap();
    assert_eq!(loaded, 2);
    let beta = fresh.profile("beta");
    assert!((beta.k - 0.01).abs() < 1e-12);
    assert!((beta.setup - 0.5).abs() < 1e-12);
    assert_eq!(fresh.profile("gamma").k, 1.0);
}

#[test]
fn test_workers_are_scoped_by_session_and_engine() {
    let dir = TempDir::new().unwrap();
    let store = SledPerfStore::new(dir.path()).unwrap();
    trained_model("night").save(&store);
    trained_model("day").save(&store);
    let mut other_engine = PerformanceModel::new("night", "eevee", 4);
    other_engine.record_completion("delta", 10, 1.0, 1.0, 0.0);
    other_engine.save(&store);

    let mut night = store.workers("night", "cycles").unwrap();
    night.sort();
    assert_eq!(night, vec!["alpha".to_string(), "beta".to_string()]);
    assert_eq!(store.workers("night", "eevee").unwrap(), vec!["delta".to_string()]);
    assert!(store.workers("nightly", "cycles").unwrap().is_empty());
}

#[test]
fn test_loading_into_smaller_window_drops_oldest() {
    let store = MemoryPerfStore::new();
    let mut perf = WorkerPerformance::new(10);
    for k in [1.0, 2.0, 3.0, 4.0, 5.0] {
        perf.observe(k, 0.0);
    }
    store.set(&PerfKey::new("s", "e", "w"), &perf).unwrap();

    let mut model = PerformanceModel::new("s", "e", 2);
    model.load(&store, &["w".to_string()]).unwrap();
    let loaded = model.get("w").unwrap();
    assert_eq!(loaded.samples.iter().copied().collect::<Vec<_>>(), vec![4.0, 5.0]);
    assert_eq!(loaded.k_estimate(), Some(4.5));
}
