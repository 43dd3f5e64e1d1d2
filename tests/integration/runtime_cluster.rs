//! End-to-end tests: controller and worker threads over the in-process hub

use scenesync::balance::{Allocation, Workload};
use scenesync::config::SceneSyncConfig;
use scenesync::error::{ApiError, ErrorKind, LifecycleError};
use scenesync::progress::{ProgressBus, ProgressEvent};
use scenesync::registry::WorkerState;
use scenesync::runtime::{
    ChannelHub, ControlMessage, ControllerCommand, LocalCluster, RuntimeSettings, SimulatedRenderer, Transport,
    Worker, WorkerSetup,
};
use scenesync::scheduler::Dispatch;
use scenesync::scene::MemoryScene;
use scenesync::sync::{Announcement, ReplicaSync, SyncAuthority, SyncMessage};
use scenesync::tree::{SceneHost, TreeOptions};
use scenesync::types::AttrValue;
use scenesync::store::{MemoryPerfStore, PerfStore};
use std::sync::mpsc::Receiver;
use std::sync::Arc;
use std::time::Duration;

const WAIT: Duration = Duration::from_secs(10);

fn fast_config() -> SceneSyncConfig {
    let mut config = SceneSyncConfig::default();
    config.lifecycle.poll_interval_ms = 5;
    config.lifecycle.heartbeat_interval_ms = 100;
    config.lifecycle.heartbeat_timeout_ms = 5_000;
    config.lifecycle.watchdog_tick_ms = 50;
    config
}

fn setup(id: &str, host: MemoryScene) -> WorkerSetup<MemoryScene> {
    WorkerSetup {
        id: id.to_string(),
        host,
        renderer: Box::new(SimulatedRenderer::new(1e-6, 0.0)),
    }
}

fn count(events: &Receiver<ProgressEvent>, event_type: &str) -> usize {
    events.try_iter().filter(|e| e.event_type == event_type).count()
}

fn start(rigs: usize) -> (LocalCluster<MemoryScene>, Receiver<ProgressEvent>) {
    let scene = MemoryScene::sample(rigs);
    let mut stale = scene.clone();
    let root = stale.root();
    stale.set(root, "frame", AttrValue::Int(99));
    let (progress, events) = ProgressBus::new_pair("cluster-test");
    let cluster = LocalCluster::start(
        scene.clone(),
        vec![setup("worker-a", scene), setup("worker-b", stale)],
        &fast_config(),
        progress,
    )
    .unwrap()
    .with_seed(3);
    (cluster, events)
}

#[test]
fn test_workers_sync_edit_and_render() {
    let (mut cluster, events) = start(4);
    assert!(cluster.wait_for_all(WorkerState::Synced, WAIT), "workers never synced");

    let rig = cluster.controller().host().objects_of_type("object")[1];
    let before = cluster.controller().authority().top_hash();
    cluster
        .submit(ControllerCommand::Edit(Box::new(move |scene: &mut MemoryScene| {
            scene.set(rig, "visible", AttrValue::Bool(false));
            vec![rig]
        })))
        .unwrap();
    assert!(cluster.drive_until(WAIT, |c| c.authority().top_hash() != before));
    assert!(cluster.wait_for_all(WorkerState::Synced, WAIT));

    cluster
        .submit(ControllerCommand::Render(Workload::screen(64, 8, 1)))
        .unwrap();
    assert!(cluster.drive_until(WAIT, |c| !c.summaries().is_empty()), "job never finalized");
    let summary = cluster.controller().summaries()[0].clone();
    assert_eq!(summary.regions, 2);

    for (id, result) in cluster.shutdown() {
        assert!(result.is_ok(), "{} exited with {:?}", id, result);
    }
    assert_eq!(count(&events, "loop_error"), 0);
}

#[test]
fn test_local_worker_and_manual_fraction_share_the_frame() {
    let (cluster, events) = start(2);
    let mut cluster = cluster.with_local_worker("controller-local", Box::new(SimulatedRenderer::new(1e-6, 0.0)));
    assert!(cluster.wait_for_all(WorkerState::Synced, WAIT));
    assert_eq!(
        cluster.controller().registry().state("controller-local"),
        Some(WorkerState::Synced)
    );

    cluster
        .submit(ControllerCommand::SetManualFraction("worker-a".to_string(), Some(0.5)))
        .unwrap();
    cluster
        .submit(ControllerCommand::Render(Workload::screen(64, 8, 1)))
        .unwrap();
    assert!(cluster.drive_until(WAIT, |c| !c.summaries().is_empty()), "job never finalized");

    let summary = cluster.controller().summaries()[0].clone();
    assert_eq!(summary.regions, 3);
    let job = cluster.controller().scheduler().job(summary.job).unwrap();
    let pinned = job
        .partition
        .allocations
        .iter()
        .find(|a| a.worker == "worker-a")
        .unwrap();
    assert_eq!(pinned.units, 32);

    for (_, result) in cluster.shutdown() {
        assert!(result.is_ok());
    }
    assert_eq!(count(&events, "loop_error"), 0);
}

#[test]
fn test_operator_resync_returns_worker_to_synced() {
    let (mut cluster, events) = start(2);
    assert!(cluster.wait_for_all(WorkerState::Synced, WAIT));
    events.try_iter().for_each(drop);

    cluster
        .submit(ControllerCommand::Resync("worker-a".to_string()))
        .unwrap();
    let mut seen = 0;
    assert!(cluster.drive_until(WAIT, |_| {
        seen += count(&events, "synced");
        seen > 0
    }));
    assert!(cluster.wait_for_all(WorkerState::Synced, WAIT));

    for (_, result) in cluster.shutdown() {
        assert!(result.is_ok());
    }
}

#[test]
fn test_worker_without_controller_fails_to_connect() {
    let hub = ChannelHub::new();
    let scene = MemoryScene::sample(1);
    let replica = ReplicaSync::build(&scene, TreeOptions::default(), 3).unwrap();
    let settings = RuntimeSettings {
        poll_interval: Duration::from_millis(1),
        handshake_timeout: Duration::from_millis(10),
        connect_attempts: 2,
        ..RuntimeSettings::default()
    };
    let mut worker = Worker::new(
        scene,
        replica,
        Box::new(hub.endpoint("lonely")),
        "controller",
        Box::new(SimulatedRenderer::new(1e-6, 0.0)),
        settings,
    );

    let err = worker.run().unwrap_err();
    assert!(matches!(
        err,
        ApiError::Lifecycle(LifecycleError::ConnectFailed { attempts: 2, .. })
    ));
    assert_eq!(err.kind(), ErrorKind::TransientNetwork);
    assert_eq!(worker.state(), WorkerState::Ready);
}

#[test]
fn test_order_arriving_with_diverging_announcement_runs_after_resync() {
    let hub = ChannelHub::new();
    let controller = hub.endpoint("controller");
    let scene = MemoryScene::sample(2);
    let authority = SyncAuthority::build(&scene, scene.root(), TreeOptions::default()).unwrap();
    let replica = ReplicaSync::build(&scene, TreeOptions::default(), 3).unwrap();
    let settings = RuntimeSettings {
        poll_interval: Duration::from_millis(1),
        ..RuntimeSettings::default()
    };
    let mut worker = Worker::new(
        scene.clone(),
        replica,
        Box::new(hub.endpoint("worker-a")),
        "controller",
        Box::new(SimulatedRenderer::new(1e-6, 0.0)),
        settings,
    );
    controller
        .send("worker-a", &ControlMessage::Welcome { top_hash: authority.top_hash() })
        .unwrap();
    worker.connect().unwrap();
    assert_eq!(worker.state(), WorkerState::Synced);

    // Order and a diverging announcement land in the same inbound batch.
    let order = Dispatch {
        job: 7,
        allocation: Allocation {
            worker: "worker-a".to_string(),
            range_start: 0,
            range_end: 10,
            units: 10,
            render_start: 0,
            render_end: 10,
            predicted_finish: 0.0,
        },
        unit_work: 1.0,
    };
    controller.send("worker-a", &ControlMessage::Render(order)).unwrap();
    let diverging = Announcement {
        top_hash: authority.top_hash().wrapping_add(1),
        renames: Vec::new(),
        changes: Vec::new(),
    };
    controller
        .send("worker-a", &ControlMessage::Sync(SyncMessage::Announce(diverging)))
        .unwrap();
    assert!(worker.step());
    assert_eq!(worker.state(), WorkerState::Repairing);
    assert_eq!(worker.queued(), 1, "order must survive while repairing");

    let snapshot = authority.respond(&scene, &SyncMessage::RequestSnapshot).unwrap();
    controller.send("worker-a", &ControlMessage::Sync(snapshot)).unwrap();
    assert!(worker.step());
    assert_eq!(worker.queued(), 0);
    assert_eq!(worker.state(), WorkerState::Synced);

    let mut reported = Vec::new();
    while let Some(envelope) = controller.recv_timeout(Duration::from_millis(1)).unwrap() {
        if let ControlMessage::RenderDone { job, .. } = envelope.message {
            reported.push(job);
        }
    }
    assert_eq!(reported, vec![7]);
}

#[test]
fn test_second_cluster_session_starts_from_stored_performance() {
    let store: Arc<dyn PerfStore> = Arc::new(MemoryPerfStore::new());
    let config = fast_config();
    let run = |store: Arc<dyn PerfStore>| {
        let scene = MemoryScene::sample(2);
        let (progress, _events) = ProgressBus::new_pair("perf-session");
        let mut cluster = LocalCluster::start(
            scene.clone(),
            vec![WorkerSetup {
                id: "worker-a".to_string(),
                host: scene,
                renderer: Box::new(SimulatedRenderer::new(2e-3, 0.0)),
            }],
            &config,
            progress,
        )
        .unwrap()
        .with_perf_store(store)
        .with_seed(1);
        assert!(cluster.wait_for_all(WorkerState::Synced, WAIT));
        let k = cluster.controller().scheduler().model().profile("worker-a").k;
        cluster
            .submit(ControllerCommand::Render(Workload::screen(64, 8, 1)))
            .unwrap();
        assert!(cluster.drive_until(WAIT, |c| !c.summaries().is_empty()), "job never finalized");
        cluster.shutdown();
        k
    };

    let first = run(Arc::clone(&store));
    assert_eq!(first, config.balance.default_k);
    let second = run(store);
    assert_ne!(second, config.balance.default_k);
    assert!((second - 2e-3).abs() < 1e-4, "stored k not applied: {}", second);
}
