//! In-process cluster: one controller plus worker threads over a [`ChannelHub`].
//!
//! Used by the `simulate` command and by end-to-end tests. The controller runs
//! on the caller's thread and only advances when the caller drives it.

use crate::balance::{LoadBalancer, PerformanceModel};
use crate::config::SceneSyncConfig;
use crate::error::ApiError;
use crate::progress::ProgressBus;
use crate::registry::{NodeRegistry, Watchdog, WorkerState};
use crate::runtime::controller::{Controller, ControllerCommand};
use crate::runtime::render::RenderBackend;
use crate::runtime::transport::ChannelHub;
use crate::runtime::worker::Worker;
use crate::scheduler::Scheduler;
use crate::store::PerfStore;
use crate::sync::{ReplicaSync, SyncAuthority};
use crate::tree::SceneHost;
use crate::types::WorkerId;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{info, warn};

pub const CONTROLLER_NAME: &str = "controller";

/// One worker to launch: its id, its own copy of the scene, and how it renders.
pub struct WorkerSetup<H> {
    pub id: WorkerId,
    pub host: H,
    pub renderer: Box<dyn RenderBackend>,
}

pub struct LocalCluster<H: SceneHost> {
    controller: Controller<H>,
    hub: ChannelHub,
    watchdog: Option<Watchdog>,
    workers: Vec<(WorkerId, JoinHandle<Result<(), ApiError>>)>,
}

impl<H> LocalCluster<H>
where
    H: SceneHost + Send + 'static,
    H::Object: Clone + Send + 'static,
{
    pub fn start(
        host: H,
        workers: Vec<WorkerSetup<H>>,
        config: &SceneSyncConfig,
        progress: ProgressBus,
    ) -> Result<Self, ApiError> {
        let settings = config.lifecycle.runtime_settings();
        let options = config.sync.tree_options();
        let hub = ChannelHub::new();

        let authority =
            SyncAuthority::build(&host, host.root(), options.clone())?.with_progress(progress.clone());
        let registry =
            Arc::new(NodeRegistry::new(settings.heartbeat_timeout).with_progress(progress.clone()));
        let model = PerformanceModel::new(progress.session(), &config.balance.engine, config.balance.perf_window)
            .with_defaults(config.balance.default_k, config.balance.default_setup);
        let scheduler =
            Scheduler::new(LoadBalancer::new(config.balance.overlap_margin), model).with_progress(progress.clone());
        let controller = Controller::new(
            host,
            authority,
            registry,
            scheduler,
            Box::new(hub.endpoint(CONTROLLER_NAME)),
            settings,
        )
        .with_progress(progress.clone());
        let watchdog = Some(controller.spawn_watchdog());

        let mut handles = Vec::with_capacity(workers.len());
        for setup in workers {
            let replica = ReplicaSync::build(&setup.host, options.clone(), config.sync.repair_retry_limit)?
                .with_progress(progress.clone());
            let mut worker = Worker::new(
                setup.host,
                replica,
                Box::new(hub.endpoint(setup.id.clone())),
                CONTROLLER_NAME,
                setup.renderer,
                settings,
            )
            .with_progress(progress.clone());
            let handle = std::thread::Builder::new()
                .name(format!("scenesync-{}", setup.id))
                .spawn(move || worker.run())
                .map_err(|e| ApiError::Transport(format!("failed to start worker thread: {}", e)))?;
            handles.push((setup.id, handle));
        }
        info!(workers = handles.len(), "Local cluster started");

        Ok(Self {
            controller,
            hub,
            watchdog,
            workers: handles,
        })
    }

    pub fn with_seed(self, seed: u64) -> Self {
        Self {
            controller: self.controller.with_seed(seed),
            ..self
        }
    }

    /// Let the controller render a region of every job itself.
    pub fn with_local_worker(self, id: impl Into<WorkerId>, renderer: Box<dyn RenderBackend>) -> Self {
        Self {
            controller: self.controller.with_local_worker(id, renderer),
            ..self
        }
    }

    pub fn with_perf_store(self, store: Arc<dyn PerfStore>) -> Self {
        Self {
            controller: self.controller.with_perf_store(store),
            ..self
        }
    }

    pub fn controller(&self) -> &Controller<H> {
        &self.controller
    }

    pub fn hub(&self) -> &ChannelHub {
        &self.hub
    }

    pub fn submit(&self, command: ControllerCommand<H>) -> Result<(), ApiError> {
        self.controller
            .commands()
            .send(command)
            .map_err(|_| ApiError::Transport("controller command channel closed".to_string()))
    }

    /// Step the controller until `done` holds or `timeout` passes. Returns whether it held.
    pub fn drive_until<F>(&mut self, timeout: Duration, mut done: F) -> bool
    where
        F: FnMut(&Controller<H>) -> bool,
    {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if done(&self.controller) {
                return true;
            }
            if !self.controller.step() {
                break;
            }
        }
        done(&self.controller)
    }

    /// Step until every launched worker reports `state`.
    pub fn wait_for_all(&mut self, state: WorkerState, timeout: Duration) -> bool {
        let ids: Vec<WorkerId> = self.workers.iter().map(|(id, _)| id.clone()).collect();
        self.drive_until(timeout, |c| {
            ids.iter().all(|id| c.registry().state(id) == Some(state))
        })
    }

    /// Stop the controller and join every worker. Returns each worker's exit result.
    pub fn shutdown(mut self) -> Vec<(WorkerId, Result<(), ApiError>)> {
        if self.submit(ControllerCommand::Shutdown).is_ok() {
            while self.controller.step() {}
        }
        if let Some(watchdog) = self.watchdog.take() {
            watchdog.stop();
        }
        self.workers
            .drain(..)
            .map(|(id, handle)| {
                let result = handle.join().unwrap_or_else(|_| {
                    warn!(worker = %id, "Worker thread panicked");
                    Err(ApiError::Panic(format!("worker {} panicked", id)))
                });
                (id, result)
            })
            .collect()
    }
}
