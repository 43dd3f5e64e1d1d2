//! Controller event loop.

use crate::balance::Workload;
use crate::error::{ApiError, SyncError};
use crate::progress::ProgressBus;
use crate::registry::{NodeRegistry, Watchdog, WatchdogEvent, WorkerState};
use crate::runtime::barrier::guarded;
use crate::runtime::render::RenderBackend;
use crate::runtime::transport::{ControlMessage, Envelope, Transport};
use crate::runtime::{RuntimeSettings, JOB_HISTORY, MAX_BATCH};
use crate::scheduler::{Completion, Dispatch, JobId, JobSummary, Scheduler};
use crate::store::PerfStore;
use crate::sync::{SyncAuthority, SyncMessage};
use crate::tree::{RuleProvider, SceneHost};
use crate::types::WorkerId;
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// A local scene mutation. Returns the objects it touched so they can be rescanned.
pub type SceneEdit<H> = Box<dyn FnOnce(&mut H) -> Vec<<H as RuleProvider>::Object> + Send>;

/// Operator requests fed into the controller loop.
pub enum ControllerCommand<H: SceneHost> {
    Edit(SceneEdit<H>),
    Render(Workload),
    Cancel(JobId),
    Resync(WorkerId),
    SetEnabled(WorkerId, bool),
    /// Pin a worker to a fixed share of every frame, or return it to the model.
    SetManualFraction(WorkerId, Option<f64>),
    Shutdown,
}

struct LocalWorker {
    id: WorkerId,
    renderer: Box<dyn RenderBackend>,
}

pub struct Controller<H: SceneHost> {
    host: H,
    authority: SyncAuthority<H::Object>,
    registry: Arc<NodeRegistry>,
    scheduler: Scheduler,
    transport: Box<dyn Transport>,
    settings: RuntimeSettings,
    local: Option<LocalWorker>,
    perf_store: Option<Arc<dyn PerfStore>>,
    commands_tx: Sender<ControllerCommand<H>>,
    commands_rx: Receiver<ControllerCommand<H>>,
    watchdog_tx: Sender<WatchdogEvent>,
    watchdog_rx: Receiver<WatchdogEvent>,
    summaries: Vec<JobSummary>,
    rng: StdRng,
    progress: ProgressBus,
    running: bool,
}

impl<H> Controller<H>
where
    H: SceneHost,
    H::Object: Clone,
{
    pub fn new(
        host: H,
        authority: SyncAuthority<H::Object>,
        registry: Arc<NodeRegistry>,
        scheduler: Scheduler,
        transport: Box<dyn Transport>,
        settings: RuntimeSettings,
    ) -> Self {
        let (commands_tx, commands_rx) = mpsc::channel();
        let (watchdog_tx, watchdog_rx) = mpsc::channel();
        Self {
            host,
            authority,
            registry,
            scheduler,
            transport,
            settings,
            local: None,
            perf_store: None,
            commands_tx,
            commands_rx,
            watchdog_tx,
            watchdog_rx,
            summaries: Vec::new(),
            rng: StdRng::from_entropy(),
            progress: ProgressBus::detached(),
            running: true,
        }
    }

    pub fn with_progress(mut self, progress: ProgressBus) -> Self {
        self.progress = progress;
        self
    }

    /// Render in-process as well. The local worker is always `Synced`.
    pub fn with_local_worker(mut self, id: impl Into<WorkerId>, renderer: Box<dyn RenderBackend>) -> Self {
        let id = id.into();
        self.registry.register_local(id.clone());
        self.local = Some(LocalWorker { id, renderer });
        self
    }

    /// Load stored performance history from `store` and persist the model there
    /// after every finalized job.
    ///
    /// Workers already registered are loaded now; the rest when they say hello.
    pub fn with_perf_store(mut self, store: Arc<dyn PerfStore>) -> Self {
        self.perf_store = Some(store);
        let known: Vec<WorkerId> = self.registry.snapshot().into_iter().map(|(id, _)| id).collect();
        self.load_model(&known);
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.rng = StdRng::seed_from_u64(seed);
        self
    }

    pub fn commands(&self) -> Sender<ControllerCommand<H>> {
        self.commands_tx.clone()
    }

    pub fn host(&self) -> &H {
        &self.host
    }

    pub fn authority(&self) -> &SyncAuthority<H::Object> {
        &self.authority
    }

    pub fn registry(&self) -> &Arc<NodeRegistry> {
        &self.registry
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    pub fn summaries(&self) -> &[JobSummary] {
        &self.summaries
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    /// Start the watchdog for this controller's registry.
    pub fn spawn_watchdog(&self) -> Watchdog {
        Watchdog::spawn(
            Arc::clone(&self.registry),
            self.settings.watchdog_tick,
            self.watchdog_tx.clone(),
        )
    }

    /// Run until a `Shutdown` command arrives.
    pub fn run(&mut self) {
        let watchdog = self.spawn_watchdog();
        info!(name = self.transport.local_name(), "Controller loop started");
        while self.step() {}
        watchdog.stop();
        self.save_model();
        info!("Controller loop stopped");
    }

    /// One loop iteration: inbound envelopes, watchdog events, then operator commands.
    /// Returns false once shut down.
    pub fn step(&mut self) -> bool {
        let progress = self.progress.clone();
        let mut wait = self.settings.poll_interval;
        for _ in 0..MAX_BATCH {
            match self.transport.recv_timeout(wait) {
                Ok(Some(envelope)) => {
                    let from = envelope.from.clone();
                    guarded(&progress, "message", Some(&from), || self.on_message(envelope));
                }
                Ok(None) => break,
                Err(err) => {
                    guarded(&progress, "transport", None, || Err(err));
                    break;
                }
            }
            wait = Duration::ZERO;
        }

        while let Ok(event) = self.watchdog_rx.try_recv() {
            self.on_watchdog(event);
        }

        while let Ok(command) = self.commands_rx.try_recv() {
            guarded(&progress, "command", None, || self.on_command(command));
            if !self.running {
                break;
            }
        }
        self.running
    }

    fn on_message(&mut self, envelope: Envelope) -> Result<(), ApiError> {
        let Envelope { from, message } = envelope;
        debug!(from = %from, message = message.name(), "Controller received");
        match message {
            ControlMessage::Hello => {
                // A hello always starts a fresh session for that worker.
                self.registry.register(from.clone());
                self.registry.apply_status(&from, WorkerState::Connecting)?;
                self.load_model(std::slice::from_ref(&from));
                self.transport.send(
                    &from,
                    &ControlMessage::Welcome {
                        top_hash: self.authority.top_hash(),
                    },
                )
            }
            ControlMessage::Status(state) => {
                self.registry.apply_status(&from, state)?;
                Ok(())
            }
            ControlMessage::Heartbeat => {
                self.registry.heartbeat(&from)?;
                Ok(())
            }
            ControlMessage::Sync(request) => {
                self.registry.heartbeat(&from)?;
                let reply = self.authority.respond(&self.host, &request)?;
                self.transport.send(&from, &ControlMessage::Sync(reply))
            }
            ControlMessage::RenderDone {
                job,
                elapsed_ms,
                setup_ms,
            } => {
                self.registry.heartbeat(&from)?;
                self.complete(
                    job,
                    Completion {
                        worker: from,
                        elapsed: Duration::from_millis(elapsed_ms),
                        setup: Duration::from_millis(setup_ms),
                    },
                )
            }
            other => Err(SyncError::UnexpectedMessage {
                state: "controller".to_string(),
                message: format!("{} from {}", other.name(), from),
            }
            .into()),
        }
    }

    fn on_watchdog(&mut self, event: WatchdogEvent) {
        match event {
            WatchdogEvent::Unresponsive(worker) => {
                debug!(worker = %worker, "Watchdog expired worker");
            }
        }
    }

    fn on_command(&mut self, command: ControllerCommand<H>) -> Result<(), ApiError> {
        match command {
            ControllerCommand::Edit(edit) => self.apply_edit(edit),
            ControllerCommand::Render(workload) => self.render(workload),
            ControllerCommand::Cancel(job) => {
                let outstanding = self.scheduler.cancel(job)?;
                self.scheduler.prune(JOB_HISTORY);
                for worker in outstanding {
                    if self.is_local(&worker) {
                        continue;
                    }
                    if let Err(err) = self.transport.send(&worker, &ControlMessage::Cancel { job }) {
                        warn!(worker = %worker, job, error = %err, "Failed to deliver cancel");
                    }
                }
                Ok(())
            }
            ControllerCommand::Resync(worker) => self.transport.send(&worker, &ControlMessage::Resync),
            ControllerCommand::SetEnabled(worker, enabled) => {
                self.registry.set_enabled(&worker, enabled)?;
                Ok(())
            }
            ControllerCommand::SetManualFraction(worker, fraction) => {
                self.registry.set_manual_fraction(&worker, fraction)?;
                Ok(())
            }
            ControllerCommand::Shutdown => {
                for (worker, _) in self.registry.snapshot() {
                    if self.is_local(&worker) {
                        continue;
                    }
                    if let Err(err) = self.transport.send(&worker, &ControlMessage::Shutdown) {
                        debug!(worker = %worker, error = %err, "Shutdown not delivered");
                    }
                }
                self.running = false;
                Ok(())
            }
        }
    }

    fn apply_edit(&mut self, edit: SceneEdit<H>) -> Result<(), ApiError> {
        let touched = edit(&mut self.host);
        self.authority.touch(&self.host, &touched)?;
        let Some(announcement) = self.authority.announce() else {
            return Ok(());
        };
        let message = ControlMessage::Sync(SyncMessage::Announce(announcement));
        for (worker, state) in self.registry.snapshot() {
            // A worker mid-snapshot applies this after the snapshot, on the same channel.
            if self.is_local(&worker)
                || !matches!(
                    state,
                    WorkerState::Syncing
                        | WorkerState::Synced
                        | WorkerState::Rendering
                        | WorkerState::Repairing
                )
            {
                continue;
            }
            if let Err(err) = self.transport.send(&worker, &message) {
                warn!(worker = %worker, error = %err, "Failed to deliver announcement");
            }
        }
        Ok(())
    }

    fn render(&mut self, workload: Workload) -> Result<(), ApiError> {
        let job = self.scheduler.plan(&self.registry, workload, &mut self.rng)?;
        let orders = self.scheduler.dispatch(job)?;
        let mut local_orders: Vec<Dispatch> = Vec::new();
        for order in orders {
            let worker = order.allocation.worker.clone();
            if self.is_local(&worker) {
                local_orders.push(order);
                continue;
            }
            if let Err(err) = self.transport.send(&worker, &ControlMessage::Render(order)) {
                warn!(worker = %worker, job, error = %err, "Failed to dispatch region");
            }
        }
        for order in local_orders {
            let Some(local) = self.local.as_mut() else {
                continue;
            };
            let report = local.renderer.render(&order)?;
            let worker = local.id.clone();
            self.complete(
                order.job,
                Completion {
                    worker,
                    elapsed: report.elapsed,
                    setup: report.setup,
                },
            )?;
        }
        Ok(())
    }

    fn complete(&mut self, job: JobId, completion: Completion) -> Result<(), ApiError> {
        if let Some(summary) = self.scheduler.on_completion(job, completion)? {
            self.summaries.push(summary);
            self.save_model();
            self.scheduler.prune(JOB_HISTORY);
        }
        Ok(())
    }

    /// Pull stored history for `workers` the model has not seen yet.
    fn load_model(&mut self, workers: &[WorkerId]) {
        let Some(store) = &self.perf_store else {
            return;
        };
        let unseen: Vec<WorkerId> = workers
            .iter()
            .filter(|w| self.scheduler.model().get(w).is_none())
            .cloned()
            .collect();
        if unseen.is_empty() {
            return;
        }
        match self.scheduler.model_mut().load(store.as_ref(), &unseen) {
            Ok(loaded) => debug!(loaded, "Stored performance history applied"),
            Err(err) => warn!(error = %err, "Failed to load performance history"),
        }
    }

    fn save_model(&self) {
        if let Some(store) = &self.perf_store {
            let saved = self.scheduler.model().save(store.as_ref());
            debug!(saved, "Performance model persisted");
        }
    }

    fn is_local(&self, worker: &str) -> bool {
        self.local.as_ref().is_some_and(|l| l.id == worker)
    }
}
