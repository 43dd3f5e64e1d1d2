//! Worker event loop.
//!
//! Connects with bounded retries, syncs its replica against the controller,
//! renders dispatched regions and reports its own lifecycle state. Render
//! orders are queued and run after the inbound batch is drained, so a cancel
//! arriving alongside its order wins. Orders wait in the queue while the replica
//! is not `Synced` and run once it is.

use crate::error::{ApiError, LifecycleError};
use crate::progress::ProgressBus;
use crate::registry::WorkerState;
use crate::runtime::barrier::guarded;
use crate::runtime::render::RenderBackend;
use crate::runtime::transport::{ControlMessage, Envelope, Transport};
use crate::runtime::{RuntimeSettings, MAX_BATCH};
use crate::scheduler::Dispatch;
use crate::sync::{ReplicaStatus, ReplicaSync, SyncMessage};
use crate::tree::SceneHost;
use crate::types::{Hash, WorkerId};
use std::collections::VecDeque;
use std::time::{Duration, Instant};
use tracing::{debug, info, trace, warn};

pub struct Worker<H: SceneHost> {
    id: WorkerId,
    controller: String,
    host: H,
    replica: ReplicaSync<H::Object>,
    transport: Box<dyn Transport>,
    renderer: Box<dyn RenderBackend>,
    settings: RuntimeSettings,
    state: WorkerState,
    queue: VecDeque<Dispatch>,
    last_heartbeat: Instant,
    progress: ProgressBus,
    running: bool,
}

impl<H> Worker<H>
where
    H: SceneHost,
    H::Object: Clone,
{
    pub fn new(
        host: H,
        replica: ReplicaSync<H::Object>,
        transport: Box<dyn Transport>,
        controller: impl Into<String>,
        renderer: Box<dyn RenderBackend>,
        settings: RuntimeSettings,
    ) -> Self {
        Self {
            id: transport.local_name().to_string(),
            controller: controller.into(),
            host,
            replica,
            transport,
            renderer,
            settings,
            state: WorkerState::Ready,
            queue: VecDeque::new(),
            last_heartbeat: Instant::now(),
            progress: ProgressBus::detached(),
            running: true,
        }
    }

    pub fn with_progress(mut self, progress: ProgressBus) -> Self {
        self.progress = progress;
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn state(&self) -> WorkerState {
        self.state
    }

    pub fn host(&self) -> &H {
        &self.host
    }

    pub fn replica(&self) -> &ReplicaSync<H::Object> {
        &self.replica
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    /// Render orders received but not yet run.
    pub fn queued(&self) -> usize {
        self.queue.len()
    }

    /// Connect, then loop until the controller says `Shutdown`.
    pub fn run(&mut self) -> Result<(), ApiError> {
        self.connect()?;
        while self.step() {}
        info!(worker = %self.id, "Worker loop stopped");
        Ok(())
    }

    /// Handshake with the controller, retrying on timeout up to the configured bound.
    pub fn connect(&mut self) -> Result<(), ApiError> {
        let attempts = self.settings.connect_attempts;
        self.state = WorkerState::Connecting;
        for attempt in 1..=attempts {
            if let Err(err) = self.transport.send(&self.controller, &ControlMessage::Hello) {
                warn!(worker = %self.id, attempt, error = %err, "Hello not delivered");
                std::thread::sleep(self.settings.poll_interval);
                continue;
            }
            if let Some(top_hash) = self.await_welcome()? {
                info!(worker = %self.id, attempt, "Connected");
                self.last_heartbeat = Instant::now();
                return self.begin_sync(top_hash);
            }
            warn!(worker = %self.id, attempt, "Handshake timed out");
        }
        self.state = WorkerState::Ready;
        Err(LifecycleError::ConnectFailed {
            worker: self.id.clone(),
            attempts,
        }
        .into())
    }

    fn await_welcome(&mut self) -> Result<Option<Hash>, ApiError> {
        let deadline = Instant::now() + self.settings.handshake_timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(None);
            }
            match self.transport.recv_timeout(remaining.min(self.settings.poll_interval))? {
                Some(Envelope {
                    message: ControlMessage::Welcome { top_hash },
                    ..
                }) => return Ok(Some(top_hash)),
                Some(other) => {
                    debug!(worker = %self.id, message = other.message.name(), "Ignored during handshake");
                }
                None => {}
            }
        }
    }

    fn begin_sync(&mut self, controller_top: Hash) -> Result<(), ApiError> {
        self.report(WorkerState::Syncing)?;
        if self.replica.top_hash() == controller_top {
            return self.report(WorkerState::Synced);
        }
        debug!(worker = %self.id, "Replica differs from controller at connect; requesting snapshot");
        let request = self.replica.request_full_resync();
        self.transport.send(&self.controller, &ControlMessage::Sync(request))
    }

    /// One loop iteration. Returns false once shut down.
    pub fn step(&mut self) -> bool {
        let progress = self.progress.clone();
        let id = self.id.clone();

        if self.last_heartbeat.elapsed() >= self.settings.heartbeat_interval {
            self.last_heartbeat = Instant::now();
            guarded(&progress, "heartbeat", Some(&id), || {
                self.transport.send(&self.controller, &ControlMessage::Heartbeat)
            });
        }

        let mut wait = self.settings.poll_interval;
        for _ in 0..MAX_BATCH {
            match self.transport.recv_timeout(wait) {
                Ok(Some(envelope)) => {
                    guarded(&progress, "message", Some(&id), || self.on_message(envelope));
                }
                Ok(None) => break,
                Err(err) => {
                    guarded(&progress, "transport", Some(&id), || Err(err));
                    break;
                }
            }
            if !self.running {
                return false;
            }
            wait = Duration::ZERO;
        }

        if self.state == WorkerState::Synced {
            if let Some(order) = self.queue.pop_front() {
                guarded(&progress, "render", Some(&id), || self.render(order));
            }
        } else if !self.queue.is_empty() {
            trace!(worker = %self.id, state = %self.state, held = self.queue.len(), "Holding render orders");
        }
        self.running
    }

    fn on_message(&mut self, envelope: Envelope) -> Result<(), ApiError> {
        if envelope.from != self.controller {
            debug!(worker = %self.id, from = %envelope.from, "Ignoring envelope from a non-controller peer");
            return Ok(());
        }
        match envelope.message {
            ControlMessage::Sync(message) => self.on_sync(message),
            ControlMessage::Render(order) => {
                self.queue.push_back(order);
                Ok(())
            }
            ControlMessage::Cancel { job } => {
                let before = self.queue.len();
                self.queue.retain(|order| order.job != job);
                debug!(worker = %self.id, job, dropped = before - self.queue.len(), "Cancel received");
                Ok(())
            }
            ControlMessage::Resync => {
                let request = self.replica.request_full_resync();
                self.report(WorkerState::Syncing)?;
                self.transport.send(&self.controller, &ControlMessage::Sync(request))
            }
            ControlMessage::Shutdown => {
                self.queue.clear();
                self.report(WorkerState::Exited)?;
                self.running = false;
                Ok(())
            }
            ControlMessage::Welcome { .. } => {
                debug!(worker = %self.id, "Late welcome ignored");
                Ok(())
            }
            other => {
                debug!(worker = %self.id, message = other.name(), "Unexpected message ignored");
                Ok(())
            }
        }
    }

    fn on_sync(&mut self, message: SyncMessage) -> Result<(), ApiError> {
        let outcome = self.replica.handle(&mut self.host, message);
        for fault in self.replica.take_faults() {
            debug!(worker = %self.id, identity = %fault.identity(), kind = fault.kind().as_str(), "Sync fault");
        }
        let reply = match outcome {
            Ok(reply) => reply,
            Err(err) => {
                self.track_replica()?;
                return Err(err.into());
            }
        };
        if let Some(request) = reply {
            self.transport.send(&self.controller, &ControlMessage::Sync(request))?;
        }
        self.track_replica()
    }

    /// Mirror the replica's status into the reported lifecycle state.
    fn track_replica(&mut self) -> Result<(), ApiError> {
        let next = match (self.replica.status(), self.state) {
            (ReplicaStatus::Synced, _) => WorkerState::Synced,
            // A full resync in progress stays reported as Syncing.
            (ReplicaStatus::Repairing, WorkerState::Syncing) => WorkerState::Syncing,
            (ReplicaStatus::Repairing, _) => WorkerState::Repairing,
            (ReplicaStatus::SyncFailed, _) => WorkerState::SyncFailed,
        };
        self.report(next)
    }

    fn render(&mut self, order: Dispatch) -> Result<(), ApiError> {
        if self.state != WorkerState::Synced {
            return Err(LifecycleError::InvalidTransition {
                worker: self.id.clone(),
                from: self.state.to_string(),
                to: WorkerState::Rendering.to_string(),
            }
            .into());
        }
        self.report(WorkerState::Rendering)?;
        let report = match self.renderer.render(&order) {
            Ok(report) => report,
            Err(err) => {
                self.report(WorkerState::Synced)?;
                return Err(err);
            }
        };
        debug!(
            worker = %self.id,
            job = order.job,
            units = order.allocation.units,
            elapsed_ms = report.elapsed.as_millis() as u64,
            "Region rendered"
        );
        self.transport.send(
            &self.controller,
            &ControlMessage::RenderDone {
                job: order.job,
                elapsed_ms: report.elapsed.as_millis() as u64,
                setup_ms: report.setup.as_millis() as u64,
            },
        )?;
        self.report(WorkerState::Synced)
    }

    /// Record and announce a state change. Repeated states are not re-sent.
    fn report(&mut self, to: WorkerState) -> Result<(), ApiError> {
        if to == self.state {
            return Ok(());
        }
        debug!(worker = %self.id, from = %self.state, to = %to, "Reporting state");
        self.state = to;
        self.transport.send(&self.controller, &ControlMessage::Status(to))
    }
}
