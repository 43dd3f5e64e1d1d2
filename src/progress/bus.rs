//! In-process progress event channel.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, SendError, Sender};
use std::sync::Arc;

use serde::Serialize;
use serde_json::Value;
use tracing::debug;

use crate::progress::event::ProgressEvent;

/// Cloneable sender half. All clones share one session and one sequence counter.
#[derive(Debug, Clone)]
pub struct ProgressBus {
    tx: Sender<ProgressEvent>,
    session: String,
    seq: Arc<AtomicU64>,
}

impl ProgressBus {
    pub fn new_pair(session: impl Into<String>) -> (Self, Receiver<ProgressEvent>) {
        let (tx, rx) = mpsc::channel();
        let bus = Self {
            tx,
            session: session.into(),
            seq: Arc::new(AtomicU64::new(1)),
        };
        (bus, rx)
    }

    /// A bus whose receiver is already gone; every emit is a no-op.
    pub fn detached() -> Self {
        Self::new_pair("detached").0
    }

    pub fn session(&self) -> &str {
        &self.session
    }

    pub fn emit(
        &self,
        event_type: &str,
        data: Value,
    ) -> Result<(), SendError<ProgressEvent>> {
        let seq = self.seq.fetch_add(1, Ordering::Relaxed);
        self.tx
            .send(ProgressEvent::new(self.session.clone(), seq, event_type, data))
    }

    /// Emit a typed payload, dropping the event if nobody is listening.
    pub fn emit_best_effort<T: Serialize>(&self, event_type: &str, data: &T) {
        let value = match serde_json::to_value(data) {
            Ok(v) => v,
            Err(err) => {
                debug!(event_type = %event_type, error = %err, "Unserializable progress payload");
                return;
            }
        };
        if self.emit(event_type, value).is_err() {
            debug!(event_type = %event_type, "Progress receiver gone; event dropped");
        }
    }
}
