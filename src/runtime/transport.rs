//! Message transport boundary.
//!
//! The event loops only see [`Transport`]; how bytes move between processes is
//! the implementor's business. [`ChannelHub`] wires endpoints together in one
//! process over std channels, encoding every envelope with bincode on the way
//! so the wire format is exercised end to end.

use crate::error::ApiError;
use crate::registry::WorkerState;
use crate::scheduler::{Dispatch, JobId};
use crate::sync::SyncMessage;
use crate::types::Hash;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::time::Duration;
use tracing::trace;

/// Everything a controller and a worker say to each other.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ControlMessage {
    /// Worker asks to join; implies it is now `Connecting`.
    Hello,
    /// Handshake reply carrying the controller's current top hash.
    Welcome { top_hash: Hash },
    /// Worker-reported lifecycle state.
    Status(WorkerState),
    Heartbeat,
    Sync(SyncMessage),
    Render(Dispatch),
    RenderDone {
        job: JobId,
        elapsed_ms: u64,
        setup_ms: u64,
    },
    Cancel { job: JobId },
    /// Operator-triggered full resync.
    Resync,
    Shutdown,
}

impl ControlMessage {
    pub fn name(&self) -> &'static str {
        match self {
            ControlMessage::Hello => "hello",
            ControlMessage::Welcome { .. } => "welcome",
            ControlMessage::Status(_) => "status",
            ControlMessage::Heartbeat => "heartbeat",
            ControlMessage::Sync(_) => "sync",
            ControlMessage::Render(_) => "render",
            ControlMessage::RenderDone { .. } => "render_done",
            ControlMessage::Cancel { .. } => "cancel",
            ControlMessage::Resync => "resync",
            ControlMessage::Shutdown => "shutdown",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub from: String,
    pub message: ControlMessage,
}

impl Envelope {
    pub fn encode(&self) -> Result<Vec<u8>, ApiError> {
        bincode::serialize(self).map_err(|e| ApiError::Transport(format!("encode failed: {}", e)))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ApiError> {
        bincode::deserialize(bytes).map_err(|e| ApiError::Transport(format!("decode failed: {}", e)))
    }
}

pub trait Transport: Send {
    /// Name peers use to address this endpoint.
    fn local_name(&self) -> &str;

    fn send(&self, to: &str, message: &ControlMessage) -> Result<(), ApiError>;

    /// Wait up to `timeout` for the next inbound envelope. `Ok(None)` on timeout.
    fn recv_timeout(&self, timeout: Duration) -> Result<Option<Envelope>, ApiError>;
}

type PeerTable = Arc<RwLock<HashMap<String, Sender<Vec<u8>>>>>;

/// In-process switchboard for [`ChannelTransport`] endpoints.
#[derive(Debug, Clone, Default)]
pub struct ChannelHub {
    peers: PeerTable,
}

impl ChannelHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create (or replace) the endpoint called `name`.
    pub fn endpoint(&self, name: impl Into<String>) -> ChannelTransport {
        let name = name.into();
        let (tx, rx) = mpsc::channel();
        self.peers.write().insert(name.clone(), tx);
        ChannelTransport {
            name,
            inbox: rx,
            peers: Arc::clone(&self.peers),
        }
    }

    /// Unplug an endpoint; later sends to it fail.
    pub fn disconnect(&self, name: &str) -> bool {
        self.peers.write().remove(name).is_some()
    }
}

#[derive(Debug)]
pub struct ChannelTransport {
    name: String,
    inbox: Receiver<Vec<u8>>,
    peers: PeerTable,
}

impl Transport for ChannelTransport {
    fn local_name(&self) -> &str {
        &self.name
    }

    fn send(&self, to: &str, message: &ControlMessage) -> Result<(), ApiError> {
        let bytes = Envelope {
            from: self.name.clone(),
            message: message.clone(),
        }
        .encode()?;
        let peers = self.peers.read();
        let peer = peers
            .get(to)
            .ok_or_else(|| ApiError::Transport(format!("no route to {}", to)))?;
        trace!(from = %self.name, to, message = message.name(), bytes = bytes.len(), "send");
        peer.send(bytes)
            .map_err(|_| ApiError::Transport(format!("{} hung up", to)))
    }

    fn recv_timeout(&self, timeout: Duration) -> Result<Option<Envelope>, ApiError> {
        match self.inbox.recv_timeout(timeout) {
            Ok(bytes) => Envelope::decode(&bytes).map(Some),
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Err(RecvTimeoutError::Disconnected) => {
                Err(ApiError::Transport(format!("{} inbox closed", self.name)))
            }
        }
    }
}
