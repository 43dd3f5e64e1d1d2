//! Event schema for progress observability.

use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One diagnostic event. `ts` is RFC 3339 UTC with millisecond precision; `seq`
/// is strictly increasing per bus.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgressEvent {
    pub ts: String,
    pub session: String,
    pub seq: u64,
    #[serde(rename = "type")]
    pub event_type: String,
    pub data: Value,
}

impl ProgressEvent {
    pub fn new(session: impl Into<String>, seq: u64, event_type: impl Into<String>, data: Value) -> Self {
        Self {
            ts: Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
            session: session.into(),
            seq,
            event_type: event_type.into(),
            data,
        }
    }
}

/// `repair_started`, `repair_applied`, `synced`, `sync_failed`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RepairData {
    pub local_top: String,
    pub expected_top: String,
    pub attempt: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub repairs: Option<usize>,
}

/// `missing_datablock`, `schema_fault`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FaultData {
    pub identity: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attribute: Option<String>,
    pub detail: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerStateData {
    pub worker: String,
    pub from: String,
    pub to: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PartitionData {
    pub job: u64,
    pub workers: usize,
    pub total_units: u64,
    pub predicted_makespan: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchData {
    pub job: u64,
    pub worker: String,
    pub range_start: u64,
    pub range_end: u64,
    pub units: u64,
}

/// `job_finalized`, `job_cancelled`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobData {
    pub job: u64,
    pub completed: usize,
    pub assigned: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u128>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoopErrorData {
    pub kind: String,
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub worker: Option<String>,
}
