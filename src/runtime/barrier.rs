//! Crash barrier around every event-loop handler.
//!
//! A handler that returns an error or panics is logged by error kind and
//! reported as a `loop_error` progress event; the loop then carries on.

use crate::error::{ApiError, ErrorKind};
use crate::progress::{LoopErrorData, ProgressBus};
use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use tracing::{error, info, warn};

/// Run `handler`, absorbing its failure. Returns the kind of error caught, if any.
pub fn guarded<F>(progress: &ProgressBus, context: &str, worker: Option<&str>, handler: F) -> Option<ErrorKind>
where
    F: FnOnce() -> Result<(), ApiError>,
{
    let err = match panic::catch_unwind(AssertUnwindSafe(handler)) {
        Ok(Ok(())) => return None,
        Ok(Err(err)) => err,
        Err(payload) => ApiError::Panic(panic_message(payload.as_ref())),
    };
    let kind = err.kind();
    let worker_field = worker.unwrap_or("-");
    match kind {
        ErrorKind::Divergence | ErrorKind::TransientNetwork => {
            warn!(context, worker = %worker_field, kind = kind.as_str(), error = %err, "Handler failed")
        }
        ErrorKind::Schema => {
            info!(context, worker = %worker_field, kind = kind.as_str(), error = %err, "Handler failed")
        }
        ErrorKind::Structural | ErrorKind::Other => {
            error!(context, worker = %worker_field, kind = kind.as_str(), error = %err, "Handler failed")
        }
    }
    progress.emit_best_effort(
        "loop_error",
        &LoopErrorData {
            kind: kind.as_str().to_string(),
            error: err.to_string(),
            worker: worker.map(str::to_string),
        },
    );
    Some(kind)
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
