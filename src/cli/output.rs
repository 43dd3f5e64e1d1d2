//! CLI output: error mapping from domain errors to stable CLI surface.

use crate::error::ApiError;

/// Map domain/service errors to a string for CLI output, prefixed by error kind.
pub fn map_error(e: &ApiError) -> String {
    format!("error[{}]: {}", e.kind().as_str(), e)
}
