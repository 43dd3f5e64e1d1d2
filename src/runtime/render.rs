//! Render execution seam.

use crate::error::ApiError;
use crate::scheduler::Dispatch;
use std::time::Duration;

/// Timing of one rendered region.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RenderReport {
    pub elapsed: Duration,
    pub setup: Duration,
}

/// Executes a region. Implementations wrap the actual render engine.
pub trait RenderBackend: Send {
    fn render(&mut self, order: &Dispatch) -> Result<RenderReport, ApiError>;
}

/// Reports the time the cost model predicts instead of rendering anything.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SimulatedRenderer {
    /// Seconds per unit of work.
    pub k: f64,
    /// Fixed seconds per region.
    pub setup: f64,
}

impl SimulatedRenderer {
    pub fn new(k: f64, setup: f64) -> Self {
        Self { k, setup }
    }
}

impl RenderBackend for SimulatedRenderer {
    fn render(&mut self, order: &Dispatch) -> Result<RenderReport, ApiError> {
        let work = order.allocation.units as f64 * order.unit_work;
        let elapsed = self.setup + self.k * work;
        let to_duration = |secs: f64| {
            Duration::try_from_secs_f64(secs.max(0.0))
                .map_err(|e| ApiError::Render(format!("timing out of range: {}", e)))
        };
        Ok(RenderReport {
            elapsed: to_duration(elapsed)?,
            setup: to_duration(self.setup)?,
        })
    }
}
