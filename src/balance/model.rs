//! Rolling per-worker performance model
//!
//! Completions feed `k` observations (seconds per unit of work) into a bounded
//! window per worker; the estimate is the window mean. Setup time is a running
//! average over every observation.

use crate::balance::partition::WorkerProfile;
use crate::error::StorageError;
use crate::store::{PerfKey, PerfStore};
use crate::types::WorkerId;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use tracing::{debug, warn};

/// Persisted performance history of one worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerPerformance {
    pub samples: VecDeque<f64>,
    pub capacity: usize,
    pub setup_average: f64,
    pub setup_samples: u64,
}

impl WorkerPerformance {
    pub fn new(capacity: usize) -> Self {
        Self {
            samples: VecDeque::with_capacity(capacity),
            capacity: capacity.max(1),
            setup_average: 0.0,
            setup_samples: 0,
        }
    }

    /// Add one `k` observation, evicting the oldest once the window is full.
    pub fn observe(&mut self, k: f64, setup: f64) {
        if !(k.is_finite() && k > 0.0) {
            return;
        }
        while self.samples.len() >= self.capacity {
            self.samples.pop_front();
        }
        self.samples.push_back(k);
        if setup.is_finite() && setup >= 0.0 {
            self.setup_samples += 1;
            self.setup_average += (setup - self.setup_average) / self.setup_samples as f64;
        }
    }

    /// Mean `k` over the window, `None` before the first observation.
    pub fn k_estimate(&self) -> Option<f64> {
        if self.samples.is_empty() {
            return None;
        }
        Some(self.samples.iter().sum::<f64>() / self.samples.len() as f64)
    }

    /// Shrink or grow the window; excess oldest samples are dropped.
    pub fn resize(&mut self, capacity: usize) {
        self.capacity = capacity.max(1);
        while self.samples.len() > self.capacity {
            self.samples.pop_front();
        }
    }
}

/// Performance models for every worker of one session and render engine.
#[derive(Debug, Clone)]
pub struct PerformanceModel {
    session: String,
    engine: String,
    window: usize,
    default_k: f64,
    default_setup: f64,
    workers: BTreeMap<WorkerId, WorkerPerformance>,
}

impl PerformanceModel {
    pub fn new(session: impl Into<String>, engine: impl Into<String>, window: usize) -> Self {
        Self {
            session: session.into(),
            engine: engine.into(),
            window: window.max(1),
            default_k: 1.0,
            default_setup: 0.0,
            workers: BTreeMap::new(),
        }
    }

    /// Coefficients assumed for workers without history.
    pub fn with_defaults(mut self, k: f64, setup: f64) -> Self {
        self.default_k = k;
        self.default_setup = setup;
        self
    }

    /// Record a finished region: `units` units of `unit_work` took `elapsed` seconds,
    /// of which `setup` seconds were fixed overhead.
    pub fn record_completion(&mut self, worker: &str, units: u64, unit_work: f64, elapsed: f64, setup: f64) {
        let work = units as f64 * unit_work;
        if work <= 0.0 {
            return;
        }
        let k = (elapsed - setup).max(f64::EPSILON) / work;
        let window = self.window;
        let entry = self
            .workers
            .entry(worker.to_string())
            .or_insert_with(|| WorkerPerformance::new(window));
        entry.observe(k, setup);
        debug!(worker = %worker, k, samples = entry.samples.len(), "Performance sample recorded");
    }

    pub fn get(&self, worker: &str) -> Option<&WorkerPerformance> {
        self.workers.get(worker)
    }

    /// Balancer input for `worker`, falling back to the defaults.
    pub fn profile(&self, worker: &str) -> WorkerProfile {
        let (k, setup) = match self.workers.get(worker) {
            Some(perf) => (
                perf.k_estimate().unwrap_or(self.default_k),
                if perf.setup_samples > 0 {
                    perf.setup_average
                } else {
                    self.default_setup
                },
            ),
            None => (self.default_k, self.default_setup),
        };
        WorkerProfile::new(worker, k, setup)
    }

    pub fn key(&self, worker: &str) -> PerfKey {
        PerfKey::new(&self.session, &self.engine, worker)
    }

    /// Load stored history for `workers`; missing entries start empty.
    pub fn load(&mut self, store: &dyn PerfStore, workers: &[WorkerId]) -> Result<usize, StorageError> {
        let mut loaded = 0;
        for worker in workers {
            if let Some(mut perf) = store.get(&self.key(worker))? {
                perf.resize(self.window);
                self.workers.insert(worker.clone(), perf);
                loaded += 1;
            }
        }
        debug!(session = %self.session, engine = %self.engine, loaded, "Performance history loaded");
        Ok(loaded)
    }

    /// Persist every worker's history. Individual failures are logged and skipped.
    pub fn save(&self, store: &dyn PerfStore) -> usize {
        let mut saved = 0;
        for (worker, perf) in &self.workers {
            match store.set(&self.key(worker), perf) {
                Ok(()) => saved += 1,
                Err(err) => warn!(worker = %worker, error = %err, "Failed to persist performance history"),
            }
        }
        saved
    }
}
