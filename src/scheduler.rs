//! Render job scheduling
//!
//! Plans a partition over dispatchable workers, hands out regions, collects
//! completions into the performance model and finalizes the job once every
//! assigned region has reported. Cancellation and completion race with
//! last-message-wins semantics: whichever arrives last sets the job's final
//! state, and side effects already applied (model samples) are never rolled back.

use crate::balance::{Allocation, LoadBalancer, Partition, PerformanceModel, Workload};
use crate::error::ScheduleError;
use crate::progress::{DispatchData, JobData, PartitionData, ProgressBus};
use crate::registry::NodeRegistry;
use crate::types::WorkerId;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::{Duration, Instant};
use tracing::{debug, info, instrument, warn};

pub type JobId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    Planned,
    Dispatched,
    Finalized,
    Cancelled,
}

impl JobState {
    pub fn as_str(self) -> &'static str {
        match self {
            JobState::Planned => "planned",
            JobState::Dispatched => "dispatched",
            JobState::Finalized => "finalized",
            JobState::Cancelled => "cancelled",
        }
    }
}

/// A region report from a worker.
#[derive(Debug, Clone, PartialEq)]
pub struct Completion {
    pub worker: WorkerId,
    pub elapsed: Duration,
    pub setup: Duration,
}

/// Work order for one worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Dispatch {
    pub job: JobId,
    pub allocation: Allocation,
    pub unit_work: f64,
}

#[derive(Debug, Clone)]
pub struct RenderJob {
    pub id: JobId,
    pub workload: Workload,
    pub partition: Partition,
    pub state: JobState,
    pub planned_at: Instant,
    pub completions: BTreeMap<WorkerId, Completion>,
}

impl RenderJob {
    pub fn is_complete(&self) -> bool {
        self.partition
            .allocations
            .iter()
            .all(|a| self.completions.contains_key(&a.worker))
    }
}

/// Final accounting of a job.
#[derive(Debug, Clone, PartialEq)]
pub struct JobSummary {
    pub job: JobId,
    pub predicted_makespan: f64,
    /// Slowest reported region.
    pub actual_makespan: Duration,
    pub regions: usize,
}

pub struct Scheduler {
    balancer: LoadBalancer,
    model: PerformanceModel,
    jobs: BTreeMap<JobId, RenderJob>,
    next_id: JobId,
    progress: ProgressBus,
}

impl Scheduler {
    pub fn new(balancer: LoadBalancer, model: PerformanceModel) -> Self {
        Self {
            balancer,
            model,
            jobs: BTreeMap::new(),
            next_id: 1,
            progress: ProgressBus::detached(),
        }
    }

    pub fn with_progress(mut self, progress: ProgressBus) -> Self {
        self.progress = progress;
        self
    }

    pub fn model(&self) -> &PerformanceModel {
        &self.model
    }

    pub fn model_mut(&mut self) -> &mut PerformanceModel {
        &mut self.model
    }

    pub fn job(&self, id: JobId) -> Option<&RenderJob> {
        self.jobs.get(&id)
    }

    /// Partition `workload` over every enabled, synced worker.
    #[instrument(skip_all, fields(units = workload.total_units))]
    pub fn plan<R: Rng + ?Sized>(
        &mut self,
        registry: &NodeRegistry,
        workload: Workload,
        rng: &mut R,
    ) -> Result<JobId, ScheduleError> {
        let profiles: Vec<_> = registry
            .dispatchable()
            .into_iter()
            .map(|entry| {
                let mut profile = self.model.profile(&entry.id);
                profile.manual_fraction = entry.manual_fraction;
                profile
            })
            .collect();
        let partition = self.balancer.partition(&profiles, &workload, rng)?;

        let id = self.next_id;
        self.next_id += 1;
        self.progress.emit_best_effort(
            "partition_computed",
            &PartitionData {
                job: id,
                workers: partition.allocations.len(),
                total_units: partition.total_units,
                predicted_makespan: partition.makespan(),
            },
        );
        info!(job = id, workers = partition.allocations.len(), "Job planned");
        self.jobs.insert(
            id,
            RenderJob {
                id,
                workload,
                partition,
                state: JobState::Planned,
                planned_at: Instant::now(),
                completions: BTreeMap::new(),
            },
        );
        Ok(id)
    }

    /// Produce one work order per region and mark the job dispatched.
    pub fn dispatch(&mut self, id: JobId) -> Result<Vec<Dispatch>, ScheduleError> {
        let job = self.jobs.get_mut(&id).ok_or(ScheduleError::UnknownJob(id))?;
        if job.state != JobState::Planned {
            return Err(ScheduleError::JobState {
                job: id,
                state: job.state.as_str().to_string(),
                expected: JobState::Planned.as_str().to_string(),
            });
        }
        job.state = JobState::Dispatched;
        let orders: Vec<Dispatch> = job
            .partition
            .allocations
            .iter()
            .map(|a| Dispatch {
                job: id,
                allocation: a.clone(),
                unit_work: job.workload.unit_work,
            })
            .collect();
        for order in &orders {
            self.progress.emit_best_effort(
                "dispatch",
                &DispatchData {
                    job: id,
                    worker: order.allocation.worker.clone(),
                    range_start: order.allocation.range_start,
                    range_end: order.allocation.range_end,
                    units: order.allocation.units,
                },
            );
        }
        debug!(job = id, regions = orders.len(), "Job dispatched");
        Ok(orders)
    }

    /// Record a worker's region report; returns the summary once the job finalizes.
    pub fn on_completion(
        &mut self,
        id: JobId,
        completion: Completion,
    ) -> Result<Option<JobSummary>, ScheduleError> {
        let job = self.jobs.get_mut(&id).ok_or(ScheduleError::UnknownJob(id))?;
        if job.state == JobState::Planned {
            return Err(ScheduleError::JobState {
                job: id,
                state: job.state.as_str().to_string(),
                expected: JobState::Dispatched.as_str().to_string(),
            });
        }
        let Some(allocation) = job.partition.get(&completion.worker).cloned() else {
            return Err(ScheduleError::NotAssigned {
                job: id,
                worker: completion.worker,
            });
        };

        self.model.record_completion(
            &completion.worker,
            allocation.units,
            job.workload.unit_work,
            completion.elapsed.as_secs_f64(),
            completion.setup.as_secs_f64(),
        );
        job.completions.insert(completion.worker.clone(), completion);

        if !job.is_complete() || job.state == JobState::Finalized {
            return Ok(None);
        }
        if job.state == JobState::Cancelled {
            debug!(job = id, "Completion arrived after cancellation; completion wins");
        }
        job.state = JobState::Finalized;
        let summary = JobSummary {
            job: id,
            predicted_makespan: job.partition.makespan(),
            actual_makespan: job
                .completions
                .values()
                .map(|c| c.elapsed)
                .max()
                .unwrap_or_default(),
            regions: job.partition.allocations.len(),
        };
        self.progress.emit_best_effort(
            "job_finalized",
            &JobData {
                job: id,
                completed: job.completions.len(),
                assigned: job.partition.allocations.len(),
                duration_ms: Some(job.planned_at.elapsed().as_millis()),
            },
        );
        info!(
            job = id,
            predicted = summary.predicted_makespan,
            actual_ms = summary.actual_makespan.as_millis(),
            "Job finalized"
        );
        Ok(Some(summary))
    }

    /// Cancel a job. Returns the workers whose regions were still outstanding.
    pub fn cancel(&mut self, id: JobId) -> Result<Vec<WorkerId>, ScheduleError> {
        let job = self.jobs.get_mut(&id).ok_or(ScheduleError::UnknownJob(id))?;
        if job.state == JobState::Finalized {
            warn!(job = id, "Cancel arrived after finalization; cancel wins, model samples kept");
        }
        job.state = JobState::Cancelled;
        let outstanding: Vec<WorkerId> = job
            .partition
            .allocations
            .iter()
            .filter(|a| !job.completions.contains_key(&a.worker))
            .map(|a| a.worker.clone())
            .collect();
        self.progress.emit_best_effort(
            "job_cancelled",
            &JobData {
                job: id,
                completed: job.completions.len(),
                assigned: job.partition.allocations.len(),
                duration_ms: None,
            },
        );
        info!(job = id, outstanding = outstanding.len(), "Job cancelled");
        Ok(outstanding)
    }

    /// Drop finished and cancelled jobs, keeping the `keep` most recent of them.
    ///
    /// Active jobs are never dropped. A late report for a pruned job is rejected
    /// as `UnknownJob`.
    pub fn prune(&mut self, keep: usize) -> usize {
        let terminal: Vec<JobId> = self
            .jobs
            .values()
            .filter(|j| matches!(j.state, JobState::Finalized | JobState::Cancelled))
            .map(|j| j.id)
            .collect();
        let excess = terminal.len().saturating_sub(keep);
        for id in &terminal[..excess] {
            self.jobs.remove(id);
        }
        if excess > 0 {
            debug!(pruned = excess, remaining = self.jobs.len(), "Old jobs pruned");
        }
        excess
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }
}
