//! Throughput-proportional workload partitioning
//!
//! Each worker follows a linear model `time(a) = setup + k * a` where `a` is work
//! (pixel-samples). The balancer solves for the shared finish time `T0` under
//! perfectly divisible work, converts each worker's share into whole units
//! (screen columns), then repairs rounding with single-unit moves until the
//! total is exact and every worker holds at least one unit. Transfer and
//! latency costs are modelled as zero.

use crate::error::BalanceError;
use crate::types::WorkerId;
use rand::seq::SliceRandom;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument};

const FRACTION_EPSILON: f64 = 1e-9;

/// Balancer input for one worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerProfile {
    pub id: WorkerId,
    /// Seconds per unit of work.
    pub k: f64,
    /// Fixed setup seconds before the first unit completes.
    #[serde(default)]
    pub setup: f64,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Operator-supplied share of the workload in `(0, 1]`, bypassing the model.
    #[serde(default)]
    pub manual_fraction: Option<f64>,
}

fn default_enabled() -> bool {
    true
}

impl WorkerProfile {
    pub fn new(id: impl Into<WorkerId>, k: f64, setup: f64) -> Self {
        Self {
            id: id.into(),
            k,
            setup,
            enabled: true,
            manual_fraction: None,
        }
    }

    pub fn with_manual_fraction(mut self, fraction: f64) -> Self {
        self.manual_fraction = Some(fraction);
        self
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    /// Predicted finish time for `units` whole units of `unit_work` each.
    pub fn predicted_finish(&self, units: u64, unit_work: f64) -> f64 {
        self.setup + self.k * units as f64 * unit_work
    }
}

/// A fixed-size workload split into indivisible units.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Workload {
    /// Number of partitionable units (e.g. screen columns).
    pub total_units: u64,
    /// Work per unit (e.g. column height times samples).
    pub unit_work: f64,
}

impl Workload {
    pub fn new(total_units: u64, unit_work: f64) -> Self {
        Self {
            total_units,
            unit_work,
        }
    }

    /// Screen-space workload partitioned by column.
    pub fn screen(width: u32, height: u32, samples: u32) -> Self {
        Self {
            total_units: u64::from(width),
            unit_work: f64::from(height) * f64::from(samples.max(1)),
        }
    }

    pub fn total_work(&self) -> f64 {
        self.total_units as f64 * self.unit_work
    }
}

/// One worker's contiguous region.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Allocation {
    pub worker: WorkerId,
    /// Owned, non-overlapping unit range `[range_start, range_end)`.
    pub range_start: u64,
    pub range_end: u64,
    pub units: u64,
    /// Range to actually process, widened by the overlap margin at inner edges.
    pub render_start: u64,
    pub render_end: u64,
    pub predicted_finish: f64,
}

/// Result of one balancing pass. Allocations are in region order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Partition {
    pub allocations: Vec<Allocation>,
    pub total_units: u64,
    /// Ideal shared finish time from the closed form; 0 when not computed.
    pub target_time: f64,
}

impl Partition {
    pub fn get(&self, worker: &str) -> Option<&Allocation> {
        self.allocations.iter().find(|a| a.worker == worker)
    }

    /// Completion time of the slowest worker.
    pub fn makespan(&self) -> f64 {
        self.allocations
            .iter()
            .map(|a| a.predicted_finish)
            .fold(0.0, f64::max)
    }

    pub fn assigned_units(&self) -> u64 {
        self.allocations.iter().map(|a| a.units).sum()
    }
}

/// Partition calculator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoadBalancer {
    overlap_margin: u64,
}

impl Default for LoadBalancer {
    fn default() -> Self {
        Self { overlap_margin: 2 }
    }
}

impl LoadBalancer {
    pub fn new(overlap_margin: u64) -> Self {
        Self { overlap_margin }
    }

    pub fn overlap_margin(&self) -> u64 {
        self.overlap_margin
    }

    /// Whole-unit share per enabled worker, in input order
    ///
    /// `Σ units == total_units` and every enabled worker gets at least one unit.
    /// Manual fractions are honoured first; the model splits what remains.
    pub fn shares(
        &self,
        workers: &[WorkerProfile],
        workload: &Workload,
    ) -> Result<Vec<(WorkerId, u64)>, BalanceError> {
        let enabled: Vec<&WorkerProfile> = workers.iter().filter(|w| w.enabled).collect();
        if enabled.is_empty() {
            return Err(BalanceError::NoWorkersAvailable);
        }
        for worker in &enabled {
            if !(worker.k.is_finite() && worker.k > 0.0) {
                return Err(BalanceError::InvalidCoefficient {
                    worker: worker.id.clone(),
                    k: worker.k,
                });
            }
            if !(worker.setup.is_finite() && worker.setup >= 0.0) {
                return Err(BalanceError::InvalidSetup {
                    worker: worker.id.clone(),
                    setup: worker.setup,
                });
            }
        }
        let total = workload.total_units;
        if total < enabled.len() as u64 {
            return Err(BalanceError::WorkloadTooSmall {
                units: total,
                workers: enabled.len(),
            });
        }
        if enabled.len() == 1 {
            return Ok(vec![(enabled[0].id.clone(), total)]);
        }

        let mut units = vec![0u64; enabled.len()];
        let (manual, auto): (Vec<usize>, Vec<usize>) =
            (0..enabled.len()).partition(|&i| enabled[i].manual_fraction.is_some());

        let mut manual_total = 0.0;
        let mut manual_units = 0u64;
        for &i in &manual {
            let fraction = enabled[i].manual_fraction.unwrap_or_default();
            if !(fraction > 0.0 && fraction <= 1.0) {
                return Err(BalanceError::InvalidManualFraction {
                    worker: enabled[i].id.clone(),
                    fraction,
                });
            }
            manual_total += fraction;
            units[i] = ((fraction * total as f64).round() as u64).max(1);
            manual_units += units[i];
        }
        if manual_total > 1.0 + FRACTION_EPSILON {
            return Err(BalanceError::ManualOverCommit {
                total: manual_total,
            });
        }

        if auto.is_empty() {
            rebalance(&enabled, &manual, &mut units, total, workload.unit_work);
        } else {
            let remaining = total.saturating_sub(manual_units);
            if remaining < auto.len() as u64 {
                return Err(BalanceError::WorkloadTooSmall {
                    units: remaining,
                    workers: auto.len(),
                });
            }
            // Workers whose setup outlasts the shared finish time get one unit and
            // drop out; the rest re-solve over what is left.
            let mut free = auto.clone();
            let mut free_units = remaining;
            while !free.is_empty() {
                let raw = raw_shares(&enabled, &free, free_units, workload.unit_work);
                let clamped: Vec<usize> = free
                    .iter()
                    .zip(&raw)
                    .filter(|(_, share)| **share < 1.0)
                    .map(|(&i, _)| i)
                    .collect();
                if clamped.is_empty() {
                    for (&i, share) in free.iter().zip(raw) {
                        units[i] = share.round() as u64;
                    }
                    break;
                }
                for i in clamped {
                    units[i] = 1;
                    free_units -= 1;
                    free.retain(|&f| f != i);
                }
            }
            rebalance(&enabled, &auto, &mut units, remaining, workload.unit_work);
        }

        Ok(enabled
            .iter()
            .zip(units)
            .map(|(w, u)| (w.id.clone(), u))
            .collect())
    }

    /// Compute shares and lay them out as contiguous regions in a random order.
    #[instrument(skip_all, fields(workers = workers.len(), units = workload.total_units))]
    pub fn partition<R: Rng + ?Sized>(
        &self,
        workers: &[WorkerProfile],
        workload: &Workload,
        rng: &mut R,
    ) -> Result<Partition, BalanceError> {
        let shares = self.shares(workers, workload)?;
        let target_time = target_time(
            &workers.iter().filter(|w| w.enabled).collect::<Vec<_>>(),
            workload.total_work(),
        );

        let mut order: Vec<usize> = (0..shares.len()).collect();
        order.shuffle(rng);

        let total = workload.total_units;
        let last = order.len().saturating_sub(1);
        let mut cursor = 0u64;
        let mut allocations = Vec::with_capacity(order.len());
        for (position, &i) in order.iter().enumerate() {
            let (worker, units) = &shares[i];
            let start = cursor;
            let end = start + units;
            cursor = end;
            let render_start = if position == 0 {
                start
            } else {
                start.saturating_sub(self.overlap_margin)
            };
            let render_end = if position == last {
                end
            } else {
                (end + self.overlap_margin).min(total)
            };
            let predicted_finish = workers
                .iter()
                .find(|w| &w.id == worker)
                .map_or(0.0, |w| w.predicted_finish(*units, workload.unit_work));
            allocations.push(Allocation {
                worker: worker.clone(),
                range_start: start,
                range_end: end,
                units: *units,
                render_start,
                render_end,
                predicted_finish,
            });
        }

        let partition = Partition {
            allocations,
            total_units: total,
            target_time,
        };
        info!(
            workers = partition.allocations.len(),
            target_time = partition.target_time,
            makespan = partition.makespan(),
            "Partition computed"
        );
        Ok(partition)
    }
}

/// `T0 = (A + Σ setup/k) / Σ 1/k`
fn target_time(workers: &[&WorkerProfile], total_work: f64) -> f64 {
    let inv_sum: f64 = workers.iter().map(|w| 1.0 / w.k).sum();
    if inv_sum <= 0.0 || !inv_sum.is_finite() {
        return 0.0;
    }
    let setup_sum: f64 = workers.iter().map(|w| w.setup / w.k).sum();
    (total_work + setup_sum) / inv_sum
}

/// Fractional unit share for each worker in `members` over `units` units.
fn raw_shares(enabled: &[&WorkerProfile], members: &[usize], units: u64, unit_work: f64) -> Vec<f64> {
    let group: Vec<&WorkerProfile> = members.iter().map(|&i| enabled[i]).collect();
    let t0 = target_time(&group, units as f64 * unit_work);
    debug!(target_time = t0, "Closed-form finish time");
    group
        .iter()
        .map(|w| {
            let work = (t0 - w.setup) / w.k;
            if unit_work > 0.0 {
                work / unit_work
            } else {
                work
            }
        })
        .collect()
}

/// Move single units until `Σ units[members] == target`
///
/// Surplus is taken from the worker predicted to finish last (never below one
/// unit); deficit goes to the worker predicted to finish first.
fn rebalance(enabled: &[&WorkerProfile], members: &[usize], units: &mut [u64], target: u64, unit_work: f64) {
    let finish = |i: usize, u: u64| enabled[i].predicted_finish(u, unit_work);
    let mut sum: u64 = members.iter().map(|&i| units[i]).sum();
    let mut moves = 0usize;

    while sum > target {
        let Some(&i) = members
            .iter()
            .filter(|&&i| units[i] > 1)
            .max_by(|&&a, &&b| finish(a, units[a]).total_cmp(&finish(b, units[b])))
        else {
            break;
        };
        units[i] -= 1;
        sum -= 1;
        moves += 1;
    }
    while sum < target {
        let Some(&i) = members
            .iter()
            .min_by(|&&a, &&b| finish(a, units[a] + 1).total_cmp(&finish(b, units[b] + 1)))
        else {
            break;
        };
        units[i] += 1;
        sum += 1;
        moves += 1;
    }
    if moves > 0 {
        debug!(moves, "Rounding residual rebalanced");
    }
}
