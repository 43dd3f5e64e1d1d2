//! CLI route: single route table and run context. Dispatches to domain services and presentation.

use crate::balance::{LoadBalancer, PerformanceModel, WorkerProfile, Workload};
use crate::config::{ConfigLoader, SceneSyncConfig};
use crate::error::{ApiError, LifecycleError, StorageError};
use crate::progress::ProgressBus;
use crate::registry::WorkerState;
use crate::runtime::{ControllerCommand, LocalCluster, SimulatedRenderer, WorkerSetup};
use crate::scene::MemoryScene;
use crate::scheduler::JobSummary;
use crate::store::{PerfKey, PerfStore, SledPerfStore};
use crate::tree::{hasher, SceneHost};
use crate::types::{AttrValue, Hash, WorkerId};
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

use crate::cli::parse::{Commands, PerfCommands};
use crate::cli::presentation::{
    format_config, format_partition_json, format_partition_text, format_perf_json,
    format_perf_text, format_simulation_text,
};

const SIMULATION_SESSION: &str = "simulate";
const SIMULATION_TIMEOUT: Duration = Duration::from_secs(20);

/// Worker list accepted by `partition --workers`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorkersFile {
    #[serde(default)]
    pub workers: Vec<WorkerProfile>,
}

/// One stored history row for `perf show`.
#[derive(Debug, Clone, Serialize)]
pub struct PerfRow {
    pub worker: WorkerId,
    pub samples: usize,
    pub k_estimate: Option<f64>,
    pub setup_average: f64,
}

/// Outcome of `simulate`.
#[derive(Debug, Clone, Serialize)]
pub struct SimulationReport {
    pub top_hash: String,
    pub workers: Vec<(WorkerId, String)>,
    pub edits: usize,
    pub jobs: Vec<JobReport>,
    pub events: BTreeMap<String, usize>,
}

#[derive(Debug, Clone, Serialize)]
pub struct JobReport {
    pub job: u64,
    pub regions: usize,
    pub predicted_makespan: f64,
    pub actual_makespan_ms: u128,
}

impl From<&JobSummary> for JobReport {
    fn from(summary: &JobSummary) -> Self {
        Self {
            job: summary.job,
            regions: summary.regions,
            predicted_makespan: summary.predicted_makespan,
            actual_makespan_ms: summary.actual_makespan.as_millis(),
        }
    }
}

/// Runtime context for CLI execution: workspace and the effective configuration.
pub struct RunContext {
    workspace_root: PathBuf,
    config: SceneSyncConfig,
}

impl RunContext {
    /// Create run context from workspace root and optional config path. Uses ConfigLoader only.
    pub fn new(workspace_root: PathBuf, config_path: Option<PathBuf>) -> Result<Self, ApiError> {
        let config = if let Some(ref cfg_path) = config_path {
            ConfigLoader::load_from_file(cfg_path)?
        } else {
            ConfigLoader::load(&workspace_root)?
        };
        config.ensure_valid()?;
        Ok(Self {
            workspace_root,
            config,
        })
    }

    pub fn config(&self) -> &SceneSyncConfig {
        &self.config
    }

    pub fn execute(&self, command: &Commands) -> Result<String, ApiError> {
        debug!(workspace = %self.workspace_root.display(), "Executing command");
        match command {
            Commands::Partition {
                workers,
                width,
                height,
                samples,
                seed,
                session,
                format,
            } => self.handle_partition(workers, *width, *height, *samples, *seed, session.as_deref(), format),
            Commands::Config { format } => format_config(&self.config, format),
            Commands::Perf {
                command: PerfCommands::Show {
                    session,
                    engine,
                    format,
                },
            } => self.handle_perf_show(session, engine.as_deref(), format),
            Commands::Simulate {
                workers,
                objects,
                edits,
                width,
                height,
                jobs,
                seed,
            } => {
                let report = self.handle_simulate(*workers, *objects, *edits, *width, *height, *jobs, *seed)?;
                Ok(format_simulation_text(&report))
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn handle_partition(
        &self,
        workers_path: &Path,
        width: u32,
        height: u32,
        samples: u32,
        seed: Option<u64>,
        session: Option<&str>,
        format: &str,
    ) -> Result<String, ApiError> {
        let text = std::fs::read_to_string(workers_path).map_err(StorageError::IoError)?;
        let file: WorkersFile = toml::from_str(&text).map_err(|e| {
            ApiError::ConfigError(format!("Invalid workers file {}: {}", workers_path.display(), e))
        })?;
        let mut profiles = file.workers;

        if let Some(session) = session {
            let store = self.open_perf_store()?;
            let mut model = PerformanceModel::new(session, &self.config.balance.engine, self.config.balance.perf_window);
            let ids: Vec<WorkerId> = profiles.iter().map(|p| p.id.clone()).collect();
            let loaded = model.load(&store, &ids)?;
            for profile in profiles.iter_mut() {
                if model.get(&profile.id).is_some() {
                    let learned = model.profile(&profile.id);
                    profile.k = learned.k;
                    profile.setup = learned.setup;
                }
            }
            info!(session, loaded, "Applied stored performance history");
        }

        let mut rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        let workload = Workload::screen(width, height, samples);
        let partition = LoadBalancer::new(self.config.balance.overlap_margin).partition(&profiles, &workload, &mut rng)?;
        match format {
            "json" => format_partition_json(&partition),
            _ => Ok(format_partition_text(&partition, &workload)),
        }
    }

    fn handle_perf_show(&self, session: &str, engine: Option<&str>, format: &str) -> Result<String, ApiError> {
        let engine = engine.unwrap_or(&self.config.balance.engine);
        let store = self.open_perf_store()?;
        let mut rows = Vec::new();
        for worker in store.workers(session, engine)? {
            if let Some(perf) = store.get(&PerfKey::new(session, engine, &worker))? {
                rows.push(PerfRow {
                    worker,
                    samples: perf.samples.len(),
                    k_estimate: perf.k_estimate(),
                    setup_average: perf.setup_average,
                });
            }
        }
        match format {
            "json" => format_perf_json(&rows),
            _ => Ok(format_perf_text(session, engine, &rows)),
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn handle_simulate(
        &self,
        worker_count: usize,
        objects: usize,
        edits: usize,
        width: u32,
        height: u32,
        jobs: usize,
        seed: Option<u64>,
    ) -> Result<SimulationReport, ApiError> {
        let scene = MemoryScene::sample(objects.max(1));
        let rigs = scene.objects_of_type("object");

        let mut setups = Vec::with_capacity(worker_count);
        for i in 0..worker_count {
            let mut host = scene.clone();
            if i == 0 {
                // One replica starts stale so it has to be resynced at connect.
                let root = host.root();
                host.set(root, "frame", AttrValue::Int(0));
            }
            setups.push(WorkerSetup {
                id: format!("worker-{}", i + 1),
                host,
                renderer: Box::new(SimulatedRenderer::new(1e-5 * (1.0 + i as f64 * 0.75), 0.02 * i as f64)),
            });
        }

        let (progress, events) = ProgressBus::new_pair(SIMULATION_SESSION);
        let mut cluster = LocalCluster::start(scene, setups, &self.config, progress)?;
        if let Some(seed) = seed {
            cluster = cluster.with_seed(seed);
        }
        if let Ok(store) = self.open_perf_store() {
            cluster = cluster.with_perf_store(Arc::new(store));
        }

        if !cluster.wait_for_all(WorkerState::Synced, SIMULATION_TIMEOUT) {
            cluster.shutdown();
            return Err(LifecycleError::Timeout {
                worker: "*".to_string(),
                operation: "initial sync".to_string(),
            }
            .into());
        }

        for i in 0..edits {
            let rig = rigs[i % rigs.len()];
            cluster.submit(ControllerCommand::Edit(Box::new(move |scene: &mut MemoryScene| {
                scene.set(rig, "location", AttrValue::Vector(vec![i as f64, 1.0, 0.0]));
                vec![rig]
            })))?;
            let before = cluster.controller().authority().top_hash();
            cluster.drive_until(SIMULATION_TIMEOUT, |c| c.authority().top_hash() != before);
            cluster.wait_for_all(WorkerState::Synced, SIMULATION_TIMEOUT);
        }

        for j in 0..jobs {
            cluster.submit(ControllerCommand::Render(Workload::screen(width, height, 1)))?;
            if !cluster.drive_until(SIMULATION_TIMEOUT, |c| c.summaries().len() > j) {
                break;
            }
        }

        let top_hash: Hash = cluster.controller().authority().top_hash();
        let workers = cluster
            .controller()
            .registry()
            .snapshot()
            .into_iter()
            .map(|(id, state)| (id, state.to_string()))
            .collect();
        let job_reports = cluster.controller().summaries().iter().map(JobReport::from).collect();
        for (id, result) in cluster.shutdown() {
            if let Err(err) = result {
                debug!(worker = %id, error = %err, "Worker exited with error");
            }
        }

        let mut counts = BTreeMap::new();
        for event in events.try_iter() {
            *counts.entry(event.event_type).or_insert(0) += 1;
        }
        Ok(SimulationReport {
            top_hash: hasher::display(top_hash),
            workers,
            edits,
            jobs: job_reports,
            events: counts,
        })
    }

    fn open_perf_store(&self) -> Result<SledPerfStore, ApiError> {
        let path = &self.config.storage.perf_store_path;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(StorageError::IoError)?;
        }
        Ok(SledPerfStore::new(path)?)
    }
}
