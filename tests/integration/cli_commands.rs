//! Integration tests for CLI command routing

use scenesync::balance::PerformanceModel;
use scenesync::cli::{Commands, PerfCommands, RunContext};
use scenesync::store::SledPerfStore;
use std::fs;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

use crate::integration::with_xdg_env;

/// Workspace whose config points the performance store inside the temp dir.
fn workspace(temp: &TempDir) -> (PathBuf, PathBuf) {
    let root = temp.path().join("ws");
    let store = temp.path().join("perf");
    fs::create_dir_all(root.join("config")).unwrap();
    fs::write(
        root.join("config").join("config.toml"),
        format!(
            "[storage]\nperf_store_path = \"{}\"\n\n[lifecycle]\npoll_interval_ms = 5\n",
            store.display()
        ),
    )
    .unwrap();
    (root, store)
}

fn write_workers(dir: &Path) -> PathBuf {
    let path = dir.join("workers.toml");
    fs::write(
        &path,
        r#"
[[workers]]
id = "alpha"
k = 0.001

[[workers]]
id = "beta"
k = 0.002
setup = 0.5

[[workers]]
id = "spare"
k = 0.001
enabled = false
"#,
    )
    .unwrap();
    path
}

fn partition(workers: PathBuf, session: Option<&str>, format: &str) -> Commands {
    Commands::Partition {
        workers,
        width: 300,
        height: 100,
        samples: 1,
        seed: Some(11),
        session: session.map(str::to_string),
        format: format.to_string(),
    }
}

#[test]
fn test_partition_json_covers_the_frame() {
    let temp = TempDir::new().unwrap();
    with_xdg_env(&temp, || {
        let (root, _) = workspace(&temp);
        let ctx = RunContext::new(root.clone(), None).unwrap();
        let out = ctx.execute(&partition(write_workers(&root), None, "json")).unwrap();

        let value: serde_json::Value = serde_json::from_str(&out).unwrap();
        let allocations = value["allocations"].as_array().unwrap();
        assert_eq!(allocations.len(), 2);
        let units: u64 = allocations.iter().map(|a| a["units"].as_u64().unwrap()).sum();
        assert_eq!(units, 300);
        assert!(allocations.iter().all(|a| a["worker"] != "spare"));
    });
}

#[test]
fn test_partition_text_lists_workers() {
    let temp = TempDir::new().unwrap();
    with_xdg_env(&temp, || {
        let (root, _) = workspace(&temp);
        let ctx = RunContext::new(root.clone(), None).unwrap();
        let out = ctx.execute(&partition(write_workers(&root), None, "text")).unwrap();
        assert!(out.contains("alpha"));
        assert!(out.contains("beta"));
        assert!(out.contains("Predicted makespan"));
    });
}

#[test]
fn test_partition_uses_stored_history() {
    let temp = TempDir::new().unwrap();
    with_xdg_env(&temp, || {
        let (root, store_path) = workspace(&temp);
        {
            let store = SledPerfStore::new(&store_path).unwrap();
            let mut model = PerformanceModel::new("night", "default", 25);
            // beta turns out to be as fast as alpha with no setup.
            model.record_completion("beta", 100, 100.0, 10.0, 0.0);
            model.record_completion("alpha", 100, 100.0, 10.0, 0.0);
            model.save(&store);
            store.flush().unwrap();
        }

        let ctx = RunContext::new(root.clone(), None).unwrap();
        let out = ctx
            .execute(&partition(write_workers(&root), Some("night"), "json"))
            .unwrap();
        let value: serde_json::Value = serde_json::from_str(&out).unwrap();
        for allocation in value["allocations"].as_array().unwrap() {
            assert_eq!(allocation["units"].as_u64(), Some(150));
        }
    });
}

#[test]
fn test_perf_show_reports_rows() {
    let temp = TempDir::new().unwrap();
    with_xdg_env(&temp, || {
        let (root, store_path) = workspace(&temp);
        {
            let store = SledPerfStore::new(&store_path).unwrap();
            let mut model = PerformanceModel::new("night", "default", 25);
            model.record_completion("alpha", 10, 1.0, 1.0, 0.0);
            model.save(&store);
            store.flush().unwrap();
        }
        let ctx = RunContext::new(root, None).unwrap();

        let json = ctx
            .execute(&Commands::Perf {
                command: PerfCommands::Show {
                    session: "night".to_string(),
                    engine: None,
                    format: "json".to_string(),
                },
            })
            .unwrap();
        let rows: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(rows[0]["worker"], "alpha");
        assert_eq!(rows[0]["samples"], 1);

        let empty = ctx
            .execute(&Commands::Perf {
                command: PerfCommands::Show {
                    session: "morning".to_string(),
                    engine: None,
                    format: "text".to_string(),
                },
            })
            .unwrap();
        assert!(empty.contains("No performance history"));
    });
}

#[test]
fn test_config_command_prints_effective_values() {
    let temp = TempDir::new().unwrap();
    with_xdg_env(&temp, || {
        let (root, store_path) = workspace(&temp);
        let ctx = RunContext::new(root, None).unwrap();
        let out = ctx
            .execute(&Commands::Config {
                format: "json".to_string(),
            })
            .unwrap();
        let value: serde_json::Value = serde_json::from_str(&out).unwrap();
        assert_eq!(value["lifecycle"]["poll_interval_ms"], 5);
        assert_eq!(value["storage"]["perf_store_path"], store_path.display().to_string());

        let toml_out = ctx
            .execute(&Commands::Config {
                format: "toml".to_string(),
            })
            .unwrap();
        assert!(toml_out.contains("[balance]"));
    });
}

#[test]
fn test_simulate_reports_workers_and_jobs() {
    let temp = TempDir::new().unwrap();
    with_xdg_env(&temp, || {
        let (root, _) = workspace(&temp);
        let ctx = RunContext::new(root, None).unwrap();
        let out = ctx
            .execute(&Commands::Simulate {
                workers: 2,
                objects: 3,
                edits: 1,
                width: 32,
                height: 4,
                jobs: 1,
                seed: Some(5),
            })
            .unwrap();
        assert!(out.contains("Top hash"));
        assert!(out.contains("worker-1"));
        assert!(out.contains("worker-2"));
        assert!(!out.contains("No render job finished"));
    });
}

#[test]
fn test_missing_workers_file_is_an_error() {
    let temp = TempDir::new().unwrap();
    with_xdg_env(&temp, || {
        let (root, _) = workspace(&temp);
        let ctx = RunContext::new(root.clone(), None).unwrap();
        let err = ctx
            .execute(&partition(root.join("absent.toml"), None, "text"))
            .unwrap_err();
        assert!(scenesync::cli::map_error(&err).starts_with("error["));
    });
}
