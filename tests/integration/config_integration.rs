//! Integration tests for layered configuration loading

use scenesync::cli::RunContext;
use scenesync::config::ConfigLoader;
use scenesync::tree::DiamondPolicy;
use std::fs;
use tempfile::TempDir;

use crate::integration::with_xdg_env;

fn write_global(temp: &TempDir, body: &str) {
    let dir = temp.path().join("scenesync");
    fs::create_dir_all(&dir).unwrap();
    fs::write(dir.join("config.toml"), body).unwrap();
}

#[test]
fn test_defaults_without_any_file() {
    let temp = TempDir::new().unwrap();
    with_xdg_env(&temp, || {
        let config = ConfigLoader::load(temp.path()).unwrap();
        assert_eq!(config.sync.repair_retry_limit, 3);
        assert_eq!(config.sync.diamond_policy, DiamondPolicy::CountOnce);
        assert_eq!(config.balance.overlap_margin, 2);
        assert_eq!(config.lifecycle.heartbeat_timeout_ms, 5000);
        assert!(config
            .storage
            .perf_store_path
            .starts_with(temp.path().join("data")));
    });
}

#[test]
fn test_layers_override_in_order() {
    let temp = TempDir::new().unwrap();
    with_xdg_env(&temp, || {
        write_global(
            &temp,
            "[balance]\noverlap_margin = 5\nperf_window = 7\n\n[sync]\ndiamond_policy = \"per_edge\"\n",
        );
        let ws = temp.path().join("ws");
        fs::create_dir_all(ws.join("config")).unwrap();
        fs::write(ws.join("config").join("config.toml"), "[balance]\noverlap_margin = 6\n").unwrap();
        fs::write(ws.join("config").join("staging.toml"), "[balance]\nengine = \"cycles\"\n").unwrap();

        let config = ConfigLoader::load(&ws).unwrap();
        assert_eq!(config.balance.overlap_margin, 6);
        assert_eq!(config.balance.perf_window, 7);
        assert_eq!(config.balance.engine, "default");
        assert_eq!(config.sync.diamond_policy, DiamondPolicy::PerEdge);

        std::env::set_var("SCENESYNC_ENV", "staging");
        std::env::set_var("SCENESYNC__BALANCE__OVERLAP_MARGIN", "9");
        let config = ConfigLoader::load(&ws).unwrap();
        assert_eq!(config.balance.engine, "cycles");
        assert_eq!(config.balance.overlap_margin, 9);
    });
}

#[test]
fn test_explicit_file_skips_workspace_layers() {
    let temp = TempDir::new().unwrap();
    with_xdg_env(&temp, || {
        let ws = temp.path().join("ws");
        fs::create_dir_all(ws.join("config")).unwrap();
        fs::write(ws.join("config").join("config.toml"), "[balance]\noverlap_margin = 6\n").unwrap();
        let explicit = temp.path().join("explicit.toml");
        fs::write(&explicit, "[sync]\nrepair_retry_limit = 8\n").unwrap();

        let config = ConfigLoader::load_from_file(&explicit).unwrap();
        assert_eq!(config.sync.repair_retry_limit, 8);
        assert_eq!(config.balance.overlap_margin, 2);

        assert!(ConfigLoader::load_from_file(&temp.path().join("missing.toml")).is_err());
    });
}

#[test]
fn test_run_context_rejects_invalid_config() {
    let temp = TempDir::new().unwrap();
    with_xdg_env(&temp, || {
        let ws = temp.path().join("ws");
        fs::create_dir_all(ws.join("config")).unwrap();
        fs::write(
            ws.join("config").join("config.toml"),
            "[lifecycle]\nheartbeat_interval_ms = 9000\nheartbeat_timeout_ms = 1000\nwatchdog_tick_ms = 100\n",
        )
        .unwrap();

        let err = match RunContext::new(ws, None) {
            Ok(_) => panic!("invalid lifecycle timings accepted"),
            Err(e) => e,
        };
        assert!(err.to_string().contains("heartbeat_interval_ms"));
    });
}

#[test]
fn test_global_config_path_follows_xdg() {
    let temp = TempDir::new().unwrap();
    with_xdg_env(&temp, || {
        assert_eq!(
            ConfigLoader::global_config_path(),
            Some(temp.path().join("scenesync").join("config.toml"))
        );
    });
}
