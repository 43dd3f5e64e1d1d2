//! Merge rules: defaults, override order, conflict handling.

use crate::config::paths::default_perf_store_path;
use config::Config;
use config::ConfigBuilder;
use config::ConfigError;

/// Create a Config builder with merge policy defaults applied.
pub fn builder_with_defaults() -> Result<ConfigBuilder<config::builder::DefaultState>, ConfigError>
{
    Config::builder()
        .set_default("sync.repair_retry_limit", 3)?
        .set_default("sync.diamond_policy", "count_once")?
        .set_default("sync.identity_separator", "/")?
        .set_default("lifecycle.heartbeat_timeout_ms", 5000)?
        .set_default("lifecycle.poll_interval_ms", 20)?
        .set_default("balance.overlap_margin", 2)?
        .set_default("balance.perf_window", 25)?
        .set_default(
            "storage.perf_store_path",
            default_perf_store_path().to_string_lossy().to_string(),
        )
}
