//! Configuration loading entry point.

use super::{merge, sources, SceneSyncConfig};
use config::{ConfigError, File};
use std::path::{Path, PathBuf};
use tracing::debug;

/// Loads [`SceneSyncConfig`] from its layered sources.
pub struct ConfigLoader;

impl ConfigLoader {
    /// Load configuration for `workspace_root`.
    ///
    /// Precedence, lowest first: defaults, global file, `config/config.toml`,
    /// `config/{SCENESYNC_ENV}.toml`, `SCENESYNC__*` environment variables.
    pub fn load(workspace_root: &Path) -> Result<SceneSyncConfig, ConfigError> {
        let builder = merge::merge_policy::builder_with_defaults()?;
        let builder = sources::global_file::add_to_builder(builder)?;
        let builder = sources::workspace_file::add_to_builder(builder, workspace_root)?;
        let builder = sources::environment::add_to_builder(builder);
        let config: SceneSyncConfig = builder.build()?.try_deserialize()?;
        debug!(workspace = %workspace_root.display(), "Configuration loaded");
        Ok(config)
    }

    /// Load one explicit file over the defaults. Environment variables still apply.
    pub fn load_from_file(path: &Path) -> Result<SceneSyncConfig, ConfigError> {
        let builder = merge::merge_policy::builder_with_defaults()?
            .add_source(File::from(path.to_path_buf()).required(true));
        let builder = sources::environment::add_to_builder(builder);
        builder.build()?.try_deserialize()
    }

    pub fn global_config_path() -> Option<PathBuf> {
        sources::global_file::global_config_path()
    }
}
