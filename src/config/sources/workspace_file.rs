//! Workspace layers: `config/config.toml`, then `config/{SCENESYNC_ENV}.toml`.

use config::builder::DefaultState;
use config::{ConfigBuilder, ConfigError, File, FileFormat};
use std::path::{Path, PathBuf};
use tracing::debug;

pub const ENV_VAR: &str = "SCENESYNC_ENV";
const DEFAULT_ENV: &str = "development";

/// Deployment name selecting the env-specific layer.
pub fn environment_name() -> String {
    std::env::var(ENV_VAR)
        .ok()
        .filter(|name| !name.trim().is_empty())
        .unwrap_or_else(|| DEFAULT_ENV.to_string())
}

/// Workspace layer files in precedence order, whether or not they exist.
pub fn layer_paths(workspace_root: &Path) -> [PathBuf; 2] {
    let dir = workspace_root.join("config");
    [dir.join("config.toml"), dir.join(format!("{}.toml", environment_name()))]
}

pub fn add_to_builder(
    mut builder: ConfigBuilder<DefaultState>,
    workspace_root: &Path,
) -> Result<ConfigBuilder<DefaultState>, ConfigError> {
    for path in layer_paths(workspace_root) {
        if !path.is_file() {
            continue;
        }
        debug!(config_path = %path.display(), "Adding workspace configuration layer");
        builder = builder.add_source(File::from(path).format(FileFormat::Toml).required(false));
    }
    Ok(builder)
}
