//! Default on-disk locations.

use directories::ProjectDirs;
use std::path::PathBuf;

/// `$XDG_DATA_HOME/scenesync/perf` (platform equivalent elsewhere), or a
/// workspace-relative fallback when no home directory is known.
pub fn default_perf_store_path() -> PathBuf {
    ProjectDirs::from("", "", "scenesync")
        .map(|dirs| dirs.data_dir().join("perf"))
        .unwrap_or_else(|| PathBuf::from(".scenesync/perf"))
}
