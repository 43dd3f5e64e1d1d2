//! Shared test utilities for integration tests
//!
//! Environment isolation for config loading, plus controller/replica fixtures
//! over the in-memory scene.

use scenesync::scene::{MemoryScene, ObjectId};
use scenesync::sync::{ReplicaSync, SyncAuthority, SyncMessage};
use scenesync::tree::{SceneHost, TreeOptions};
use std::sync::Mutex;
use tempfile::TempDir;

/// Serializes every test that touches process environment variables.
static ENV_MUTEX: Mutex<()> = Mutex::new(());

const ENV_KEYS: [&str; 5] = [
    "HOME",
    "XDG_CONFIG_HOME",
    "XDG_DATA_HOME",
    "SCENESYNC_ENV",
    "SCENESYNC__BALANCE__OVERLAP_MARGIN",
];

/// Environment variable state to restore after test
struct EnvState(Vec<(&'static str, Option<String>)>);

impl EnvState {
    fn capture() -> Self {
        Self(ENV_KEYS.iter().map(|k| (*k, std::env::var(k).ok())).collect())
    }

    fn restore(self) {
        for (key, value) in self.0 {
            match value {
                Some(v) => std::env::set_var(key, v),
                None => std::env::remove_var(key),
            }
        }
    }
}

/// Run `f` with HOME, XDG_CONFIG_HOME and XDG_DATA_HOME pointed into `test_dir`.
///
/// `XDG_CONFIG_HOME` is the temp dir itself, so the global file lives at
/// `test_dir/scenesync/config.toml`.
pub fn with_xdg_env<F, R>(test_dir: &TempDir, f: F) -> R
where
    F: FnOnce() -> R,
{
    let _guard = ENV_MUTEX.lock().unwrap_or_else(|e| e.into_inner());
    let env_state = EnvState::capture();

    let test_data_home = test_dir.path().join("data");
    let test_home = test_dir.path().join("home");
    std::fs::create_dir_all(&test_data_home).unwrap();
    std::fs::create_dir_all(&test_home).unwrap();

    std::env::set_var("HOME", test_home.to_str().unwrap());
    std::env::set_var("XDG_CONFIG_HOME", test_dir.path().to_str().unwrap());
    std::env::set_var("XDG_DATA_HOME", test_data_home.to_str().unwrap());
    std::env::remove_var("SCENESYNC_ENV");
    std::env::remove_var("SCENESYNC__BALANCE__OVERLAP_MARGIN");

    let result = f();

    env_state.restore();

    result
}

/// Controller scene, authority, replica scene and replica over the same sample scene.
pub struct SyncPair {
    pub controller_scene: MemoryScene,
    pub authority: SyncAuthority<ObjectId>,
    pub replica_scene: MemoryScene,
    pub replica: ReplicaSync<ObjectId>,
}

impl SyncPair {
    pub fn new(rigs: usize) -> Self {
        Self::from_scenes(MemoryScene::sample(rigs), MemoryScene::sample(rigs), 3)
    }

    pub fn from_scenes(controller_scene: MemoryScene, replica_scene: MemoryScene, retry_limit: u32) -> Self {
        let authority =
            SyncAuthority::build(&controller_scene, controller_scene.root(), TreeOptions::default()).unwrap();
        let replica = ReplicaSync::build(&replica_scene, TreeOptions::default(), retry_limit).unwrap();
        Self {
            controller_scene,
            authority,
            replica_scene,
            replica,
        }
    }

    /// Announce pending controller changes and run the exchange to completion.
    pub fn propagate(&mut self) {
        if let Some(announcement) = self.authority.announce() {
            let reply = self
                .replica
                .handle(&mut self.replica_scene, SyncMessage::Announce(announcement));
            self.pump(reply.unwrap());
        }
    }

    /// Answer replica requests until it stops asking.
    pub fn pump(&mut self, mut reply: Option<SyncMessage>) {
        while let Some(request) = reply {
            let answer = self.authority.respond(&self.controller_scene, &request).unwrap();
            reply = self.replica.handle(&mut self.replica_scene, answer).unwrap();
        }
    }
}

/// First rig object of a sample scene.
pub fn first_rig(scene: &MemoryScene) -> ObjectId {
    scene.objects_of_type("object")[0]
}
