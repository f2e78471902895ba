//! Daemon configuration and on-disk layout.

use std::path::{Path, PathBuf};
use std::time::Duration;

/// Configuration for the container daemon.
#[derive(Debug, Clone)]
pub struct Config {
    /// Base directory for the database, container bundles and snapshots.
    pub data_dir: PathBuf,
    /// Path to the OCI runtime binary.
    pub runtime_path: PathBuf,
    /// Root directory for runtime container state (runtime default if unset).
    pub runtime_root: Option<PathBuf>,
    /// Listen address for session channels: `host:port` or `unix:/path`.
    pub listen: String,
    /// Project that daemon-level operations act on.
    pub project: String,
    pub connect_timeout: Duration,
    pub shutdown_timeout: Duration,
    /// Maximum instances shut down concurrently.
    pub shutdown_parallelism: usize,
    pub predump_max_rounds: u32,
    /// A pre-dump round at or below this many bytes counts as converged.
    pub predump_threshold: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("/var/lib/mvirt/ctr"),
            runtime_path: PathBuf::from("/usr/bin/youki"),
            runtime_root: None,
            listen: "[::1]:50060".to_string(),
            project: "default".to_string(),
            connect_timeout: Duration::from_secs(30),
            shutdown_timeout: Duration::from_secs(30),
            shutdown_parallelism: 16,
            predump_max_rounds: 10,
            predump_threshold: 1024 * 1024,
        }
    }
}

impl Config {
    pub fn paths(&self) -> Paths {
        Paths::new(&self.data_dir)
    }
}

/// Filesystem layout below the data directory.
#[derive(Debug, Clone)]
pub struct Paths {
    root: PathBuf,
}

impl Paths {
    pub fn new(root: &Path) -> Self {
        Self {
            root: root.to_path_buf(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn containers_dir(&self) -> PathBuf {
        self.root.join("containers")
    }

    /// Bundle directory: holds `config.json` and `rootfs/`.
    pub fn container(&self, name: &str) -> PathBuf {
        self.containers_dir().join(name)
    }

    pub fn rootfs(&self, name: &str) -> PathBuf {
        self.container(name).join("rootfs")
    }

    pub fn snapshots_dir(&self, parent: &str) -> PathBuf {
        self.root.join("snapshots").join(parent)
    }

    pub fn snapshot(&self, parent: &str, snap: &str) -> PathBuf {
        self.snapshots_dir(parent).join(snap)
    }

    /// Storage path for either a plain instance or a `parent/snap` name.
    pub fn storage(&self, name: &str) -> PathBuf {
        match crate::instance::split_snapshot_name(name) {
            (parent, Some(snap)) => self.snapshot(parent, snap),
            (parent, None) => self.container(parent),
        }
    }

    pub fn logs(&self, name: &str) -> PathBuf {
        self.root.join("logs").join(name)
    }

    /// Checkpoint written by a stateful snapshot.
    pub fn snapshot_state(&self, parent: &str, snap: &str) -> PathBuf {
        self.snapshot(parent, snap).join("state")
    }

    /// Staging area while an instance is restored from a snapshot.
    pub fn restore(&self, name: &str) -> PathBuf {
        self.root.join("restore").join(name)
    }

    /// Scratch space for an in-flight migration.
    pub fn migration(&self, name: &str) -> PathBuf {
        self.root.join("migration").join(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_storage_paths() {
        let paths = Paths::new(Path::new("/data"));
        assert_eq!(paths.storage("web"), PathBuf::from("/data/containers/web"));
        assert_eq!(
            paths.storage("web/snap0"),
            PathBuf::from("/data/snapshots/web/snap0")
        );
        assert_eq!(paths.rootfs("web"), PathBuf::from("/data/containers/web/rootfs"));
    }

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.connect_timeout, Duration::from_secs(30));
        assert_eq!(config.shutdown_parallelism, 16);
        assert_eq!(config.predump_max_rounds, 10);
    }
}
