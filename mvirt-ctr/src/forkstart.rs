//! `forkstart`: start one container from a prepared runtime config in a
//! separate process, so the container does not inherit the daemon's state.

use std::path::{Path, PathBuf};

use tracing::{info, warn};

use crate::bundle;
use crate::error::{Error, Result};
use crate::runtime::{ContainerRuntime, OciRuntime};

/// Name the runtime config is kept under after a successful start.
pub const RUNTIME_CONFIG_NAME: &str = "runtime.json";

#[derive(Debug, Clone)]
pub struct ForkStart {
    pub name: String,
    pub runtime_path: PathBuf,
    /// Runtime state directory (`--root`).
    pub runtime_root: PathBuf,
    /// `config.json` inside the bundle directory.
    pub config_path: PathBuf,
    pub log_dir: PathBuf,
}

impl ForkStart {
    pub async fn run(&self) -> Result<()> {
        let runtime = OciRuntime::new(self.runtime_path.clone(), Some(self.runtime_root.clone()));
        self.run_with(&runtime).await
    }

    /// Validate the config, start the container and move the config into
    /// the log directory. The config is removed if anything fails.
    pub async fn run_with(&self, runtime: &dyn ContainerRuntime) -> Result<()> {
        let started = self.start(runtime).await;

        if let Err(e) = &started {
            warn!(instance = %self.name, error = %e, "forkstart failed");
            if let Err(err) = tokio::fs::remove_file(&self.config_path).await
                && err.kind() != std::io::ErrorKind::NotFound
            {
                warn!(path = %self.config_path.display(), error = %err, "Failed to remove runtime config");
            }
            return started;
        }

        let dst = self.saved_config();
        if let Some(parent) = dst.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        move_file(&self.config_path, &dst).await?;
        info!(instance = %self.name, config = %dst.display(), "Container started");
        Ok(())
    }

    /// Where the config ends up after a successful start.
    pub fn saved_config(&self) -> PathBuf {
        self.log_dir.join(&self.name).join(RUNTIME_CONFIG_NAME)
    }

    async fn start(&self, runtime: &dyn ContainerRuntime) -> Result<()> {
        bundle::validate_config(&self.config_path).await?;
        let bundle = self.config_path.parent().ok_or_else(|| {
            Error::InvalidArgument(format!(
                "{} has no parent directory",
                self.config_path.display()
            ))
        })?;
        runtime.start(&self.name, bundle).await
    }
}

/// Rename, falling back to copy and remove across filesystems.
async fn move_file(src: &Path, dst: &Path) -> Result<()> {
    match tokio::fs::rename(src, dst).await {
        Ok(()) => Ok(()),
        Err(e) if e.raw_os_error() == Some(libc::EXDEV) => {
            tokio::fs::copy(src, dst).await?;
            tokio::fs::remove_file(src).await?;
            Ok(())
        }
        Err(e) => Err(e.into()),
    }
}
