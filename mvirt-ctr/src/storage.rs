//! Storage backend operations on instance and snapshot directories.

use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, info};

use crate::error::{Error, Result};

const BTRFS_SUPER_MAGIC: i64 = 0x9123_683E;
const ZFS_SUPER_MAGIC: i64 = 0x2FC1_2FC2;

/// Inode number of every btrfs subvolume root.
const BTRFS_SUBVOLUME_INO: u64 = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    Btrfs,
    Zfs,
    /// Plain directories on any other filesystem.
    Dir,
}

#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// Backend holding `path`. Missing paths are `NotFound`.
    async fn detect(&self, path: &Path) -> Result<BackendKind>;

    /// Create an empty volume at `path`.
    async fn create(&self, path: &Path) -> Result<()>;

    /// Delete a btrfs subvolume.
    async fn delete_subvolume(&self, path: &Path) -> Result<()>;

    /// Recursive delete. An absent path is not an error.
    async fn remove_all(&self, path: &Path) -> Result<()>;

    /// Copy `src` to a new `dst`, using a cheap snapshot when possible.
    async fn snapshot(&self, src: &Path, dst: &Path) -> Result<()>;

    async fn rename(&self, src: &Path, dst: &Path) -> Result<()>;
}

/// Storage on the host filesystem, driven through `statfs` and the
/// `btrfs` command-line tool.
#[derive(Debug, Default, Clone)]
pub struct HostStorage;

impl HostStorage {
    pub fn new() -> Self {
        Self
    }

    async fn is_subvolume(&self, path: &Path) -> Result<bool> {
        if self.detect(path).await? != BackendKind::Btrfs {
            return Ok(false);
        }
        let meta = tokio::fs::symlink_metadata(path).await?;
        Ok(meta.is_dir() && meta.ino() == BTRFS_SUBVOLUME_INO)
    }
}

#[async_trait]
impl StorageBackend for HostStorage {
    async fn detect(&self, path: &Path) -> Result<BackendKind> {
        let path = path.to_path_buf();
        let stat = tokio::task::spawn_blocking(move || nix::sys::statfs::statfs(&path))
            .await
            .map_err(|e| Error::Io(std::io::Error::other(e)))?
            .map_err(|e| match e {
                nix::errno::Errno::ENOENT => Error::NotFound("storage path".into()),
                e => Error::from(e),
            })?;

        Ok(match stat.filesystem_type().0 as i64 {
            BTRFS_SUPER_MAGIC => BackendKind::Btrfs,
            ZFS_SUPER_MAGIC => BackendKind::Zfs,
            _ => BackendKind::Dir,
        })
    }

    async fn create(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
            if self.detect(parent).await? == BackendKind::Btrfs {
                return btrfs(&["subvolume", "create", &path.to_string_lossy()]).await;
            }
        }
        tokio::fs::create_dir(path).await?;
        Ok(())
    }

    async fn delete_subvolume(&self, path: &Path) -> Result<()> {
        btrfs(&["subvolume", "delete", &path.to_string_lossy()]).await
    }

    async fn remove_all(&self, path: &Path) -> Result<()> {
        match tokio::fs::remove_dir_all(path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn snapshot(&self, src: &Path, dst: &Path) -> Result<()> {
        if let Some(parent) = dst.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        if self.is_subvolume(src).await? {
            info!(src = %src.display(), dst = %dst.display(), "Creating btrfs snapshot");
            return btrfs(&[
                "subvolume",
                "snapshot",
                &src.to_string_lossy(),
                &dst.to_string_lossy(),
            ])
            .await;
        }

        debug!(src = %src.display(), dst = %dst.display(), "Copying directory tree");
        let (src, dst) = (src.to_path_buf(), dst.to_path_buf());
        tokio::task::spawn_blocking(move || copy_tree(&src, &dst))
            .await
            .map_err(|e| Error::Io(std::io::Error::other(e)))??;
        Ok(())
    }

    async fn rename(&self, src: &Path, dst: &Path) -> Result<()> {
        if let Some(parent) = dst.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::rename(src, dst).await?;
        Ok(())
    }
}

/// Remove an instance or snapshot volume: subvolume delete on btrfs,
/// recursive removal otherwise. A missing path counts as removed.
pub async fn remove_volume(backend: &dyn StorageBackend, path: &Path) -> Result<()> {
    match backend.detect(path).await {
        Ok(BackendKind::Btrfs) => match backend.delete_subvolume(path).await {
            Ok(()) => Ok(()),
            Err(e) => {
                debug!(path = %path.display(), error = %e, "Not a subvolume, removing recursively");
                backend.remove_all(path).await
            }
        },
        Ok(_) => backend.remove_all(path).await,
        Err(e) if e.is_not_found() => backend.remove_all(path).await,
        Err(e) => Err(e),
    }
}

/// Run a `btrfs` subcommand.
pub(crate) async fn btrfs(args: &[&str]) -> Result<()> {
    let output = Command::new("btrfs").args(args).output().await?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(Error::Runtime(format!(
            "btrfs {} failed: {}",
            args.join(" "),
            stderr.trim()
        )));
    }
    Ok(())
}

/// Recursive copy keeping symlinks, permissions and (as root) ownership.
pub fn copy_tree(src: &Path, dst: &Path) -> std::io::Result<()> {
    let is_root = nix::unistd::geteuid().is_root();
    let mut stack: Vec<(PathBuf, PathBuf)> = vec![(src.to_path_buf(), dst.to_path_buf())];

    while let Some((from, to)) = stack.pop() {
        let meta = std::fs::symlink_metadata(&from)?;
        let file_type = meta.file_type();

        if file_type.is_symlink() {
            let target = std::fs::read_link(&from)?;
            std::os::unix::fs::symlink(target, &to)?;
        } else if file_type.is_dir() {
            std::fs::create_dir(&to)?;
            for entry in std::fs::read_dir(&from)? {
                let entry = entry?;
                stack.push((entry.path(), to.join(entry.file_name())));
            }
            std::fs::set_permissions(&to, meta.permissions())?;
        } else if file_type.is_file() {
            std::fs::copy(&from, &to)?;
        } else {
            // Device nodes and fifos are recreated by the container runtime.
            continue;
        }

        if is_root {
            std::os::unix::fs::lchown(&to, Some(meta.uid()), Some(meta.gid()))?;
        }
    }

    Ok(())
}
