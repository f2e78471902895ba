//! Pre-dump convergence tracking for live migration.

use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy)]
pub struct PreDumpPolicy {
    pub max_rounds: u32,
    /// A round at or below this many bytes counts as converged.
    pub threshold: u64,
}

impl Default for PreDumpPolicy {
    fn default() -> Self {
        Self {
            max_rounds: 10,
            threshold: 1024 * 1024,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinalDump {
    /// Diff against the pre-dump of `parent_round`.
    Incremental { parent_round: u32 },
    Full,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PreDumpDecision {
    Continue,
    Final(FinalDump),
}

#[derive(Debug)]
pub struct PreDumpTracker {
    policy: PreDumpPolicy,
    rounds: u32,
    last_size: Option<u64>,
}

impl PreDumpTracker {
    pub fn new(policy: PreDumpPolicy) -> Self {
        Self {
            policy,
            rounds: 0,
            last_size: None,
        }
    }

    /// Decision before any round ran.
    pub fn initial(&self) -> PreDumpDecision {
        if self.policy.max_rounds == 0 {
            PreDumpDecision::Final(FinalDump::Full)
        } else {
            PreDumpDecision::Continue
        }
    }

    pub fn rounds(&self) -> u32 {
        self.rounds
    }

    /// Record the size of the round just dumped.
    pub fn record(&mut self, size: u64) -> PreDumpDecision {
        self.rounds += 1;
        let previous = self.last_size.replace(size);

        if size <= self.policy.threshold {
            return PreDumpDecision::Final(FinalDump::Incremental {
                parent_round: self.rounds,
            });
        }
        if previous.is_some_and(|prev| size >= prev) || self.rounds >= self.policy.max_rounds {
            return PreDumpDecision::Final(FinalDump::Full);
        }
        PreDumpDecision::Continue
    }
}

/// Directory holding the image of one round.
pub fn round_dir(base: &Path, round: u32) -> PathBuf {
    base.join(format!("round-{round}"))
}

/// Parent reference for an incremental dump, relative to its image dir.
pub fn parent_ref(round: u32) -> PathBuf {
    PathBuf::from("..").join(format!("round-{round}"))
}

/// Total size of regular files below `path`.
pub async fn dir_size(path: &Path) -> Result<u64> {
    let path = path.to_path_buf();
    tokio::task::spawn_blocking(move || {
        let mut total = 0u64;
        let mut stack = vec![path];
        while let Some(dir) = stack.pop() {
            for entry in std::fs::read_dir(&dir)? {
                let entry = entry?;
                let meta = entry.metadata()?;
                if meta.is_dir() {
                    stack.push(entry.path());
                } else if meta.is_file() {
                    total += meta.len();
                }
            }
        }
        Ok::<_, std::io::Error>(total)
    })
    .await
    .map_err(|e| Error::Io(std::io::Error::other(e)))?
    .map_err(Error::from)
}
