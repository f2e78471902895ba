//! Instance metadata store.

mod sqlite;

pub use sqlite::SqliteStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::Result;
use crate::instance::{Instance, InstanceArgs, InstanceUpdate};

/// Persistence for instance and snapshot rows.
///
/// Each call is individually consistent; callers never rely on
/// multi-call transactions.
#[async_trait]
pub trait InstanceStore: Send + Sync {
    /// Insert a new row. A duplicate name in the project is `Conflict`.
    async fn create(&self, args: &InstanceArgs) -> Result<Instance>;

    /// Look up by name. Missing rows are `NotFound`.
    async fn get(&self, project: &str, name: &str) -> Result<Instance>;

    async fn get_id(&self, project: &str, name: &str) -> Result<Option<i64>>;

    /// All non-snapshot instances of a project.
    async fn list_regular(&self, project: &str) -> Result<Vec<Instance>>;

    /// Instances in any project whose "was running" flag is set.
    async fn list_power_on(&self) -> Result<Vec<Instance>>;

    /// Replace config, devices and profiles. A missing row is `NotFound`.
    async fn update(&self, id: i64, update: &InstanceUpdate) -> Result<()>;

    async fn set_power_state(&self, id: i64, running: bool) -> Result<()>;

    /// Clear the "was running" flag on every instance. Returns the row count.
    async fn clear_power_state(&self) -> Result<u64>;

    /// Snapshots of `parent`, matched on the `parent/` name prefix.
    async fn snapshots(&self, project: &str, parent: &str) -> Result<Vec<Instance>>;

    /// Returns whether a row was removed.
    async fn delete_by_id(&self, id: i64) -> Result<bool>;

    /// Rename an instance and all of its snapshot rows.
    async fn rename(&self, project: &str, old: &str, new: &str) -> Result<()>;

    async fn touch_last_used(&self, id: i64, at: DateTime<Utc>) -> Result<()>;
}
