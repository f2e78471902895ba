//! Instance records shared by the store, the supervisor and migration.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Separator between a parent instance name and a snapshot name.
pub const SNAPSHOT_DELIMITER: &str = "/";

/// Config key holding the host uid that container root maps to.
pub const IDMAP_UID_BASE: &str = "volatile.idmap.uid_base";
/// Config key holding the host gid that container root maps to.
pub const IDMAP_GID_BASE: &str = "volatile.idmap.gid_base";

/// Device name -> property map.
pub type Devices = BTreeMap<String, BTreeMap<String, String>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum InstanceType {
    #[default]
    Container,
    VirtualMachine,
}

impl InstanceType {
    pub fn as_i64(self) -> i64 {
        match self {
            InstanceType::Container => 0,
            InstanceType::VirtualMachine => 1,
        }
    }

    pub fn from_i64(v: i64) -> Self {
        match v {
            1 => InstanceType::VirtualMachine,
            _ => InstanceType::Container,
        }
    }
}

/// Everything needed to create an instance or snapshot row.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InstanceArgs {
    pub project: String,
    pub name: String,
    pub instance_type: InstanceType,
    pub architecture: i32,
    pub config: BTreeMap<String, String>,
    pub devices: Devices,
    /// Ordered, later profiles override earlier ones.
    pub profiles: Vec<String>,
    pub ephemeral: bool,
    pub stateful: bool,
    pub snapshot: bool,
    pub creation_date: Option<DateTime<Utc>>,
    pub last_used_date: Option<DateTime<Utc>>,
}

/// Replacement for the user-editable parts of an instance.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InstanceUpdate {
    pub config: BTreeMap<String, String>,
    pub devices: Devices,
    pub profiles: Vec<String>,
}

impl From<&Instance> for InstanceUpdate {
    fn from(inst: &Instance) -> Self {
        Self {
            config: inst.config.clone(),
            devices: inst.devices.clone(),
            profiles: inst.profiles.clone(),
        }
    }
}

/// A persisted instance or snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Instance {
    pub id: i64,
    pub project: String,
    pub name: String,
    pub instance_type: InstanceType,
    pub architecture: i32,
    pub config: BTreeMap<String, String>,
    pub devices: Devices,
    pub profiles: Vec<String>,
    pub ephemeral: bool,
    pub stateful: bool,
    pub snapshot: bool,
    /// "Was running" flag used by restart-all.
    pub power_state: bool,
    pub creation_date: Option<DateTime<Utc>>,
    pub last_used_date: Option<DateTime<Utc>>,
}

impl Instance {
    /// Host (uid, gid) that container root is mapped to.
    pub fn root_ids(&self) -> (u32, u32) {
        let base = |key: &str| {
            self.config
                .get(key)
                .and_then(|v| v.parse::<u32>().ok())
                .unwrap_or(0)
        };
        (base(IDMAP_UID_BASE), base(IDMAP_GID_BASE))
    }

    /// Parent name for a snapshot, the instance name otherwise.
    pub fn parent_name(&self) -> &str {
        split_snapshot_name(&self.name).0
    }
}

/// Join parent and snapshot names.
pub fn snapshot_name(parent: &str, snap: &str) -> String {
    format!("{parent}{SNAPSHOT_DELIMITER}{snap}")
}

/// Split `parent/snap` into its parts. A plain name yields `(name, None)`.
pub fn split_snapshot_name(name: &str) -> (&str, Option<&str>) {
    match name.split_once(SNAPSHOT_DELIMITER) {
        Some((parent, snap)) => (parent, Some(snap)),
        None => (name, None),
    }
}

pub fn validate_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(Error::InvalidArgument("instance name is empty".into()));
    }
    if name.contains(SNAPSHOT_DELIMITER) {
        return Err(Error::InvalidArgument(format!(
            "instance name {name:?} contains {SNAPSHOT_DELIMITER:?}"
        )));
    }
    check_chars(name)
}

pub fn validate_snapshot_name(snap: &str) -> Result<()> {
    if snap.is_empty() {
        return Err(Error::InvalidArgument("snapshot name is empty".into()));
    }
    if snap.contains(SNAPSHOT_DELIMITER) {
        return Err(Error::InvalidArgument(format!(
            "snapshot name {snap:?} contains {SNAPSHOT_DELIMITER:?}"
        )));
    }
    check_chars(snap)
}

fn check_chars(name: &str) -> Result<()> {
    // Names become path components.
    if name == "." || name == ".." {
        return Err(Error::InvalidArgument(format!("name {name:?} is reserved")));
    }
    if name.chars().any(|c| c.is_whitespace() || c.is_control()) {
        return Err(Error::InvalidArgument(format!(
            "name {name:?} contains whitespace or control characters"
        )));
    }
    Ok(())
}
