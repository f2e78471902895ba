//! Conversion between migration descriptors and instance records.
//!
//! Pure functions: no I/O, same input gives the same output.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};

use super::wire::{Config, Device, Snapshot};
use crate::error::{Error, Result};
use crate::instance::{
    Devices, Instance, InstanceArgs, InstanceType, snapshot_name, validate_snapshot_name,
};

/// Creation record for a transferred snapshot of `container_name`.
pub fn snapshot_to_instance_args(
    project: &str,
    container_name: &str,
    snap: &Snapshot,
) -> Result<InstanceArgs> {
    Ok(InstanceArgs {
        name: snapshot_name(container_name, &snap.name),
        snapshot: true,
        ..descriptor_to_args(project, snap)?
    })
}

/// Creation record for the transferred instance itself, under `name`.
pub fn instance_to_args(project: &str, name: &str, desc: &Snapshot) -> Result<InstanceArgs> {
    Ok(InstanceArgs {
        name: name.to_string(),
        snapshot: false,
        ..descriptor_to_args(project, desc)?
    })
}

fn descriptor_to_args(project: &str, desc: &Snapshot) -> Result<InstanceArgs> {
    let config: BTreeMap<String, String> = desc
        .local_config
        .iter()
        .map(|c| (c.key.clone(), c.value.clone()))
        .collect();

    let devices: Devices = desc
        .local_devices
        .iter()
        .map(|d| {
            let props = d
                .config
                .iter()
                .map(|c| (c.key.clone(), c.value.clone()))
                .collect();
            (d.name.clone(), props)
        })
        .collect();

    Ok(InstanceArgs {
        project: project.to_string(),
        name: desc.name.clone(),
        instance_type: InstanceType::Container,
        architecture: desc.architecture,
        config,
        devices,
        profiles: desc.profiles.clone(),
        ephemeral: desc.ephemeral,
        stateful: desc.stateful,
        snapshot: false,
        creation_date: epoch_to_date(desc.creation_date)?,
        last_used_date: epoch_to_date(desc.last_used_date)?,
    })
}

/// Descriptor for an instance or snapshot row. Snapshot rows are named by
/// their snapshot part only.
pub fn instance_to_descriptor(inst: &Instance) -> Snapshot {
    let name = match crate::instance::split_snapshot_name(&inst.name) {
        (_, Some(snap)) => snap.to_string(),
        (name, None) => name.to_string(),
    };

    Snapshot {
        name,
        local_config: inst
            .config
            .iter()
            .map(|(key, value)| Config {
                key: key.clone(),
                value: value.clone(),
            })
            .collect(),
        profiles: inst.profiles.clone(),
        ephemeral: inst.ephemeral,
        local_devices: inst
            .devices
            .iter()
            .map(|(name, props)| Device {
                name: name.clone(),
                config: props
                    .iter()
                    .map(|(key, value)| Config {
                        key: key.clone(),
                        value: value.clone(),
                    })
                    .collect(),
            })
            .collect(),
        architecture: inst.architecture,
        stateful: inst.stateful,
        creation_date: date_to_epoch(inst.creation_date),
        last_used_date: date_to_epoch(inst.last_used_date),
    }
}

/// Sort snapshots oldest first. Two snapshots with the same non-zero
/// creation date cannot be ordered and are rejected.
pub fn order_snapshots(mut snaps: Vec<Snapshot>) -> Result<Vec<Snapshot>> {
    snaps.sort_by_key(|s| s.creation_date);
    for pair in snaps.windows(2) {
        if pair[0].creation_date != 0 && pair[0].creation_date == pair[1].creation_date {
            return Err(Error::InvalidArgument(format!(
                "snapshots {:?} and {:?} share creation date {}",
                pair[0].name, pair[1].name, pair[0].creation_date
            )));
        }
    }
    Ok(snaps)
}

/// Check snapshot descriptors received from a peer: every name must be a
/// valid, unique snapshot name and the list must already be oldest first.
pub fn validate_snapshots(snaps: &[Snapshot]) -> Result<()> {
    let mut seen = BTreeSet::new();
    for snap in snaps {
        validate_snapshot_name(&snap.name)?;
        if !seen.insert(snap.name.as_str()) {
            return Err(Error::InvalidArgument(format!(
                "snapshot {:?} sent twice",
                snap.name
            )));
        }
    }
    for pair in snaps.windows(2) {
        let (a, b) = (pair[0].creation_date, pair[1].creation_date);
        if a > b || (a != 0 && a == b) {
            return Err(Error::InvalidArgument(format!(
                "snapshots {:?} and {:?} are not in creation order",
                pair[0].name, pair[1].name
            )));
        }
    }
    Ok(())
}

fn epoch_to_date(secs: i64) -> Result<Option<DateTime<Utc>>> {
    if secs == 0 {
        return Ok(None);
    }
    DateTime::from_timestamp(secs, 0)
        .map(Some)
        .ok_or_else(|| Error::InvalidArgument(format!("timestamp {secs} out of range")))
}

fn date_to_epoch(date: Option<DateTime<Utc>>) -> i64 {
    date.map(|d| d.timestamp()).unwrap_or(0)
}
