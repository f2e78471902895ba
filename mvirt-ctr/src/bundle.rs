//! OCI runtime bundle (config.json) generation for instances.

use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{Error, Result};
use crate::instance::Instance;

/// Config key overriding the container's init command line.
pub const INIT_KEY: &str = "raw.init";
/// Config key prefix for environment variables of the init process.
pub const ENV_PREFIX: &str = "environment.";

/// Size of the id range mapped into user-namespaced containers.
const IDMAP_RANGE: u32 = 65536;

/// Write `bundle/config.json` for `instance`, rooted at `bundle/rootfs`.
pub async fn write_bundle(instance: &Instance, bundle: &Path) -> Result<()> {
    let spec = OciSpec::for_instance(instance);
    let spec_json = serde_json::to_string_pretty(&spec)?;

    tokio::fs::create_dir_all(bundle.join("rootfs")).await?;
    tokio::fs::write(bundle.join("config.json"), &spec_json).await?;

    info!(
        instance = %instance.name,
        bundle = %bundle.display(),
        args = ?spec.process.args,
        "Generated OCI runtime config"
    );
    Ok(())
}

/// Check that `path` holds a parsable OCI runtime config.
pub async fn validate_config(path: &Path) -> Result<()> {
    let data = tokio::fs::read(path).await?;
    let spec: OciSpec = serde_json::from_slice(&data)?;
    if spec.process.args.is_empty() {
        return Err(Error::InvalidArgument(format!(
            "{} has no process args",
            path.display()
        )));
    }
    Ok(())
}

/// Minimal OCI Runtime Spec.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct OciSpec {
    oci_version: String,
    root: Root,
    process: Process,
    #[serde(default)]
    hostname: String,
    #[serde(default)]
    mounts: Vec<Mount>,
    #[serde(default)]
    linux: Linux,
}

#[derive(Debug, Serialize, Deserialize)]
struct Root {
    path: String,
    #[serde(default)]
    readonly: bool,
}

#[derive(Debug, Serialize, Deserialize)]
struct Process {
    #[serde(default)]
    terminal: bool,
    user: User,
    args: Vec<String>,
    #[serde(default)]
    env: Vec<String>,
    cwd: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct User {
    uid: u32,
    gid: u32,
}

#[derive(Debug, Serialize, Deserialize)]
struct Mount {
    destination: String,
    #[serde(rename = "type")]
    mount_type: String,
    source: String,
    #[serde(default)]
    options: Vec<String>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Linux {
    #[serde(default)]
    namespaces: Vec<Namespace>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    uid_mappings: Vec<IdMapping>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    gid_mappings: Vec<IdMapping>,
}

#[derive(Debug, Serialize, Deserialize)]
struct Namespace {
    #[serde(rename = "type")]
    ns_type: String,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct IdMapping {
    container_id: u32,
    host_id: u32,
    size: u32,
}

impl OciSpec {
    fn for_instance(instance: &Instance) -> Self {
        let args = instance
            .config
            .get(INIT_KEY)
            .map(|init| init.split_whitespace().map(String::from).collect::<Vec<_>>())
            .filter(|args| !args.is_empty())
            .unwrap_or_else(|| vec!["/sbin/init".to_string()]);

        let mut env = vec![
            "PATH=/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin".to_string(),
            "container=mvirt".to_string(),
        ];
        env.extend(instance.config.iter().filter_map(|(key, value)| {
            key.strip_prefix(ENV_PREFIX)
                .map(|name| format!("{name}={value}"))
        }));

        let mut namespaces: Vec<Namespace> = ["pid", "ipc", "uts", "mount", "network", "cgroup"]
            .into_iter()
            .map(|ns| Namespace {
                ns_type: ns.to_string(),
            })
            .collect();

        let (uid_base, gid_base) = instance.root_ids();
        let (uid_mappings, gid_mappings) = if uid_base != 0 || gid_base != 0 {
            namespaces.push(Namespace {
                ns_type: "user".to_string(),
            });
            (
                vec![IdMapping {
                    container_id: 0,
                    host_id: uid_base,
                    size: IDMAP_RANGE,
                }],
                vec![IdMapping {
                    container_id: 0,
                    host_id: gid_base,
                    size: IDMAP_RANGE,
                }],
            )
        } else {
            (vec![], vec![])
        };

        OciSpec {
            oci_version: "1.0.2".to_string(),
            root: Root {
                path: "rootfs".to_string(),
                readonly: false,
            },
            process: Process {
                terminal: false,
                user: User { uid: 0, gid: 0 },
                args,
                env,
                cwd: "/".to_string(),
            },
            hostname: instance.name.clone(),
            mounts: vec![
                Mount {
                    destination: "/proc".to_string(),
                    mount_type: "proc".to_string(),
                    source: "proc".to_string(),
                    options: vec![],
                },
                Mount {
                    destination: "/dev".to_string(),
                    mount_type: "tmpfs".to_string(),
                    source: "tmpfs".to_string(),
                    options: vec![
                        "nosuid".to_string(),
                        "strictatime".to_string(),
                        "mode=755".to_string(),
                        "size=65536k".to_string(),
                    ],
                },
                Mount {
                    destination: "/dev/pts".to_string(),
                    mount_type: "devpts".to_string(),
                    source: "devpts".to_string(),
                    options: vec![
                        "nosuid".to_string(),
                        "noexec".to_string(),
                        "newinstance".to_string(),
                        "ptmxmode=0666".to_string(),
                        "mode=0620".to_string(),
                    ],
                },
                Mount {
                    destination: "/sys".to_string(),
                    mount_type: "sysfs".to_string(),
                    source: "sysfs".to_string(),
                    options: vec![
                        "nosuid".to_string(),
                        "noexec".to_string(),
                        "nodev".to_string(),
                        "ro".to_string(),
                    ],
                },
            ],
            linux: Linux {
                namespaces,
                uid_mappings,
                gid_mappings,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instance::{IDMAP_GID_BASE, IDMAP_UID_BASE, InstanceType};
    use std::collections::BTreeMap;

    fn instance(config: &[(&str, &str)]) -> Instance {
        Instance {
            id: 1,
            project: "default".into(),
            name: "web".into(),
            instance_type: InstanceType::Container,
            architecture: 2,
            config: config
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect::<BTreeMap<_, _>>(),
            devices: Default::default(),
            profiles: vec![],
            ephemeral: false,
            stateful: false,
            snapshot: false,
            power_state: false,
            creation_date: None,
            last_used_date: None,
        }
    }

    #[test]
    fn test_default_init_and_env() {
        let spec = OciSpec::for_instance(&instance(&[("environment.LANG", "C.UTF-8")]));
        assert_eq!(spec.process.args, vec!["/sbin/init"]);
        assert!(spec.process.env.contains(&"LANG=C.UTF-8".to_string()));
        assert!(spec.linux.uid_mappings.is_empty());
        assert!(!spec.linux.namespaces.iter().any(|ns| ns.ns_type == "user"));
    }

    #[test]
    fn test_idmap_enables_user_namespace() {
        let spec = OciSpec::for_instance(&instance(&[
            (IDMAP_UID_BASE, "100000"),
            (IDMAP_GID_BASE, "100000"),
            (INIT_KEY, "/bin/sh -c 'sleep 1000'"),
        ]));
        assert_eq!(spec.linux.uid_mappings[0].host_id, 100000);
        assert!(spec.linux.namespaces.iter().any(|ns| ns.ns_type == "user"));
        assert_eq!(spec.process.args[0], "/bin/sh");
    }

    #[tokio::test]
    async fn test_write_then_validate() {
        let tmp = tempfile::tempdir().unwrap();
        write_bundle(&instance(&[]), tmp.path()).await.unwrap();
        assert!(tmp.path().join("rootfs").is_dir());
        validate_config(&tmp.path().join("config.json")).await.unwrap();

        std::fs::write(tmp.path().join("bad.json"), "{}").unwrap();
        assert!(validate_config(&tmp.path().join("bad.json")).await.is_err());
    }
}
