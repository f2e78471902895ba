use std::collections::BTreeMap;
use std::path::Path;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::Row;
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions, SqliteRow};

use super::InstanceStore;
use crate::error::{Error, Result};
use crate::instance::{
    Devices, Instance, InstanceArgs, InstanceType, InstanceUpdate, SNAPSHOT_DELIMITER,
};

const KIND_REGULAR: i64 = 0;
const KIND_SNAPSHOT: i64 = 1;

const COLUMNS: &str = "id, project, name, kind, instance_type, architecture, ephemeral, \
     stateful, power_state, config_json, devices_json, profiles_json, created_at, last_used_at";

pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    pub async fn open(data_dir: &Path) -> Result<Self> {
        let db_path = data_dir.join("mvirt-ctr.db");
        let db_url = format!("sqlite:{}?mode=rwc", db_path.display());

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(&db_url)
            .await?;

        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    /// Private in-memory database, used by tests.
    pub async fn in_memory() -> Result<Self> {
        // One connection that never expires, otherwise the database vanishes.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await?;

        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    async fn migrate(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS instances (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                project TEXT NOT NULL,
                name TEXT NOT NULL,
                kind INTEGER NOT NULL DEFAULT 0,
                instance_type INTEGER NOT NULL DEFAULT 0,
                architecture INTEGER NOT NULL DEFAULT 0,
                ephemeral INTEGER NOT NULL DEFAULT 0,
                stateful INTEGER NOT NULL DEFAULT 0,
                power_state INTEGER NOT NULL DEFAULT 0,
                config_json TEXT NOT NULL,
                devices_json TEXT NOT NULL,
                profiles_json TEXT NOT NULL,
                created_at INTEGER,
                last_used_at INTEGER,
                UNIQUE (project, name)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

#[async_trait]
impl InstanceStore for SqliteStore {
    async fn create(&self, args: &InstanceArgs) -> Result<Instance> {
        let config_json = serde_json::to_string(&args.config)?;
        let devices_json = serde_json::to_string(&args.devices)?;
        let profiles_json = serde_json::to_string(&args.profiles)?;
        let kind = if args.snapshot {
            KIND_SNAPSHOT
        } else {
            KIND_REGULAR
        };

        let result = sqlx::query(
            r#"
            INSERT INTO instances (project, name, kind, instance_type, architecture,
                ephemeral, stateful, power_state, config_json, devices_json, profiles_json,
                created_at, last_used_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, 0, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&args.project)
        .bind(&args.name)
        .bind(kind)
        .bind(args.instance_type.as_i64())
        .bind(args.architecture as i64)
        .bind(args.ephemeral as i64)
        .bind(args.stateful as i64)
        .bind(&config_json)
        .bind(&devices_json)
        .bind(&profiles_json)
        .bind(args.creation_date.map(|d| d.timestamp()))
        .bind(args.last_used_date.map(|d| d.timestamp()))
        .execute(&self.pool)
        .await
        .map_err(|e| match e {
            sqlx::Error::Database(ref db) if db.is_unique_violation() => {
                Error::Conflict(format!("instance {} already exists", args.name))
            }
            e => Error::Store(e),
        })?;

        Ok(Instance {
            id: result.last_insert_rowid(),
            project: args.project.clone(),
            name: args.name.clone(),
            instance_type: args.instance_type,
            architecture: args.architecture,
            config: args.config.clone(),
            devices: args.devices.clone(),
            profiles: args.profiles.clone(),
            ephemeral: args.ephemeral,
            stateful: args.stateful,
            snapshot: args.snapshot,
            power_state: false,
            creation_date: args.creation_date.map(truncate_to_second),
            last_used_date: args.last_used_date.map(truncate_to_second),
        })
    }

    async fn get(&self, project: &str, name: &str) -> Result<Instance> {
        let row = sqlx::query(&format!(
            "SELECT {COLUMNS} FROM instances WHERE project = ? AND name = ?"
        ))
        .bind(project)
        .bind(name)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => row_to_instance(&row),
            None => Err(Error::NotFound(format!("instance {name}"))),
        }
    }

    async fn get_id(&self, project: &str, name: &str) -> Result<Option<i64>> {
        let row = sqlx::query("SELECT id FROM instances WHERE project = ? AND name = ?")
            .bind(project)
            .bind(name)
            .fetch_optional(&self.pool)
            .await?;

        Ok(row.map(|r| r.get::<i64, _>("id")))
    }

    async fn list_regular(&self, project: &str) -> Result<Vec<Instance>> {
        let rows = sqlx::query(&format!(
            "SELECT {COLUMNS} FROM instances WHERE project = ? AND kind = ? ORDER BY name"
        ))
        .bind(project)
        .bind(KIND_REGULAR)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(row_to_instance).collect()
    }

    async fn list_power_on(&self) -> Result<Vec<Instance>> {
        let rows = sqlx::query(&format!(
            "SELECT {COLUMNS} FROM instances WHERE kind = ? AND power_state = 1 ORDER BY id"
        ))
        .bind(KIND_REGULAR)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(row_to_instance).collect()
    }

    async fn update(&self, id: i64, update: &InstanceUpdate) -> Result<()> {
        let result = sqlx::query(
            "UPDATE instances SET config_json = ?, devices_json = ?, profiles_json = ? WHERE id = ?",
        )
        .bind(serde_json::to_string(&update.config)?)
        .bind(serde_json::to_string(&update.devices)?)
        .bind(serde_json::to_string(&update.profiles)?)
        .bind(id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(Error::NotFound(format!("instance id {id}")));
        }
        Ok(())
    }

    async fn set_power_state(&self, id: i64, running: bool) -> Result<()> {
        let result = sqlx::query("UPDATE instances SET power_state = ? WHERE id = ?")
            .bind(running as i64)
            .bind(id)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(Error::NotFound(format!("instance id {id}")));
        }
        Ok(())
    }

    async fn clear_power_state(&self) -> Result<u64> {
        let result = sqlx::query("UPDATE instances SET power_state = 0 WHERE power_state != 0")
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected())
    }

    async fn snapshots(&self, project: &str, parent: &str) -> Result<Vec<Instance>> {
        // substr() instead of LIKE so '%' and '_' in names match literally.
        let prefix = format!("{parent}{SNAPSHOT_DELIMITER}");
        let rows = sqlx::query(&format!(
            "SELECT {COLUMNS} FROM instances \
             WHERE project = ? AND kind = ? AND substr(name, 1, ?) = ? ORDER BY id"
        ))
        .bind(project)
        .bind(KIND_SNAPSHOT)
        .bind(prefix.chars().count() as i64)
        .bind(&prefix)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(row_to_instance).collect()
    }

    async fn delete_by_id(&self, id: i64) -> Result<bool> {
        let result = sqlx::query("DELETE FROM instances WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn rename(&self, project: &str, old: &str, new: &str) -> Result<()> {
        let old_prefix = format!("{old}{SNAPSHOT_DELIMITER}");
        let new_prefix = format!("{new}{SNAPSHOT_DELIMITER}");
        let mut tx = self.pool.begin().await?;

        let result = sqlx::query("UPDATE instances SET name = ? WHERE project = ? AND name = ?")
            .bind(new)
            .bind(project)
            .bind(old)
            .execute(&mut *tx)
            .await
            .map_err(|e| match e {
                sqlx::Error::Database(ref db) if db.is_unique_violation() => {
                    Error::Conflict(format!("instance {new} already exists"))
                }
                e => Error::Store(e),
            })?;

        if result.rows_affected() == 0 {
            return Err(Error::NotFound(format!("instance {old}")));
        }

        let old_len = old_prefix.chars().count() as i64;
        sqlx::query(
            r#"
            UPDATE instances SET name = ? || substr(name, ?)
            WHERE project = ? AND kind = ? AND substr(name, 1, ?) = ?
            "#,
        )
        .bind(&new_prefix)
        .bind(old_len + 1)
        .bind(project)
        .bind(KIND_SNAPSHOT)
        .bind(old_len)
        .bind(&old_prefix)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn touch_last_used(&self, id: i64, at: DateTime<Utc>) -> Result<()> {
        sqlx::query("UPDATE instances SET last_used_at = ? WHERE id = ?")
            .bind(at.timestamp())
            .bind(id)
            .execute(&self.pool)
            .await?;

        Ok(())
    }
}

fn row_to_instance(row: &SqliteRow) -> Result<Instance> {
    let config_json: String = row.get("config_json");
    let devices_json: String = row.get("devices_json");
    let profiles_json: String = row.get("profiles_json");

    let config: BTreeMap<String, String> = serde_json::from_str(&config_json)?;
    let devices: Devices = serde_json::from_str(&devices_json)?;
    let profiles: Vec<String> = serde_json::from_str(&profiles_json)?;

    Ok(Instance {
        id: row.get("id"),
        project: row.get("project"),
        name: row.get("name"),
        instance_type: InstanceType::from_i64(row.get("instance_type")),
        architecture: row.get::<i64, _>("architecture") as i32,
        config,
        devices,
        profiles,
        ephemeral: row.get::<i64, _>("ephemeral") != 0,
        stateful: row.get::<i64, _>("stateful") != 0,
        snapshot: row.get::<i64, _>("kind") == KIND_SNAPSHOT,
        power_state: row.get::<i64, _>("power_state") != 0,
        creation_date: epoch_to_date(row.get("created_at")),
        last_used_date: epoch_to_date(row.get("last_used_at")),
    })
}

fn epoch_to_date(secs: Option<i64>) -> Option<DateTime<Utc>> {
    secs.and_then(|s| DateTime::from_timestamp(s, 0))
}

fn truncate_to_second(d: DateTime<Utc>) -> DateTime<Utc> {
    DateTime::from_timestamp(d.timestamp(), 0).unwrap_or(d)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instance::snapshot_name;

    fn args(name: &str) -> InstanceArgs {
        InstanceArgs {
            project: "default".into(),
            name: name.into(),
            architecture: 2,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_create_get_roundtrip() {
        let store = SqliteStore::in_memory().await.unwrap();
        let mut a = args("web");
        a.config.insert("limits.cpu".into(), "2".into());
        a.profiles = vec!["default".into(), "gpu".into()];
        a.creation_date = DateTime::from_timestamp(1_700_000_000, 0);

        let created = store.create(&a).await.unwrap();
        let fetched = store.get("default", "web").await.unwrap();
        assert_eq!(created, fetched);
        assert_eq!(fetched.profiles, vec!["default", "gpu"]);
        assert_eq!(fetched.last_used_date, None);
    }

    #[tokio::test]
    async fn test_duplicate_is_conflict() {
        let store = SqliteStore::in_memory().await.unwrap();
        store.create(&args("web")).await.unwrap();
        let err = store.create(&args("web")).await.unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Conflict);
    }

    #[tokio::test]
    async fn test_snapshot_prefix_is_literal() {
        let store = SqliteStore::in_memory().await.unwrap();
        store.create(&args("a_b")).await.unwrap();
        store.create(&args("axb")).await.unwrap();
        for (parent, snap) in [("a_b", "s0"), ("axb", "s0"), ("a_b", "s1")] {
            let mut s = args(&snapshot_name(parent, snap));
            s.snapshot = true;
            store.create(&s).await.unwrap();
        }

        let snaps = store.snapshots("default", "a_b").await.unwrap();
        let names: Vec<_> = snaps.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["a_b/s0", "a_b/s1"]);
    }

    #[tokio::test]
    async fn test_rename_moves_snapshots() {
        let store = SqliteStore::in_memory().await.unwrap();
        store.create(&args("old")).await.unwrap();
        let mut s = args("old/snap0");
        s.snapshot = true;
        store.create(&s).await.unwrap();

        store.rename("default", "old", "new").await.unwrap();

        assert!(store.get("default", "old").await.unwrap_err().is_not_found());
        assert!(store.get("default", "new").await.is_ok());
        assert!(store.get("default", "new/snap0").await.is_ok());
        assert!(store.snapshots("default", "old").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_power_state_flags() {
        let store = SqliteStore::in_memory().await.unwrap();
        let a = store.create(&args("a")).await.unwrap();
        let b = store.create(&args("b")).await.unwrap();
        store.set_power_state(a.id, true).await.unwrap();
        store.set_power_state(b.id, true).await.unwrap();

        assert_eq!(store.list_power_on().await.unwrap().len(), 2);
        assert_eq!(store.clear_power_state().await.unwrap(), 2);
        assert!(store.list_power_on().await.unwrap().is_empty());
        assert!(store.set_power_state(999, true).await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_delete_by_id_reports_absence() {
        let store = SqliteStore::in_memory().await.unwrap();
        let a = store.create(&args("a")).await.unwrap();
        assert!(store.delete_by_id(a.id).await.unwrap());
        assert!(!store.delete_by_id(a.id).await.unwrap());
    }

    #[tokio::test]
    async fn test_update_replaces_config() {
        let store = SqliteStore::in_memory().await.unwrap();
        let mut a = args("web");
        a.config.insert("limits.cpu".into(), "2".into());
        let created = store.create(&a).await.unwrap();

        let update = InstanceUpdate {
            config: [("limits.memory".to_string(), "1GiB".to_string())].into(),
            devices: BTreeMap::from([(
                "eth0".to_string(),
                BTreeMap::from([("type".to_string(), "nic".to_string())]),
            )]),
            profiles: vec!["net".into()],
        };
        store.update(created.id, &update).await.unwrap();

        let fetched = store.get("default", "web").await.unwrap();
        assert_eq!(InstanceUpdate::from(&fetched), update);
        assert!(!fetched.config.contains_key("limits.cpu"));
        assert_eq!(fetched.architecture, 2);
        assert!(store.update(999, &update).await.unwrap_err().is_not_found());
    }
}
