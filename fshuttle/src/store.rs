use crate::config::ShuttleConfig;
use crate::errors::{Result, ShuttleError};
use crate::models::{EntityKey, RunLog, StoredEdge, StoredProperty};
use rusqlite::types::Value as SqlValue;
use rusqlite::{Connection, OptionalExtension, params};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use uuid::Uuid;

/// SQLite database holding entity data, edges, the natural key map and run logs.
pub struct RelationalStore {
    conn: Arc<Mutex<Connection>>,
}

impl RelationalStore {
    pub fn new(config: &ShuttleConfig) -> Result<Self> {
        if let Some(parent) = config.database_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(&config.database_path)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn initialize_schema(&self) -> Result<()> {
        let conn = self.conn()?;
        conn.execute_batch(
            "BEGIN;
            CREATE TABLE IF NOT EXISTS id_map (
                entity_set_id TEXT NOT NULL,
                entity_id TEXT NOT NULL,
                id TEXT NOT NULL UNIQUE,
                PRIMARY KEY (entity_set_id, entity_id)
            );
            CREATE TABLE IF NOT EXISTS entities (
                entity_set_id TEXT NOT NULL,
                id TEXT NOT NULL,
                version INTEGER NOT NULL,
                versions TEXT NOT NULL DEFAULT '[]',
                last_write INTEGER NOT NULL,
                PRIMARY KEY (entity_set_id, id)
            );
            CREATE TABLE IF NOT EXISTS data (
                entity_set_id TEXT NOT NULL,
                id TEXT NOT NULL,
                property_type_id TEXT NOT NULL,
                hash BLOB NOT NULL,
                value,
                version INTEGER NOT NULL,
                versions TEXT NOT NULL DEFAULT '[]',
                last_write INTEGER NOT NULL,
                PRIMARY KEY (entity_set_id, id, property_type_id, hash)
            );
            CREATE TABLE IF NOT EXISTS edges (
                src_entity_set_id TEXT NOT NULL,
                src_id TEXT NOT NULL,
                dst_entity_set_id TEXT NOT NULL,
                dst_id TEXT NOT NULL,
                edge_entity_set_id TEXT NOT NULL,
                edge_id TEXT NOT NULL,
                version INTEGER NOT NULL,
                versions TEXT NOT NULL DEFAULT '[]',
                last_write INTEGER NOT NULL,
                PRIMARY KEY (src_entity_set_id, src_id, dst_entity_set_id, dst_id, edge_entity_set_id, edge_id)
            );
            CREATE TABLE IF NOT EXISTS integration_runs (
                run_id INTEGER PRIMARY KEY AUTOINCREMENT,
                plan TEXT NOT NULL,
                start_time INTEGER NOT NULL,
                end_time INTEGER,
                status TEXT NOT NULL,
                details TEXT
            );
            COMMIT;",
        )?;
        Ok(())
    }

    pub(crate) fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| ShuttleError::Config("relational store mutex poisoned".into()))
    }

    /// Largest version (in absolute value) persisted anywhere, or 0.
    pub fn max_version(&self) -> Result<i64> {
        let conn = self.conn()?;
        let max: Option<i64> = conn.query_row(
            "SELECT MAX(v) FROM (
                SELECT MAX(ABS(version)) AS v FROM data
                UNION ALL SELECT MAX(ABS(version)) FROM entities
                UNION ALL SELECT MAX(ABS(version)) FROM edges
            )",
            [],
            |row| row.get(0),
        )?;
        Ok(max.unwrap_or(0))
    }

    /// Maps natural keys to surrogate ids, assigning fresh ids to unseen keys.
    pub fn resolve_ids(&self, keys: &HashSet<EntityKey>) -> Result<HashMap<EntityKey, Uuid>> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let mut resolved = HashMap::with_capacity(keys.len());
        {
            let mut insert = tx.prepare_cached(
                "INSERT OR IGNORE INTO id_map (entity_set_id, entity_id, id) VALUES (?1, ?2, ?3)",
            )?;
            let mut select = tx.prepare_cached(
                "SELECT id FROM id_map WHERE entity_set_id = ?1 AND entity_id = ?2",
            )?;
            for key in keys {
                let entity_set_id = key.entity_set_id.to_string();
                insert.execute(params![
                    entity_set_id,
                    key.entity_id,
                    Uuid::new_v4().to_string()
                ])?;
                let id: String =
                    select.query_row(params![entity_set_id, key.entity_id], |row| row.get(0))?;
                resolved.insert(key.clone(), Uuid::parse_str(&id)?);
            }
        }
        tx.commit()?;
        Ok(resolved)
    }

    pub fn create_run_log(&self, plan: &str) -> Result<i64> {
        let conn = self.conn()?;
        let start_time = chrono::Utc::now().timestamp();
        conn.execute(
            "INSERT INTO integration_runs (plan, start_time, status) VALUES (?1, ?2, 'RUNNING')",
            params![plan, start_time],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub fn update_run_status(&self, run_id: i64, status: &str, details: &str) -> Result<()> {
        let conn = self.conn()?;
        let end_time = chrono::Utc::now().timestamp();
        conn.execute(
            "UPDATE integration_runs SET status = ?1, details = ?2, end_time = ?3 WHERE run_id = ?4",
            params![status, details, end_time, run_id],
        )?;
        Ok(())
    }

    pub fn get_run_log(&self, run_id: i64) -> Result<Option<RunLog>> {
        let conn = self.conn()?;
        let log = conn
            .query_row(
                "SELECT run_id, plan, start_time, end_time, status, details FROM integration_runs WHERE run_id = ?1",
                params![run_id],
                |row| {
                    Ok(RunLog {
                        run_id: row.get(0)?,
                        plan: row.get(1)?,
                        start_time: row.get(2)?,
                        end_time: row.get(3)?,
                        status: row.get(4)?,
                        details: row.get(5)?,
                    })
                },
            )
            .optional()?;
        Ok(log)
    }

    /// Committed entity-level version, if the entity was ever written.
    pub fn entity_version(&self, entity_set_id: Uuid, id: Uuid) -> Result<Option<i64>> {
        let conn = self.conn()?;
        let version = conn
            .query_row(
                "SELECT version FROM entities WHERE entity_set_id = ?1 AND id = ?2",
                params![entity_set_id.to_string(), id.to_string()],
                |row| row.get(0),
            )
            .optional()?;
        Ok(version)
    }

    /// Every stored value row of an entity, tombstoned ones included.
    pub fn property_rows(&self, entity_set_id: Uuid, id: Uuid) -> Result<Vec<StoredProperty>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT property_type_id, hash, value, version, versions FROM data
             WHERE entity_set_id = ?1 AND id = ?2
             ORDER BY property_type_id, version DESC",
        )?;
        let rows = stmt.query_map(
            params![entity_set_id.to_string(), id.to_string()],
            |row| {
                let property_type_id: String = row.get(0)?;
                let versions: String = row.get(4)?;
                Ok((
                    property_type_id,
                    row.get::<_, Vec<u8>>(1)?,
                    row.get::<_, SqlValue>(2)?,
                    row.get::<_, i64>(3)?,
                    versions,
                ))
            },
        )?;

        let mut properties = Vec::new();
        for row in rows {
            let (property_type_id, hash, value, version, versions) = row?;
            properties.push(StoredProperty {
                property_type_id: Uuid::parse_str(&property_type_id)?,
                hash,
                value,
                version,
                versions: serde_json::from_str(&versions)?,
            });
        }
        Ok(properties)
    }

    /// Values of a property carrying the highest live version.
    pub fn latest_values(
        &self,
        entity_set_id: Uuid,
        id: Uuid,
        property_type_id: Uuid,
    ) -> Result<Vec<SqlValue>> {
        let mut rows: Vec<StoredProperty> = self
            .property_rows(entity_set_id, id)?
            .into_iter()
            .filter(|row| row.property_type_id == property_type_id && row.version > 0)
            .collect();
        let Some(max) = rows.iter().map(|row| row.version).max() else {
            return Ok(Vec::new());
        };
        rows.retain(|row| row.version == max);
        Ok(rows.into_iter().map(|row| row.value).collect())
    }

    pub fn edges_from(&self, src_entity_set_id: Uuid, src_id: Uuid) -> Result<Vec<StoredEdge>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT dst_entity_set_id, dst_id, edge_entity_set_id, edge_id, version, versions FROM edges
             WHERE src_entity_set_id = ?1 AND src_id = ?2",
        )?;
        let rows = stmt.query_map(
            params![src_entity_set_id.to_string(), src_id.to_string()],
            |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, i64>(4)?,
                    row.get::<_, String>(5)?,
                ))
            },
        )?;

        let mut edges = Vec::new();
        for row in rows {
            let (dst_es, dst_id, edge_es, edge_id, version, versions) = row?;
            edges.push(StoredEdge {
                src_entity_set_id,
                src_id,
                dst_entity_set_id: Uuid::parse_str(&dst_es)?,
                dst_id: Uuid::parse_str(&dst_id)?,
                edge_entity_set_id: Uuid::parse_str(&edge_es)?,
                edge_id: Uuid::parse_str(&edge_id)?,
                version,
                versions: serde_json::from_str(&versions)?,
            });
        }
        Ok(edges)
    }

    pub fn count_rows(&self, table: &str) -> Result<i64> {
        if !matches!(table, "data" | "entities" | "edges" | "id_map" | "integration_runs") {
            return Err(ShuttleError::Config(format!("unknown table '{table}'")));
        }
        let conn = self.conn()?;
        let count = conn.query_row(&format!("SELECT COUNT(*) FROM {table}"), [], |row| row.get(0))?;
        Ok(count)
    }
}
