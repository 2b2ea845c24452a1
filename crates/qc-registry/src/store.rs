//! SQLite persistence for agent records.
//!
//! One table `agents (agent_id PK, host, port, status, registered_at,
//! last_heartbeat, hotpath)`. The `hotpath` column is added by an
//! idempotent additive migration so databases created before the column
//! existed keep working. All I/O runs on the blocking pool.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use tracing::debug;

use qc_types::registry::{AgentInfo, AgentRegistration, AgentStatus};

use crate::error::RegistryError;

/// SQLite-backed agent record store.
pub struct AgentStore {
    db_path: PathBuf,
}

fn status_to_str(status: AgentStatus) -> &'static str {
    match status {
        AgentStatus::Healthy => "healthy",
        AgentStatus::Unhealthy => "unhealthy",
    }
}

fn status_from_str(raw: &str) -> AgentStatus {
    match raw {
        "unhealthy" => AgentStatus::Unhealthy,
        _ => AgentStatus::Healthy,
    }
}

fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

fn row_to_agent(row: &Row<'_>) -> rusqlite::Result<AgentInfo> {
    let status: String = row.get("status")?;
    let registered_at: String = row.get("registered_at")?;
    let last_heartbeat: Option<String> = row.get("last_heartbeat")?;
    let hotpath: i64 = row.get("hotpath")?;
    let port: i64 = row.get("port")?;
    Ok(AgentInfo {
        agent_id: row.get("agent_id")?,
        host: row.get("host")?,
        port: port as u16,
        status: status_from_str(&status),
        registered_at: parse_timestamp(&registered_at).unwrap_or_else(Utc::now),
        last_heartbeat: last_heartbeat.as_deref().and_then(parse_timestamp),
        hotpath: hotpath != 0,
    })
}

impl AgentStore {
    /// Open (or create) the store at `path` and ensure the schema exists.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, RegistryError> {
        let store = Self {
            db_path: path.as_ref().to_path_buf(),
        };
        store
            .with_conn(|conn| {
                conn.execute(
                    "CREATE TABLE IF NOT EXISTS agents (
                        agent_id TEXT PRIMARY KEY,
                        host TEXT NOT NULL,
                        port INTEGER NOT NULL,
                        status TEXT NOT NULL,
                        registered_at TEXT NOT NULL,
                        last_heartbeat TEXT,
                        hotpath INTEGER NOT NULL DEFAULT 0
                    )",
                    [],
                )?;
                // Additive migration for databases predating the hotpath
                // column. A duplicate-column error means it already exists.
                if let Err(err) = conn.execute(
                    "ALTER TABLE agents ADD COLUMN hotpath INTEGER NOT NULL DEFAULT 0",
                    [],
                ) {
                    debug!(error = %err, "hotpath column migration skipped");
                }
                Ok(())
            })
            .await?;
        debug!(path = %store.db_path.display(), "agent store ready");
        Ok(store)
    }

    async fn with_conn<T, F>(&self, op: F) -> Result<T, RegistryError>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T, RegistryError> + Send + 'static,
    {
        let db_path = self.db_path.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = Connection::open(&db_path)?;
            op(&mut conn)
        })
        .await
        .map_err(|e| RegistryError::Task(e.to_string()))?
    }

    /// Insert or refresh an agent record.
    ///
    /// Re-registration refreshes host/port, resets status to healthy, and
    /// stamps both timestamps. The `hotpath` flag is sticky up: a record
    /// already marked hotpath stays hotpath regardless of the request.
    pub async fn upsert_agent(
        &self,
        registration: &AgentRegistration,
        now: DateTime<Utc>,
    ) -> Result<(), RegistryError> {
        let reg = registration.clone();
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO agents
                    (agent_id, host, port, status, registered_at, last_heartbeat, hotpath)
                 VALUES (?1, ?2, ?3, 'healthy', ?4, ?4, ?5)
                 ON CONFLICT(agent_id) DO UPDATE SET
                    host = excluded.host,
                    port = excluded.port,
                    status = 'healthy',
                    registered_at = excluded.registered_at,
                    last_heartbeat = excluded.last_heartbeat,
                    hotpath = CASE WHEN agents.hotpath = 1 THEN 1 ELSE excluded.hotpath END",
                params![
                    reg.agent_id,
                    reg.host,
                    reg.port as i64,
                    now.to_rfc3339(),
                    if reg.hotpath { 1i64 } else { 0i64 },
                ],
            )?;
            Ok(())
        })
        .await
    }

    /// Record a heartbeat. `last_heartbeat` never moves backwards: a
    /// report older than the stored value updates status only.
    ///
    /// Returns `false` when no record exists.
    pub async fn update_heartbeat(
        &self,
        agent_id: &str,
        status: AgentStatus,
        at: DateTime<Utc>,
    ) -> Result<bool, RegistryError> {
        let agent_id = agent_id.to_string();
        self.with_conn(move |conn| {
            let tx = conn.transaction()?;
            let existing: Option<Option<String>> = tx
                .query_row(
                    "SELECT last_heartbeat FROM agents WHERE agent_id = ?1",
                    params![agent_id],
                    |row| row.get(0),
                )
                .optional()?;

            let Some(existing) = existing else {
                return Ok(false);
            };

            let effective = match existing.as_deref().and_then(parse_timestamp) {
                Some(previous) if previous > at => previous,
                _ => at,
            };

            tx.execute(
                "UPDATE agents SET status = ?1, last_heartbeat = ?2 WHERE agent_id = ?3",
                params![status_to_str(status), effective.to_rfc3339(), agent_id],
            )?;
            tx.commit()?;
            Ok(true)
        })
        .await
    }

    /// Delete a record. Returns `false` when it did not exist.
    pub async fn delete_agent(&self, agent_id: &str) -> Result<bool, RegistryError> {
        let agent_id = agent_id.to_string();
        self.with_conn(move |conn| {
            let changed = conn.execute("DELETE FROM agents WHERE agent_id = ?1", params![agent_id])?;
            Ok(changed > 0)
        })
        .await
    }

    /// Fetch one record.
    pub async fn fetch_agent(&self, agent_id: &str) -> Result<Option<AgentInfo>, RegistryError> {
        let agent_id = agent_id.to_string();
        self.with_conn(move |conn| {
            let agent = conn
                .query_row(
                    "SELECT * FROM agents WHERE agent_id = ?1",
                    params![agent_id],
                    row_to_agent,
                )
                .optional()?;
            Ok(agent)
        })
        .await
    }

    /// Fetch all records, newest registration first.
    pub async fn fetch_agents(&self, hotpath_only: bool) -> Result<Vec<AgentInfo>, RegistryError> {
        self.with_conn(move |conn| {
            let sql = if hotpath_only {
                "SELECT * FROM agents WHERE hotpath = 1 ORDER BY registered_at DESC"
            } else {
                "SELECT * FROM agents ORDER BY registered_at DESC"
            };
            let mut stmt = conn.prepare(sql)?;
            let rows = stmt.query_map([], row_to_agent)?;
            let mut agents = Vec::new();
            for row in rows {
                agents.push(row?);
            }
            Ok(agents)
        })
        .await
    }

    /// Flip the hotpath flag. Returns `false` when no record exists.
    pub async fn set_hotpath(&self, agent_id: &str, hotpath: bool) -> Result<bool, RegistryError> {
        let agent_id = agent_id.to_string();
        self.with_conn(move |conn| {
            let changed = conn.execute(
                "UPDATE agents SET hotpath = ?1 WHERE agent_id = ?2",
                params![if hotpath { 1i64 } else { 0i64 }, agent_id],
            )?;
            Ok(changed > 0)
        })
        .await
    }
}
