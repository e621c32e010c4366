//! SQLite database store implementation.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Result as SqlResult, Row};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use thiserror::Error;
use uuid::Uuid;

use super::models::*;
use super::repository::{ProbeRepository, TargetRepository};

mod embedded {
    use refinery::embed_migrations;
    embed_migrations!("migrations");
}

/// Database error types.
#[derive(Error, Debug)]
pub enum DbError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("Migration error: {0}")]
    Migration(String),
    #[error("Not found")]
    NotFound,
    #[error("target already exists for {0}")]
    Duplicate(String),
    #[error("service temporarily unavailable: {0}")]
    Unavailable(String),
    #[error("repository failure: {0}")]
    Repository(String),
    #[error("connection mutex poisoned")]
    Poisoned,
}

const TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.9f";

const TARGET_COLUMNS: &str =
    "id, label, host, port, enabled, probe_method, timeout_override_ms";

const RESULT_COLUMNS: &str =
    "time, target_id, target_host, latency_ms, probe_cycle_id, status, method, error_message";

/// Thread-safe database store.
#[derive(Clone)]
pub struct Store {
    conn: Arc<Mutex<Connection>>,
}

impl Store {
    /// Create a new store with the given database path.
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self, DbError> {
        let conn = Connection::open(path)?;
        // Replicas share the file for lease coordination.
        conn.busy_timeout(std::time::Duration::from_secs(5))?;
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.init()?;
        Ok(store)
    }

    fn init(&self) -> Result<(), DbError> {
        let mut conn = self.conn()?;
        embedded::migrations::runner()
            .run(&mut *conn)
            .map_err(|e| DbError::Migration(e.to_string()))?;
        Ok(())
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>, DbError> {
        self.conn.lock().map_err(|_| DbError::Poisoned)
    }

    // --- Target CRUD ---

    /// Insert a target, rejecting a duplicate host/port pair.
    pub fn add_target(&self, target: &Target) -> Result<(), DbError> {
        let conn = self.conn()?;
        let exists: bool = conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM targets WHERE lower(host) = lower(?1) AND port = ?2)",
            params![target.host, target.port],
            |row| row.get(0),
        )?;
        if exists {
            return Err(DbError::Duplicate(target.endpoint_key()));
        }

        conn.execute(
            "INSERT INTO targets (id, label, host, port, enabled, probe_method, timeout_override_ms) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                target.id.to_string(),
                target.label,
                target.host,
                target.port,
                target.enabled,
                target.probe_method.map(|m| m.as_str()),
                target.timeout_override_ms.map(|ms| ms as i64),
            ],
        )?;
        Ok(())
    }

    /// Get all targets in insertion order.
    pub fn get_targets(&self) -> Result<Vec<Target>, DbError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM targets ORDER BY seq ASC",
            TARGET_COLUMNS
        ))?;

        let targets = stmt
            .query_map([], target_from_row)?
            .collect::<SqlResult<Vec<_>>>()?;

        Ok(targets)
    }

    /// Get a target by ID.
    pub fn get_target(&self, id: &Uuid) -> Result<Option<Target>, DbError> {
        let conn = self.conn()?;
        let target = conn
            .query_row(
                &format!("SELECT {} FROM targets WHERE id = ?1", TARGET_COLUMNS),
                params![id.to_string()],
                target_from_row,
            )
            .optional()?;
        Ok(target)
    }

    pub fn set_target_enabled(&self, id: &Uuid, enabled: bool) -> Result<(), DbError> {
        let conn = self.conn()?;
        let changed = conn.execute(
            "UPDATE targets SET enabled = ?1 WHERE id = ?2",
            params![enabled, id.to_string()],
        )?;
        if changed == 0 {
            return Err(DbError::NotFound);
        }
        Ok(())
    }

    /// Delete a target. History is kept.
    pub fn delete_target(&self, id: &Uuid) -> Result<bool, DbError> {
        let conn = self.conn()?;
        let changed = conn.execute("DELETE FROM targets WHERE id = ?1", params![id.to_string()])?;
        Ok(changed > 0)
    }

    // --- Probe Results ---

    pub fn add_probe_result(&self, result: &ProbeResult) -> Result<(), DbError> {
        let conn = self.conn()?;
        conn.execute(
            &format!(
                "INSERT INTO probe_results ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                RESULT_COLUMNS
            ),
            params![
                result.timestamp.format(TIME_FORMAT).to_string(),
                result.target_id,
                result.target_host,
                result.latency_ms.map(|ms| ms as i64),
                result.probe_cycle_id,
                result.status.as_str(),
                result.method.as_str(),
                result.error_message,
            ],
        )?;
        Ok(())
    }

    pub fn get_recent_results(&self, target_id: &str, limit: usize) -> Result<Vec<ProbeResult>, DbError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM probe_results WHERE target_id = ?1 ORDER BY time DESC, id DESC LIMIT ?2",
            RESULT_COLUMNS
        ))?;

        let results = stmt
            .query_map(params![target_id, limit as i64], result_from_row)?
            .collect::<SqlResult<Vec<_>>>()?;

        Ok(results)
    }

    pub fn get_latest_result(&self) -> Result<Option<ProbeResult>, DbError> {
        let conn = self.conn()?;
        let result = conn
            .query_row(
                &format!(
                    "SELECT {} FROM probe_results ORDER BY time DESC, id DESC LIMIT 1",
                    RESULT_COLUMNS
                ),
                [],
                result_from_row,
            )
            .optional()?;
        Ok(result)
    }

    pub fn get_results_between(
        &self,
        target_id: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<ProbeResult>, DbError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM probe_results
             WHERE target_id = ?1 AND time >= ?2 AND time < ?3 ORDER BY time ASC, id ASC",
            RESULT_COLUMNS
        ))?;

        let results = stmt
            .query_map(
                params![
                    target_id,
                    start.format(TIME_FORMAT).to_string(),
                    end.format(TIME_FORMAT).to_string(),
                ],
                result_from_row,
            )?
            .collect::<SqlResult<Vec<_>>>()?;

        Ok(results)
    }

    // --- Leases ---

    /// Claim or renew `key` for `holder`.
    ///
    /// Succeeds when the key is free, expired, or already held by `holder`.
    /// The conditional upsert is a single statement, so competing processes
    /// sharing the file cannot both win.
    pub fn try_acquire_lease(
        &self,
        key: &str,
        holder: &str,
        lease_ms: i64,
        now_ms: i64,
    ) -> Result<bool, DbError> {
        let conn = self.conn()?;
        let changed = conn.execute(
            "INSERT INTO leases (key, holder, expires_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(key) DO UPDATE SET holder = excluded.holder, expires_at = excluded.expires_at
             WHERE leases.holder = excluded.holder OR leases.expires_at <= ?4",
            params![key, holder, now_ms + lease_ms, now_ms],
        )?;
        Ok(changed == 1)
    }

    /// Release `key` if `holder` owns it. Returns whether a row was removed.
    pub fn release_lease(&self, key: &str, holder: &str) -> Result<bool, DbError> {
        let conn = self.conn()?;
        let changed = conn.execute(
            "DELETE FROM leases WHERE key = ?1 AND holder = ?2",
            params![key, holder],
        )?;
        Ok(changed == 1)
    }

    /// Current unexpired holder of `key`.
    pub fn lease_holder(&self, key: &str, now_ms: i64) -> Result<Option<String>, DbError> {
        let conn = self.conn()?;
        let holder = conn
            .query_row(
                "SELECT holder FROM leases WHERE key = ?1 AND expires_at > ?2",
                params![key, now_ms],
                |row| row.get(0),
            )
            .optional()?;
        Ok(holder)
    }
}

#[async_trait]
impl TargetRepository for Store {
    async fn find_all(&self) -> Result<Vec<Target>, DbError> {
        self.get_targets()
    }

    async fn find_by_id(&self, id: &Uuid) -> Result<Option<Target>, DbError> {
        self.get_target(id)
    }
}

#[async_trait]
impl ProbeRepository for Store {
    async fn save(&self, result: &ProbeResult) -> Result<(), DbError> {
        self.add_probe_result(result)
    }

    async fn find_recent(&self, target_id: &str, limit: usize) -> Result<Vec<ProbeResult>, DbError> {
        self.get_recent_results(target_id, limit)
    }

    async fn find_latest(&self) -> Result<Option<ProbeResult>, DbError> {
        self.get_latest_result()
    }

    async fn find_between(
        &self,
        target_id: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<ProbeResult>, DbError> {
        self.get_results_between(target_id, start, end)
    }
}

fn conversion_error(idx: usize, err: impl Into<Box<dyn std::error::Error + Send + Sync>>) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, err.into())
}

fn target_from_row(row: &Row<'_>) -> SqlResult<Target> {
    let id: String = row.get(0)?;
    let method: Option<String> = row.get(5)?;
    let timeout: Option<i64> = row.get(6)?;

    Ok(Target {
        id: Uuid::parse_str(&id).map_err(|e| conversion_error(0, e))?,
        label: row.get(1)?,
        host: row.get(2)?,
        port: row.get(3)?,
        enabled: row.get(4)?,
        probe_method: method
            .map(|m| m.parse::<ProbeMethod>().map_err(|e| conversion_error(5, e)))
            .transpose()?,
        timeout_override_ms: timeout.map(|ms| ms.max(0) as u64),
    })
}

fn result_from_row(row: &Row<'_>) -> SqlResult<ProbeResult> {
    let time_str: String = row.get(0)?;
    let latency: Option<i64> = row.get(3)?;
    let status: String = row.get(5)?;
    let method: String = row.get(6)?;

    Ok(ProbeResult {
        timestamp: parse_db_time(&time_str).unwrap_or_else(Utc::now),
        target_id: row.get(1)?,
        target_host: row.get(2)?,
        latency_ms: latency.map(|ms| ms.max(0) as u64),
        probe_cycle_id: row.get(4)?,
        status: status.parse().map_err(|e: String| conversion_error(5, e))?,
        method: method.parse().map_err(|e: String| conversion_error(6, e))?,
        error_message: row.get(7)?,
    })
}

/// Parse a datetime string from the database.
fn parse_db_time(s: &str) -> Option<DateTime<Utc>> {
    let formats = [
        TIME_FORMAT,
        "%Y-%m-%d %H:%M:%S%.f",
        "%Y-%m-%d %H:%M:%S",
        "%Y-%m-%dT%H:%M:%S%.9fZ",
        "%Y-%m-%dT%H:%M:%SZ",
    ];

    for fmt in &formats {
        if let Ok(dt) = NaiveDateTime::parse_from_str(s, fmt) {
            return Some(DateTime::from_naive_utc_and_offset(dt, Utc));
        }
    }

    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }

    None
}
