//! Storage contracts consumed by the probe engine.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use super::models::{ProbeResult, Target};
use super::DbError;

/// Read access to monitored targets.
#[async_trait]
pub trait TargetRepository: Send + Sync {
    /// All targets in insertion order, enabled or not.
    async fn find_all(&self) -> Result<Vec<Target>, DbError>;

    async fn find_by_id(&self, id: &Uuid) -> Result<Option<Target>, DbError>;
}

/// Append-only probe history.
#[async_trait]
pub trait ProbeRepository: Send + Sync {
    async fn save(&self, result: &ProbeResult) -> Result<(), DbError>;

    /// Most recent results for a target, newest first.
    async fn find_recent(&self, target_id: &str, limit: usize) -> Result<Vec<ProbeResult>, DbError>;

    /// Most recent result across all targets.
    async fn find_latest(&self) -> Result<Option<ProbeResult>, DbError>;

    /// Results in `[start, end)`, oldest first.
    async fn find_between(
        &self,
        target_id: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<ProbeResult>, DbError>;
}
