//! In-memory repositories for tests and embedding.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::RwLock;
use uuid::Uuid;

use super::models::{ProbeResult, Target};
use super::repository::{ProbeRepository, TargetRepository};
use super::DbError;

/// Insertion-ordered target list.
#[derive(Default)]
pub struct InMemoryTargetRepository {
    targets: RwLock<Vec<Target>>,
}

impl InMemoryTargetRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_targets(targets: Vec<Target>) -> Self {
        Self {
            targets: RwLock::new(targets),
        }
    }

    /// Insert or replace by id. New targets go to the end.
    pub fn save(&self, target: Target) -> Result<(), DbError> {
        let mut targets = self.targets.write().map_err(|_| DbError::Poisoned)?;
        match targets.iter_mut().find(|t| t.id == target.id) {
            Some(existing) => *existing = target,
            None => targets.push(target),
        }
        Ok(())
    }

    pub fn delete(&self, id: &Uuid) -> Result<bool, DbError> {
        let mut targets = self.targets.write().map_err(|_| DbError::Poisoned)?;
        let before = targets.len();
        targets.retain(|t| t.id != *id);
        Ok(targets.len() != before)
    }
}

#[async_trait]
impl TargetRepository for InMemoryTargetRepository {
    async fn find_all(&self) -> Result<Vec<Target>, DbError> {
        Ok(self.targets.read().map_err(|_| DbError::Poisoned)?.clone())
    }

    async fn find_by_id(&self, id: &Uuid) -> Result<Option<Target>, DbError> {
        let targets = self.targets.read().map_err(|_| DbError::Poisoned)?;
        Ok(targets.iter().find(|t| t.id == *id).cloned())
    }
}

/// Append-only result log.
#[derive(Default)]
pub struct InMemoryProbeRepository {
    results: RwLock<Vec<ProbeResult>>,
}

impl InMemoryProbeRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.results.read().map(|r| r.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn all(&self) -> Vec<ProbeResult> {
        self.results.read().map(|r| r.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl ProbeRepository for InMemoryProbeRepository {
    async fn save(&self, result: &ProbeResult) -> Result<(), DbError> {
        self.results
            .write()
            .map_err(|_| DbError::Poisoned)?
            .push(result.clone());
        Ok(())
    }

    async fn find_recent(&self, target_id: &str, limit: usize) -> Result<Vec<ProbeResult>, DbError> {
        let results = self.results.read().map_err(|_| DbError::Poisoned)?;
        let mut matching: Vec<_> = results
            .iter()
            .enumerate()
            .filter(|(_, r)| r.target_id == target_id)
            .collect();
        // Newest first; insertion order breaks timestamp ties.
        matching.sort_by(|(ia, a), (ib, b)| b.timestamp.cmp(&a.timestamp).then(ib.cmp(ia)));
        Ok(matching.into_iter().take(limit).map(|(_, r)| r.clone()).collect())
    }

    async fn find_latest(&self) -> Result<Option<ProbeResult>, DbError> {
        let results = self.results.read().map_err(|_| DbError::Poisoned)?;
        Ok(results
            .iter()
            .enumerate()
            .max_by(|(ia, a), (ib, b)| a.timestamp.cmp(&b.timestamp).then(ia.cmp(ib)))
            .map(|(_, r)| r.clone()))
    }

    async fn find_between(
        &self,
        target_id: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<ProbeResult>, DbError> {
        let results = self.results.read().map_err(|_| DbError::Poisoned)?;
        let mut matching: Vec<_> = results
            .iter()
            .filter(|r| r.target_id == target_id && r.timestamp >= start && r.timestamp < end)
            .cloned()
            .collect();
        matching.sort_by_key(|r| r.timestamp);
        Ok(matching)
    }
}
