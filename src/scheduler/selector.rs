//! Round-robin rotation over enabled targets.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard};
use uuid::Uuid;

use crate::db::{DbError, Target, TargetRepository};

#[derive(Default)]
struct Rotation {
    targets: Vec<Target>,
    cursor: usize,
}

impl Rotation {
    fn add(&mut self, target: Target) {
        match self.targets.iter_mut().find(|t| t.id == target.id) {
            Some(existing) => *existing = target,
            None => self.targets.push(target),
        }
    }

    /// Remove `id`, keeping the element that was next in line next.
    fn remove(&mut self, id: &Uuid) {
        let Some(removed) = self.targets.iter().position(|t| t.id == *id) else {
            return;
        };
        let prev_len = self.targets.len();
        self.targets.remove(removed);

        if self.targets.is_empty() {
            self.cursor = 0;
            return;
        }
        let next = self.cursor % prev_len;
        if removed < next {
            self.cursor = self.cursor.saturating_sub(1);
        }
    }

    /// Adopt the live target list and its order, keeping the element that
    /// was next in line next.
    fn reconcile(&mut self, live: Vec<Target>) {
        let live_ids: HashSet<Uuid> = live.iter().map(|t| t.id).collect();
        let gone: Vec<Uuid> = self
            .targets
            .iter()
            .filter(|t| !live_ids.contains(&t.id))
            .map(|t| t.id)
            .collect();
        for id in gone {
            self.remove(&id);
        }

        let next_id = match self.targets.len() {
            0 => None,
            len => Some(self.targets[self.cursor % len].id),
        };
        self.targets = live;
        self.cursor = next_id
            .and_then(|id| self.targets.iter().position(|t| t.id == id))
            .unwrap_or(0);
    }

    fn next(&mut self) -> Option<Target> {
        if self.targets.is_empty() {
            return None;
        }
        let index = self.cursor % self.targets.len();
        self.cursor = index + 1;
        Some(self.targets[index].clone())
    }
}

/// Hands out enabled targets one per call, in insertion order, cycling.
pub struct RoundRobinTargetSelector {
    repository: Arc<dyn TargetRepository>,
    rotation: Mutex<Rotation>,
}

impl RoundRobinTargetSelector {
    pub fn new(repository: Arc<dyn TargetRepository>) -> Self {
        Self {
            repository,
            rotation: Mutex::new(Rotation::default()),
        }
    }

    /// Next enabled target, re-reading the store first.
    pub async fn next_target(&self) -> Result<Option<Target>, DbError> {
        let live: Vec<Target> = self
            .repository
            .find_all()
            .await?
            .into_iter()
            .filter(|t| t.enabled)
            .collect();

        let mut rotation = self.rotation()?;
        rotation.reconcile(live);
        Ok(rotation.next())
    }

    pub fn add_target(&self, target: Target) -> Result<(), DbError> {
        self.rotation()?.add(target);
        Ok(())
    }

    pub fn remove_target(&self, id: &Uuid) -> Result<(), DbError> {
        self.rotation()?.remove(id);
        Ok(())
    }

    /// Targets currently in rotation.
    pub fn targets(&self) -> Result<Vec<Target>, DbError> {
        Ok(self.rotation()?.targets.clone())
    }

    fn rotation(&self) -> Result<MutexGuard<'_, Rotation>, DbError> {
        self.rotation.lock().map_err(|_| DbError::Poisoned)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::memory::InMemoryTargetRepository;

    fn abc() -> (Arc<InMemoryTargetRepository>, Vec<Target>) {
        let targets = vec![
            Target::new("A", "a.test", 1),
            Target::new("B", "b.test", 2),
            Target::new("C", "c.test", 3),
        ];
        (Arc::new(InMemoryTargetRepository::with_targets(targets.clone())), targets)
    }

    async fn labels(selector: &RoundRobinTargetSelector, n: usize) -> Vec<String> {
        let mut out = Vec::new();
        for _ in 0..n {
            out.push(selector.next_target().await.unwrap().unwrap().label);
        }
        out
    }

    #[tokio::test]
    async fn test_cycles_in_order() {
        let (repo, _) = abc();
        let selector = RoundRobinTargetSelector::new(repo);
        assert_eq!(labels(&selector, 6).await, vec!["A", "B", "C", "A", "B", "C"]);
    }

    #[tokio::test]
    async fn test_removal_before_cursor_does_not_skip() {
        let (repo, targets) = abc();
        let selector = RoundRobinTargetSelector::new(repo.clone());
        assert_eq!(labels(&selector, 2).await, vec!["A", "B"]);

        repo.delete(&targets[1].id).unwrap();
        assert_eq!(labels(&selector, 2).await, vec!["C", "A"]);
    }

    #[tokio::test]
    async fn test_removal_of_next_element() {
        let (repo, targets) = abc();
        let selector = RoundRobinTargetSelector::new(repo.clone());
        assert_eq!(labels(&selector, 2).await, vec!["A", "B"]);

        repo.delete(&targets[2].id).unwrap();
        assert_eq!(labels(&selector, 2).await, vec!["A", "B"]);
    }

    #[tokio::test]
    async fn test_disabled_and_added_targets() {
        let (repo, targets) = abc();
        let selector = RoundRobinTargetSelector::new(repo.clone());
        assert_eq!(labels(&selector, 1).await, vec!["A"]);

        let mut b = targets[1].clone();
        b.enabled = false;
        repo.save(b).unwrap();
        repo.save(Target::new("D", "d.test", 4)).unwrap();

        assert_eq!(labels(&selector, 4).await, vec!["C", "D", "A", "C"]);
    }

    #[tokio::test]
    async fn test_reenabled_target_returns_to_store_position() {
        let (repo, targets) = abc();
        let selector = RoundRobinTargetSelector::new(repo.clone());
        assert_eq!(labels(&selector, 1).await, vec!["A"]);

        let mut b = targets[1].clone();
        b.enabled = false;
        repo.save(b.clone()).unwrap();
        assert_eq!(labels(&selector, 1).await, vec!["C"]);

        b.enabled = true;
        repo.save(b).unwrap();
        assert_eq!(labels(&selector, 6).await, vec!["A", "B", "C", "A", "B", "C"]);
        let order: Vec<_> = selector.targets().unwrap().into_iter().map(|t| t.label).collect();
        assert_eq!(order, vec!["A", "B", "C"]);
    }

    #[tokio::test]
    async fn test_empty_store() {
        let selector = RoundRobinTargetSelector::new(Arc::new(InMemoryTargetRepository::new()));
        assert!(selector.next_target().await.unwrap().is_none());
    }

    #[test]
    fn test_direct_rotation_edits() {
        let selector = RoundRobinTargetSelector::new(Arc::new(InMemoryTargetRepository::new()));
        let a = Target::new("A", "a.test", 1);
        selector.add_target(a.clone()).unwrap();
        selector.add_target(a.clone()).unwrap();
        assert_eq!(selector.targets().unwrap().len(), 1);
        selector.remove_target(&a.id).unwrap();
        assert!(selector.targets().unwrap().is_empty());
    }
}
