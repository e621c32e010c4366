//! Tracing setup and probe correlation context.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;
use tokio::time::Instant;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use uuid::Uuid;

/// Install the global subscriber. `RUST_LOG` adds directives on top of `vigil=info`.
pub fn init_tracing() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(tracing_subscriber::EnvFilter::from_default_env().add_directive("vigil=info".parse()?))
        .try_init()?;
    Ok(())
}

/// Correlation values carried through one probe cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeContext {
    pub probe_cycle_id: String,
    pub target_id: Option<String>,
}

impl ProbeContext {
    /// Start a new cycle with a fresh id.
    pub fn new() -> Self {
        Self {
            probe_cycle_id: Uuid::new_v4().to_string(),
            target_id: None,
        }
    }

    /// Reuse the caller's cycle id when one is already established.
    pub fn resolve(parent: Option<&ProbeContext>) -> Self {
        match parent {
            Some(ctx) => ctx.clone(),
            None => Self::new(),
        }
    }

    pub fn for_target(&self, target_id: &str) -> Self {
        Self {
            probe_cycle_id: self.probe_cycle_id.clone(),
            target_id: Some(target_id.to_string()),
        }
    }

    pub fn span(&self) -> tracing::Span {
        tracing::info_span!(
            "probe",
            probe_cycle_id = %self.probe_cycle_id,
            target_id = self.target_id.as_deref().unwrap_or("-"),
        )
    }
}

impl Default for ProbeContext {
    fn default() -> Self {
        Self::new()
    }
}

/// Suppresses repeated log lines per key within a window.
pub struct LogRateLimiter {
    interval: Duration,
    last: Mutex<HashMap<String, Instant>>,
}

impl LogRateLimiter {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last: Mutex::new(HashMap::new()),
        }
    }

    /// True on the first call for `key`, then at most once per interval.
    pub fn should_log(&self, key: &str) -> bool {
        let now = Instant::now();
        let mut last = match self.last.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        match last.get(key) {
            Some(at) if now.duration_since(*at) < self.interval => false,
            _ => {
                last.insert(key.to_string(), now);
                true
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_reuses_parent_cycle() {
        let parent = ProbeContext::new();
        assert_eq!(ProbeContext::resolve(Some(&parent)), parent);

        let fresh = ProbeContext::resolve(None);
        assert_ne!(fresh.probe_cycle_id, parent.probe_cycle_id);
        assert!(Uuid::parse_str(&fresh.probe_cycle_id).is_ok());

        let scoped = parent.for_target("t-1");
        assert_eq!(scoped.probe_cycle_id, parent.probe_cycle_id);
        assert_eq!(scoped.target_id.as_deref(), Some("t-1"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limiter_window() {
        let limiter = LogRateLimiter::new(Duration::from_secs(30));
        assert!(limiter.should_log("db:5432"));
        assert!(!limiter.should_log("db:5432"));
        assert!(limiter.should_log("web:80"));

        tokio::time::advance(Duration::from_secs(29)).await;
        assert!(!limiter.should_log("db:5432"));
        tokio::time::advance(Duration::from_secs(1)).await;
        assert!(limiter.should_log("db:5432"));
    }
}
