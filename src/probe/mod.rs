//! Probe module for reachability checks.
//!
//! Supports TCP-connect and ICMP (system ping) probes behind a common
//! strategy trait, selected per target by [`ProbeStrategyFactory`].

mod icmp;
mod tcp;

pub use icmp::*;
pub use tcp::*;

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;

use crate::db::{ProbeMethod, ProbeRequest, ProbeResult, Target};

/// Probe error types.
///
/// The display text is what ends up in a DOWN result's error message.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ProbeError {
    #[error("connection timed out")]
    Timeout,
    #[error("connection refused")]
    Refused,
    #[error("unknown host")]
    UnknownHost,
    #[error("ping timed out")]
    PingTimeout,
    #[error("ping failed (exit code: {0})")]
    PingFailed(i32),
    #[error("I/O error: {0}")]
    Io(String),
    #[error("unexpected error: {0}")]
    Unexpected(String),
}

impl ProbeError {
    /// Failures worth another connection attempt within the same probe.
    pub fn is_transient(&self) -> bool {
        matches!(self, ProbeError::Io(_))
    }
}

/// A way of checking one target.
///
/// Expected network failures come back as DOWN results. `Err` is reserved
/// for failures of the strategy itself.
#[async_trait]
pub trait ProbeStrategy: Send + Sync {
    fn method(&self) -> ProbeMethod;

    async fn probe(&self, request: &ProbeRequest) -> Result<ProbeResult, ProbeError>;
}

/// Maps a target's probe method to its strategy.
#[derive(Clone, Default)]
pub struct ProbeStrategyFactory {
    strategies: HashMap<ProbeMethod, Arc<dyn ProbeStrategy>>,
}

impl ProbeStrategyFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(mut self, strategy: Arc<dyn ProbeStrategy>) -> Self {
        self.strategies.insert(strategy.method(), strategy);
        self
    }

    /// Strategy for `target`, TCP when the target names no method.
    pub fn strategy_for(&self, target: &Target) -> Result<Arc<dyn ProbeStrategy>, ProbeError> {
        let method = target.probe_method.unwrap_or_default();
        self.strategies
            .get(&method)
            .cloned()
            .ok_or_else(|| ProbeError::Unexpected(format!("no strategy registered for {}", method)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    struct Fixed(ProbeMethod);

    #[async_trait]
    impl ProbeStrategy for Fixed {
        fn method(&self) -> ProbeMethod {
            self.0
        }

        async fn probe(&self, request: &ProbeRequest) -> Result<ProbeResult, ProbeError> {
            Ok(ProbeResult::up(request, self.0, Utc::now(), None))
        }
    }

    #[test]
    fn test_error_messages() {
        assert_eq!(ProbeError::Timeout.to_string(), "connection timed out");
        assert_eq!(ProbeError::Refused.to_string(), "connection refused");
        assert_eq!(ProbeError::UnknownHost.to_string(), "unknown host");
        assert_eq!(ProbeError::PingFailed(2).to_string(), "ping failed (exit code: 2)");
        assert_eq!(ProbeError::Io("reset".into()).to_string(), "I/O error: reset");
        assert!(ProbeError::Io("reset".into()).is_transient());
        assert!(!ProbeError::Refused.is_transient());
    }

    #[test]
    fn test_factory_defaults_to_tcp() {
        let factory = ProbeStrategyFactory::new()
            .register(Arc::new(Fixed(ProbeMethod::Tcp)))
            .register(Arc::new(Fixed(ProbeMethod::Icmp)));

        let plain = Target::new("web", "example.org", 80);
        assert_eq!(factory.strategy_for(&plain).unwrap().method(), ProbeMethod::Tcp);

        let icmp = plain.clone().with_method(ProbeMethod::Icmp);
        assert_eq!(factory.strategy_for(&icmp).unwrap().method(), ProbeMethod::Icmp);
    }

    #[test]
    fn test_factory_missing_strategy() {
        let factory = ProbeStrategyFactory::new().register(Arc::new(Fixed(ProbeMethod::Tcp)));
        let icmp = Target::new("gw", "10.0.0.1", 0).with_method(ProbeMethod::Icmp);
        assert!(matches!(factory.strategy_for(&icmp), Err(ProbeError::Unexpected(_))));
    }
}
