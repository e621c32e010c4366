//! Configuration module for Vigil.
//!
//! Loads configuration from environment variables with sensible defaults.

use std::env;
use std::str::FromStr;
use std::time::Duration;

use crate::coordination::DEFAULT_LEADER_LOCK_KEY;
use crate::notification::DEFAULT_NOTIFICATION_TIMEOUT_MS;
use crate::pool::WorkerPoolConfig;
use crate::resilience::{CircuitBreakerConfig, ResilienceConfig, RetryPolicy};
use crate::scheduler::PersistenceMode;

/// Server configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// HTTP port for the status server (default: 8080)
    pub http_port: u16,
    /// Path to the SQLite database file (default: "vigil.db")
    pub db_path: String,
    /// Delay between scheduler ticks (default: 1000)
    pub probe_interval_ms: u64,

    pub tcp_timeout_ms: u64,
    pub tcp_refused_log_window_secs: u64,
    pub tcp_retry_attempts: u32,
    pub icmp_timeout_ms: u64,
    pub icmp_packet_size: u32,

    pub pool_core_size: usize,
    pub pool_max_size: usize,
    pub pool_queue_capacity: usize,
    pub pool_shutdown_grace_secs: u64,

    pub leader_election_enabled: bool,
    pub leader_lease_secs: u64,
    pub leader_lock_key: String,

    pub notifications_enabled: bool,
    pub notifications_default_webhook_url: Option<String>,
    pub notifications_timeout_ms: u64,

    pub persistence_mode: PersistenceMode,

    pub store_retry_attempts: u32,
    pub store_retry_backoff_ms: u64,
    /// Failure percentage that opens the store breaker.
    pub breaker_failure_rate: f64,
    pub breaker_window: usize,
    pub breaker_min_calls: usize,
    pub breaker_open_secs: u64,
    pub breaker_half_open_calls: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            http_port: 8080,
            db_path: "vigil.db".to_string(),
            probe_interval_ms: 1000,
            tcp_timeout_ms: 1000,
            tcp_refused_log_window_secs: 30,
            tcp_retry_attempts: 3,
            icmp_timeout_ms: 2000,
            icmp_packet_size: 32,
            pool_core_size: 4,
            pool_max_size: 10,
            pool_queue_capacity: 100,
            pool_shutdown_grace_secs: 30,
            leader_election_enabled: false,
            leader_lease_secs: 30,
            leader_lock_key: DEFAULT_LEADER_LOCK_KEY.to_string(),
            notifications_enabled: false,
            notifications_default_webhook_url: None,
            notifications_timeout_ms: DEFAULT_NOTIFICATION_TIMEOUT_MS,
            persistence_mode: PersistenceMode::Sync,
            store_retry_attempts: 3,
            store_retry_backoff_ms: 500,
            breaker_failure_rate: 50.0,
            breaker_window: 100,
            breaker_min_calls: 10,
            breaker_open_secs: 60,
            breaker_half_open_calls: 10,
        }
    }
}

/// Overwrite `slot` when `value` is present and parses.
fn apply<T: FromStr>(slot: &mut T, value: Option<String>) {
    if let Some(s) = value {
        if let Ok(v) = s.trim().parse() {
            *slot = v;
        }
    }
}

impl ServerConfig {
    /// Load configuration from `VIGIL_*` environment variables.
    ///
    /// Unparsable values are ignored and the default kept.
    pub fn load() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build from an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut cfg = Self::default();

        apply(&mut cfg.http_port, lookup("VIGIL_HTTP_PORT"));
        if let Some(db_path) = lookup("VIGIL_DB_PATH") {
            cfg.db_path = db_path;
        }
        apply(&mut cfg.probe_interval_ms, lookup("VIGIL_PROBE_INTERVAL_MS"));

        apply(&mut cfg.tcp_timeout_ms, lookup("VIGIL_TCP_TIMEOUT_MS"));
        apply(&mut cfg.tcp_refused_log_window_secs, lookup("VIGIL_TCP_REFUSED_LOG_WINDOW_SECS"));
        apply(&mut cfg.tcp_retry_attempts, lookup("VIGIL_TCP_RETRY_ATTEMPTS"));
        apply(&mut cfg.icmp_timeout_ms, lookup("VIGIL_ICMP_TIMEOUT_MS"));
        apply(&mut cfg.icmp_packet_size, lookup("VIGIL_ICMP_PACKET_SIZE"));

        apply(&mut cfg.pool_core_size, lookup("VIGIL_POOL_CORE_SIZE"));
        apply(&mut cfg.pool_max_size, lookup("VIGIL_POOL_MAX_SIZE"));
        apply(&mut cfg.pool_queue_capacity, lookup("VIGIL_POOL_QUEUE_CAPACITY"));
        apply(&mut cfg.pool_shutdown_grace_secs, lookup("VIGIL_POOL_SHUTDOWN_GRACE_SECS"));

        apply(&mut cfg.leader_election_enabled, lookup("VIGIL_LEADER_ELECTION_ENABLED"));
        apply(&mut cfg.leader_lease_secs, lookup("VIGIL_LEADER_LEASE_SECS"));
        if let Some(key) = lookup("VIGIL_LEADER_LOCK_KEY").filter(|k| !k.trim().is_empty()) {
            cfg.leader_lock_key = key;
        }

        apply(&mut cfg.notifications_enabled, lookup("VIGIL_NOTIFICATIONS_ENABLED"));
        if let Some(url) = lookup("VIGIL_NOTIFICATIONS_DEFAULT_WEBHOOK_URL").filter(|u| !u.trim().is_empty()) {
            cfg.notifications_default_webhook_url = Some(url);
        }
        apply(&mut cfg.notifications_timeout_ms, lookup("VIGIL_NOTIFICATIONS_TIMEOUT_MS"));

        apply(&mut cfg.persistence_mode, lookup("VIGIL_PERSISTENCE_MODE"));

        apply(&mut cfg.store_retry_attempts, lookup("VIGIL_STORE_RETRY_ATTEMPTS"));
        apply(&mut cfg.store_retry_backoff_ms, lookup("VIGIL_STORE_RETRY_BACKOFF_MS"));
        apply(&mut cfg.breaker_failure_rate, lookup("VIGIL_BREAKER_FAILURE_RATE"));
        apply(&mut cfg.breaker_window, lookup("VIGIL_BREAKER_WINDOW"));
        apply(&mut cfg.breaker_min_calls, lookup("VIGIL_BREAKER_MIN_CALLS"));
        apply(&mut cfg.breaker_open_secs, lookup("VIGIL_BREAKER_OPEN_SECS"));
        apply(&mut cfg.breaker_half_open_calls, lookup("VIGIL_BREAKER_HALF_OPEN_CALLS"));

        cfg
    }

    pub fn probe_interval(&self) -> Duration {
        Duration::from_millis(self.probe_interval_ms.max(1))
    }

    pub fn tcp_timeout(&self) -> Duration {
        Duration::from_millis(self.tcp_timeout_ms)
    }

    pub fn tcp_refused_log_window(&self) -> Duration {
        Duration::from_secs(self.tcp_refused_log_window_secs)
    }

    pub fn tcp_retry(&self) -> RetryPolicy {
        RetryPolicy::default().with_attempts(self.tcp_retry_attempts)
    }

    pub fn icmp_timeout(&self) -> Duration {
        Duration::from_millis(self.icmp_timeout_ms)
    }

    pub fn pool_config(&self) -> WorkerPoolConfig {
        WorkerPoolConfig {
            core_size: self.pool_core_size,
            max_size: self.pool_max_size,
            queue_capacity: self.pool_queue_capacity,
        }
    }

    pub fn pool_shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.pool_shutdown_grace_secs)
    }

    pub fn leader_lease(&self) -> Duration {
        Duration::from_secs(self.leader_lease_secs.max(1))
    }

    pub fn notifications_timeout(&self) -> Duration {
        Duration::from_millis(self.notifications_timeout_ms)
    }

    /// Retry and breaker settings for the probe result store.
    pub fn store_resilience(&self) -> ResilienceConfig {
        ResilienceConfig {
            retry: RetryPolicy::default()
                .with_attempts(self.store_retry_attempts)
                .with_backoff(Duration::from_millis(self.store_retry_backoff_ms)),
            breaker: CircuitBreakerConfig {
                failure_rate_threshold: self.breaker_failure_rate,
                sliding_window_size: self.breaker_window,
                minimum_calls: self.breaker_min_calls,
                open_duration: Duration::from_secs(self.breaker_open_secs),
                half_open_calls: self.breaker_half_open_calls,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_default_config() {
        let cfg = ServerConfig::default();
        assert_eq!(cfg.http_port, 8080);
        assert_eq!(cfg.db_path, "vigil.db");
        assert_eq!(cfg.probe_interval(), Duration::from_secs(1));
        assert_eq!(cfg.persistence_mode, PersistenceMode::Sync);
        assert!(!cfg.leader_election_enabled);
        assert_eq!(cfg.leader_lock_key, "vigil:leader-election:lock");
        assert_eq!(cfg.pool_config(), WorkerPoolConfig::default());
        assert_eq!(cfg.store_resilience(), ResilienceConfig::default());
    }

    #[test]
    fn test_overrides() {
        let cfg = ServerConfig::from_lookup(lookup(&[
            ("VIGIL_HTTP_PORT", "9090"),
            ("VIGIL_DB_PATH", "/var/lib/vigil/probes.db"),
            ("VIGIL_LEADER_ELECTION_ENABLED", "true"),
            ("VIGIL_PERSISTENCE_MODE", "listener"),
            ("VIGIL_NOTIFICATIONS_DEFAULT_WEBHOOK_URL", "http://hooks.local/vigil"),
            ("VIGIL_POOL_MAX_SIZE", "16"),
            ("VIGIL_BREAKER_OPEN_SECS", "5"),
        ]));
        assert_eq!(cfg.http_port, 9090);
        assert_eq!(cfg.db_path, "/var/lib/vigil/probes.db");
        assert!(cfg.leader_election_enabled);
        assert_eq!(cfg.persistence_mode, PersistenceMode::Listener);
        assert_eq!(
            cfg.notifications_default_webhook_url.as_deref(),
            Some("http://hooks.local/vigil")
        );
        assert_eq!(cfg.pool_config().max_size, 16);
        assert_eq!(cfg.store_resilience().breaker.open_duration, Duration::from_secs(5));
    }

    #[test]
    fn test_unparsable_values_keep_defaults() {
        let cfg = ServerConfig::from_lookup(lookup(&[
            ("VIGIL_HTTP_PORT", "eighty"),
            ("VIGIL_PERSISTENCE_MODE", "async"),
            ("VIGIL_TCP_RETRY_ATTEMPTS", "-1"),
            ("VIGIL_NOTIFICATIONS_DEFAULT_WEBHOOK_URL", "  "),
        ]));
        assert_eq!(cfg.http_port, 8080);
        assert_eq!(cfg.persistence_mode, PersistenceMode::Sync);
        assert_eq!(cfg.tcp_retry_attempts, 3);
        assert!(cfg.notifications_default_webhook_url.is_none());
    }
}
