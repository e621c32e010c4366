//! TCP connect probe.

use async_trait::async_trait;
use chrono::Utc;
use std::io::ErrorKind;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{lookup_host, TcpStream};
use tokio::time::Instant;

use super::{ProbeError, ProbeStrategy};
use crate::db::{ProbeMethod, ProbeRequest, ProbeResult};
use crate::logging::LogRateLimiter;
use crate::resilience::RetryPolicy;

pub const DEFAULT_TCP_TIMEOUT: Duration = Duration::from_millis(1000);

/// Opens a connection and reports how long establishing it took.
#[async_trait]
pub trait TcpConnector: Send + Sync {
    async fn connect(&self, host: &str, port: u16) -> Result<Duration, ProbeError>;
}

/// Resolves the host and connects over the OS socket stack.
pub struct SocketConnector;

#[async_trait]
impl TcpConnector for SocketConnector {
    async fn connect(&self, host: &str, port: u16) -> Result<Duration, ProbeError> {
        let addr = lookup_host((host, port))
            .await
            .map_err(|_| ProbeError::UnknownHost)?
            .next()
            .ok_or(ProbeError::UnknownHost)?;

        let start = Instant::now();
        let stream = TcpStream::connect(addr).await.map_err(|e| match e.kind() {
            ErrorKind::ConnectionRefused => ProbeError::Refused,
            ErrorKind::TimedOut => ProbeError::Timeout,
            _ => ProbeError::Io(e.to_string()),
        })?;
        let elapsed = start.elapsed();
        drop(stream);
        Ok(elapsed)
    }
}

pub struct TcpProbeStrategy {
    timeout: Duration,
    retry: RetryPolicy,
    refused_log: LogRateLimiter,
    connector: Arc<dyn TcpConnector>,
}

impl TcpProbeStrategy {
    pub fn new(timeout: Duration, retry: RetryPolicy, refused_log_window: Duration) -> Self {
        Self {
            timeout,
            retry,
            refused_log: LogRateLimiter::new(refused_log_window),
            connector: Arc::new(SocketConnector),
        }
    }

    pub fn with_connector(mut self, connector: Arc<dyn TcpConnector>) -> Self {
        self.connector = connector;
        self
    }

    /// One connection attempt bounded by `timeout`.
    async fn connect_once(&self, host: &str, port: u16, timeout: Duration) -> Result<Duration, ProbeError> {
        match tokio::time::timeout(timeout, self.connector.connect(host, port)).await {
            Ok(result) => result,
            Err(_) => Err(ProbeError::Timeout),
        }
    }
}

impl Default for TcpProbeStrategy {
    fn default() -> Self {
        Self::new(DEFAULT_TCP_TIMEOUT, RetryPolicy::default(), Duration::from_secs(30))
    }
}

#[async_trait]
impl ProbeStrategy for TcpProbeStrategy {
    fn method(&self) -> ProbeMethod {
        ProbeMethod::Tcp
    }

    async fn probe(&self, request: &ProbeRequest) -> Result<ProbeResult, ProbeError> {
        let started = Utc::now();
        let timeout = request.timeout.unwrap_or(self.timeout);
        let host = request.host.as_str();

        let outcome = self
            .retry
            .run_if(
                "tcp-connect",
                || self.connect_once(host, request.port, timeout),
                ProbeError::is_transient,
            )
            .await;

        let result = match outcome {
            Ok(latency) => {
                tracing::debug!(
                    host,
                    port = request.port,
                    latency_ms = latency.as_millis() as u64,
                    "TCP probe succeeded"
                );
                ProbeResult::up(request, ProbeMethod::Tcp, started, Some(latency.as_millis() as u64))
            }
            Err(ProbeError::Refused) => {
                let key = format!("{}:{}", host, request.port);
                if self.refused_log.should_log(&key) {
                    tracing::warn!(host, port = request.port, "TCP probe failed: connection refused");
                }
                ProbeResult::down(request, ProbeMethod::Tcp, started, ProbeError::Refused.to_string())
            }
            Err(e) => {
                tracing::warn!(host, port = request.port, error = %e, "TCP probe failed");
                ProbeResult::down(request, ProbeMethod::Tcp, started, e.to_string())
            }
        };

        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::ProbeStatus;
    use tokio::net::TcpListener;

    fn request(host: &str, port: u16) -> ProbeRequest {
        ProbeRequest {
            target_id: "t-1".to_string(),
            host: host.to_string(),
            port,
            probe_cycle_id: "cycle-1".to_string(),
            timeout: None,
        }
    }

    fn strategy() -> TcpProbeStrategy {
        TcpProbeStrategy::new(
            DEFAULT_TCP_TIMEOUT,
            RetryPolicy::none(),
            Duration::from_secs(30),
        )
    }

    #[tokio::test]
    async fn test_open_port_is_up() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let _ = listener.accept().await;
        });

        let result = strategy().probe(&request("127.0.0.1", port)).await.unwrap();
        assert_eq!(result.status, ProbeStatus::Up);
        assert!(result.latency_ms.is_some());
        assert!(result.error_message.is_none());
        assert_eq!(result.method, ProbeMethod::Tcp);
        assert_eq!(result.probe_cycle_id, "cycle-1");
    }

    #[tokio::test]
    async fn test_closed_port_is_refused() {
        let port = {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap().port()
        };

        let result = strategy().probe(&request("127.0.0.1", port)).await.unwrap();
        assert_eq!(result.status, ProbeStatus::Down);
        assert!(result.latency_ms.is_none());
        assert_eq!(result.error_message.as_deref(), Some("connection refused"));
    }

    #[tokio::test]
    async fn test_unresolvable_host() {
        let result = strategy()
            .probe(&request("no-such-host.invalid", 80))
            .await
            .unwrap();
        assert_eq!(result.status, ProbeStatus::Down);
        assert_eq!(result.error_message.as_deref(), Some("unknown host"));
    }

    /// Never completes, like a peer that silently drops SYNs.
    struct Blackhole;

    #[async_trait]
    impl TcpConnector for Blackhole {
        async fn connect(&self, _host: &str, _port: u16) -> Result<Duration, ProbeError> {
            std::future::pending().await
        }
    }

    fn blackholed(timeout: Duration) -> TcpProbeStrategy {
        TcpProbeStrategy::new(timeout, RetryPolicy::none(), Duration::from_secs(30))
            .with_connector(Arc::new(Blackhole))
    }

    #[tokio::test(start_paused = true)]
    async fn test_unanswered_connect_times_out() {
        let started = Instant::now();
        let result = blackholed(DEFAULT_TCP_TIMEOUT)
            .probe(&request("10.255.255.1", 81))
            .await
            .unwrap();

        assert_eq!(result.status, ProbeStatus::Down);
        assert!(result.latency_ms.is_none());
        assert_eq!(result.error_message.as_deref(), Some("connection timed out"));
        let elapsed = started.elapsed();
        assert!(elapsed >= DEFAULT_TCP_TIMEOUT);
        assert!(elapsed < DEFAULT_TCP_TIMEOUT + Duration::from_millis(50));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_override_is_used() {
        let mut req = request("10.255.255.1", 81);
        req.timeout = Some(Duration::from_millis(200));

        let started = Instant::now();
        let result = blackholed(DEFAULT_TCP_TIMEOUT).probe(&req).await.unwrap();

        assert_eq!(result.error_message.as_deref(), Some("connection timed out"));
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_millis(200));
        assert!(elapsed < Duration::from_millis(250));
    }
}
