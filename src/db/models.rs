//! Database model types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use uuid::Uuid;

/// Reachability outcome of a single probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ProbeStatus {
    Up,
    Down,
}

impl ProbeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProbeStatus::Up => "UP",
            ProbeStatus::Down => "DOWN",
        }
    }
}

impl fmt::Display for ProbeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProbeStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "UP" => Ok(ProbeStatus::Up),
            "DOWN" => Ok(ProbeStatus::Down),
            other => Err(format!("unknown probe status: {}", other)),
        }
    }
}

/// How a target is checked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ProbeMethod {
    #[default]
    Tcp,
    Icmp,
}

impl ProbeMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProbeMethod::Tcp => "TCP",
            ProbeMethod::Icmp => "ICMP",
        }
    }
}

impl fmt::Display for ProbeMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProbeMethod {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "TCP" => Ok(ProbeMethod::Tcp),
            "ICMP" => Ok(ProbeMethod::Icmp),
            other => Err(format!("unknown probe method: {}", other)),
        }
    }
}

/// A monitored endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Target {
    pub id: Uuid,
    pub label: String,
    pub host: String,
    pub port: u16,
    pub enabled: bool,
    /// Unset means TCP.
    pub probe_method: Option<ProbeMethod>,
    pub timeout_override_ms: Option<u64>,
}

impl Target {
    /// Create an enabled target with a fresh id.
    pub fn new(label: &str, host: &str, port: u16) -> Self {
        Self {
            id: Uuid::new_v4(),
            label: label.to_string(),
            host: host.to_string(),
            port,
            enabled: true,
            probe_method: None,
            timeout_override_ms: None,
        }
    }

    pub fn with_method(mut self, method: ProbeMethod) -> Self {
        self.probe_method = Some(method);
        self
    }

    /// Case-insensitive `host:port` key used for uniqueness checks.
    pub fn endpoint_key(&self) -> String {
        format!("{}:{}", self.host.to_lowercase(), self.port)
    }
}

/// Ephemeral input to a probe strategy.
#[derive(Debug, Clone, PartialEq)]
pub struct ProbeRequest {
    pub target_id: String,
    pub host: String,
    pub port: u16,
    pub probe_cycle_id: String,
    /// Per-target override of the strategy's default timeout.
    pub timeout: Option<Duration>,
}

impl ProbeRequest {
    pub fn for_target(target: &Target, probe_cycle_id: &str) -> Self {
        Self {
            target_id: target.id.to_string(),
            host: target.host.clone(),
            port: target.port,
            probe_cycle_id: probe_cycle_id.to_string(),
            timeout: target.timeout_override_ms.map(Duration::from_millis),
        }
    }
}

/// Outcome of one probe execution. Immutable once built.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProbeResult {
    pub timestamp: DateTime<Utc>,
    pub target_id: String,
    pub target_host: String,
    /// Only present on UP results with a measured latency.
    pub latency_ms: Option<u64>,
    pub probe_cycle_id: String,
    pub status: ProbeStatus,
    pub method: ProbeMethod,
    /// Only present on DOWN results.
    pub error_message: Option<String>,
}

impl ProbeResult {
    pub fn up(
        request: &ProbeRequest,
        method: ProbeMethod,
        started: DateTime<Utc>,
        latency_ms: Option<u64>,
    ) -> Self {
        Self {
            timestamp: started,
            target_id: request.target_id.clone(),
            target_host: request.host.clone(),
            latency_ms,
            probe_cycle_id: request.probe_cycle_id.clone(),
            status: ProbeStatus::Up,
            method,
            error_message: None,
        }
    }

    pub fn down(
        request: &ProbeRequest,
        method: ProbeMethod,
        started: DateTime<Utc>,
        error_message: impl Into<String>,
    ) -> Self {
        Self {
            timestamp: started,
            target_id: request.target_id.clone(),
            target_host: request.host.clone(),
            latency_ms: None,
            probe_cycle_id: request.probe_cycle_id.clone(),
            status: ProbeStatus::Down,
            method,
            error_message: Some(error_message.into()),
        }
    }

    /// Rewrite the cycle id if the strategy returned a stale one.
    pub fn aligned_to(self, probe_cycle_id: &str) -> Self {
        if self.probe_cycle_id == probe_cycle_id {
            return self;
        }
        Self {
            probe_cycle_id: probe_cycle_id.to_string(),
            ..self
        }
    }
}
