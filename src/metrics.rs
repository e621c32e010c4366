//! In-process probe and store metrics.

use serde::Serialize;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use crate::db::{ProbeMethod, ProbeStatus};

/// Count/sum/max summary of a duration series, in milliseconds.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LatencySummary {
    pub count: u64,
    pub total_ms: u64,
    pub max_ms: u64,
}

impl LatencySummary {
    fn record(&mut self, ms: u64) {
        self.count += 1;
        self.total_ms += ms;
        self.max_ms = self.max_ms.max(ms);
    }

    pub fn mean_ms(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.total_ms as f64 / self.count as f64
        }
    }
}

#[derive(Default)]
struct MetricsInner {
    executions: HashMap<(String, ProbeStatus, ProbeMethod), u64>,
    latency: HashMap<(String, ProbeMethod), LatencySummary>,
    store_operations: HashMap<(String, bool), u64>,
    store_durations: HashMap<String, LatencySummary>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionCount {
    pub target_id: String,
    pub status: ProbeStatus,
    pub method: ProbeMethod,
    pub total: u64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LatencyEntry {
    pub target_id: String,
    pub method: ProbeMethod,
    #[serde(flatten)]
    pub summary: LatencySummary,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StoreOperationCount {
    pub operation: String,
    pub status: &'static str,
    pub total: u64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsSnapshot {
    pub probe_executions: Vec<ExecutionCount>,
    pub probe_latency: Vec<LatencyEntry>,
    pub store_operations: Vec<StoreOperationCount>,
    pub store_durations: HashMap<String, LatencySummary>,
}

/// Metrics sink for probe executions and store calls.
#[derive(Default)]
pub struct ProbeMetrics {
    inner: Mutex<MetricsInner>,
}

impl ProbeMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_probe_execution(&self, target_id: &str, status: ProbeStatus, method: ProbeMethod) {
        if let Ok(mut inner) = self.inner.lock() {
            *inner
                .executions
                .entry((target_id.to_string(), status, method))
                .or_default() += 1;
        }
    }

    pub fn record_probe_latency(&self, target_id: &str, method: ProbeMethod, latency_ms: u64) {
        if let Ok(mut inner) = self.inner.lock() {
            inner
                .latency
                .entry((target_id.to_string(), method))
                .or_default()
                .record(latency_ms);
        }
    }

    pub fn record_store_operation(&self, operation: &str, success: bool, duration: Duration) {
        if let Ok(mut inner) = self.inner.lock() {
            *inner
                .store_operations
                .entry((operation.to_string(), success))
                .or_default() += 1;
            inner
                .store_durations
                .entry(operation.to_string())
                .or_default()
                .record(duration.as_millis() as u64);
        }
    }

    /// Executions for a target with the given status, across methods.
    pub fn execution_count(&self, target_id: &str, status: ProbeStatus) -> u64 {
        self.inner
            .lock()
            .map(|inner| {
                inner
                    .executions
                    .iter()
                    .filter(|((t, s, _), _)| t == target_id && *s == status)
                    .map(|(_, n)| *n)
                    .sum()
            })
            .unwrap_or(0)
    }

    pub fn store_operation_count(&self, operation: &str, success: bool) -> u64 {
        self.inner
            .lock()
            .ok()
            .and_then(|inner| inner.store_operations.get(&(operation.to_string(), success)).copied())
            .unwrap_or(0)
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let inner = match self.inner.lock() {
            Ok(inner) => inner,
            Err(poisoned) => poisoned.into_inner(),
        };

        let mut probe_executions: Vec<_> = inner
            .executions
            .iter()
            .map(|((target_id, status, method), total)| ExecutionCount {
                target_id: target_id.clone(),
                status: *status,
                method: *method,
                total: *total,
            })
            .collect();
        probe_executions.sort_by(|a, b| a.target_id.cmp(&b.target_id));

        let mut probe_latency: Vec<_> = inner
            .latency
            .iter()
            .map(|((target_id, method), summary)| LatencyEntry {
                target_id: target_id.clone(),
                method: *method,
                summary: summary.clone(),
            })
            .collect();
        probe_latency.sort_by(|a, b| a.target_id.cmp(&b.target_id));

        let store_operations = inner
            .store_operations
            .iter()
            .map(|((operation, success), total)| StoreOperationCount {
                operation: operation.clone(),
                status: if *success { "success" } else { "failure" },
                total: *total,
            })
            .collect();

        MetricsSnapshot {
            probe_executions,
            probe_latency,
            store_operations,
            store_durations: inner.store_durations.clone(),
        }
    }
}
