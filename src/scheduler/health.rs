//! Liveness of the scheduling loop.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

/// No execution for longer than this marks the scheduler DOWN.
pub const HEALTH_THRESHOLD_SECS: i64 = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HealthStatus {
    Up,
    Down,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthReport {
    pub status: HealthStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub last_execution_time: DateTime<Utc>,
    pub seconds_since_last_execution: i64,
    pub total_executions: u64,
    pub failed_executions: u64,
    pub success_rate: String,
}

pub struct SchedulerHealth {
    last_execution: Mutex<DateTime<Utc>>,
    total: AtomicU64,
    failed: AtomicU64,
}

impl Default for SchedulerHealth {
    fn default() -> Self {
        Self::new()
    }
}

impl SchedulerHealth {
    /// Starts healthy: the clock runs from construction.
    pub fn new() -> Self {
        Self::starting_at(Utc::now())
    }

    pub fn starting_at(last_execution: DateTime<Utc>) -> Self {
        Self {
            last_execution: Mutex::new(last_execution),
            total: AtomicU64::new(0),
            failed: AtomicU64::new(0),
        }
    }

    pub fn record_execution(&self) {
        if let Ok(mut last) = self.last_execution.lock() {
            *last = Utc::now();
        }
        self.total.fetch_add(1, Ordering::SeqCst);
    }

    pub fn record_failure(&self) {
        self.failed.fetch_add(1, Ordering::SeqCst);
    }

    pub fn report(&self) -> HealthReport {
        self.report_at(Utc::now())
    }

    pub fn report_at(&self, now: DateTime<Utc>) -> HealthReport {
        let last = self.last_execution.lock().map(|l| *l).unwrap_or(now);
        let since = (now - last).num_seconds();
        let total = self.total.load(Ordering::SeqCst);
        let failed = self.failed.load(Ordering::SeqCst);

        let (status, reason) = if since > HEALTH_THRESHOLD_SECS {
            (
                HealthStatus::Down,
                Some(format!("No probe execution in last {} seconds", HEALTH_THRESHOLD_SECS)),
            )
        } else {
            (HealthStatus::Up, None)
        };

        let success_rate = if total > 0 {
            format!("{:.2}%", total.saturating_sub(failed) as f64 * 100.0 / total as f64)
        } else {
            "N/A".to_string()
        };

        HealthReport {
            status,
            reason,
            last_execution_time: last,
            seconds_since_last_execution: since,
            total_executions: total,
            failed_executions: failed,
            success_rate,
        }
    }
}
