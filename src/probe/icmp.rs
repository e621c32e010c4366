//! ICMP probe via the system `ping` command.

use async_trait::async_trait;
use chrono::Utc;
use regex::Regex;
use std::process::Stdio;
use std::sync::OnceLock;
use std::time::Duration;
use tokio::process::Command;

use super::{ProbeError, ProbeStrategy};
use crate::db::{ProbeMethod, ProbeRequest, ProbeResult};

pub const DEFAULT_ICMP_TIMEOUT: Duration = Duration::from_millis(2000);
pub const DEFAULT_PACKET_SIZE: u32 = 32;

pub struct IcmpProbeStrategy {
    timeout: Duration,
    packet_size: u32,
}

impl IcmpProbeStrategy {
    pub fn new(timeout: Duration, packet_size: u32) -> Self {
        Self {
            timeout,
            packet_size,
        }
    }
}

impl Default for IcmpProbeStrategy {
    fn default() -> Self {
        Self::new(DEFAULT_ICMP_TIMEOUT, DEFAULT_PACKET_SIZE)
    }
}

/// One-packet ping invocation for the current platform.
fn ping_command(host: &str, timeout: Duration, packet_size: u32) -> Command {
    let mut cmd = Command::new("ping");
    if cfg!(windows) {
        cmd.args([
            "-n",
            "1",
            "-w",
            &timeout.as_millis().to_string(),
            "-l",
            &packet_size.to_string(),
            host,
        ]);
    } else {
        let timeout_secs = timeout.as_secs().max(1);
        cmd.args([
            "-c",
            "1",
            "-W",
            &timeout_secs.to_string(),
            "-s",
            &packet_size.to_string(),
            host,
        ]);
    }
    cmd
}

async fn run_ping(host: &str, timeout: Duration, packet_size: u32) -> Result<Option<f64>, ProbeError> {
    let child = ping_command(host, timeout, packet_size)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| ProbeError::Io(e.to_string()))?;

    // Dropping the child on timeout kills the process.
    let output = tokio::time::timeout(timeout, child.wait_with_output())
        .await
        .map_err(|_| ProbeError::PingTimeout)?
        .map_err(|e| ProbeError::Io(e.to_string()))?;

    if !output.status.success() {
        return Err(ProbeError::PingFailed(output.status.code().unwrap_or(-1)));
    }

    let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
    text.push_str(&String::from_utf8_lossy(&output.stderr));
    Ok(parse_ping_output(&text))
}

/// Round-trip time in milliseconds from ping output, if present.
pub fn parse_ping_output(output: &str) -> Option<f64> {
    // Per-packet "time=1.23 ms" (Linux, macOS)
    static UNIX: OnceLock<Option<Regex>> = OnceLock::new();
    // Per-packet "time=1ms" or "time<1ms" (Windows)
    static WINDOWS: OnceLock<Option<Regex>> = OnceLock::new();
    // Summary "rtt min/avg/max/mdev" (Linux) or "round-trip min/avg/max/stddev" (macOS)
    static SUMMARY: OnceLock<Option<Regex>> = OnceLock::new();

    let patterns = [
        (
            UNIX.get_or_init(|| Regex::new(r"(?i)time[=<](\d+\.?\d*)\s*ms").ok()),
            1,
        ),
        (
            WINDOWS.get_or_init(|| Regex::new(r"(?i)time[=<](\d+)ms").ok()),
            1,
        ),
        (
            SUMMARY.get_or_init(|| {
                Regex::new(r"(?:rtt|round-trip)\s+min/avg/max/(?:mdev|stddev)\s*=\s*([0-9.]+)/([0-9.]+)/([0-9.]+)")
                    .ok()
            }),
            2,
        ),
    ];

    patterns.into_iter().find_map(|(re, group)| {
        re.as_ref()?
            .captures(output)?
            .get(group)?
            .as_str()
            .parse::<f64>()
            .ok()
    })
}

#[async_trait]
impl ProbeStrategy for IcmpProbeStrategy {
    fn method(&self) -> ProbeMethod {
        ProbeMethod::Icmp
    }

    async fn probe(&self, request: &ProbeRequest) -> Result<ProbeResult, ProbeError> {
        let started = Utc::now();
        let timeout = request.timeout.unwrap_or(self.timeout);

        let result = match run_ping(&request.host, timeout, self.packet_size).await {
            Ok(Some(ms)) => {
                tracing::debug!(host = %request.host, latency_ms = ms, "ICMP probe succeeded");
                ProbeResult::up(request, ProbeMethod::Icmp, started, Some(ms.round() as u64))
            }
            Ok(None) => {
                tracing::debug!(host = %request.host, "ICMP probe succeeded but latency was not reported");
                ProbeResult::up(request, ProbeMethod::Icmp, started, None)
            }
            Err(e) => {
                tracing::warn!(host = %request.host, error = %e, "ICMP probe failed");
                ProbeResult::down(request, ProbeMethod::Icmp, started, e.to_string())
            }
        };

        Ok(result)
    }
}
