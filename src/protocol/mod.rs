//! Core data structures: host records, connection configs, statuses and
//! per-operation result records.
//!
//! Everything the engine consumes or produces lives here. Host records come
//! in from the inventory, get narrowed by the selector, and are turned into
//! one short-lived [`ConnectionConfig`] per target per invocation. Each
//! dispatched target yields exactly one result record; a run's records are
//! collected into a [`RunReport`].
//!
//! Type hierarchy:
//!
//! ```text
//! Host  ──►  ConnectionConfig  ──►  CommandResult │ TransferResult │ ProbeResult
//!                                          │
//!                                          ▼
//!                              RunReport (summary + records)
//! ```

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::errors::{ErrorCode, StructuredError};

/// Default SSH port when the inventory omits one.
pub const DEFAULT_PORT: u16 = 22;

/// Default TCP connect timeout in seconds.
pub const DEFAULT_CONNECT_TIMEOUT: f64 = 10.0;

/// Default remote command timeout in seconds.
pub const DEFAULT_COMMAND_TIMEOUT: f64 = 30.0;

// ============================================================================
// STATUS TAXONOMY
// ============================================================================

/// Closed status set shared by every operation kind.
///
/// The distinctions matter operationally: `unreachable` and `timeout` point
/// at the network, `auth-failed` at credentials, `failed-nonzero-exit` at
/// the remote command itself, `error` at everything else in the transport,
/// `cancelled` at stop-on-error propagation. The serialized spellings are
/// wire format — external consumers key off them — and must not change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ExecutionStatus {
    /// Queued, not yet dispatched.
    Pending,
    /// Session in progress.
    Running,
    /// Operation completed; for commands, exit code 0.
    Success,
    /// Remote command exited non-zero.
    #[serde(rename = "failed-nonzero-exit")]
    Failed,
    /// Connect or command deadline exceeded.
    Timeout,
    /// Server rejected authentication.
    AuthFailed,
    /// TCP connect refused or host unresolvable.
    Unreachable,
    /// Any other transport or IO fault.
    Error,
    /// Cancelled before or during execution.
    Cancelled,
}

impl ExecutionStatus {
    /// Statuses worth another connection attempt. A non-zero exit is a
    /// deliberate remote answer and is never retried.
    pub fn is_retryable(self) -> bool {
        matches!(
            self,
            Self::Timeout | Self::AuthFailed | Self::Unreachable | Self::Error
        )
    }

    pub fn is_success(self) -> bool {
        self == Self::Success
    }
}

impl std::fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Success => "success",
            Self::Failed => "failed-nonzero-exit",
            Self::Timeout => "timeout",
            Self::AuthFailed => "auth-failed",
            Self::Unreachable => "unreachable",
            Self::Error => "error",
            Self::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// Direction of an SFTP transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransferDirection {
    Upload,
    Download,
}

// ============================================================================
// HOST RECORD
// ============================================================================

/// One reachable endpoint from the inventory.
///
/// Immutable once constructed; the scheduler and the drivers only ever read
/// it. Credentials: inline `private_key` takes precedence over
/// `private_key_path`, key auth over password auth.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Host {
    /// Display name for logs and reports; defaults to `user@host:port`.
    #[serde(default)]
    pub name: Option<String>,

    /// Hostname or IPv4 address.
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,

    #[serde(default = "default_username")]
    pub username: String,

    #[serde(default)]
    pub password: Option<String>,

    /// Inline PEM private key material.
    #[serde(default)]
    pub private_key: Option<String>,

    /// Path to a private key file.
    #[serde(default)]
    pub private_key_path: Option<PathBuf>,

    #[serde(default)]
    pub passphrase: Option<String>,

    /// Whether commands on this host should run under sudo.
    #[serde(default)]
    pub sudo: bool,

    /// TCP connect timeout in seconds.
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout: f64,

    /// Remote command timeout in seconds.
    #[serde(default = "default_command_timeout")]
    pub command_timeout: f64,

    /// Environment exported into the remote session (`export K='V';`).
    #[serde(default)]
    pub env: HashMap<String, String>,

    /// Labels driving the label-predicate selector.
    #[serde(default)]
    pub labels: HashMap<String, String>,
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

fn default_username() -> String {
    "root".to_string()
}

fn default_connect_timeout() -> f64 {
    DEFAULT_CONNECT_TIMEOUT
}

fn default_command_timeout() -> f64 {
    DEFAULT_COMMAND_TIMEOUT
}

impl Host {
    /// Explicit name, or `user@host:port`.
    pub fn display_name(&self) -> String {
        match &self.name {
            Some(name) if !name.is_empty() => name.clone(),
            _ => format!("{}@{}:{}", self.username, self.host, self.port),
        }
    }

    /// Derives the runtime connection parameters for one invocation.
    ///
    /// CLI-level timeout overrides win over the per-host values.
    pub fn connection_config(
        &self,
        known_hosts: Option<PathBuf>,
        connect_timeout_override: Option<f64>,
        command_timeout_override: Option<f64>,
    ) -> ConnectionConfig {
        ConnectionConfig {
            name: self.display_name(),
            host: self.host.clone(),
            port: self.port,
            username: self.username.clone(),
            password: self.password.clone(),
            private_key: self.private_key.clone(),
            private_key_path: self.private_key_path.clone(),
            passphrase: self.passphrase.clone(),
            env: self.env.clone(),
            known_hosts,
            connect_timeout: Duration::from_secs_f64(
                connect_timeout_override.unwrap_or(self.connect_timeout),
            ),
            command_timeout: Duration::from_secs_f64(
                command_timeout_override.unwrap_or(self.command_timeout),
            ),
        }
    }
}

/// Runtime connection parameters for a single target in a single invocation.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Display name, used as log context only.
    pub name: String,
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: Option<String>,
    pub private_key: Option<String>,
    pub private_key_path: Option<PathBuf>,
    pub passphrase: Option<String>,
    pub env: HashMap<String, String>,
    /// Known-hosts record file; `None` disables recording (accept all).
    pub known_hosts: Option<PathBuf>,
    pub connect_timeout: Duration,
    pub command_timeout: Duration,
}

// ============================================================================
// TIMING
// ============================================================================

/// Wall-clock bracket common to every result record.
///
/// `finished_at` is derived from `started_at` plus a monotonic elapsed
/// reading, so `duration_ms == finished_at - started_at` holds exactly at
/// millisecond precision even if the system clock steps mid-run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Timing {
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub duration_ms: u64,
}

/// Start-time capture: one wall-clock read plus one monotonic origin.
#[derive(Debug, Clone)]
pub struct Timer {
    started_at: DateTime<Utc>,
    origin: Instant,
}

impl Timer {
    pub fn start() -> Self {
        Self {
            started_at: Utc::now(),
            origin: Instant::now(),
        }
    }

    pub fn finish(&self) -> Timing {
        let duration_ms = self.origin.elapsed().as_millis() as u64;
        Timing {
            started_at: self.started_at,
            finished_at: self.started_at + chrono::Duration::milliseconds(duration_ms as i64),
            duration_ms,
        }
    }
}

impl Default for Timer {
    fn default() -> Self {
        Self::start()
    }
}

// ============================================================================
// RESULT RECORDS
// ============================================================================

/// Accessors the scheduler needs from any result kind.
pub trait TaskResult: Send + 'static {
    fn host(&self) -> &str;
    fn status(&self) -> ExecutionStatus;
    fn error(&self) -> Option<&str>;
}

/// Outcome of one remote command on one host.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandResult {
    pub host: String,
    pub port: u16,
    pub status: ExecutionStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(flatten)]
    pub timing: Timing,
    /// Complete lines joined by `\n`.
    pub stdout: String,
    pub stderr: String,
    /// `None` when the channel closed without reporting a status.
    pub exit_code: Option<i32>,
}

impl CommandResult {
    /// Record for a task cancelled before (or while) producing output.
    pub fn cancelled(config: &ConnectionConfig, timer: &Timer) -> Self {
        Self {
            host: config.host.clone(),
            port: config.port,
            status: ExecutionStatus::Cancelled,
            error: Some(
                StructuredError::new(ErrorCode::CANCELLED, "cancelled before completion")
                    .with_host(&config.name)
                    .user_message(),
            ),
            timing: timer.finish(),
            stdout: String::new(),
            stderr: String::new(),
            exit_code: None,
        }
    }

    /// Record for a fault that produced no session at all.
    pub fn fault(
        config: &ConnectionConfig,
        timer: &Timer,
        status: ExecutionStatus,
        error: StructuredError,
    ) -> Self {
        Self {
            host: config.host.clone(),
            port: config.port,
            status,
            error: Some(error.user_message()),
            timing: timer.finish(),
            stdout: String::new(),
            stderr: String::new(),
            exit_code: None,
        }
    }
}

impl TaskResult for CommandResult {
    fn host(&self) -> &str {
        &self.host
    }

    fn status(&self) -> ExecutionStatus {
        self.status
    }

    fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }
}

/// Outcome of one SFTP upload or download on one host.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferResult {
    pub host: String,
    pub port: u16,
    pub status: ExecutionStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(flatten)]
    pub timing: Timing,
    pub direction: TransferDirection,
    pub local_path: String,
    pub remote_path: String,
    pub bytes_transferred: u64,
}

impl TransferResult {
    pub fn fault(
        config: &ConnectionConfig,
        timer: &Timer,
        direction: TransferDirection,
        local_path: String,
        remote_path: String,
        status: ExecutionStatus,
        error: Option<StructuredError>,
    ) -> Self {
        Self {
            host: config.host.clone(),
            port: config.port,
            status,
            error: error.map(|e| e.user_message()),
            timing: timer.finish(),
            direction,
            local_path,
            remote_path,
            bytes_transferred: 0,
        }
    }
}

impl TaskResult for TransferResult {
    fn host(&self) -> &str {
        &self.host
    }

    fn status(&self) -> ExecutionStatus {
        self.status
    }

    fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }
}

/// Outcome of one reachability probe on one host.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProbeResult {
    pub host: String,
    pub port: u16,
    pub status: ExecutionStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(flatten)]
    pub timing: Timing,
    /// Total elapsed time of both probe phases.
    pub response_time_ms: u64,
    /// True only when the SSH layer answered the probe command with exit 0.
    pub ssh_available: bool,
}

impl TaskResult for ProbeResult {
    fn host(&self) -> &str {
        &self.host
    }

    fn status(&self) -> ExecutionStatus {
        self.status
    }

    fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }
}

// ============================================================================
// RUN REPORT
// ============================================================================

/// Final report for one invocation, serialised to stdout or a file.
#[derive(Debug, Serialize)]
pub struct RunReport<R: Serialize> {
    /// UUID of this invocation, for cross-referencing logs and traces.
    pub execution_id: String,
    /// "success" iff every record succeeded.
    pub status: String,
    pub started_at: String,
    pub finished_at: String,
    pub summary: RunSummary,
    pub results: Vec<R>,
}

impl<R: Serialize + TaskResult> RunReport<R> {
    pub fn new(
        execution_id: String,
        started_at: DateTime<Utc>,
        finished_at: DateTime<Utc>,
        results: Vec<R>,
    ) -> Self {
        let summary = RunSummary::from_results(
            results.iter().map(|r| r.status()),
            (finished_at - started_at).num_milliseconds().max(0) as u64,
        );
        let status = if summary.total == summary.succeeded {
            "success"
        } else {
            "failed"
        };
        Self {
            execution_id,
            status: status.to_string(),
            started_at: started_at.to_rfc3339(),
            finished_at: finished_at.to_rfc3339(),
            summary,
            results,
        }
    }
}

/// Per-status counts for dashboards and exit-code decisions.
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub total: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub timed_out: usize,
    pub auth_failed: usize,
    pub unreachable: usize,
    pub errors: usize,
    pub cancelled: usize,
    pub duration_ms: u64,
}

impl RunSummary {
    pub fn from_results(statuses: impl Iterator<Item = ExecutionStatus>, duration_ms: u64) -> Self {
        let mut summary = Self {
            total: 0,
            succeeded: 0,
            failed: 0,
            timed_out: 0,
            auth_failed: 0,
            unreachable: 0,
            errors: 0,
            cancelled: 0,
            duration_ms,
        };
        for status in statuses {
            summary.total += 1;
            match status {
                ExecutionStatus::Success => summary.succeeded += 1,
                ExecutionStatus::Failed => summary.failed += 1,
                ExecutionStatus::Timeout => summary.timed_out += 1,
                ExecutionStatus::AuthFailed => summary.auth_failed += 1,
                ExecutionStatus::Unreachable => summary.unreachable += 1,
                ExecutionStatus::Cancelled => summary.cancelled += 1,
                ExecutionStatus::Error
                | ExecutionStatus::Pending
                | ExecutionStatus::Running => summary.errors += 1,
            }
        }
        summary
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_host() -> Host {
        serde_json::from_value(serde_json::json!({
            "host": "192.168.1.10",
            "username": "deploy"
        }))
        .expect("valid host json")
    }

    #[test]
    fn test_host_defaults() {
        let host = sample_host();
        assert_eq!(host.port, 22);
        assert_eq!(host.username, "deploy");
        assert_eq!(host.connect_timeout, 10.0);
        assert_eq!(host.command_timeout, 30.0);
        assert!(!host.sudo);
        assert!(host.labels.is_empty());
    }

    #[test]
    fn test_display_name_defaults_to_endpoint() {
        let host = sample_host();
        assert_eq!(host.display_name(), "deploy@192.168.1.10:22");

        let mut named = sample_host();
        named.name = Some("web-1".to_string());
        assert_eq!(named.display_name(), "web-1");
    }

    #[test]
    fn test_connection_config_overrides() {
        let host = sample_host();
        let config = host.connection_config(None, Some(3.0), None);
        assert_eq!(config.connect_timeout, Duration::from_secs(3));
        assert_eq!(config.command_timeout, Duration::from_secs(30));
    }

    #[test]
    fn test_status_serde_values() {
        assert_eq!(
            serde_json::to_string(&ExecutionStatus::AuthFailed).unwrap(),
            "\"auth-failed\""
        );
        assert_eq!(
            serde_json::to_string(&ExecutionStatus::Failed).unwrap(),
            "\"failed-nonzero-exit\""
        );
        assert_eq!(
            serde_json::to_string(&ExecutionStatus::Unreachable).unwrap(),
            "\"unreachable\""
        );
        let parsed: ExecutionStatus = serde_json::from_str("\"cancelled\"").unwrap();
        assert_eq!(parsed, ExecutionStatus::Cancelled);
        let parsed: ExecutionStatus = serde_json::from_str("\"failed-nonzero-exit\"").unwrap();
        assert_eq!(parsed, ExecutionStatus::Failed);
    }

    #[test]
    fn test_status_display_matches_wire_spelling() {
        assert_eq!(ExecutionStatus::Failed.to_string(), "failed-nonzero-exit");
        assert_eq!(ExecutionStatus::AuthFailed.to_string(), "auth-failed");
        assert_eq!(ExecutionStatus::Success.to_string(), "success");
    }

    #[test]
    fn test_retryable_statuses() {
        assert!(ExecutionStatus::Timeout.is_retryable());
        assert!(ExecutionStatus::Unreachable.is_retryable());
        assert!(ExecutionStatus::AuthFailed.is_retryable());
        assert!(ExecutionStatus::Error.is_retryable());
        assert!(!ExecutionStatus::Failed.is_retryable());
        assert!(!ExecutionStatus::Success.is_retryable());
        assert!(!ExecutionStatus::Cancelled.is_retryable());
    }

    #[test]
    fn test_timer_invariants() {
        let timer = Timer::start();
        std::thread::sleep(Duration::from_millis(5));
        let timing = timer.finish();

        assert!(timing.started_at <= timing.finished_at);
        assert_eq!(
            (timing.finished_at - timing.started_at).num_milliseconds() as u64,
            timing.duration_ms
        );
        assert!(timing.duration_ms >= 5);
    }

    #[test]
    fn test_summary_counts() {
        let statuses = vec![
            ExecutionStatus::Success,
            ExecutionStatus::Success,
            ExecutionStatus::Failed,
            ExecutionStatus::Timeout,
            ExecutionStatus::Cancelled,
        ];
        let summary = RunSummary::from_results(statuses.into_iter(), 1200);

        assert_eq!(summary.total, 5);
        assert_eq!(summary.succeeded, 2);
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.timed_out, 1);
        assert_eq!(summary.cancelled, 1);
        assert_eq!(summary.duration_ms, 1200);
    }

    #[test]
    fn test_report_status_reflects_failures() {
        let config = sample_host().connection_config(None, None, None);
        let timer = Timer::start();
        let results = vec![CommandResult::cancelled(&config, &timer)];
        let report = RunReport::new(
            "exec-1".to_string(),
            Utc::now(),
            Utc::now(),
            results,
        );
        assert_eq!(report.status, "failed");
        assert_eq!(report.summary.cancelled, 1);
    }
}
