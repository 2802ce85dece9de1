//! Reachability prober.
//!
//! Two sequential checks per host: a raw TCP connect under the host's
//! connect timeout, then a full SSH handshake plus a probe command under a
//! fixed secondary deadline. The distinction the statuses draw:
//!
//! * TCP refused/unresolvable  → `unreachable`, `ssh_available = false`
//! * TCP or handshake deadline → `timeout`
//! * auth rejected             → `auth-failed`
//! * probe command exits != 0  → `success` (reachable), `ssh_available = false`
//! * probe command exits 0     → `success`, `ssh_available = true`

use std::time::Duration;

use async_trait::async_trait;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::debug;

use crate::errors::{ErrorCode, StructuredError};
use crate::executor::ssh::CommandOperation;
use crate::executor::{CancelToken, HostOperation};
use crate::protocol::{
    CommandResult, ConnectionConfig, ExecutionStatus, ProbeResult, Timer,
};

/// Command used to confirm the SSH layer end to end.
const PROBE_COMMAND: &str = "echo connectivity_test";

/// Secondary deadline for the SSH-layer check.
const PROBE_COMMAND_TIMEOUT: Duration = Duration::from_secs(5);

/// Per-host reachability check.
pub struct ProbeOperation;

#[async_trait]
impl HostOperation for ProbeOperation {
    type Output = ProbeResult;

    async fn run(&self, config: &ConnectionConfig, cancel: &CancelToken) -> ProbeResult {
        let timer = Timer::start();

        // Phase 1: raw TCP connect.
        match timeout(
            config.connect_timeout,
            TcpStream::connect((config.host.as_str(), config.port)),
        )
        .await
        {
            Err(_) => {
                return finish(
                    config,
                    &timer,
                    ExecutionStatus::Timeout,
                    false,
                    Some(
                        StructuredError::new(
                            ErrorCode::CONNECT_TIMEOUT,
                            format!(
                                "connect timeout after {:.1}s",
                                config.connect_timeout.as_secs_f64()
                            ),
                        )
                        .with_host(&config.name)
                        .user_message(),
                    ),
                );
            }
            Ok(Err(err)) => {
                return finish(
                    config,
                    &timer,
                    ExecutionStatus::Unreachable,
                    false,
                    Some(
                        StructuredError::new(
                            ErrorCode::CONNECT_FAILED,
                            format!("connection failed: {}", err),
                        )
                        .with_host(&config.name)
                        .user_message(),
                    ),
                );
            }
            Ok(Ok(stream)) => drop(stream),
        }
        debug!(host = %config.name, "tcp reachable, probing ssh layer");

        // Phase 2: SSH handshake, auth and the probe command under the
        // secondary deadline.
        let mut probe_config = config.clone();
        probe_config.command_timeout = PROBE_COMMAND_TIMEOUT;
        let command = CommandOperation {
            command: PROBE_COMMAND.to_string(),
            needs_pty: false,
            apply_sudo: false,
        };
        let command_result = command.run(&probe_config, cancel).await;

        let (status, ssh_available, error) = classify(&command_result);
        finish(config, &timer, status, ssh_available, error)
    }

    fn cancelled_output(&self, config: &ConnectionConfig) -> ProbeResult {
        finish(
            config,
            &Timer::start(),
            ExecutionStatus::Cancelled,
            false,
            Some(
                StructuredError::new(ErrorCode::CANCELLED, "cancelled before completion")
                    .with_host(&config.name)
                    .user_message(),
            ),
        )
    }

    fn failure_output(&self, host: &str, message: String) -> ProbeResult {
        ProbeResult {
            host: host.to_string(),
            port: 0,
            status: ExecutionStatus::Error,
            error: Some(message),
            timing: Timer::start().finish(),
            response_time_ms: 0,
            ssh_available: false,
        }
    }
}

/// Maps the probe command's outcome onto probe semantics: a non-zero exit
/// still proves the host reachable, it just flags the SSH layer as not
/// fully usable.
fn classify(result: &CommandResult) -> (ExecutionStatus, bool, Option<String>) {
    match result.status {
        ExecutionStatus::Success => (ExecutionStatus::Success, true, None),
        ExecutionStatus::Failed => (
            ExecutionStatus::Success,
            false,
            Some("ssh connection established but command execution failed".to_string()),
        ),
        other => (other, false, result.error.clone()),
    }
}

fn finish(
    config: &ConnectionConfig,
    timer: &Timer,
    status: ExecutionStatus,
    ssh_available: bool,
    error: Option<String>,
) -> ProbeResult {
    let timing = timer.finish();
    let response_time_ms = timing.duration_ms;
    ProbeResult {
        host: config.host.clone(),
        port: config.port,
        status,
        error,
        timing,
        response_time_ms,
        ssh_available,
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Host;

    fn config(addr: &str, port: u16, connect_timeout: f64) -> ConnectionConfig {
        let host: Host = serde_json::from_value(serde_json::json!({
            "host": addr,
            "port": port,
            "connect_timeout": connect_timeout,
        }))
        .unwrap();
        host.connection_config(None, None, None)
    }

    fn command_result(status: ExecutionStatus, exit_code: Option<i32>) -> CommandResult {
        CommandResult {
            host: "10.0.0.1".to_string(),
            port: 22,
            status,
            error: None,
            timing: Timer::start().finish(),
            stdout: String::new(),
            stderr: String::new(),
            exit_code,
        }
    }

    #[test]
    fn test_classify_success() {
        let (status, ssh_available, error) =
            classify(&command_result(ExecutionStatus::Success, Some(0)));
        assert_eq!(status, ExecutionStatus::Success);
        assert!(ssh_available);
        assert!(error.is_none());
    }

    #[test]
    fn test_classify_non_zero_exit_is_still_reachable() {
        let (status, ssh_available, error) =
            classify(&command_result(ExecutionStatus::Failed, Some(2)));
        assert_eq!(status, ExecutionStatus::Success);
        assert!(!ssh_available);
        assert!(error.unwrap().contains("command execution failed"));
    }

    #[test]
    fn test_classify_auth_failure_passes_through() {
        let (status, ssh_available, _) =
            classify(&command_result(ExecutionStatus::AuthFailed, None));
        assert_eq!(status, ExecutionStatus::AuthFailed);
        assert!(!ssh_available);
    }

    #[tokio::test]
    async fn test_probe_refused_port_is_unreachable() {
        // Bind a port, learn it, then drop the listener so connects are
        // refused deterministically.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let probe = ProbeOperation;
        let result = probe
            .run(&config("127.0.0.1", port, 2.0), &CancelToken::new())
            .await;

        assert_eq!(result.status, ExecutionStatus::Unreachable);
        assert!(!result.ssh_available);
        assert!(result.error.unwrap().contains("E2002"));
    }
}
