//! Parallel fan-out scheduler.
//!
//! One task per target host, at most `max_concurrent` active at a time
//! behind a semaphore. Each task runs a [`HostOperation`] (command,
//! transfer or probe) with a per-host retry loop; results are collected in
//! **completion order** — a caller that wants stable ordering sorts the
//! batch afterwards.
//!
//! Failure surface: the scheduler never returns an error. Driver faults
//! become result records; a panicking task is recovered into an `error`
//! record for its host. The batch always has exactly one record per input
//! target.
//!
//! Cancellation is cooperative. When `stop_on_error` trips (any non-success
//! completion), the shared [`CancelToken`] fires: tasks still queued on the
//! semaphore finalise as `cancelled` without connecting, and in-flight
//! drivers observe the token at their next suspension point and tear the
//! session down (SIGTERM, grace, SIGKILL — see [`ssh`]).

pub mod probe;
pub mod ssh;
pub mod transfer;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{Notify, Semaphore};
use tokio::task::JoinSet;
use tracing::{error, info, warn};

use crate::errors::{ErrorCode, StructuredError};
use crate::protocol::{ConnectionConfig, TaskResult};

/// Default fan-out width when the caller does not specify one.
pub const DEFAULT_MAX_CONCURRENT: usize = 50;

// ============================================================================
// CANCELLATION TOKEN
// ============================================================================

/// Shared cooperative cancellation flag.
///
/// `cancel` is sticky and may be called from any task; `cancelled` resolves
/// once the flag is set, including when it was set before the call.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    inner: Arc<CancelInner>,
}

#[derive(Debug, Default)]
struct CancelInner {
    cancelled: AtomicBool,
    notify: Notify,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.inner.cancelled.store(true, Ordering::SeqCst);
        self.inner.notify.notify_waiters();
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    /// Resolves when the token is cancelled.
    pub async fn cancelled(&self) {
        // The waiter must be registered before the flag is re-checked, or a
        // cancel between check and await would be missed.
        let mut notified = std::pin::pin!(self.inner.notify.notified());
        loop {
            notified.as_mut().enable();
            if self.is_cancelled() {
                return;
            }
            notified.as_mut().await;
            notified.set(self.inner.notify.notified());
        }
    }
}

// ============================================================================
// HOST OPERATION
// ============================================================================

/// A per-host remote operation the scheduler can fan out.
///
/// Implementations must observe the token at every await point that can
/// block for long (connects, channel reads, transfers) and must close their
/// transport on every exit path.
#[async_trait]
pub trait HostOperation: Send + Sync {
    type Output: TaskResult;

    /// Runs the operation against one host. Faults are encoded in the
    /// returned record, never panicked or bubbled.
    async fn run(&self, config: &ConnectionConfig, cancel: &CancelToken) -> Self::Output;

    /// Record for a target that was cancelled before its driver started.
    /// Carries no output.
    fn cancelled_output(&self, config: &ConnectionConfig) -> Self::Output;

    /// Record for a task the scheduler had to recover (panic or join
    /// failure).
    fn failure_output(&self, host: &str, message: String) -> Self::Output;
}

// ============================================================================
// OPTIONS
// ============================================================================

/// Scheduler policy for one run.
#[derive(Debug, Clone)]
pub struct RunOptions {
    /// Upper bound on simultaneously active tasks; clamped to at least 1.
    pub max_concurrent: usize,
    /// Total attempts per host, including the first; clamped to at least 1.
    /// Only transport-class failures retry, a non-zero exit never does.
    pub retry_count: u32,
    /// Cancel everything still pending after the first non-success result.
    pub stop_on_error: bool,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            max_concurrent: DEFAULT_MAX_CONCURRENT,
            retry_count: 1,
            stop_on_error: false,
        }
    }
}

/// `(completed_count, total_count, just_finished_result)`, invoked from the
/// completing side; must be safe to call concurrently with itself.
pub type ProgressCallback<R> = Arc<dyn Fn(usize, usize, &R) + Send + Sync>;

// ============================================================================
// FAN-OUT
// ============================================================================

/// Runs `operation` against every config, bounded by
/// `options.max_concurrent`, and returns one result per target in
/// completion order.
pub async fn run_parallel<O>(
    operation: Arc<O>,
    configs: Vec<ConnectionConfig>,
    options: RunOptions,
    progress: Option<ProgressCallback<O::Output>>,
    cancel: CancelToken,
) -> Vec<O::Output>
where
    O: HostOperation + 'static,
{
    let total = configs.len();
    let retry_count = options.retry_count.max(1);
    let semaphore = Arc::new(Semaphore::new(options.max_concurrent.max(1)));

    let mut join_set = JoinSet::new();
    let mut host_by_task: HashMap<tokio::task::Id, String> = HashMap::new();

    for config in configs {
        let semaphore = Arc::clone(&semaphore);
        let operation = Arc::clone(&operation);
        let cancel = cancel.clone();
        let host = config.host.clone();

        let handle = join_set.spawn(async move {
            // Queued tasks must stay responsive to stop-on-error: give up
            // the spot instead of waiting out a permit that may never come.
            let _permit = tokio::select! {
                permit = semaphore.acquire_owned() => permit.expect("semaphore closed"),
                _ = cancel.cancelled() => return operation.cancelled_output(&config),
            };
            if cancel.is_cancelled() {
                return operation.cancelled_output(&config);
            }

            let mut attempt = 1u32;
            loop {
                let result = operation.run(&config, &cancel).await;
                if !result.status().is_retryable()
                    || attempt >= retry_count
                    || cancel.is_cancelled()
                {
                    return result;
                }
                warn!(
                    host = %config.name,
                    "{} retry {}/{}",
                    result.error().unwrap_or("attempt failed"),
                    attempt,
                    retry_count
                );
                attempt += 1;
            }
        });
        host_by_task.insert(handle.id(), host);
    }

    let mut results = Vec::with_capacity(total);
    let mut completed = 0usize;

    while let Some(joined) = join_set.join_next_with_id().await {
        let result = match joined {
            Ok((_, result)) => result,
            Err(join_error) => {
                let host = host_by_task
                    .get(&join_error.id())
                    .cloned()
                    .unwrap_or_default();
                error!(host = %host, "host task did not complete: {}", join_error);
                operation.failure_output(
                    &host,
                    StructuredError::new(ErrorCode::TASK_PANIC, join_error.to_string())
                        .with_host(&host)
                        .user_message(),
                )
            }
        };

        completed += 1;
        if let Some(callback) = &progress {
            callback(completed, total, &result);
        }

        let trip = options.stop_on_error && !result.status().is_success();
        results.push(result);

        if trip && !cancel.is_cancelled() {
            info!(completed, total, "stop-on-error tripped, cancelling remaining tasks");
            cancel.cancel();
        }
    }

    results
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{CommandResult, ExecutionStatus, Host, Timer};
    use std::sync::atomic::AtomicU32;
    use std::time::Duration;

    /// Scripted operation: behaviour keyed by host address.
    struct StubOperation {
        attempts: AtomicU32,
        /// Attempts that must fail (with `fail_status`) before success.
        failures_before_success: u32,
        fail_status: ExecutionStatus,
        /// Hosts that report a non-zero exit.
        failing_hosts: Vec<String>,
        delay: Duration,
    }

    impl StubOperation {
        fn succeeding() -> Self {
            Self {
                attempts: AtomicU32::new(0),
                failures_before_success: 0,
                fail_status: ExecutionStatus::Error,
                failing_hosts: Vec::new(),
                delay: Duration::ZERO,
            }
        }

        fn flaky(failures: u32, status: ExecutionStatus) -> Self {
            Self {
                failures_before_success: failures,
                fail_status: status,
                ..Self::succeeding()
            }
        }

        fn with_failing_hosts(hosts: &[&str]) -> Self {
            Self {
                failing_hosts: hosts.iter().map(|h| h.to_string()).collect(),
                ..Self::succeeding()
            }
        }

        fn record(
            config: &ConnectionConfig,
            status: ExecutionStatus,
            exit_code: Option<i32>,
        ) -> CommandResult {
            CommandResult {
                host: config.host.clone(),
                port: config.port,
                status,
                error: None,
                timing: Timer::start().finish(),
                stdout: "ok".to_string(),
                stderr: String::new(),
                exit_code,
            }
        }
    }

    #[async_trait]
    impl HostOperation for StubOperation {
        type Output = CommandResult;

        async fn run(&self, config: &ConnectionConfig, cancel: &CancelToken) -> CommandResult {
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            // Real drivers observe the token at suspension points.
            if cancel.is_cancelled() {
                return CommandResult::cancelled(config, &Timer::start());
            }
            let attempt = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;
            if attempt <= self.failures_before_success {
                return Self::record(config, self.fail_status, None);
            }
            if self.failing_hosts.contains(&config.host) {
                return Self::record(config, ExecutionStatus::Failed, Some(1));
            }
            Self::record(config, ExecutionStatus::Success, Some(0))
        }

        fn cancelled_output(&self, config: &ConnectionConfig) -> CommandResult {
            CommandResult::cancelled(config, &Timer::start())
        }

        fn failure_output(&self, host: &str, message: String) -> CommandResult {
            CommandResult {
                host: host.to_string(),
                port: 22,
                status: ExecutionStatus::Error,
                error: Some(message),
                timing: Timer::start().finish(),
                stdout: String::new(),
                stderr: String::new(),
                exit_code: None,
            }
        }
    }

    fn configs(addrs: &[&str]) -> Vec<ConnectionConfig> {
        addrs
            .iter()
            .map(|addr| {
                let host: Host =
                    serde_json::from_value(serde_json::json!({ "host": addr })).unwrap();
                host.connection_config(None, None, None)
            })
            .collect()
    }

    #[tokio::test]
    async fn test_one_result_per_target() {
        let op = Arc::new(StubOperation::succeeding());
        let targets = configs(&["10.0.0.1", "10.0.0.2", "10.0.0.3", "10.0.0.4"]);

        let results = run_parallel(
            op,
            targets,
            RunOptions::default(),
            None,
            CancelToken::new(),
        )
        .await;

        assert_eq!(results.len(), 4);
        assert!(results.iter().all(|r| r.status == ExecutionStatus::Success));
        assert!(results.iter().all(|r| r.exit_code == Some(0)));
    }

    #[tokio::test]
    async fn test_progress_callback_sees_every_completion() {
        let op = Arc::new(StubOperation::succeeding());
        let targets = configs(&["10.0.0.1", "10.0.0.2", "10.0.0.3"]);

        let seen: Arc<std::sync::Mutex<Vec<(usize, usize)>>> =
            Arc::new(std::sync::Mutex::new(Vec::new()));
        let seen_clone = Arc::clone(&seen);
        let progress: ProgressCallback<CommandResult> =
            Arc::new(move |completed, total, _result| {
                seen_clone.lock().unwrap().push((completed, total));
            });

        run_parallel(
            op,
            targets,
            RunOptions::default(),
            Some(progress),
            CancelToken::new(),
        )
        .await;

        let seen = seen.lock().unwrap();
        assert_eq!(seen.as_slice(), &[(1, 3), (2, 3), (3, 3)]);
    }

    #[tokio::test]
    async fn test_transport_faults_retry_until_success() {
        let op = Arc::new(StubOperation::flaky(2, ExecutionStatus::Error));
        let targets = configs(&["10.0.0.1"]);

        let options = RunOptions {
            retry_count: 3,
            ..RunOptions::default()
        };
        let results = run_parallel(op.clone(), targets, options, None, CancelToken::new()).await;

        assert_eq!(results[0].status, ExecutionStatus::Success);
        assert_eq!(op.attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_retries_exhausted_keep_last_fault() {
        let op = Arc::new(StubOperation::flaky(10, ExecutionStatus::Timeout));
        let targets = configs(&["10.0.0.1"]);

        let options = RunOptions {
            retry_count: 3,
            ..RunOptions::default()
        };
        let results = run_parallel(op.clone(), targets, options, None, CancelToken::new()).await;

        assert_eq!(results[0].status, ExecutionStatus::Timeout);
        assert_eq!(op.attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_non_zero_exit_does_not_retry() {
        let op = Arc::new(StubOperation::with_failing_hosts(&["10.0.0.1"]));
        let targets = configs(&["10.0.0.1"]);

        let options = RunOptions {
            retry_count: 5,
            ..RunOptions::default()
        };
        let results = run_parallel(op.clone(), targets, options, None, CancelToken::new()).await;

        assert_eq!(results[0].status, ExecutionStatus::Failed);
        assert_eq!(results[0].exit_code, Some(1));
        assert_eq!(op.attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_stop_on_error_serial_cancels_the_rest() {
        let op = Arc::new(StubOperation {
            delay: Duration::from_millis(5),
            ..StubOperation::with_failing_hosts(&["10.0.0.2"])
        });
        let targets = configs(&["10.0.0.1", "10.0.0.2", "10.0.0.3"]);

        let options = RunOptions {
            max_concurrent: 1,
            stop_on_error: true,
            ..RunOptions::default()
        };
        let results = run_parallel(op, targets, options, None, CancelToken::new()).await;

        assert_eq!(results.len(), 3);
        let by_host = |h: &str| results.iter().find(|r| r.host == h).unwrap();
        assert_eq!(by_host("10.0.0.1").status, ExecutionStatus::Success);
        assert_eq!(by_host("10.0.0.2").status, ExecutionStatus::Failed);

        let third = by_host("10.0.0.3");
        assert_eq!(third.status, ExecutionStatus::Cancelled);
        assert!(third.stdout.is_empty());
    }

    #[tokio::test]
    async fn test_stop_on_error_wide_allows_started_tasks_to_finish() {
        let op = Arc::new(StubOperation {
            delay: Duration::from_millis(5),
            ..StubOperation::with_failing_hosts(&["10.0.0.2"])
        });
        let targets = configs(&["10.0.0.1", "10.0.0.2", "10.0.0.3"]);

        let options = RunOptions {
            max_concurrent: 3,
            stop_on_error: true,
            ..RunOptions::default()
        };
        let results = run_parallel(op, targets, options, None, CancelToken::new()).await;

        assert_eq!(results.len(), 3);
        let third = results.iter().find(|r| r.host == "10.0.0.3").unwrap();
        // With a wide pool the third host may already have started; either
        // completion or cancellation is acceptable, never a missing record.
        assert!(matches!(
            third.status,
            ExecutionStatus::Success | ExecutionStatus::Cancelled
        ));
    }

    #[tokio::test]
    async fn test_pre_cancelled_token_cancels_everything() {
        let op = Arc::new(StubOperation::succeeding());
        let targets = configs(&["10.0.0.1", "10.0.0.2"]);

        let cancel = CancelToken::new();
        cancel.cancel();
        let results = run_parallel(op, targets, RunOptions::default(), None, cancel).await;

        assert_eq!(results.len(), 2);
        assert!(results
            .iter()
            .all(|r| r.status == ExecutionStatus::Cancelled && r.stdout.is_empty()));
    }

    #[tokio::test]
    async fn test_cancel_token_wakes_waiters() {
        let token = CancelToken::new();
        let waiter = token.clone();
        let handle = tokio::spawn(async move {
            waiter.cancelled().await;
            true
        });

        tokio::time::sleep(Duration::from_millis(5)).await;
        token.cancel();
        assert!(handle.await.unwrap());
        assert!(token.is_cancelled());
    }
}
