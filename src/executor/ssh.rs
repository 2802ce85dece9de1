//! SSH session driver: one remote command on one host.
//!
//! Connection flow per host: TCP connect under the connect timeout, SSH
//! handshake under a fixed banner deadline (slow sshd startup must not be
//! charged against the per-host connect budget), key-exchange verification
//! against the known-hosts file, then key auth when key material is
//! configured, password auth otherwise.
//!
//! The command is transmitted with `export K='V';` prefixes for the host's
//! environment map and an optional `sudo` prefix. Output is drained in a
//! single loop that also owns the command deadline, cancellation and the
//! sudo prompt watch: when the first bytes contain `[sudo]`, the stored
//! password is written once. Complete stdout lines are delivered to the
//! per-host structured logger as they arrive.
//!
//! The transport is closed on every exit path. A cancelled session signals
//! the remote process (SIGTERM, 5 s grace, SIGKILL, 2 s grace) before the
//! channel is torn down.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use russh::client::{self, Msg};
use russh::{Channel, ChannelMsg, Disconnect, Sig};
use russh_keys::key;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::errors::{ErrorCode, StructuredError};
use crate::executor::{CancelToken, HostOperation};
use crate::protocol::{CommandResult, ConnectionConfig, ExecutionStatus, Timer};

/// Deadline for banner exchange and key exchange, independent of the
/// per-host connect timeout.
pub const BANNER_TIMEOUT: Duration = Duration::from_secs(300);

/// Grace period after SIGTERM before escalating.
const SIGTERM_GRACE: Duration = Duration::from_secs(5);

/// Grace period after SIGKILL before the channel is abandoned.
const SIGKILL_GRACE: Duration = Duration::from_secs(2);

/// The sudo prompt marker watched for in early output.
const SUDO_PROMPT: &[u8] = b"[sudo]";

/// How many leading output bytes are scanned for the sudo prompt.
const SUDO_WATCH_WINDOW: usize = 4096;

// ============================================================================
// CONNECT ERRORS
// ============================================================================

/// Faults raised while bringing a session up, before any command runs.
#[derive(Debug, Error)]
pub enum ConnectError {
    #[error("connect timeout after {0:.1}s")]
    Timeout(f64),

    #[error("connection failed: {0}")]
    Unreachable(std::io::Error),

    #[error("ssh handshake failed: {0}")]
    Handshake(russh::Error),

    #[error("authentication failed for user '{0}'")]
    AuthDenied(String),

    #[error("private key unusable: {0}")]
    Key(russh_keys::Error),

    #[error("host key verification failed")]
    HostKeyChanged,
}

impl ConnectError {
    pub fn status(&self) -> ExecutionStatus {
        match self {
            Self::Timeout(_) => ExecutionStatus::Timeout,
            Self::Unreachable(_) => ExecutionStatus::Unreachable,
            Self::AuthDenied(_) => ExecutionStatus::AuthFailed,
            Self::Handshake(_) | Self::Key(_) | Self::HostKeyChanged => ExecutionStatus::Error,
        }
    }

    pub fn code(&self) -> ErrorCode {
        match self {
            Self::Timeout(_) => ErrorCode::CONNECT_TIMEOUT,
            Self::Unreachable(_) => ErrorCode::CONNECT_FAILED,
            Self::Handshake(_) => ErrorCode::HANDSHAKE_FAILED,
            Self::AuthDenied(_) => ErrorCode::AUTH_FAILED,
            Self::Key(_) => ErrorCode::KEY_LOAD_FAILED,
            Self::HostKeyChanged => ErrorCode::HOST_KEY_CHANGED,
        }
    }

    pub fn structured(&self, host: &str) -> StructuredError {
        StructuredError::new(self.code(), self.to_string()).with_host(host)
    }
}

fn map_ssh_error(err: russh::Error) -> ConnectError {
    match err {
        russh::Error::UnknownKey => ConnectError::HostKeyChanged,
        other => ConnectError::Handshake(other),
    }
}

// ============================================================================
// HOST KEY POLICY
// ============================================================================

/// Accept-on-first-use handler: unknown keys are recorded in the
/// known-hosts file, a changed key refuses the connection.
pub(crate) struct ClientHandler {
    host: String,
    port: u16,
    known_hosts: Option<PathBuf>,
}

#[async_trait]
impl client::Handler for ClientHandler {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        server_public_key: &key::PublicKey,
    ) -> Result<bool, Self::Error> {
        let Some(path) = &self.known_hosts else {
            return Ok(true);
        };

        match russh_keys::check_known_hosts_path(&self.host, self.port, server_public_key, path)
        {
            Ok(true) => Ok(true),
            Ok(false) => {
                if let Err(err) = russh_keys::learn_known_hosts_path(
                    &self.host,
                    self.port,
                    server_public_key,
                    path,
                ) {
                    warn!(host = %self.host, "failed to record host key: {}", err);
                }
                Ok(true)
            }
            Err(russh_keys::Error::KeyChanged { line }) => {
                warn!(
                    host = %self.host,
                    line,
                    "host key changed, refusing connection"
                );
                Ok(false)
            }
            Err(err) => {
                // An unreadable known-hosts file must not take the fleet
                // down; accept and warn.
                warn!(host = %self.host, "known-hosts check failed: {}", err);
                Ok(true)
            }
        }
    }
}

// ============================================================================
// CONNECT + AUTH
// ============================================================================

/// Opens and authenticates a transport for `config`.
pub(crate) async fn connect(
    config: &ConnectionConfig,
) -> Result<client::Handle<ClientHandler>, ConnectError> {
    let connect_secs = config.connect_timeout.as_secs_f64();

    let stream = timeout(
        config.connect_timeout,
        TcpStream::connect((config.host.as_str(), config.port)),
    )
    .await
    .map_err(|_| ConnectError::Timeout(connect_secs))?
    .map_err(ConnectError::Unreachable)?;

    let handler = ClientHandler {
        host: config.host.clone(),
        port: config.port,
        known_hosts: config.known_hosts.clone(),
    };
    let ssh_config = Arc::new(client::Config::default());

    let mut handle = timeout(
        BANNER_TIMEOUT,
        client::connect_stream(ssh_config, stream, handler),
    )
    .await
    .map_err(|_| ConnectError::Timeout(BANNER_TIMEOUT.as_secs_f64()))?
    .map_err(map_ssh_error)?;

    let authenticated = timeout(config.connect_timeout, authenticate(&mut handle, config))
        .await
        .map_err(|_| ConnectError::Timeout(connect_secs))??;

    if !authenticated {
        return Err(ConnectError::AuthDenied(config.username.clone()));
    }
    Ok(handle)
}

/// Key auth when key material is present, password auth otherwise.
async fn authenticate(
    handle: &mut client::Handle<ClientHandler>,
    config: &ConnectionConfig,
) -> Result<bool, ConnectError> {
    let passphrase = config.passphrase.as_deref();

    let key_pair = if let Some(pem) = &config.private_key {
        Some(russh_keys::decode_secret_key(pem, passphrase).map_err(ConnectError::Key)?)
    } else if let Some(path) = &config.private_key_path {
        Some(russh_keys::load_secret_key(path, passphrase).map_err(ConnectError::Key)?)
    } else {
        None
    };

    if let Some(key_pair) = key_pair {
        return handle
            .authenticate_publickey(config.username.as_str(), Arc::new(key_pair))
            .await
            .map_err(map_ssh_error);
    }
    if let Some(password) = &config.password {
        return handle
            .authenticate_password(config.username.as_str(), password.as_str())
            .await
            .map_err(map_ssh_error);
    }
    handle
        .authenticate_none(config.username.as_str())
        .await
        .map_err(map_ssh_error)
}

// ============================================================================
// COMMAND COMPOSITION
// ============================================================================

/// `export K='V'; export K2='V2'; [sudo ]<command>`.
///
/// Export order is alphabetical to keep the transmitted command
/// deterministic. Values are single-quoted with embedded quotes escaped.
pub(crate) fn compose_command(
    command: &str,
    env: &HashMap<String, String>,
    apply_sudo: bool,
) -> String {
    let mut composed = String::new();

    let mut keys: Vec<&String> = env.keys().collect();
    keys.sort();
    for key in keys {
        composed.push_str(&format!("export {}='{}'; ", key, shell_single_quote(&env[key])));
    }

    if apply_sudo {
        composed.push_str("sudo ");
    }
    composed.push_str(command);
    composed
}

/// Escapes a value for inclusion inside single quotes: each `'` becomes
/// `'\''`.
fn shell_single_quote(value: &str) -> String {
    value.replace('\'', r"'\''")
}

// ============================================================================
// LINE BUFFER
// ============================================================================

/// Byte accumulator that yields complete `\n`-terminated lines.
///
/// Carriage returns from PTY output are stripped. The remainder (a final
/// unterminated line) is produced by `flush`.
#[derive(Debug, Default)]
pub(crate) struct LineBuffer {
    buf: Vec<u8>,
}

impl LineBuffer {
    pub fn push(&mut self, bytes: &[u8]) -> Vec<String> {
        self.buf.extend_from_slice(bytes);

        let mut lines = Vec::new();
        while let Some(pos) = self.buf.iter().position(|&b| b == b'\n') {
            let mut line: Vec<u8> = self.buf.drain(..=pos).collect();
            line.pop();
            if line.last() == Some(&b'\r') {
                line.pop();
            }
            lines.push(String::from_utf8_lossy(&line).into_owned());
        }
        lines
    }

    pub fn flush(&mut self) -> Option<String> {
        if self.buf.is_empty() {
            return None;
        }
        let mut line = std::mem::take(&mut self.buf);
        if line.last() == Some(&b'\r') {
            line.pop();
        }
        Some(String::from_utf8_lossy(&line).into_owned())
    }
}

/// True once the watched output window contains the sudo prompt marker.
pub(crate) fn contains_sudo_prompt(window: &[u8]) -> bool {
    window
        .windows(SUDO_PROMPT.len())
        .any(|chunk| chunk == SUDO_PROMPT)
}

// ============================================================================
// COMMAND OPERATION
// ============================================================================

/// One remote command, fanned out by the scheduler.
pub struct CommandOperation {
    pub command: String,
    /// Request an `xterm-256color` PTY (required for interactive sudo).
    pub needs_pty: bool,
    /// Prefix the command with `sudo` and answer the password prompt.
    pub apply_sudo: bool,
}

#[async_trait]
impl HostOperation for CommandOperation {
    type Output = CommandResult;

    async fn run(&self, config: &ConnectionConfig, cancel: &CancelToken) -> CommandResult {
        let timer = Timer::start();

        let mut handle = match connect(config).await {
            Ok(handle) => handle,
            Err(err) => {
                return CommandResult::fault(
                    config,
                    &timer,
                    err.status(),
                    err.structured(&config.name),
                );
            }
        };

        let result = self.run_session(&mut handle, config, cancel, &timer).await;

        // Transport close is unconditional, including after faults.
        let _ = handle
            .disconnect(Disconnect::ByApplication, "", "en")
            .await;
        result
    }

    fn cancelled_output(&self, config: &ConnectionConfig) -> CommandResult {
        CommandResult::cancelled(config, &Timer::start())
    }

    fn failure_output(&self, host: &str, message: String) -> CommandResult {
        CommandResult {
            host: host.to_string(),
            port: 0,
            status: ExecutionStatus::Error,
            error: Some(message),
            timing: Timer::start().finish(),
            stdout: String::new(),
            stderr: String::new(),
            exit_code: None,
        }
    }
}

impl CommandOperation {
    async fn run_session(
        &self,
        handle: &mut client::Handle<ClientHandler>,
        config: &ConnectionConfig,
        cancel: &CancelToken,
        timer: &Timer,
    ) -> CommandResult {
        let mut channel = match handle.channel_open_session().await {
            Ok(channel) => channel,
            Err(err) => {
                return CommandResult::fault(
                    config,
                    timer,
                    ExecutionStatus::Error,
                    StructuredError::new(
                        ErrorCode::CHANNEL_FAILED,
                        format!("failed to open session channel: {}", err),
                    )
                    .with_host(&config.name),
                );
            }
        };

        if self.needs_pty {
            if let Err(err) = channel
                .request_pty(true, "xterm-256color", 80, 24, 0, 0, &[])
                .await
            {
                return CommandResult::fault(
                    config,
                    timer,
                    ExecutionStatus::Error,
                    StructuredError::new(
                        ErrorCode::CHANNEL_FAILED,
                        format!("failed to allocate pty: {}", err),
                    )
                    .with_host(&config.name),
                );
            }
        }

        let full_command = compose_command(&self.command, &config.env, self.apply_sudo);
        debug!(host = %config.name, command = %full_command, "dispatching command");

        if let Err(err) = channel.exec(true, full_command.as_str()).await {
            return CommandResult::fault(
                config,
                timer,
                ExecutionStatus::Error,
                StructuredError::new(
                    ErrorCode::CHANNEL_FAILED,
                    format!("failed to dispatch command: {}", err),
                )
                .with_host(&config.name),
            );
        }

        self.drain_channel(&mut channel, config, cancel, timer).await
    }

    /// Streams output until the channel closes, honouring the command
    /// deadline, cancellation and the sudo prompt.
    async fn drain_channel(
        &self,
        channel: &mut Channel<Msg>,
        config: &ConnectionConfig,
        cancel: &CancelToken,
        timer: &Timer,
    ) -> CommandResult {
        let deadline = Instant::now() + config.command_timeout;

        let mut stdout_buffer = LineBuffer::default();
        let mut stderr_buffer = LineBuffer::default();
        let mut stdout_lines: Vec<String> = Vec::new();
        let mut stderr_lines: Vec<String> = Vec::new();
        let mut exit_code: Option<i32> = None;

        let mut sudo_window: Vec<u8> = Vec::new();
        let mut sudo_sent = false;

        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                terminate_remote(channel).await;
                return self.finish(
                    config,
                    timer,
                    ExecutionStatus::Timeout,
                    Some(timeout_error(config)),
                    stdout_lines,
                    stderr_lines,
                    None,
                );
            }

            tokio::select! {
                _ = cancel.cancelled() => {
                    terminate_remote(channel).await;
                    return self.finish(
                        config,
                        timer,
                        ExecutionStatus::Cancelled,
                        Some(
                            StructuredError::new(
                                ErrorCode::CANCELLED,
                                "cancelled while running",
                            )
                            .with_host(&config.name),
                        ),
                        stdout_lines,
                        stderr_lines,
                        None,
                    );
                }
                msg = timeout(remaining, channel.wait()) => match msg {
                    Err(_) => {
                        terminate_remote(channel).await;
                        return self.finish(
                            config,
                            timer,
                            ExecutionStatus::Timeout,
                            Some(timeout_error(config)),
                            stdout_lines,
                            stderr_lines,
                            None,
                        );
                    }
                    Ok(None) => break,
                    Ok(Some(ChannelMsg::Data { data })) => {
                        if self.apply_sudo && !sudo_sent && sudo_window.len() < SUDO_WATCH_WINDOW {
                            sudo_window.extend_from_slice(&data);
                            if contains_sudo_prompt(&sudo_window) {
                                if let Some(password) = &config.password {
                                    let answer = format!("{}\n", password);
                                    let _ = channel.data(answer.as_bytes()).await;
                                }
                                sudo_sent = true;
                            }
                        }
                        for line in stdout_buffer.push(&data) {
                            info!(host = %config.name, "{}", line);
                            stdout_lines.push(line);
                        }
                    }
                    Ok(Some(ChannelMsg::ExtendedData { data, ext })) if ext == 1 => {
                        for line in stderr_buffer.push(&data) {
                            warn!(host = %config.name, "{}", line);
                            stderr_lines.push(line);
                        }
                    }
                    Ok(Some(ChannelMsg::ExitStatus { exit_status })) => {
                        exit_code = Some(exit_status as i32);
                    }
                    Ok(Some(_)) => {}
                }
            }
        }

        if let Some(line) = stdout_buffer.flush() {
            info!(host = %config.name, "{}", line);
            stdout_lines.push(line);
        }
        if let Some(line) = stderr_buffer.flush() {
            warn!(host = %config.name, "{}", line);
            stderr_lines.push(line);
        }

        let (status, error) = match exit_code {
            Some(0) => (ExecutionStatus::Success, None),
            Some(code) => (
                ExecutionStatus::Failed,
                Some(
                    StructuredError::new(
                        ErrorCode::NON_ZERO_EXIT,
                        format!("command exited with code {}", code),
                    )
                    .with_host(&config.name),
                ),
            ),
            None => (
                ExecutionStatus::Error,
                Some(
                    StructuredError::new(
                        ErrorCode::MISSING_EXIT_STATUS,
                        "channel closed without an exit status",
                    )
                    .with_host(&config.name),
                ),
            ),
        };

        self.finish(
            config,
            timer,
            status,
            error,
            stdout_lines,
            stderr_lines,
            exit_code,
        )
    }

    #[allow(clippy::too_many_arguments)]
    fn finish(
        &self,
        config: &ConnectionConfig,
        timer: &Timer,
        status: ExecutionStatus,
        error: Option<StructuredError>,
        stdout_lines: Vec<String>,
        stderr_lines: Vec<String>,
        exit_code: Option<i32>,
    ) -> CommandResult {
        CommandResult {
            host: config.host.clone(),
            port: config.port,
            status,
            error: error.map(|e| e.user_message()),
            timing: timer.finish(),
            stdout: stdout_lines.join("\n"),
            stderr: stderr_lines.join("\n"),
            exit_code,
        }
    }
}

fn timeout_error(config: &ConnectionConfig) -> StructuredError {
    StructuredError::new(
        ErrorCode::COMMAND_TIMEOUT,
        format!(
            "command timed out after {:.1}s",
            config.command_timeout.as_secs_f64()
        ),
    )
    .with_host(&config.name)
}

/// SIGTERM, grace, SIGKILL, grace. Failures are ignored: the channel is
/// being abandoned either way and the transport close follows.
async fn terminate_remote(channel: &mut Channel<Msg>) {
    let _ = channel.signal(Sig::TERM).await;
    if drain_until_closed(channel, SIGTERM_GRACE).await {
        return;
    }
    let _ = channel.signal(Sig::KILL).await;
    let _ = drain_until_closed(channel, SIGKILL_GRACE).await;
}

async fn drain_until_closed(channel: &mut Channel<Msg>, grace: Duration) -> bool {
    timeout(grace, async {
        while channel.wait().await.is_some() {}
    })
    .await
    .is_ok()
}

// ============================================================================
// TESTS
// ============================================================================
