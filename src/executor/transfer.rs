//! SFTP transfer driver: per-host uploads and downloads.
//!
//! Transfers run over the SFTP subsystem of a fresh transport per host,
//! with the same status taxonomy and cancellation semantics as command
//! execution. The `timeout` status can only come from the connect phase;
//! a slow transfer is allowed to take its time.
//!
//! Downloads land in `<local_dir>/<host>/<basename(remote)>` by default so
//! that a fleet-wide pull never collides across hosts. A caller-supplied
//! [`NameTemplate`] can override the per-host file name using the
//! variables `hostname`, `remote_file`, `remote_file_name`, `local_file`
//! and `local_file_name`.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use russh::Disconnect;
use russh_sftp::client::SftpSession;
use russh_sftp::protocol::FileAttributes;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};

use crate::errors::{ErrorCode, StructuredError};
use crate::executor::ssh::{connect, ClientHandler};
use crate::executor::{CancelToken, HostOperation};
use crate::protocol::{
    ConnectionConfig, ExecutionStatus, Timer, TransferDirection, TransferResult,
};

static TEMPLATE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\$\{([a-z_]+)\}").expect("valid template regex"));

// ============================================================================
// NAMING TEMPLATE
// ============================================================================

/// `${var}` substitution for per-host download file names.
#[derive(Debug, Clone)]
pub struct NameTemplate {
    raw: String,
}

impl NameTemplate {
    pub fn new(raw: impl Into<String>) -> Self {
        Self { raw: raw.into() }
    }

    /// Substitutes every `${var}`; an unknown variable is an operator
    /// mistake and errors out.
    pub fn render(&self, vars: &HashMap<&str, String>) -> Result<String, StructuredError> {
        let mut rendered = String::new();
        let mut last_index = 0;

        for capture in TEMPLATE_RE.captures_iter(&self.raw) {
            let matched = capture.get(0).expect("capture 0 always present");
            let name = capture.get(1).expect("capture 1 always present").as_str();

            rendered.push_str(&self.raw[last_index..matched.start()]);
            match vars.get(name) {
                Some(value) => rendered.push_str(value),
                None => {
                    return Err(StructuredError::new(
                        ErrorCode::TEMPLATE_VARIABLE,
                        format!("unknown template variable '{}'", name),
                    ));
                }
            }
            last_index = matched.end();
        }
        rendered.push_str(&self.raw[last_index..]);
        Ok(rendered)
    }
}

// ============================================================================
// INTERNAL FAULTS
// ============================================================================

/// Driver-internal fault carrying the status it maps to.
struct Fault {
    status: ExecutionStatus,
    error: StructuredError,
}

impl Fault {
    fn cancelled(host: &str) -> Self {
        Self {
            status: ExecutionStatus::Cancelled,
            error: StructuredError::new(ErrorCode::CANCELLED, "cancelled while transferring")
                .with_host(host),
        }
    }

    fn sftp(code: ErrorCode, context: &str, err: impl std::fmt::Display, host: &str) -> Self {
        Self {
            status: ExecutionStatus::Error,
            error: StructuredError::new(code, format!("{}: {}", context, err)).with_host(host),
        }
    }
}

// ============================================================================
// UPLOAD
// ============================================================================

/// Uploads one file or tree to every selected host.
pub struct UploadOperation {
    pub local_path: PathBuf,
    pub remote_path: String,
    pub recursive: bool,
    pub preserve: bool,
}

#[async_trait]
impl HostOperation for UploadOperation {
    type Output = TransferResult;

    async fn run(&self, config: &ConnectionConfig, cancel: &CancelToken) -> TransferResult {
        let timer = Timer::start();
        let local_display = self.local_path.display().to_string();

        if !self.local_path.exists() {
            return TransferResult::fault(
                config,
                &timer,
                TransferDirection::Upload,
                local_display,
                self.remote_path.clone(),
                ExecutionStatus::Error,
                Some(
                    StructuredError::new(
                        ErrorCode::LOCAL_PATH_MISSING,
                        format!("local path '{}' does not exist", self.local_path.display()),
                    )
                    .with_host(&config.name),
                ),
            );
        }

        let mut handle = match connect(config).await {
            Ok(handle) => handle,
            Err(err) => {
                return TransferResult::fault(
                    config,
                    &timer,
                    TransferDirection::Upload,
                    local_display,
                    self.remote_path.clone(),
                    err.status(),
                    Some(err.structured(&config.name)),
                );
            }
        };

        let outcome = match open_sftp(&mut handle, &config.name).await {
            Ok(sftp) => {
                let result = self.transfer(&sftp, config, cancel).await;
                let _ = sftp.close().await;
                result
            }
            Err(fault) => Err(fault),
        };
        let _ = handle.disconnect(Disconnect::ByApplication, "", "en").await;

        match outcome {
            Ok(bytes) => {
                info!(host = %config.name, bytes, "upload complete");
                TransferResult {
                    host: config.host.clone(),
                    port: config.port,
                    status: ExecutionStatus::Success,
                    error: None,
                    timing: timer.finish(),
                    direction: TransferDirection::Upload,
                    local_path: local_display,
                    remote_path: self.remote_path.clone(),
                    bytes_transferred: bytes,
                }
            }
            Err(fault) => TransferResult::fault(
                config,
                &timer,
                TransferDirection::Upload,
                local_display,
                self.remote_path.clone(),
                fault.status,
                Some(fault.error),
            ),
        }
    }

    fn cancelled_output(&self, config: &ConnectionConfig) -> TransferResult {
        TransferResult::fault(
            config,
            &Timer::start(),
            TransferDirection::Upload,
            self.local_path.display().to_string(),
            self.remote_path.clone(),
            ExecutionStatus::Cancelled,
            Some(
                StructuredError::new(ErrorCode::CANCELLED, "cancelled before completion")
                    .with_host(&config.name),
            ),
        )
    }

    fn failure_output(&self, host: &str, message: String) -> TransferResult {
        TransferResult {
            host: host.to_string(),
            port: 0,
            status: ExecutionStatus::Error,
            error: Some(message),
            timing: Timer::start().finish(),
            direction: TransferDirection::Upload,
            local_path: self.local_path.display().to_string(),
            remote_path: self.remote_path.clone(),
            bytes_transferred: 0,
        }
    }
}

impl UploadOperation {
    async fn transfer(
        &self,
        sftp: &SftpSession,
        config: &ConnectionConfig,
        cancel: &CancelToken,
    ) -> Result<u64, Fault> {
        if self.recursive && self.local_path.is_dir() {
            self.upload_tree(sftp, config, cancel).await
        } else {
            upload_file(
                sftp,
                &self.local_path,
                &self.remote_path,
                self.preserve,
                config,
                cancel,
            )
            .await
        }
    }

    async fn upload_tree(
        &self,
        sftp: &SftpSession,
        config: &ConnectionConfig,
        cancel: &CancelToken,
    ) -> Result<u64, Fault> {
        let (dirs, files) = collect_local_tree(&self.local_path)
            .await
            .map_err(|err| {
                Fault::sftp(
                    ErrorCode::LOCAL_PATH_MISSING,
                    "failed to walk local tree",
                    err,
                    &config.name,
                )
            })?;

        let remote_base = self.remote_path.trim_end_matches('/');
        ensure_remote_dir(sftp, remote_base, &config.name).await?;
        for rel in &dirs {
            if cancel.is_cancelled() {
                return Err(Fault::cancelled(&config.name));
            }
            ensure_remote_dir(sftp, &format!("{}/{}", remote_base, rel), &config.name).await?;
        }

        let mut total = 0u64;
        for (local, rel) in &files {
            if cancel.is_cancelled() {
                return Err(Fault::cancelled(&config.name));
            }
            let remote = format!("{}/{}", remote_base, rel);
            total +=
                upload_file(sftp, local, &remote, self.preserve, config, cancel).await?;
        }
        Ok(total)
    }
}

// ============================================================================
// DOWNLOAD
// ============================================================================

/// Downloads one file or tree from every selected host into a per-host
/// local directory.
pub struct DownloadOperation {
    pub remote_path: String,
    pub local_dir: PathBuf,
    pub recursive: bool,
    pub preserve: bool,
    pub template: Option<NameTemplate>,
}

#[async_trait]
impl HostOperation for DownloadOperation {
    type Output = TransferResult;

    async fn run(&self, config: &ConnectionConfig, cancel: &CancelToken) -> TransferResult {
        let timer = Timer::start();

        let local_path = match self.local_destination(config) {
            Ok(path) => path,
            Err(error) => {
                return TransferResult::fault(
                    config,
                    &timer,
                    TransferDirection::Download,
                    self.local_dir.display().to_string(),
                    self.remote_path.clone(),
                    ExecutionStatus::Error,
                    Some(error.with_host(&config.name)),
                );
            }
        };
        let local_display = local_path.display().to_string();

        let mut handle = match connect(config).await {
            Ok(handle) => handle,
            Err(err) => {
                return TransferResult::fault(
                    config,
                    &timer,
                    TransferDirection::Download,
                    local_display,
                    self.remote_path.clone(),
                    err.status(),
                    Some(err.structured(&config.name)),
                );
            }
        };

        let outcome = match open_sftp(&mut handle, &config.name).await {
            Ok(sftp) => {
                let result = self.transfer(&sftp, &local_path, config, cancel).await;
                let _ = sftp.close().await;
                result
            }
            Err(fault) => Err(fault),
        };
        let _ = handle.disconnect(Disconnect::ByApplication, "", "en").await;

        match outcome {
            Ok(bytes) => {
                info!(host = %config.name, bytes, path = %local_display, "download complete");
                TransferResult {
                    host: config.host.clone(),
                    port: config.port,
                    status: ExecutionStatus::Success,
                    error: None,
                    timing: timer.finish(),
                    direction: TransferDirection::Download,
                    local_path: local_display,
                    remote_path: self.remote_path.clone(),
                    bytes_transferred: bytes,
                }
            }
            Err(fault) => TransferResult::fault(
                config,
                &timer,
                TransferDirection::Download,
                local_display,
                self.remote_path.clone(),
                fault.status,
                Some(fault.error),
            ),
        }
    }

    fn cancelled_output(&self, config: &ConnectionConfig) -> TransferResult {
        TransferResult::fault(
            config,
            &Timer::start(),
            TransferDirection::Download,
            self.local_dir.display().to_string(),
            self.remote_path.clone(),
            ExecutionStatus::Cancelled,
            Some(
                StructuredError::new(ErrorCode::CANCELLED, "cancelled before completion")
                    .with_host(&config.name),
            ),
        )
    }

    fn failure_output(&self, host: &str, message: String) -> TransferResult {
        TransferResult {
            host: host.to_string(),
            port: 0,
            status: ExecutionStatus::Error,
            error: Some(message),
            timing: Timer::start().finish(),
            direction: TransferDirection::Download,
            local_path: self.local_dir.display().to_string(),
            remote_path: self.remote_path.clone(),
            bytes_transferred: 0,
        }
    }
}

impl DownloadOperation {
    /// Per-host landing path: `<local_dir>/<host>/<basename(remote)>`, or
    /// the rendered template relative to `local_dir`.
    pub(crate) fn local_destination(
        &self,
        config: &ConnectionConfig,
    ) -> Result<PathBuf, StructuredError> {
        let remote_file_name = basename(&self.remote_path);
        let default_path = self.local_dir.join(&config.host).join(&remote_file_name);

        let Some(template) = &self.template else {
            return Ok(default_path);
        };

        let mut vars: HashMap<&str, String> = HashMap::new();
        vars.insert("hostname", config.host.clone());
        vars.insert("remote_file", self.remote_path.clone());
        vars.insert("remote_file_name", remote_file_name.clone());
        vars.insert("local_file", default_path.display().to_string());
        vars.insert("local_file_name", remote_file_name);

        Ok(self.local_dir.join(template.render(&vars)?))
    }

    async fn transfer(
        &self,
        sftp: &SftpSession,
        local_path: &Path,
        config: &ConnectionConfig,
        cancel: &CancelToken,
    ) -> Result<u64, Fault> {
        if let Some(parent) = local_path.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(|err| {
                Fault::sftp(
                    ErrorCode::TRANSFER_FAILED,
                    "failed to create local directory",
                    err,
                    &config.name,
                )
            })?;
        }

        let remote_is_dir = sftp
            .metadata(self.remote_path.as_str())
            .await
            .map(|attrs| attrs.is_dir())
            .unwrap_or(false);

        if self.recursive && remote_is_dir {
            self.download_tree(sftp, local_path, config, cancel).await
        } else {
            download_file(
                sftp,
                &self.remote_path,
                local_path,
                self.preserve,
                config,
                cancel,
            )
            .await
        }
    }

    async fn download_tree(
        &self,
        sftp: &SftpSession,
        local_root: &Path,
        config: &ConnectionConfig,
        cancel: &CancelToken,
    ) -> Result<u64, Fault> {
        let mut total = 0u64;
        let mut stack: Vec<(String, PathBuf)> = vec![(
            self.remote_path.trim_end_matches('/').to_string(),
            local_root.to_path_buf(),
        )];

        while let Some((remote_dir, local_dir)) = stack.pop() {
            if cancel.is_cancelled() {
                return Err(Fault::cancelled(&config.name));
            }
            tokio::fs::create_dir_all(&local_dir).await.map_err(|err| {
                Fault::sftp(
                    ErrorCode::TRANSFER_FAILED,
                    "failed to create local directory",
                    err,
                    &config.name,
                )
            })?;

            let entries = sftp.read_dir(remote_dir.as_str()).await.map_err(|err| {
                Fault::sftp(
                    ErrorCode::REMOTE_PATH_FAILED,
                    &format!("failed to list '{}'", remote_dir),
                    err,
                    &config.name,
                )
            })?;

            for entry in entries {
                let name = entry.file_name();
                if name == "." || name == ".." {
                    continue;
                }
                let remote_path = format!("{}/{}", remote_dir, name);
                let local_path = local_dir.join(&name);

                if entry.metadata().is_dir() {
                    stack.push((remote_path, local_path));
                } else {
                    if cancel.is_cancelled() {
                        return Err(Fault::cancelled(&config.name));
                    }
                    total += download_file(
                        sftp,
                        &remote_path,
                        &local_path,
                        self.preserve,
                        config,
                        cancel,
                    )
                    .await?;
                }
            }
        }
        Ok(total)
    }
}

// ============================================================================
// SHARED TRANSFER HELPERS
// ============================================================================

async fn open_sftp(
    handle: &mut russh::client::Handle<ClientHandler>,
    host: &str,
) -> Result<SftpSession, Fault> {
    let mut channel = handle.channel_open_session().await.map_err(|err| {
        Fault::sftp(
            ErrorCode::REMOTE_PATH_FAILED,
            "failed to open sftp channel",
            err,
            host,
        )
    })?;
    channel
        .request_subsystem(true, "sftp")
        .await
        .map_err(|err| {
            Fault::sftp(
                ErrorCode::REMOTE_PATH_FAILED,
                "sftp subsystem unavailable",
                err,
                host,
            )
        })?;
    SftpSession::new(channel.into_stream()).await.map_err(|err| {
        Fault::sftp(
            ErrorCode::REMOTE_PATH_FAILED,
            "failed to start sftp session",
            err,
            host,
        )
    })
}

async fn ensure_remote_dir(sftp: &SftpSession, path: &str, host: &str) -> Result<(), Fault> {
    if sftp.metadata(path).await.is_ok() {
        return Ok(());
    }
    sftp.create_dir(path).await.map_err(|err| {
        Fault::sftp(
            ErrorCode::REMOTE_PATH_FAILED,
            &format!("failed to create remote directory '{}'", path),
            err,
            host,
        )
    })
}

async fn upload_file(
    sftp: &SftpSession,
    local: &Path,
    remote: &str,
    preserve: bool,
    config: &ConnectionConfig,
    cancel: &CancelToken,
) -> Result<u64, Fault> {
    debug!(host = %config.name, local = %local.display(), remote, "uploading file");

    let mut local_file = tokio::fs::File::open(local).await.map_err(|err| {
        Fault::sftp(
            ErrorCode::LOCAL_PATH_MISSING,
            &format!("failed to open '{}'", local.display()),
            err,
            &config.name,
        )
    })?;
    let mut remote_file = sftp.create(remote).await.map_err(|err| {
        Fault::sftp(
            ErrorCode::REMOTE_PATH_FAILED,
            &format!("failed to create remote file '{}'", remote),
            err,
            &config.name,
        )
    })?;

    let bytes = tokio::select! {
        copied = tokio::io::copy(&mut local_file, &mut remote_file) => copied.map_err(|err| {
            Fault::sftp(ErrorCode::TRANSFER_FAILED, "upload interrupted", err, &config.name)
        })?,
        _ = cancel.cancelled() => return Err(Fault::cancelled(&config.name)),
    };
    remote_file.shutdown().await.map_err(|err| {
        Fault::sftp(ErrorCode::TRANSFER_FAILED, "failed to finalise upload", err, &config.name)
    })?;

    #[cfg(unix)]
    if preserve {
        use std::os::unix::fs::PermissionsExt;
        if let Ok(meta) = tokio::fs::metadata(local).await {
            let attrs = FileAttributes {
                permissions: Some(meta.permissions().mode()),
                ..Default::default()
            };
            let _ = sftp.set_metadata(remote, attrs).await;
        }
    }

    Ok(bytes)
}

async fn download_file(
    sftp: &SftpSession,
    remote: &str,
    local: &Path,
    preserve: bool,
    config: &ConnectionConfig,
    cancel: &CancelToken,
) -> Result<u64, Fault> {
    debug!(host = %config.name, remote, local = %local.display(), "downloading file");

    let mut remote_file = sftp.open(remote).await.map_err(|err| {
        Fault::sftp(
            ErrorCode::REMOTE_PATH_FAILED,
            &format!("failed to open remote file '{}'", remote),
            err,
            &config.name,
        )
    })?;
    let mut local_file = tokio::fs::File::create(local).await.map_err(|err| {
        Fault::sftp(
            ErrorCode::TRANSFER_FAILED,
            &format!("failed to create '{}'", local.display()),
            err,
            &config.name,
        )
    })?;

    let bytes = tokio::select! {
        copied = tokio::io::copy(&mut remote_file, &mut local_file) => copied.map_err(|err| {
            Fault::sftp(ErrorCode::TRANSFER_FAILED, "download interrupted", err, &config.name)
        })?,
        _ = cancel.cancelled() => return Err(Fault::cancelled(&config.name)),
    };
    local_file.shutdown().await.map_err(|err| {
        Fault::sftp(ErrorCode::TRANSFER_FAILED, "failed to finalise download", err, &config.name)
    })?;

    #[cfg(unix)]
    if preserve {
        use std::os::unix::fs::PermissionsExt;
        if let Ok(attrs) = sftp.metadata(remote).await {
            if let Some(mode) = attrs.permissions {
                let _ = tokio::fs::set_permissions(
                    local,
                    std::fs::Permissions::from_mode(mode),
                )
                .await;
            }
        }
    }

    Ok(bytes)
}

/// Walks a local tree, returning directory and file paths relative to the
/// root in `/`-separated form. Directories come out parents-first.
async fn collect_local_tree(
    root: &Path,
) -> std::io::Result<(Vec<String>, Vec<(PathBuf, String)>)> {
    let mut dirs: Vec<String> = Vec::new();
    let mut files: Vec<(PathBuf, String)> = Vec::new();
    let mut stack = vec![root.to_path_buf()];

    while let Some(dir) = stack.pop() {
        let mut entries = tokio::fs::read_dir(&dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            let Ok(rel) = path.strip_prefix(root) else {
                continue;
            };
            let rel = rel.to_string_lossy().replace('\\', "/");

            let file_type = entry.file_type().await?;
            if file_type.is_dir() {
                dirs.push(rel);
                stack.push(path);
            } else if file_type.is_file() {
                files.push((path, rel));
            }
        }
    }

    dirs.sort();
    files.sort_by(|a, b| a.1.cmp(&b.1));
    Ok((dirs, files))
}

fn basename(path: &str) -> String {
    path.trim_end_matches('/')
        .rsplit('/')
        .next()
        .unwrap_or(path)
        .to_string()
}

// ============================================================================
// TESTS
// ============================================================================
