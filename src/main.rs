//! pssh — parallel remote execution over SSH.
//!
//! One-shot fan-out tool: select hosts from an inventory with an IP
//! expression and a label predicate, then run a command, move files, or
//! probe reachability on all of them concurrently, collecting one result
//! record per host into a JSON report.
//!
//! ```bash
//! pssh --inventory hosts.json execute "systemctl restart nginx" \
//!     -H "10.20.0.0/24 !10.20.0.15" -L "env=prod, tier=web" \
//!     -c 50 --stop-on-error
//!
//! pssh --inventory hosts.json download /var/log/syslog ./logs -L "env=prod"
//! pssh --inventory hosts.json ping -L "region=us-east"
//! ```
//!
//! Exit codes: 0 — every host succeeded; 1 — at least one host failed;
//! 2 — operator error (bad expression, unreadable inventory).

/// Structured error codes attached to result records.
mod errors;

/// Fan-out scheduler and the per-host drivers (ssh, sftp, probe).
mod executor;

/// Inventory loading and validation.
mod inventory;

/// Host records, statuses, result records, run report.
mod protocol;

/// IP-set and label-predicate target selection.
mod selector;

/// tracing + OpenTelemetry setup.
mod telemetry;

use std::path::PathBuf;
use std::sync::Arc;

use chrono::Utc;
use clap::{Args, Parser, Subcommand, ValueEnum};
use serde::Serialize;
use tracing::{error, info, warn, Level};
use uuid::Uuid;

use executor::probe::ProbeOperation;
use executor::ssh::CommandOperation;
use executor::transfer::{DownloadOperation, NameTemplate, UploadOperation};
use executor::{
    run_parallel, CancelToken, HostOperation, ProgressCallback, RunOptions,
    DEFAULT_MAX_CONCURRENT,
};
use protocol::{ConnectionConfig, Host, RunReport, TaskResult};
use telemetry::{init_telemetry, shutdown_telemetry, TelemetryConfig};

// ============================================================================
// CLI DEFINITION
// ============================================================================

#[derive(Parser)]
#[command(name = "pssh")]
#[command(about = "Parallel remote execution over SSH", long_about = None)]
struct Cli {
    /// Inventory JSON file (array of host records).
    #[arg(short, long, global = true)]
    inventory: Option<PathBuf>,

    /// Known-hosts file for accept-and-record host key verification.
    /// Without it, host keys are accepted and not recorded.
    #[arg(long, global = true)]
    known_hosts: Option<PathBuf>,

    /// Export spans to an OpenTelemetry collector.
    #[arg(long, global = true, default_value = "false")]
    otel: bool,

    /// OTLP collector endpoint (defaults to OTEL_EXPORTER_OTLP_ENDPOINT or
    /// http://localhost:4317).
    #[arg(long, global = true)]
    otel_endpoint: Option<String>,

    /// Only log errors.
    #[arg(long, short = 's', global = true, default_value = "false")]
    silent: bool,

    /// Debug-level logging.
    #[arg(long, short = 'v', global = true, default_value = "false")]
    verbose: bool,

    /// Execution id for cross-referencing logs and traces (default: random
    /// UUID v4).
    #[arg(long, global = true)]
    execution_id: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

/// Target selection, shared by every subcommand.
#[derive(Args, Clone)]
struct SelectionArgs {
    /// IP selection expression, e.g. "192.168.1.0/24 !192.168.1.5".
    #[arg(short = 'H', long = "hosts")]
    hosts: Option<String>,

    /// Label predicate, e.g. "env=prod, tier=web".
    #[arg(short = 'L', long = "selector")]
    selector: Option<String>,
}

/// Scheduler policy, shared by every subcommand.
#[derive(Args, Clone)]
struct SchedulerArgs {
    /// Maximum concurrent sessions.
    #[arg(short = 'c', long, default_value_t = DEFAULT_MAX_CONCURRENT)]
    max_concurrent: usize,

    /// Total attempts per host for transport-class failures.
    #[arg(long, default_value_t = 1)]
    retry: u32,

    /// Cancel pending hosts after the first non-success result.
    #[arg(long, default_value_t = false)]
    stop_on_error: bool,

    /// Override every host's connect timeout (seconds).
    #[arg(long)]
    connect_timeout: Option<f64>,
}

/// Report rendering, shared by every subcommand.
#[derive(Args, Clone)]
struct OutputArgs {
    /// Report format.
    #[arg(short = 'o', long, value_enum, default_value_t = OutputFormat::Json)]
    output: OutputFormat,

    /// Write the report to a file instead of stdout.
    #[arg(short = 'f', long)]
    output_file: Option<PathBuf>,

    /// Suppress per-host progress logging.
    #[arg(short = 'q', long, default_value = "false")]
    quiet: bool,
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq)]
enum OutputFormat {
    /// Pretty-printed JSON report.
    Json,
    /// No report; logs and exit code only.
    None,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a command on every selected host.
    Execute {
        command: String,

        #[command(flatten)]
        selection: SelectionArgs,

        #[command(flatten)]
        scheduler: SchedulerArgs,

        /// Override every host's command timeout (seconds).
        #[arg(short = 't', long)]
        timeout: Option<f64>,

        /// Allocate a pty (xterm-256color); required for interactive sudo.
        #[arg(long, default_value = "false")]
        needs_pty: bool,

        /// Prefix the command with sudo and answer the password prompt.
        #[arg(long, default_value = "false")]
        sudo: bool,

        #[command(flatten)]
        output: OutputArgs,
    },

    /// Upload a file or directory to every selected host.
    Upload {
        local_path: PathBuf,
        remote_path: String,

        #[command(flatten)]
        selection: SelectionArgs,

        #[command(flatten)]
        scheduler: SchedulerArgs,

        /// Recurse into directories.
        #[arg(short = 'r', long, default_value = "false")]
        recursive: bool,

        /// Re-apply file permissions on the remote side.
        #[arg(short = 'p', long, default_value_t = true, action = clap::ArgAction::Set)]
        preserve: bool,

        #[command(flatten)]
        output: OutputArgs,
    },

    /// Download a file or directory from every selected host into
    /// <local_dir>/<host>/.
    Download {
        remote_path: String,
        local_dir: PathBuf,

        #[command(flatten)]
        selection: SelectionArgs,

        #[command(flatten)]
        scheduler: SchedulerArgs,

        /// Recurse into directories.
        #[arg(short = 'r', long, default_value = "false")]
        recursive: bool,

        /// Re-apply file permissions on the local side.
        #[arg(short = 'p', long, default_value_t = true, action = clap::ArgAction::Set)]
        preserve: bool,

        /// Per-host file name template; variables: hostname, remote_file,
        /// remote_file_name, local_file, local_file_name.
        #[arg(short = 'T', long)]
        template: Option<String>,

        #[command(flatten)]
        output: OutputArgs,
    },

    /// Probe TCP and SSH reachability of every selected host.
    Ping {
        #[command(flatten)]
        selection: SelectionArgs,

        #[command(flatten)]
        scheduler: SchedulerArgs,

        #[command(flatten)]
        output: OutputArgs,
    },
}

// ============================================================================
// ENTRY POINT
// ============================================================================

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let mut telemetry_config = TelemetryConfig::from_env();
    telemetry_config.log_level = if cli.silent {
        Level::ERROR
    } else if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    if cli.otel {
        if let Some(endpoint) = &cli.otel_endpoint {
            telemetry_config.otlp_endpoint = Some(endpoint.clone());
        } else if telemetry_config.otlp_endpoint.is_none() {
            telemetry_config.otlp_endpoint = Some("http://localhost:4317".to_string());
        }
    }

    if let Err(err) = init_telemetry(telemetry_config) {
        if !cli.silent {
            eprintln!("warning: failed to initialise telemetry: {}", err);
        }
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .try_init();
    }

    let exit_code = run(cli).await;

    shutdown_telemetry();
    std::process::exit(exit_code);
}

async fn run(cli: Cli) -> i32 {
    let Some(inventory_path) = &cli.inventory else {
        error!("--inventory is required");
        return 2;
    };

    let hosts = match inventory::load_inventory(inventory_path) {
        Ok(hosts) => hosts,
        Err(err) => {
            error!("{:#}", err);
            return 2;
        }
    };
    if let Err(violations) = inventory::validate_inventory(&hosts) {
        error!("inventory validation failed with {} error(s):", violations.len());
        for violation in &violations {
            error!("  - {}", violation);
        }
        return 2;
    }

    let execution_id = cli
        .execution_id
        .clone()
        .unwrap_or_else(|| Uuid::new_v4().to_string());
    info!(execution_id = %execution_id, hosts = hosts.len(), "inventory loaded");

    match &cli.command {
        Commands::Execute {
            command,
            selection,
            scheduler,
            timeout,
            needs_pty,
            sudo,
            output,
        } => {
            let Some(configs) =
                select_configs(&hosts, selection, &cli, scheduler, *timeout)
            else {
                return 2;
            };
            if configs.is_empty() {
                warn!("no hosts selected");
                return 0;
            }
            info!(targets = configs.len(), command = %command, "executing command");

            let operation = Arc::new(CommandOperation {
                command: command.clone(),
                needs_pty: *needs_pty,
                apply_sudo: *sudo,
            });
            dispatch(operation, configs, scheduler, output, &execution_id).await
        }

        Commands::Upload {
            local_path,
            remote_path,
            selection,
            scheduler,
            recursive,
            preserve,
            output,
        } => {
            let Some(configs) = select_configs(&hosts, selection, &cli, scheduler, None)
            else {
                return 2;
            };
            if configs.is_empty() {
                warn!("no hosts selected");
                return 0;
            }
            info!(
                targets = configs.len(),
                local = %local_path.display(),
                remote = %remote_path,
                "uploading"
            );

            let operation = Arc::new(UploadOperation {
                local_path: local_path.clone(),
                remote_path: remote_path.clone(),
                recursive: *recursive,
                preserve: *preserve,
            });
            dispatch(operation, configs, scheduler, output, &execution_id).await
        }

        Commands::Download {
            remote_path,
            local_dir,
            selection,
            scheduler,
            recursive,
            preserve,
            template,
            output,
        } => {
            let Some(configs) = select_configs(&hosts, selection, &cli, scheduler, None)
            else {
                return 2;
            };
            if configs.is_empty() {
                warn!("no hosts selected");
                return 0;
            }
            info!(
                targets = configs.len(),
                remote = %remote_path,
                local_dir = %local_dir.display(),
                "downloading"
            );

            let operation = Arc::new(DownloadOperation {
                remote_path: remote_path.clone(),
                local_dir: local_dir.clone(),
                recursive: *recursive,
                preserve: *preserve,
                template: template.as_deref().map(NameTemplate::new),
            });
            dispatch(operation, configs, scheduler, output, &execution_id).await
        }

        Commands::Ping {
            selection,
            scheduler,
            output,
        } => {
            let Some(configs) = select_configs(&hosts, selection, &cli, scheduler, None)
            else {
                return 2;
            };
            if configs.is_empty() {
                warn!("no hosts selected");
                return 0;
            }
            info!(targets = configs.len(), "probing reachability");

            dispatch(Arc::new(ProbeOperation), configs, scheduler, output, &execution_id).await
        }
    }
}

// ============================================================================
// PLUMBING
// ============================================================================

/// Selection + per-invocation connection configs. `None` means an operator
/// error that was already logged.
fn select_configs(
    hosts: &[Host],
    selection: &SelectionArgs,
    cli: &Cli,
    scheduler: &SchedulerArgs,
    command_timeout: Option<f64>,
) -> Option<Vec<ConnectionConfig>> {
    let ip_expr = selection.hosts.as_deref().unwrap_or("");
    let label_expr = selection.selector.as_deref().unwrap_or("");

    let selected = match selector::select_hosts(hosts, ip_expr, label_expr) {
        Ok(selected) => selected,
        Err(err) => {
            error!(
                category = %err.code().category(),
                "[{}] {}",
                err.code(),
                err
            );
            return None;
        }
    };

    Some(
        selected
            .iter()
            .map(|host| {
                host.connection_config(
                    cli.known_hosts.clone(),
                    scheduler.connect_timeout,
                    command_timeout,
                )
            })
            .collect(),
    )
}

/// Fans the operation out and renders the report. Returns the process exit
/// code.
async fn dispatch<O>(
    operation: Arc<O>,
    configs: Vec<ConnectionConfig>,
    scheduler: &SchedulerArgs,
    output: &OutputArgs,
    execution_id: &str,
) -> i32
where
    O: HostOperation + 'static,
    O::Output: Serialize,
{
    let options = RunOptions {
        max_concurrent: scheduler.max_concurrent,
        retry_count: scheduler.retry,
        stop_on_error: scheduler.stop_on_error,
    };
    let progress = if output.quiet {
        None
    } else {
        Some(log_progress::<O::Output>())
    };

    let started_at = Utc::now();
    let mut results =
        run_parallel(operation, configs, options, progress, CancelToken::new()).await;
    let finished_at = Utc::now();

    // Batch arrives in completion order; the report reads better sorted by
    // address.
    sort_by_address(&mut results);
    let failures = results
        .iter()
        .filter(|r| !r.status().is_success())
        .count();

    let report = RunReport::new(
        execution_id.to_string(),
        started_at,
        finished_at,
        results,
    );
    info!(
        total = report.summary.total,
        succeeded = report.summary.succeeded,
        failures,
        "run finished"
    );

    match output.output {
        OutputFormat::Json => {
            let json = serde_json::to_string_pretty(&report).expect("report serialises");
            if let Some(path) = &output.output_file {
                if let Some(parent) = path.parent() {
                    let _ = std::fs::create_dir_all(parent);
                }
                if let Err(err) = std::fs::write(path, json) {
                    error!("failed to write report to {}: {}", path.display(), err);
                    return 2;
                }
                info!(path = %path.display(), "report written");
            } else {
                println!("{}", json);
            }
        }
        OutputFormat::None => {}
    }

    if failures == 0 {
        0
    } else {
        1
    }
}

fn log_progress<R: TaskResult>() -> ProgressCallback<R> {
    Arc::new(|completed, total, result: &R| {
        info!(
            host = %result.host(),
            status = %result.status(),
            "{}/{} finished",
            completed,
            total
        );
    })
}

/// Numeric IPv4 order where possible, hostnames after addresses.
fn sort_by_address<R: TaskResult>(results: &mut [R]) {
    results.sort_by_key(|r| {
        match r.host().parse::<std::net::Ipv4Addr>() {
            Ok(addr) => (0u8, u32::from(addr), String::new()),
            Err(_) => (1u8, 0, r.host().to_string()),
        }
    });
}
