//! Courier Sync - offline-resilient sync core for delivery agents.
//!
//! The library owns the agent-side state machine: connectivity, location
//! tracking, the durable action queue, order status transitions, cash
//! collection and order-list polling. Embedding apps build an
//! [`AgentSyncContext`]; the `courier-agent` binary runs one headless
//! against the HTTP backend.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

pub mod backend;
pub mod config;
pub mod connectivity;
pub mod credentials;
pub mod db;
pub mod diagnostics;
pub mod error;
pub mod location;
pub mod model;
pub mod notices;
pub mod orders;
pub mod payments;
pub mod polling;
pub mod queue;
pub mod session;

#[cfg(test)]
mod testing;

pub use backend::{HttpOrderBackend, OrderBackend};
pub use config::{AgentConfig, BackendCredentials, SyncConfig};
pub use connectivity::{ConnectivityMonitor, ConnectivityState};
pub use error::{BackendError, SensorError, SyncError, ValidationError};
pub use model::{Money, OrderAssignment, OrderStatus, PaymentMethod};
pub use notices::Notice;
pub use session::{AgentSyncContext, SessionDevices, SyncStatus};

const STATUS_LOG_INTERVAL: Duration = Duration::from_secs(300);

// ============================================================================
// Logging
// ============================================================================

/// Install the global subscriber: console plus a daily rolling file under
/// `{data_dir}/logs`. Set `COURIER_LOG_JSON=1` for JSON console output.
///
/// The returned guard flushes the file writer on drop; hold it until exit.
pub fn init_logging(data_dir: &Path) -> WorkerGuard {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,courier_sync=debug"));

    let log_dir = diagnostics::get_log_dir(data_dir);
    std::fs::create_dir_all(&log_dir).ok();
    diagnostics::prune_old_logs(&log_dir);

    let file_appender = tracing_appender::rolling::daily(&log_dir, diagnostics::LOG_FILE_PREFIX);
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let file_layer = fmt::layer()
        .with_writer(non_blocking)
        .with_ansi(false)
        .with_target(true);

    let json_console = std::env::var("COURIER_LOG_JSON").is_ok_and(|v| v == "1" || v == "true");
    let (plain_console, json_console) = if json_console {
        (None, Some(fmt::layer().json().with_target(true)))
    } else {
        (Some(fmt::layer().with_target(true)), None)
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(plain_console)
        .with(json_console)
        .with(file_layer)
        .init();

    guard
}

// ============================================================================
// Headless agent entry point
// ============================================================================

const USAGE: &str =
    "usage: courier-agent [DATA_DIR] | connect <CONNECTION_STRING> | logout | diagnostics [OUT_DIR]";

/// A bare word is a mistyped subcommand, not a data directory. The
/// directory must look like a path (`./agent`, `/var/lib/courier`) or exist.
fn data_dir_arg(arg: &str) -> anyhow::Result<PathBuf> {
    let path = PathBuf::from(arg);
    let looks_like_path = arg.contains('/')
        || arg.contains(std::path::MAIN_SEPARATOR)
        || arg.starts_with('.')
        || path.is_dir();
    if !looks_like_path {
        anyhow::bail!("unknown command `{arg}`\n{USAGE}");
    }
    Ok(path)
}

/// `courier-agent [DATA_DIR]` runs the agent until Ctrl-C.
/// `courier-agent connect <CONNECTION_STRING>` stores backend credentials.
/// `courier-agent logout` removes them.
/// `courier-agent diagnostics [OUT_DIR]` writes a redacted diagnostics file.
pub fn run() -> anyhow::Result<()> {
    let args: Vec<String> = std::env::args().skip(1).collect();
    let command = args.first().map(String::as_str);

    let explicit_dir = match command {
        Some("connect") | Some("logout") | Some("diagnostics") => None,
        Some(dir) => Some(data_dir_arg(dir)?),
        None => None,
    };
    let data_dir = config::resolve_data_dir(explicit_dir, |var| std::env::var(var).ok());
    let _log_guard = init_logging(&data_dir);
    info!("Starting courier-agent v{}", env!("CARGO_PKG_VERSION"));

    match command {
        Some("connect") => {
            let raw = args
                .get(1)
                .context("usage: courier-agent connect <CONNECTION_STRING>")?;
            let creds = credentials::apply_connection_string(raw).map_err(anyhow::Error::msg)?;
            info!(agent_id = %creds.agent_id, backend = %creds.base_url, "Agent connected");
            Ok(())
        }
        Some("logout") => {
            credentials::clear_credentials().map_err(anyhow::Error::msg)?;
            Ok(())
        }
        Some("diagnostics") => {
            let out_dir = args
                .get(1)
                .map(PathBuf::from)
                .unwrap_or_else(|| data_dir.clone());
            let db = db::init(&data_dir).map_err(anyhow::Error::msg)?;
            let path =
                diagnostics::export_diagnostics(&db, &out_dir, true).map_err(anyhow::Error::msg)?;
            println!("{}", path.display());
            Ok(())
        }
        _ => {
            let runtime = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .context("failed to build tokio runtime")?;
            runtime.block_on(run_agent(data_dir))
        }
    }
}

async fn run_agent(data_dir: PathBuf) -> anyhow::Result<()> {
    let config = AgentConfig::load(Some(data_dir)).context("failed to load configuration")?;
    let credentials = config
        .credentials
        .clone()
        .context("agent is not connected; run `courier-agent connect <CONNECTION_STRING>`")?;

    let db = Arc::new(
        db::init(&config.data_dir)
            .map_err(anyhow::Error::msg)
            .context("failed to open local database")?,
    );
    let backend: Arc<dyn OrderBackend> = Arc::new(
        HttpOrderBackend::new(&credentials, config.sync.request_timeout())
            .map_err(anyhow::Error::msg)?,
    );
    if backend::test_connectivity(backend.as_ref()).await.is_none() {
        warn!(backend = %credentials.base_url, "Order service unreachable; starting offline");
    }

    let ctx = Arc::new(AgentSyncContext::new(
        config.sync.clone(),
        db.clone(),
        backend.clone(),
        SessionDevices::default(),
    ));
    let cancel = ctx.cancellation();

    let notice_log = spawn_notice_logger(&ctx, cancel.clone());
    let probe = connectivity::spawn_reachability_probe(
        ctx.connectivity(),
        backend,
        config.sync.probe_interval(),
        cancel.clone(),
    );
    ctx.start().await?;
    let heartbeat = spawn_status_heartbeat(ctx.clone(), db, cancel.clone());

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for Ctrl-C")?;
    info!("Shutdown requested");

    ctx.shutdown().await;
    for task in [notice_log, probe, heartbeat] {
        if let Err(e) = task.await {
            warn!(error = %e, "Background task ended abnormally");
        }
    }
    info!(pending = ctx.queue().len()?, "courier-agent stopped");
    Ok(())
}

fn spawn_notice_logger(
    ctx: &AgentSyncContext,
    cancel: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    let mut rx = ctx.subscribe_notices();
    tokio::spawn(async move {
        loop {
            let notice = tokio::select! {
                _ = cancel.cancelled() => break,
                received = rx.recv() => received,
            };
            match notice {
                Ok(notice) => {
                    let rendered = serde_json::to_string(&notice).unwrap_or_default();
                    match notice {
                        Notice::ActionDropped { .. }
                        | Notice::ActionRejected { .. }
                        | Notice::OrderConflict { .. }
                        | Notice::DegradedConnectivity { .. }
                        | Notice::TrackingHalted { .. } => warn!(notice = %rendered, "notice"),
                        _ => info!(notice = %rendered, "notice"),
                    }
                }
                Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Notice logger fell behind");
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    })
}

fn spawn_status_heartbeat(
    ctx: Arc<AgentSyncContext>,
    db: Arc<db::DbState>,
    cancel: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(STATUS_LOG_INTERVAL) => {}
            }
            match ctx.status() {
                Ok(status) => info!(
                    status = %serde_json::to_string(&status).unwrap_or_default(),
                    "sync status"
                ),
                Err(e) => warn!(error = %e, "Failed to read sync status"),
            }
            if let Ok(health) = diagnostics::get_sync_health(&db) {
                info!(health = %health, "sync health");
            }
        }
    })
}
