//! proctor-agent - local agent for the offline proctoring queue
//!
//! Captured events are appended to an encrypted on-disk queue and drained to
//! the proctoring backend whenever the machine is online.
//!
//! Uses XDG Base Directory specification for file locations:
//! - Database: $XDG_DATA_HOME/proctor-sync/queue.db (~/.local/share/proctor-sync/queue.db)
//! - Logs: $XDG_STATE_HOME/proctor-sync/proctor-sync.log.YYYY-MM-DD
//! - Config: $XDG_CONFIG_HOME/proctor-sync/config.toml

mod process_lock;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use proctor_core::{
    probe_client, BackendClient, Config, ConnectivityMonitor, CycleReport, LogPayload, LogQueue,
    LogType, PayloadCodec, RemoteAssetUploader, SyncEngine, SyncEvent,
};
use tokio::sync::{broadcast, watch};

use crate::process_lock::acquire_sync_guard;

#[derive(Parser)]
#[command(name = "proctor-agent")]
#[command(about = "Queue proctoring events offline and sync them to the backend")]
#[command(version)]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Append one event to the local queue
    Enqueue {
        /// Submission the event belongs to
        submission: String,

        /// Event type (SCREENSHOT, WEBCAM_PHOTO, FOCUS_CHANGE, MOUSECLICK, KEYSTROKE)
        log_type: LogType,

        /// Event data as JSON, e.g. '{"key":"a","loggedAt":"2026-01-01T10:00:00Z"}'
        #[arg(short, long)]
        data: String,
    },

    /// Show queued entries per submission
    Status {
        /// Only show this submission
        submission: Option<String>,
    },

    /// Run one sync cycle for a submission
    Sync { submission: String },

    /// Keep syncing a submission until Ctrl+C
    Watch { submission: String },

    /// List entries dropped after too many failed attempts
    Discarded { submission: String },
}

fn main() -> Result<()> {
    let args = Args::parse();

    // Must happen before the runtime starts any threads
    Config::ensure_xdg_env();

    let config = Config::load().context("failed to load configuration")?;

    let _log_guard =
        proctor_core::logging::init(&config.logging).context("failed to initialize logging")?;

    tracing::info!("proctor-agent starting");

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to create async runtime")?;

    runtime.block_on(run(args.command, config))
}

async fn run(command: Command, config: Config) -> Result<()> {
    let db_path = Config::database_path();
    tracing::info!(path = %db_path.display(), "Opening queue");

    let queue = LogQueue::open(&db_path, PayloadCodec::new(config.codec.secret.clone()))
        .context("failed to open queue database")?;

    match command {
        Command::Enqueue {
            submission,
            log_type,
            data,
        } => cmd_enqueue(&queue, &submission, log_type, &data).await,
        Command::Status { submission } => cmd_status(&queue, &config, submission.as_deref()).await,
        Command::Sync { submission } => {
            let _guard = acquire_sync_guard(&db_path, &submission)
                .context("failed to acquire process lock")?;
            cmd_sync(queue, &config, submission).await
        }
        Command::Watch { submission } => {
            let _guard = acquire_sync_guard(&db_path, &submission)
                .context("failed to acquire process lock")?;
            cmd_watch(queue, &config, submission).await
        }
        Command::Discarded { submission } => cmd_discarded(&queue, &submission).await,
    }
}

async fn cmd_enqueue(queue: &LogQueue, submission: &str, log_type: LogType, data: &str) -> Result<()> {
    let data: serde_json::Value =
        serde_json::from_str(data).context("event data is not valid JSON")?;
    let payload: LogPayload =
        serde_json::from_value(serde_json::json!({ "logType": log_type, "data": data }))
            .with_context(|| format!("event data does not match {}", log_type))?;

    let id = queue
        .append(submission, payload)
        .await
        .context("failed to append to queue")?;

    println!("Queued {} entry {} for {}", log_type, id, submission);
    Ok(())
}

async fn cmd_status(queue: &LogQueue, config: &Config, submission: Option<&str>) -> Result<()> {
    println!("Database: {}", Config::database_path().display());
    println!("Log:      {}", proctor_core::logging::log_file_path().display());
    println!(
        "Backend:  {}",
        config
            .backend
            .base_url
            .as_deref()
            .unwrap_or("<not configured>")
    );
    println!();

    let backlog = queue.backlog().await.context("failed to read queue")?;
    let backlog: Vec<_> = backlog
        .into_iter()
        .filter(|b| submission.map_or(true, |s| s == b.submission_id))
        .collect();

    if backlog.is_empty() {
        match submission {
            Some(s) => println!("No pending entries for {}", s),
            None => println!("No pending entries"),
        }
        return Ok(());
    }

    println!("Pending entries:");
    for entry in &backlog {
        let oldest = entry
            .oldest_at
            .map(|t| t.with_timezone(&chrono::Local).format("%Y-%m-%d %H:%M:%S").to_string())
            .unwrap_or_else(|| "-".to_string());
        println!(
            "  {}: {} pending (oldest {})",
            entry.submission_id, entry.pending, oldest
        );
    }

    Ok(())
}

fn build_engine(
    queue: LogQueue,
    config: &Config,
    submission: String,
    connectivity: ConnectivityMonitor,
) -> Result<SyncEngine> {
    let backend =
        BackendClient::new(config.backend.clone()).context("backend is not configured")?;
    let uploader = RemoteAssetUploader::from_client(
        backend.clone(),
        Duration::from_secs(config.backend.timeout_secs),
    )
    .context("failed to create uploader")?;

    Ok(SyncEngine::new(
        submission,
        queue,
        Arc::new(backend),
        Arc::new(uploader),
        connectivity,
        config.sync.clone(),
    ))
}

/// Probe once so a cycle never starts against an unreachable backend.
async fn check_connectivity(config: &Config, connectivity: &ConnectivityMonitor) -> Result<()> {
    let Some(url) = config.probe_url() else {
        return Ok(());
    };
    let client = probe_client(config.connectivity.probe_interval())
        .context("failed to create probe client")?;
    if !connectivity.probe_once(&client, url).await {
        tracing::warn!(url = %url, "Backend unreachable, treating as offline");
    }
    Ok(())
}

async fn cmd_sync(queue: LogQueue, config: &Config, submission: String) -> Result<()> {
    let connectivity = ConnectivityMonitor::default();
    let engine = build_engine(queue, config, submission, connectivity.clone())?;
    check_connectivity(config, &connectivity).await?;

    match engine.trigger_sync().await {
        Some(report) => print_report(engine.submission_id(), &report),
        None if !connectivity.is_online() => {
            println!("Offline: backend unreachable, queued entries kept for the next sync");
        }
        None => println!("Sync skipped"),
    }

    Ok(())
}

async fn cmd_watch(queue: LogQueue, config: &Config, submission: String) -> Result<()> {
    let connectivity = ConnectivityMonitor::default();
    let engine = build_engine(queue, config, submission, connectivity.clone())?;
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    check_connectivity(config, &connectivity).await?;
    let probe = config.probe_url().map(|url| {
        connectivity.spawn_probe(
            url.to_string(),
            config.connectivity.probe_interval(),
            shutdown_rx.clone(),
        )
    });

    let printer = tokio::spawn(print_events(engine.subscribe()));
    let runner = tokio::spawn({
        let engine = engine.clone();
        let shutdown_rx = shutdown_rx.clone();
        async move { engine.run(shutdown_rx).await }
    });

    println!(
        "Watching {} (sync every {}s{}). Press Ctrl+C to stop.",
        engine.submission_id(),
        config.sync.interval().as_secs(),
        if connectivity.is_online() { "" } else { ", currently offline" }
    );

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for Ctrl+C")?;
    eprintln!("\nShutting down...");

    let _ = shutdown_tx.send(true);
    runner.await.context("sync loop panicked")?;
    if let Some(probe) = probe {
        let _ = probe.await;
    }
    printer.abort();

    let status = engine.status();
    println!(
        "Stopped. {} pending, {} uploaded this run.",
        status.pending_count,
        status.last_uploaded.total()
    );
    tracing::info!("proctor-agent watch mode stopped");

    Ok(())
}

async fn print_events(mut events: broadcast::Receiver<SyncEvent>) {
    loop {
        let event = match events.recv().await {
            Ok(event) => event,
            Err(broadcast::error::RecvError::Lagged(_)) => continue,
            Err(broadcast::error::RecvError::Closed) => break,
        };

        let timestamp = chrono::Local::now().format("%H:%M:%S");
        match event {
            SyncEvent::CycleCompleted(report) => {
                if report.submitted > 0 || report.failed > 0 || report.discarded > 0 {
                    println!(
                        "[{}] Sent {} logs, {} failed, {} discarded, {} pending",
                        timestamp,
                        report.uploaded.total(),
                        report.failed,
                        report.discarded,
                        report.pending_after
                    );
                }
            }
            SyncEvent::EntryDiscarded {
                entry_id,
                log_type,
                attempts,
            } => {
                println!(
                    "[{}] Discarded {} entry {} after {} attempts",
                    timestamp, log_type, entry_id, attempts
                );
            }
            SyncEvent::EntryFailed { .. } => {}
        }
    }
}

fn print_report(submission: &str, report: &CycleReport) {
    println!("Sync complete for {}:", submission);
    println!("  Entries submitted: {}", report.submitted);
    println!("  Screenshots:       {}", report.uploaded.screenshots);
    println!("  Webcam photos:     {}", report.uploaded.webcam_photos);
    println!("  Focus changes:     {}", report.uploaded.focus_changes);
    println!("  Mouse clicks:      {}", report.uploaded.mouse_clicks);
    println!("  Keystrokes:        {}", report.uploaded.keystrokes);
    println!("  Failed entries:    {}", report.failed);
    println!("  Discarded entries: {}", report.discarded);
    println!("  Still pending:     {}", report.pending_after);
    if report.batch_rejected {
        println!("\nThe backend did not accept the batch; it will be retried.");
    }
}

async fn cmd_discarded(queue: &LogQueue, submission: &str) -> Result<()> {
    let entries = queue
        .discarded(submission)
        .await
        .context("failed to read discard log")?;

    if entries.is_empty() {
        println!("No discarded entries for {}", submission);
        return Ok(());
    }

    println!("Discarded entries for {}:", submission);
    for entry in &entries {
        println!(
            "  #{} {} created {} discarded {} after {} attempts",
            entry.entry_id,
            entry.log_type,
            entry.created_at.format("%Y-%m-%d %H:%M:%S"),
            entry.discarded_at.format("%Y-%m-%d %H:%M:%S"),
            entry.upload_attempts
        );
    }

    Ok(())
}
