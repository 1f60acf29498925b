//! `sitescan` command line.
//!
//! Usage:
//!   sitescan discover [--full|--incremental]   Run (or resume) a discovery
//!   sitescan validate                          Check the persisted site structure
//!   sitescan status                            Print checkpoint and progress
//!   sitescan reset                             Forget local progress

mod commands;
mod error;
mod logging;

use crate::commands::{Cli, Command, DiscoverArgs};
use crate::error::{ErrorKind, Result};
use clap::Parser;
use exn::ResultExt;
use serde_json::json;
use sitescan_cache::{Database, ProgressStore};
use sitescan_config::{BackendConfig, Config};
use sitescan_discovery::{Context, DiscoveryCoordinator, DiscoveryError, DiscoveryEvent, DiscoveryOutcome};
use sitescan_storage::BackendHandle;
use sitescan_storage::backend::{HttpBackend, HttpOptions, LocalBackend, ReadOnlyBackend};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

const PRINTER_GRACE: Duration = Duration::from_secs(1);

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    logging::init(cli.verbose);
    match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            tracing::error!(error = ?e, "sitescan failed");
            eprintln!("error: {}", *e);
            ExitCode::FAILURE
        },
    }
}

async fn run(cli: Cli) -> Result<ExitCode> {
    let mut config = Config::load(cli.config.as_deref()).or_raise(|| ErrorKind::Config)?;
    config.dry_run |= cli.dry_run;
    let mut ctx = Context::from(&config);
    if let Command::Discover(DiscoverArgs { concurrency: Some(n), .. }) = &cli.command {
        ctx = ctx.with_concurrency(*n);
    }

    let backend = backend(&config)?;
    let db = open_state(&config).await?;
    let store = ProgressStore::new(db.pool().clone(), config.dry_run);
    let coordinator = DiscoveryCoordinator::new(backend, ctx, store);

    let code = match cli.command {
        Command::Discover(args) => discover(&coordinator, &args).await?,
        Command::Validate => {
            let validation = coordinator.validate().await.or_raise(|| ErrorKind::Discovery)?;
            print_json(&validation)?;
            if validation.is_valid { ExitCode::SUCCESS } else { ExitCode::FAILURE }
        },
        Command::Status => {
            let report = coordinator.status_report().await.or_raise(|| ErrorKind::Discovery)?;
            print_json(&json!({
                "namespace": coordinator.context().namespace.prefix(),
                "checkpoint": report.checkpoint,
                "progress": report.progress,
            }))?;
            ExitCode::SUCCESS
        },
        Command::Reset => {
            coordinator.reset().await.or_raise(|| ErrorKind::Discovery)?;
            println!("Progress for {} cleared", coordinator.context().namespace.prefix());
            ExitCode::SUCCESS
        },
    };
    db.close().await;
    Ok(code)
}

fn backend(config: &Config) -> Result<BackendHandle> {
    let backend: BackendHandle = match &config.backend {
        BackendConfig::Local { root } => Arc::new(LocalBackend::new("local", root).or_raise(|| ErrorKind::Backend)?),
        BackendConfig::Http { base_url, token } => Arc::new(
            HttpBackend::new("http", base_url, &config.org, &config.repo, token.clone(), HttpOptions::default())
                .or_raise(|| ErrorKind::Backend)?,
        ),
    };
    if config.dry_run {
        tracing::info!("Dry run: repository writes are skipped");
        return Ok(Arc::new(ReadOnlyBackend::new(backend)));
    }
    Ok(backend)
}

async fn open_state(config: &Config) -> Result<Database> {
    let path = config.state_database().or_raise(|| ErrorKind::State)?;
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await.or_raise(|| ErrorKind::State)?;
    }
    tracing::debug!(path = %path.display(), "Opening progress database");
    Database::connect(&path).await.or_raise(|| ErrorKind::State)
}

async fn discover(coordinator: &DiscoveryCoordinator, args: &DiscoverArgs) -> Result<ExitCode> {
    let events = coordinator.subscribe();
    let printer = tokio::spawn(print_events(events, args.json));
    let control = coordinator.control();
    let interrupt = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("Stopping; run `sitescan discover` again to resume");
            control.stop();
        }
    });

    let result = coordinator.run(args.mode()).await;
    interrupt.abort();
    // The printer ends once it has drained the terminal event.
    if tokio::time::timeout(PRINTER_GRACE, printer).await.is_err() {
        tracing::debug!("Event printer did not see a terminal event");
    }
    let outcome = result.or_raise(|| ErrorKind::Discovery)?;
    summarize(&outcome, args.json)?;
    Ok(if outcome.stats.errors == 0 { ExitCode::SUCCESS } else { ExitCode::from(2) })
}

async fn print_events(mut events: broadcast::Receiver<DiscoveryEvent>, json: bool) {
    loop {
        let event = match events.recv().await {
            Ok(event) => event,
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                tracing::warn!(skipped, "Event printer fell behind");
                continue;
            },
            Err(broadcast::error::RecvError::Closed) => return,
        };
        let terminal = matches!(
            event,
            DiscoveryEvent::Complete { .. }
                | DiscoveryEvent::Stopped(_)
                | DiscoveryEvent::Error(DiscoveryError { fatal: true, .. })
        );
        if json {
            println!("{}", event_json(&event));
        } else if let Some(line) = event_line(&event) {
            eprintln!("{line}");
        }
        if terminal {
            return;
        }
    }
}

fn event_line(event: &DiscoveryEvent) -> Option<String> {
    Some(match event {
        DiscoveryEvent::Started { mode, resumed, total_folders } => {
            let verb = if *resumed { "Resuming" } else { "Starting" };
            format!("{verb} {mode} discovery of {total_folders} folders")
        },
        DiscoveryEvent::Progress(stats) => format!(
            "[{}/{}] {} documents, {} errors",
            stats.completed_folders, stats.total_folders, stats.total_documents, stats.errors
        ),
        DiscoveryEvent::FolderComplete { folder, documents, changes } if changes.has_changes() => format!(
            "  {folder}: {documents} documents (+{} ~{} -{})",
            changes.new, changes.updated, changes.deleted
        ),
        DiscoveryEvent::FolderComplete { folder, documents, .. } => format!("  {folder}: {documents} documents"),
        DiscoveryEvent::Paused(_) => "Paused".to_string(),
        DiscoveryEvent::Resumed(_) => "Resumed".to_string(),
        DiscoveryEvent::Error(error) => match &error.folder {
            Some(folder) => format!("  {folder}: {}", error.message),
            None => format!("Error: {}", error.message),
        },
        DiscoveryEvent::Stopped(stats) => {
            format!("Stopped after {}/{} folders", stats.completed_folders, stats.total_folders)
        },
        DiscoveryEvent::DocumentsDiscovered { .. } | DiscoveryEvent::Complete { .. } => return None,
    })
}

fn event_json(event: &DiscoveryEvent) -> serde_json::Value {
    match event {
        DiscoveryEvent::Started { mode, resumed, total_folders } => {
            json!({ "event": "started", "mode": mode, "resumed": resumed, "totalFolders": total_folders })
        },
        DiscoveryEvent::Progress(stats) => json!({ "event": "progress", "stats": stats }),
        DiscoveryEvent::DocumentsDiscovered { folder, documents } => {
            json!({ "event": "documentsDiscovered", "folder": folder, "documents": &documents[..] })
        },
        DiscoveryEvent::FolderComplete { folder, documents, changes } => {
            json!({ "event": "folderComplete", "folder": folder, "documents": documents, "changes": changes })
        },
        DiscoveryEvent::Paused(stats) => json!({ "event": "paused", "stats": stats }),
        DiscoveryEvent::Resumed(stats) => json!({ "event": "resumed", "stats": stats }),
        DiscoveryEvent::Complete { stats, duration, site_structure } => json!({
            "event": "complete",
            "stats": stats,
            "durationMs": duration.as_millis() as u64,
            "siteStructure": site_structure.stats,
        }),
        DiscoveryEvent::Error(error) => {
            json!({ "event": "error", "folder": error.folder, "message": error.message, "fatal": error.fatal })
        },
        DiscoveryEvent::Stopped(stats) => json!({ "event": "stopped", "stats": stats }),
    }
}

fn summarize(outcome: &DiscoveryOutcome, json: bool) -> Result<()> {
    if json {
        return print_json(&json!({
            "status": outcome.status,
            "mode": outcome.mode,
            "resumed": outcome.resumed,
            "stats": outcome.stats,
            "diff": outcome.diff,
            "durationMs": outcome.duration.as_millis() as u64,
            "filesWithErrors": outcome.files_with_errors,
        }));
    }
    println!(
        "{} {} discovery: {}/{} folders, {} documents, {} errors in {:.1}s",
        outcome.status,
        outcome.mode,
        outcome.stats.completed_folders,
        outcome.stats.total_folders,
        outcome.stats.total_documents,
        outcome.stats.errors,
        outcome.duration.as_secs_f64(),
    );
    if let Some(diff) = &outcome.diff {
        println!(
            "  folders +{} -{}; documents +{} ~{} ={} -{}",
            diff.new_folders.len(),
            diff.deleted_folders.len(),
            diff.changes.new,
            diff.changes.updated,
            diff.changes.unchanged,
            diff.changes.deleted,
        );
    }
    for file in &outcome.files_with_errors {
        println!("  unreadable inventory: {file}");
    }
    Ok(())
}

fn print_json(value: &impl serde::Serialize) -> Result<()> {
    let text = serde_json::to_string_pretty(value).or_raise(|| ErrorKind::Output)?;
    println!("{text}");
    Ok(())
}
