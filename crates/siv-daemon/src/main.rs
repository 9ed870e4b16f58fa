//! siv-daemon binary entry point.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use siv_core::appeal::AppealWorkflow;
use siv_core::machine::VerificationStateMachine;
use siv_daemon::config::DaemonConfig;
use siv_daemon::http::{AppState, router};
use siv_daemon::ocr::{TextExtractor, UnavailableExtractor};
use siv_daemon::storage::Database;
use siv_daemon::worker::ReviewWorker;
use tokio::sync::mpsc;
use tracing::info;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Review jobs buffered ahead of the worker.
const REVIEW_QUEUE_DEPTH: usize = 256;

/// Student identity verification service.
#[derive(Debug, Parser)]
#[command(name = "siv-daemon", version, about)]
struct Args {
    /// Path to the TOML configuration file.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Override the configured listen address.
    #[arg(long)]
    listen: Option<String>,

    /// Override the configured database path.
    #[arg(long)]
    db: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => DaemonConfig::from_file(path)
            .with_context(|| format!("loading config from {}", path.display()))?,
        None => DaemonConfig::default(),
    };
    if let Some(listen) = args.listen {
        config.server.listen_addr = listen;
    }
    if let Some(db) = args.db {
        config.server.database_path = db;
    }

    let database = Database::open(&config.server.database_path).with_context(|| {
        format!(
            "opening database at {}",
            config.server.database_path.display()
        )
    })?;

    let blobs = Arc::new(database.blobs());
    let audit = Arc::new(database.audit());
    let machine = Arc::new(
        VerificationStateMachine::new(
            Arc::new(database.identities()),
            Arc::clone(&blobs) as Arc<dyn siv_core::BlobStore>,
            Arc::clone(&audit) as Arc<dyn siv_core::AuditLog>,
        )
        .with_matcher(
            config.matcher.weights(),
            config.matcher.auto_approve_threshold,
        ),
    );
    let appeals = Arc::new(AppealWorkflow::new(
        Arc::clone(&machine),
        Arc::new(database.appeals()),
        Arc::clone(&blobs) as Arc<dyn siv_core::BlobStore>,
        Arc::clone(&audit) as Arc<dyn siv_core::AuditLog>,
    ));

    // No OCR engine is wired in by default; every upload is held for
    // manual review. Deployments plug an engine in behind TextExtractor.
    let extractor: Arc<dyn TextExtractor> = Arc::new(UnavailableExtractor);

    let (job_tx, job_rx) = mpsc::channel(REVIEW_QUEUE_DEPTH);
    let worker = ReviewWorker::new(
        Arc::clone(&machine),
        Arc::clone(&blobs) as Arc<dyn siv_core::BlobStore>,
        extractor,
        config.ocr.timeout_ms,
    );
    tokio::spawn(worker.run(job_rx));

    let state = AppState {
        machine,
        appeals,
        jobs: job_tx,
    };

    let listener = tokio::net::TcpListener::bind(&config.server.listen_addr)
        .await
        .with_context(|| format!("binding {}", config.server.listen_addr))?;
    info!(addr = %config.server.listen_addr, "siv-daemon listening");

    axum::serve(listener, router(state))
        .await
        .context("serving HTTP")?;

    Ok(())
}
