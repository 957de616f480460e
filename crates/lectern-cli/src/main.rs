//! Lectern CLI: publish media and courses to object storage.
//!
//! Configuration comes from the environment (and `.env`); see `Config::from_env`.

use anyhow::Context;
use clap::{Parser, Subcommand};
use lectern_cli::{format_status, init_tracing, PublishArgs};
use lectern_core::{Config, ErrorMetadata};
use lectern_db::{create_document_store, DocumentStore, MemoryDocumentStore};
use lectern_services::{PublishError, PublishOrchestrator};
use lectern_storage::create_storage;
use serde::Serialize;
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "lectern", about = "Lectern content publishing CLI")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Publish a single file or an ordered course
    Publish(PublishArgs),
}

fn print_json(value: &impl Serialize) -> anyhow::Result<()> {
    let out = serde_json::to_string_pretty(value).context("Serialize result")?;
    println!("{}", out);
    Ok(())
}

fn error_report(err: &PublishError) -> serde_json::Value {
    serde_json::json!({
        "error_code": err.error_code(),
        "message": err.client_message(),
        "detail": err.to_string(),
        "recoverable": err.is_recoverable(),
        "suggested_action": err.suggested_action(),
        "orphans": err.orphans(),
        "partial_manifest": err.partial_manifest(),
    })
}

async fn publish(args: PublishArgs, config: &Config) -> anyhow::Result<()> {
    let request = args.to_request()?;

    let storage = create_storage(&config.storage)
        .await
        .context("Failed to initialize storage")?;
    let store: Arc<dyn DocumentStore> = if args.dry_run {
        tracing::info!("Dry run: records are kept in memory");
        Arc::new(MemoryDocumentStore::new(config.fan_out.max_batch_ops))
    } else {
        create_document_store(config)
            .await
            .context("Failed to initialize document store")?
    };
    let orchestrator = Arc::new(
        PublishOrchestrator::from_config(storage, store, config)
            .context("Failed to build publish pipeline")?,
    );

    let mut status_rx = orchestrator.subscribe();
    let printer = tokio::spawn(async move {
        let mut last = String::new();
        while status_rx.changed().await.is_ok() {
            let line = format_status(&status_rx.borrow_and_update());
            if line != last {
                eprintln!("{}", line);
                last = line;
            }
        }
    });

    let interrupt = {
        let orchestrator = orchestrator.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() && orchestrator.cancel() {
                tracing::warn!("Interrupted, cancelling the active transfer");
            }
        })
    };

    let result = orchestrator.publish(request).await;
    orchestrator.wait_for_background().await;
    interrupt.abort();
    printer.abort();

    match result {
        Ok(receipt) => print_json(&receipt),
        Err(err) => {
            print_json(&error_report(&err))?;
            Err(anyhow::anyhow!("Publish failed: {}", err.error_code()))
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    let config = Config::from_env().context("Failed to load configuration")?;
    init_tracing(config.log_format);

    tracing::debug!(environment = %config.environment, "Configuration loaded");

    match cli.command {
        Commands::Publish(args) => publish(args, &config).await,
    }
}
