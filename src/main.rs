use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use archiver::{ArchiveOrchestrator, Database, RecoveryService};
use clap::{Parser, Subcommand};
use common::{Configuration, create_object_store_from_dsn};

#[derive(Parser)]
#[command(name = "archivedb")]
#[command(about = "Moves old operational rows into verified Parquet objects in cold storage")]
struct Cli {
    /// Path to the configuration file
    #[arg(short, long, default_value = "archivedb.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Report the pending backlog per table without touching anything
    Stats,
    /// Reconcile interrupted work, then archive the backlog
    Run,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();
    let config = Configuration::load_from_path(&cli.config)
        .with_context(|| format!("failed to load configuration from {}", cli.config.display()))?;

    if !config.archiver.enabled {
        log::warn!("Archiver is disabled in configuration, nothing to do");
        return Ok(());
    }

    let db = Database::connect(&config.database.dsn).await?;
    let store = create_object_store_from_dsn(&config.storage.dsn)?;

    match cli.command {
        Command::Stats => stats(db, store, config).await,
        Command::Run => run(db, store, config).await,
    }
}

async fn stats(
    db: Database,
    store: Arc<dyn object_store::ObjectStore>,
    config: Configuration,
) -> Result<()> {
    let orchestrator = ArchiveOrchestrator::new(db, store, config.archiver);
    let reports = orchestrator.backlog_report().await?;

    println!("cutoff: {}", orchestrator.cutoff());
    for report in reports {
        let oldest = report
            .oldest
            .map_or_else(|| "-".to_string(), |t| t.to_rfc3339());
        println!(
            "{}: {} pending records across {} days (oldest {})",
            report.table_name, report.pending_records, report.pending_days, oldest
        );
    }
    Ok(())
}

async fn run(
    db: Database,
    store: Arc<dyn object_store::ObjectStore>,
    config: Configuration,
) -> Result<()> {
    {
        let orchestrator =
            ArchiveOrchestrator::new(db.clone(), store.clone(), config.archiver.clone());
        for report in orchestrator.backlog_report().await? {
            log::info!(
                "{}: {} pending records across {} days",
                report.table_name,
                report.pending_records,
                report.pending_days
            );
        }
    }

    let recovery = RecoveryService::new(db.clone(), store.clone(), config.archiver.clone());
    let recovered = recovery.run().await?;
    for day in &recovered {
        if !day.promoted {
            log::warn!(
                "recovery left {} {} non-terminal: {} failures",
                day.table_name,
                day.day,
                day.failures.len()
            );
        }
    }

    let orchestrator = ArchiveOrchestrator::new(db, store, config.archiver);
    let summary = orchestrator.run().await?;

    for table in &summary.tables {
        log::info!(
            "{}: {} days, {} hours archived, {} skipped, {} rows archived, {} rows deleted, {} errors",
            table.table_name,
            table.days_processed,
            table.hours_completed,
            table.hours_skipped,
            table.records_archived,
            table.records_deleted,
            table.errors
        );
    }

    let errors = summary.total_errors();
    if errors > 0 {
        anyhow::bail!("archival run finished with {errors} failed hours");
    }
    Ok(())
}
