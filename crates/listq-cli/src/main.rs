use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use listq_extract::{select_strategy, RemoteBrowserEngine, RotatingProfiles};
use listq_storage::JobStore;
use listq_worker::{build_sweep_scheduler, sweep_stale, QueueWorker, WorkerConfig};
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use uuid::Uuid;

#[derive(Debug, Parser)]
#[command(name = "listq-cli")]
#[command(about = "Listing capture queue worker and operator tools")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Poll the queue until Ctrl-C.
    Work,
    /// Process eligible jobs until the queue is idle, then exit.
    Once,
    /// Reset jobs stuck in `processing` back to `pending`.
    Sweep {
        #[arg(long)]
        stale_after_secs: Option<u64>,
    },
    /// Move one failed or captcha job back to `pending`.
    Requeue { id: Uuid },
    Enqueue {
        url: String,
        #[arg(long)]
        user_id: Option<String>,
    },
    /// Print the introspected columns of a table.
    Columns { table: String },
    Stats,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,listq=debug,sqlx=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    let config = WorkerConfig::from_env();
    let tables = config.table_names().context("invalid table name in configuration")?;
    let store = listq_storage::connect(&config.database_url, tables)
        .await
        .with_context(|| format!("connecting to {}", config.database_url))?;

    match cli.command.unwrap_or(Commands::Work) {
        Commands::Work => work(store, &config).await?,
        Commands::Once => {
            let worker = build_worker(store, &config).await?;
            let summary = worker.drain().await;
            println!(
                "drained: processed={} completed={} errors={} captchas={} storage_failures={}",
                summary.processed, summary.completed, summary.errors, summary.captchas, summary.storage_failures
            );
            if summary.storage_failures > 0 {
                bail!("storage failure while draining the queue");
            }
        }
        Commands::Sweep { stale_after_secs } => {
            let stale_after = stale_after_secs.map(Duration::from_secs).unwrap_or(config.stale_after);
            let reset = sweep_stale(store.as_ref(), Utc::now(), stale_after).await?;
            println!("reset {reset} stale job(s)");
        }
        Commands::Requeue { id } => {
            if store.requeue_job(id, Utc::now()).await? {
                println!("requeued {id}");
            } else {
                bail!("job {id} not found or not in error/captcha");
            }
        }
        Commands::Enqueue { url, user_id } => {
            let id = store.insert_job(&url, user_id.as_deref(), Utc::now()).await?;
            println!("{id}");
        }
        Commands::Columns { table } => {
            let info = store.columns(&table).await?;
            if info.is_empty() {
                println!("table {table} not found");
            }
            for column in &info.columns {
                println!("{}\t{}", column.name, column.declared_type);
            }
        }
        Commands::Stats => {
            for (status, count) in store.status_counts().await? {
                println!("{status}\t{count}");
            }
        }
    }

    Ok(())
}

async fn build_worker(store: Arc<dyn JobStore>, config: &WorkerConfig) -> Result<QueueWorker> {
    let engine = Arc::new(RemoteBrowserEngine::new(config.engine_url.clone())?);
    let profiles = RotatingProfiles::from_lists(&config.user_agents, &config.proxies);
    if profiles.is_empty() {
        warn!("no user agents or proxies configured; engine defaults apply");
    }
    let selection = select_strategy(config.strategy, engine, Arc::new(profiles)).await;
    Ok(QueueWorker::from_config(store, selection.strategy, config))
}

async fn work(store: Arc<dyn JobStore>, config: &WorkerConfig) -> Result<()> {
    let mut scheduler = match &config.sweep_cron {
        Some(cron) => {
            let scheduler = build_sweep_scheduler(store.clone(), cron, config.stale_after).await?;
            scheduler.start().await.context("starting sweep scheduler")?;
            info!(cron = %cron, "stale sweep scheduled");
            Some(scheduler)
        }
        None => {
            sweep_stale(store.as_ref(), Utc::now(), config.stale_after).await?;
            None
        }
    };

    let worker = build_worker(store, config).await?;
    let (tx, rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("shutdown requested; finishing current job");
            let _ = tx.send(true);
        }
    });
    let summary = worker.run(rx).await;

    if let Some(scheduler) = scheduler.as_mut() {
        scheduler.shutdown().await.context("stopping sweep scheduler")?;
    }
    if summary.storage_failures > 0 {
        warn!(storage_failures = summary.storage_failures, "worker saw storage failures");
    }
    Ok(())
}
