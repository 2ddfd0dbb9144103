//! # Route Optimization Jobs Entry Point
//!
//! Command-line front end: runs the worker, applies migrations, enqueues jobs
//! and reports job status.

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::info;
use uuid::Uuid;

use route_jobs::{
    config::{AppConfig, ConfigLoader},
    db,
    dispatcher::{DispatcherConfig, OptimizationDispatcher},
    optimizer::HttpOptimizer,
    repositories::{NewOptimizationJob, OptimizationJobRepository},
    telemetry::init_tracing,
};

#[derive(Debug, Parser)]
#[command(name = "route-optimizer-jobs", version, about = "Route optimization job worker")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Start the worker and process jobs until SIGINT/SIGTERM
    Run,
    /// Apply database migrations and exit
    Migrate,
    /// Queue a new optimization job and print its id
    Enqueue {
        #[arg(long)]
        route_id: i64,
        #[arg(long, default_value = "fastest")]
        mode: String,
        #[arg(long)]
        avoid_tolls: bool,
        #[arg(long)]
        preserve_order: bool,
        #[arg(long)]
        time_deviation: bool,
        #[arg(long, default_value = "cli")]
        requested_by: String,
    },
    /// Print the status of a job as JSON
    Status { id: Uuid },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = ConfigLoader::new()
        .load()
        .context("loading configuration")?;
    init_tracing(&config).context("initializing tracing")?;

    info!(profile = %config.profile, "Loaded configuration");
    if let Ok(redacted_json) = config.redacted_json() {
        tracing::debug!(config = %redacted_json, "Effective configuration");
    }

    match cli.command {
        Command::Run => run_worker(config).await,
        Command::Migrate => {
            let db = connect(&config).await?;
            db::apply_migrations(&db)
                .await
                .context("applying migrations")?;
            Ok(())
        }
        Command::Enqueue {
            route_id,
            mode,
            avoid_tolls,
            preserve_order,
            time_deviation,
            requested_by,
        } => {
            let db = connect(&config).await?;
            let repository = OptimizationJobRepository::new(db);
            let job = repository
                .enqueue(NewOptimizationJob {
                    target_route_id: route_id,
                    optimization_mode: mode,
                    avoid_tolls,
                    preserve_order,
                    is_time_deviation_optimization: time_deviation,
                    requested_by,
                })
                .await
                .context("enqueueing optimization job")?;
            println!("{}", job.id);
            Ok(())
        }
        Command::Status { id } => {
            let db = connect(&config).await?;
            let repository = OptimizationJobRepository::new(db);
            let view = repository
                .status(id)
                .await
                .context("loading job status")?
                .with_context(|| format!("optimization job {id} not found"))?;
            println!("{}", serde_json::to_string_pretty(&view)?);
            Ok(())
        }
    }
}

async fn connect(config: &AppConfig) -> Result<sea_orm::DatabaseConnection> {
    db::init_pool(config)
        .await
        .context("initializing database connection pool")
}

async fn run_worker(config: AppConfig) -> Result<()> {
    let base_url = config.require_optimizer_base_url()?;
    let optimizer = HttpOptimizer::new(base_url, config.optimizer_api_key.clone())
        .context("building optimizer client")?;

    let db = connect(&config).await?;
    db::apply_migrations(&db)
        .await
        .context("applying migrations")?;
    db::health_check(&db).await.context("database health check")?;

    let shutdown = CancellationToken::new();
    let dispatcher = OptimizationDispatcher::new(
        db,
        Arc::new(optimizer),
        DispatcherConfig::from(&config.worker),
        shutdown.clone(),
    );

    let worker = tokio::spawn(async move { dispatcher.run().await });

    shutdown_signal().await;
    shutdown.cancel();

    worker.await.context("dispatcher task failed")?;
    info!("Worker stopped");
    Ok(())
}

/// Completes on SIGINT (Ctrl-C) or, on Unix, SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %err, "Failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                tracing::error!(error = %err, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            info!("Received SIGINT (Ctrl-C), starting graceful shutdown");
        }
        () = terminate => {
            info!("Received SIGTERM, starting graceful shutdown");
        }
    }
}
