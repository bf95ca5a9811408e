//! CiteGraph Crawler
//!
//! Usage:
//!   crawler seed <paper-id>...   enqueue seed papers
//!   crawler run                  run discovery workers until drained or halted
//!   crawler status               print queue counts and failed entries
//!   crawler retry <paper-id>...  requeue terminally failed entries

use anyhow::{bail, Context};
use citegraph_common::config::{AppConfig, ObservabilityConfig};
use citegraph_common::db::DbPool;
use citegraph_common::metrics::{self, FETCH_BUCKETS, METRICS_PREFIX};
use citegraph_common::VERSION;
use citegraph_crawler::{DiscoveryOrchestrator, SemanticScholarClient};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::signal;
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

/// Failed entries listed by `status`
const STATUS_FAILED_LIMIT: u64 = 20;

enum Command {
    Seed(Vec<String>),
    Run,
    Status,
    Retry(Vec<String>),
}

impl Command {
    fn parse(args: &[String]) -> anyhow::Result<Self> {
        let Some((name, rest)) = args.split_first() else {
            bail!(usage());
        };

        let ids: Vec<String> = rest.iter().map(|s| s.trim().to_string()).filter(|s| !s.is_empty()).collect();

        match name.as_str() {
            "seed" if !ids.is_empty() => Ok(Command::Seed(ids)),
            "retry" if !ids.is_empty() => Ok(Command::Retry(ids)),
            "run" => Ok(Command::Run),
            "status" => Ok(Command::Status),
            _ => bail!(usage()),
        }
    }
}

fn usage() -> String {
    "usage: crawler <seed <paper-id>... | run | status | retry <paper-id>...>".to_string()
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables
    dotenvy::dotenv().ok();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let command = Command::parse(&args)?;

    let config = AppConfig::load().context("Failed to load configuration")?;
    init_tracing(&config.observability);
    config.validate().map_err(|e| {
        error!(error = %e, "Invalid configuration");
        e
    })?;

    info!("Starting CiteGraph Crawler v{}", VERSION);

    let db = DbPool::new(&config.database).await?;
    db.migrate().await?;

    let client = Arc::new(SemanticScholarClient::new(&config.bibliographic)?);
    let orchestrator = Arc::new(DiscoveryOrchestrator::from_config(db, client, &config));

    match command {
        Command::Seed(ids) => {
            for (paper_id, outcome) in orchestrator.seed(&ids).await? {
                println!("{paper_id}\t{outcome:?}");
            }
        }
        Command::Retry(ids) => {
            for paper_id in ids {
                orchestrator.queue().retry_failed(&paper_id).await?;
                println!("{paper_id}\trequeued");
            }
        }
        Command::Status => print_status(&orchestrator).await?,
        Command::Run => {
            init_metrics(&config.observability)?;

            let (halt_tx, halt_rx) = watch::channel(false);
            tokio::spawn(async move {
                shutdown_signal().await;
                let _ = halt_tx.send(true);
            });

            let summary = orchestrator.run(halt_rx).await?;
            println!(
                "completed={} unavailable={} rescheduled={} failed={} lease_lost={} errors={}",
                summary.completed,
                summary.unavailable,
                summary.rescheduled,
                summary.failed,
                summary.lease_lost,
                summary.errors
            );
        }
    }

    Ok(())
}

fn init_tracing(config: &ObservabilityConfig) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));
    let builder = tracing_subscriber::fmt().with_env_filter(filter).with_target(true);

    if config.json_logging {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn init_metrics(config: &ObservabilityConfig) -> anyhow::Result<()> {
    if config.metrics_port == 0 {
        return Ok(());
    }

    let addr = SocketAddr::from(([0, 0, 0, 0], config.metrics_port));
    PrometheusBuilder::new()
        .with_http_listener(addr)
        .add_global_label("service", config.service_name.clone())
        .set_buckets_for_metric(
            Matcher::Full(format!("{}_fetch_duration_seconds", METRICS_PREFIX)),
            FETCH_BUCKETS,
        )?
        .install()
        .context("Failed to install Prometheus exporter")?;

    metrics::register_metrics();
    info!(%addr, "Metrics exporter listening");
    Ok(())
}

async fn print_status(orchestrator: &DiscoveryOrchestrator) -> anyhow::Result<()> {
    orchestrator.repository().pool().ping().await?;

    let counts = orchestrator.queue().counts().await?;
    let papers = orchestrator.repository().paper_count().await?;
    let edges = orchestrator.repository().edge_count().await?;

    println!("pending     {}", counts.pending);
    println!("processing  {}", counts.processing);
    println!("completed   {}", counts.completed);
    println!("failed      {}", counts.failed);
    println!("papers      {papers}");
    println!("edges       {edges}");

    let failed = orchestrator.queue().failed_entries(STATUS_FAILED_LIMIT).await?;
    if !failed.is_empty() {
        println!();
        for entry in failed {
            println!(
                "{}\tretries={}\t{}",
                entry.paper_id,
                entry.retry_count,
                entry.last_error.as_deref().unwrap_or("-")
            );
        }
    }

    Ok(())
}

/// Resolve on Ctrl+C or SIGTERM
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C, halting workers..."),
        _ = terminate => info!("Received SIGTERM, halting workers..."),
    }
}
