mod firehose;
mod metrics_server;
mod relay_backfill;
mod repo_backfill;
mod wire;

use std::env;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use appview_core::config::CoreConfig;
use appview_core::cursor::CursorStore;
use appview_core::deferred::DeferredOpReconciler;
use appview_core::identity::IdentityResolver;
use appview_core::opt_out::OptOutCache;
use appview_core::processor::EventProcessor;
use appview_core::queue::{BackpressurePolicy, DispatchQueue};
use appview_core::storage::postgres::PostgresStorage;
use appview_core::storage::Storage;
use clap::Parser;
use deadpool_postgres::{Config, ManagerConfig, PoolConfig, RecyclingMethod, Runtime, Timeouts};
use tokio_postgres::NoTls;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// CLI surface, grounded in `rsky-indexer/src/bin/indexer.rs`'s `Args` and
/// `rsky-wintermute`'s `direct_index` binary: normal operation runs as a
/// long-lived service (mode chosen by `INGEST_MODE`); the one-off flags
/// below bypass that entirely for operational/backfill tooling.
#[derive(Debug, Parser)]
#[command(name = "appview-ingest")]
#[command(about = "Firehose ingestion and backfill for the appview")]
struct Args {
    /// Backfill a single repo by DID, bypassing the firehose entirely.
    #[arg(long)]
    index_repo: Option<String>,

    /// Backfill multiple repos from a CSV file (one DID per line, optional header).
    #[arg(long)]
    index_repos_file: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::dotenv();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "appview_ingest=info,appview_core=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();
    let config = CoreConfig::from_env();
    let pool = build_pool(&config)?;
    let pg_storage = Arc::new(PostgresStorage::new(pool));
    let storage: Arc<dyn Storage> = pg_storage.clone();
    let plc_url = env::var("PLC_URL").unwrap_or_else(|_| "https://plc.directory".to_string());
    let identity = IdentityResolver::new(plc_url);
    let deferred = DeferredOpReconciler::new();
    let opt_out = OptOutCache::new();
    let processor = EventProcessor::new(
        storage.clone(),
        identity.clone(),
        deferred,
        opt_out,
        config.max_concurrent_user_creations,
    );

    if let Some(file) = args.index_repos_file {
        info!(file, "bulk repo backfill mode");
        return repo_backfill::backfill_from_file(&file, identity, processor, &config).await;
    }

    if let Some(did) = args.index_repo {
        info!(did, "one-off repo backfill mode");
        let cutoff = config.backfill_cutoff(chrono::Utc::now());
        let (indexed, skipped) = repo_backfill::backfill_one(&did, &identity, &processor, cutoff).await?;
        info!(indexed, skipped, "one-off repo backfill complete");
        return Ok(());
    }

    let metrics_port = env::var("METRICS_PORT")
        .unwrap_or_else(|_| "9090".to_string())
        .parse::<u16>()
        .expect("METRICS_PORT must be a valid port number");
    tokio::spawn(metrics_server::serve(metrics_port));

    let mode = env::var("INGEST_MODE").unwrap_or_else(|_| "live".to_string());
    info!(mode, "starting appview-ingest");

    match mode.as_str() {
        "live" => {
            let cursor_store: Arc<dyn CursorStore> = pg_storage.clone();
            let queue = DispatchQueue::new(
                config.dispatch_queue_capacity,
                BackpressurePolicy::MemoryTriggeredDrop {
                    high_water_mark: config.dispatch_queue_high_water_mark,
                    min_free_memory_mb: config.dispatch_queue_min_free_memory_mb,
                },
            );
            firehose::run(config.relay_url.clone(), storage, cursor_store, processor, queue).await;
        }
        "relay-backfill" => {
            let cursor_store: Arc<dyn CursorStore> = pg_storage.clone();
            relay_backfill::run(config, cursor_store, processor).await;
        }
        "network-backfill" => {
            repo_backfill::backfill_from_relay(&config.relay_url, identity, processor, &config).await?;
        }
        other => {
            error!(mode = other, "unknown INGEST_MODE");
            std::process::exit(1);
        }
    }

    Ok(())
}

fn build_pool(config: &CoreConfig) -> Result<deadpool_postgres::Pool> {
    let mut pg_config = Config::new();
    pg_config.url = Some(config.database_url.clone());
    pg_config.manager = Some(ManagerConfig {
        recycling_method: RecyclingMethod::Fast,
    });
    pg_config.pool = Some(PoolConfig {
        max_size: config.db_pool_max_size,
        timeouts: Timeouts {
            wait: Some(Duration::from_secs(30)),
            create: Some(Duration::from_secs(30)),
            recycle: Some(Duration::from_secs(30)),
        },
        ..Default::default()
    });
    Ok(pg_config.create_pool(Some(Runtime::Tokio1), NoTls)?)
}
