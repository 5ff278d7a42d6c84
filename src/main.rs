use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};

use retail_sync::config;
use retail_sync::connectivity::{self, Connectivity};
use retail_sync::db::{self, queue};
use retail_sync::remote::{PostgrestClient, RemoteStore};
use retail_sync::scheduler;
use retail_sync::sync::{Notifier, SyncEngine, SyncEvent};

#[derive(Debug, Parser)]
#[command(author, version, about = "Replay queued retail writes whenever the remote store is reachable")]
struct Args {
    /// Path to YAML config file
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_target(false)
        .compact()
        .init();

    let args = Args::parse();
    let cfg = config::load(Some(&args.config))?;
    cfg.ensure_dirs()?;

    let database_url = std::env::var("DATABASE_URL").unwrap_or_else(|_| cfg.database_url());
    let pool = db::init_pool(&database_url).await?;
    db::run_migrations(&pool).await?;

    let recovered = queue::recover_interrupted(&pool).await?;
    if recovered > 0 {
        warn!(recovered, "requeued items interrupted by a previous shutdown");
    }

    let remote: Arc<dyn RemoteStore> = Arc::new(PostgrestClient::new(
        &cfg.remote.url,
        cfg.remote.api_key.clone(),
        cfg.request_timeout(),
    )?);
    let initially_online = remote.ping().await.is_ok();
    let notifier = Notifier::new();
    let connectivity = Connectivity::new(initially_online, notifier.clone());
    let probe = connectivity::spawn_probe(remote.clone(), connectivity.clone(), cfg.probe_interval());

    // Stand-in for toasts: surface notifications in the log.
    let mut events = notifier.subscribe();
    let event_log = tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => log_event(event),
                Err(RecvError::Lagged(skipped)) => warn!(skipped, "dropped sync notifications"),
                Err(RecvError::Closed) => break,
            }
        }
    });

    let session = cfg.session();
    let engine = Arc::new(SyncEngine::new(pool, remote, connectivity, cfg.engine_settings()));
    let handle = scheduler::spawn(engine, session.clone(), cfg.scheduler_settings());

    info!(store_id = session.store_id, online = initially_online, "retail sync running");
    tokio::signal::ctrl_c().await?;
    info!("shutting down");
    handle.shutdown().await;
    probe.abort();
    event_log.abort();
    Ok(())
}

fn log_event(event: SyncEvent) {
    match event {
        SyncEvent::WentOnline => info!("back online; syncing queued changes"),
        SyncEvent::WentOffline => warn!("offline; changes will be queued"),
        SyncEvent::PassStarted { total } => info!(total, "syncing"),
        SyncEvent::ItemFailed { entity_type, error, .. } => {
            warn!(entity_type = %entity_type, error = %error, "change failed to sync")
        }
        SyncEvent::PassFinished(report) => info!(synced = report.synced, failed = report.failed, "sync finished"),
    }
}
