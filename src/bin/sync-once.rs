use anyhow::{bail, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, warn};

use retail_sync::config;
use retail_sync::connectivity::Connectivity;
use retail_sync::db::{self, queue};
use retail_sync::remote::{PostgrestClient, RemoteStore};
use retail_sync::sync::{Notifier, SyncEngine};

#[derive(Debug, Parser)]
#[command(
    author,
    version,
    about = "Drain the local mutation queue to the remote store and exit"
)]
struct Args {
    /// Path to YAML config file
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,

    /// Attempts before a failed item is left for manual retry (default: from config)
    #[arg(long)]
    max_attempts: Option<i64>,

    /// Upper bound on passes; each pass retries items that failed in the previous one
    #[arg(long, default_value = "5")]
    max_passes: u32,
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
    queue::recover_interrupted(&pool).await?;

    let session = cfg.session();
    let initial = queue::counts(&pool, session.store_id).await?;
    info!(
        pending = initial.pending,
        failed = initial.failed,
        synced = initial.synced,
        "initial queue state"
    );
    if initial.outstanding() == 0 {
        info!("nothing to sync, exiting");
        return Ok(());
    }

    let remote: Arc<dyn RemoteStore> = Arc::new(PostgrestClient::new(
        &cfg.remote.url,
        cfg.remote.api_key.clone(),
        cfg.request_timeout(),
    )?);
    if let Err(err) = remote.ping().await {
        error!(%err, "remote store unreachable");
        bail!("remote store unreachable: {}", err);
    }

    let mut settings = cfg.engine_settings();
    if let Some(max_attempts) = args.max_attempts {
        settings.max_attempts = max_attempts;
    }
    let connectivity = Connectivity::new(true, Notifier::new());
    let engine = SyncEngine::new(pool.clone(), remote, connectivity, settings);

    for pass in 1..=args.max_passes {
        let Some(report) = engine.run_sync_pass(&session).await? else {
            break;
        };
        info!(
            pass,
            total = report.total,
            synced = report.synced,
            failed = report.failed,
            "pass complete"
        );
        if report.synced == 0 || !engine.has_work(&session).await? {
            break;
        }
    }

    let remaining = queue::counts(&pool, session.store_id).await?;
    if remaining.failed > 0 {
        warn!(
            failed = remaining.failed,
            "items still failing; inspect them with queue-inspect --status failed"
        );
    } else {
        info!("queue drained");
    }
    Ok(())
}
