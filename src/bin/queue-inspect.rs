use anyhow::{anyhow, Result};
use clap::Parser;
use std::path::PathBuf;

use retail_sync::config;
use retail_sync::db::{self, queue, sync_log};
use retail_sync::model::{ms_to_datetime, QueueStatus};

#[derive(Parser, Debug)]
#[command(author, version, about = "Show the local mutation queue and recent sync passes")]
struct Args {
    /// Path to YAML config
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,

    /// Only list items with this status (pending, syncing, synced, failed)
    #[arg(long)]
    status: Option<String>,

    /// Put failed items back to pending with a fresh attempt budget
    #[arg(long)]
    retry_failed: bool,

    /// Number of sync log entries to show
    #[arg(long, default_value = "5")]
    log: i64,
}

fn fmt_ms(ms: i64) -> String {
    ms_to_datetime(ms)
        .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_else(|| ms.to_string())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let cfg = config::load(Some(&args.config))?;
    let session = cfg.session();

    let status = args
        .status
        .as_deref()
        .map(|s| QueueStatus::parse(s).ok_or_else(|| anyhow!("unknown status {}", s)))
        .transpose()?;

    let database_url = std::env::var("DATABASE_URL").unwrap_or_else(|_| cfg.database_url());
    let pool = db::init_pool(&database_url).await?;
    db::run_migrations(&pool).await?;

    if args.retry_failed {
        let n = queue::retry_failed(&pool, session.store_id).await?;
        println!("Requeued {} failed item(s)", n);
    }

    let counts = queue::counts(&pool, session.store_id).await?;
    println!("Store {}", session.store_id);
    println!(
        "  pending: {}  syncing: {}  failed: {}  synced: {}",
        counts.pending, counts.syncing, counts.failed, counts.synced
    );

    let items = queue::list(&pool, session.store_id, status).await?;
    println!("Items:");
    for item in items {
        println!(
            "  #{} [{}] {}/{} id={} attempts={} created={}",
            item.seq,
            item.status.as_str(),
            item.entity_type.as_str(),
            item.operation.as_str(),
            item.entity_id.or(item.local_id).unwrap_or_else(|| "-".into()),
            item.attempts,
            fmt_ms(item.created_at),
        );
        if let Some(err) = item.last_error {
            println!("      last error: {}", err);
        }
    }

    println!("Recent passes:");
    for entry in sync_log::recent(&pool, session.store_id, args.log).await? {
        println!(
            "  {} total={} synced={} failed={}{}",
            fmt_ms(entry.started_at),
            entry.total,
            entry.synced,
            entry.failed,
            entry.last_error.map(|e| format!(" last_error={}", e)).unwrap_or_default(),
        );
    }
    Ok(())
}
