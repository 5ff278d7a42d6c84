use anyhow::Result;
use tracing::instrument;

use super::model::SyncLogEntry;
use super::Pool;
use crate::model::SyncReport;

#[instrument(skip_all, fields(store_id = store_id))]
pub async fn record_pass(
    pool: &Pool,
    store_id: i64,
    report: &SyncReport,
    last_error: Option<&str>,
) -> Result<i64> {
    let id: i64 = sqlx::query_scalar(
        "INSERT INTO sync_log (store_id, started_at, finished_at, total, synced, failed, last_error) VALUES (?, ?, ?, ?, ?, ?, ?) RETURNING id",
    )
    .bind(store_id)
    .bind(report.started_at)
    .bind(report.finished_at)
    .bind(report.total as i64)
    .bind(report.synced as i64)
    .bind(report.failed as i64)
    .bind(last_error)
    .fetch_one(pool)
    .await?;
    Ok(id)
}

/// Most recent passes first.
pub async fn recent(pool: &Pool, store_id: i64, limit: i64) -> Result<Vec<SyncLogEntry>> {
    let rows = sqlx::query_as::<_, SyncLogEntry>(
        "SELECT id, store_id, started_at, finished_at, total, synced, failed, last_error FROM sync_log WHERE store_id = ? ORDER BY id DESC LIMIT ?",
    )
    .bind(store_id)
    .bind(limit)
    .fetch_all(pool)
    .await?;
    Ok(rows)
}
