//! Mutation Queue: durable log of writes waiting to reach the remote store.
//!
//! Items drain in `priority ASC, seq ASC` order. Only the sync engine moves an
//! item between statuses.
use anyhow::{anyhow, Context, Result};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, Sqlite, Transaction};
use std::time::Duration;
use tracing::{instrument, warn};
use uuid::Uuid;

use super::model::QueueCounts;
use super::{cache, Pool};
use crate::error::SyncError;
use crate::model::{now_ms, CachedEntity, EntityType, NewQueueItem, Operation, QueueItem, QueueStatus};

const SELECT_COLUMNS: &str = "SELECT seq, client_ref, store_id, entity_type, operation, entity_id, local_id, data, priority, attempts, status, last_error, created_at, updated_at, synced_at FROM sync_queue";

fn row_to_item(row: &SqliteRow) -> Result<QueueItem> {
    let entity_type: String = row.try_get("entity_type")?;
    let operation: String = row.try_get("operation")?;
    let status: String = row.try_get("status")?;
    let data: String = row.try_get("data")?;
    Ok(QueueItem {
        seq: row.try_get("seq")?,
        client_ref: row.try_get("client_ref")?,
        store_id: row.try_get("store_id")?,
        entity_type: EntityType::parse(&entity_type)
            .ok_or_else(|| anyhow!("queue item has unknown entity type {}", entity_type))?,
        operation: Operation::parse(&operation)
            .ok_or_else(|| anyhow!("queue item has unknown operation {}", operation))?,
        entity_id: row.try_get("entity_id")?,
        local_id: row.try_get("local_id")?,
        data: serde_json::from_str(&data).context("corrupt queue payload")?,
        priority: row.try_get("priority")?,
        attempts: row.try_get("attempts")?,
        status: QueueStatus::parse(&status)
            .ok_or_else(|| anyhow!("queue item has unknown status {}", status))?,
        last_error: row.try_get("last_error")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
        synced_at: row.try_get("synced_at")?,
    })
}

/// Decode rows, setting aside the ones that no longer parse as `(seq, error)`.
fn decode_rows(rows: &[SqliteRow]) -> (Vec<QueueItem>, Vec<(i64, String)>) {
    let mut items = Vec::with_capacity(rows.len());
    let mut broken = Vec::new();
    for row in rows {
        match row_to_item(row) {
            Ok(item) => items.push(item),
            Err(e) => {
                let seq: i64 = row.try_get("seq").unwrap_or_default();
                warn!(seq, error = %e, "skipping undecodable queue item");
                broken.push((seq, format!("{:#}", e)));
            }
        }
    }
    (items, broken)
}

/// Append an item. Once this returns the write is durable.
#[instrument(skip_all, fields(entity = item.entity_type.as_str(), op = item.operation.as_str()))]
pub async fn enqueue(pool: &Pool, store_id: i64, item: NewQueueItem) -> Result<String> {
    let mut tx = pool.begin().await?;
    let client_ref = enqueue_tx(&mut tx, store_id, &item).await?;
    tx.commit().await?;
    Ok(client_ref)
}

/// Optimistic cache write plus its queue item, committed together.
#[instrument(skip_all, fields(entity = item.entity_type.as_str(), op = item.operation.as_str()))]
pub async fn enqueue_with_cache(pool: &Pool, record: &CachedEntity, item: NewQueueItem) -> Result<String> {
    let mut tx = pool.begin().await?;
    cache::put_tx(&mut tx, record).await?;
    let client_ref = enqueue_tx(&mut tx, record.store_id, &item).await?;
    tx.commit().await?;
    Ok(client_ref)
}

async fn enqueue_tx(tx: &mut Transaction<'_, Sqlite>, store_id: i64, item: &NewQueueItem) -> Result<String> {
    let client_ref = item.client_ref.clone().unwrap_or_else(|| Uuid::new_v4().to_string());
    let now = now_ms();
    sqlx::query(
        "INSERT INTO sync_queue (client_ref, store_id, entity_type, operation, entity_id, local_id, data, priority, attempts, status, created_at, updated_at) \
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, 0, 'pending', ?, ?)",
    )
    .bind(&client_ref)
    .bind(store_id)
    .bind(item.entity_type.as_str())
    .bind(item.operation.as_str())
    .bind(&item.entity_id)
    .bind(&item.local_id)
    .bind(serde_json::to_string(&item.data)?)
    .bind(item.priority)
    .bind(now)
    .bind(now)
    .execute(&mut **tx)
    .await?;
    Ok(client_ref)
}

/// Items the next pass should attempt: pending, or failed with retries left.
#[instrument(skip_all, fields(store_id = store_id))]
pub async fn get_pending(pool: &Pool, store_id: i64, max_attempts: i64) -> Result<Vec<QueueItem>> {
    let rows = sqlx::query(&format!(
        "{} WHERE store_id = ? AND (status = 'pending' OR (status = 'failed' AND attempts < ?)) ORDER BY priority ASC, seq ASC",
        SELECT_COLUMNS
    ))
    .bind(store_id)
    .bind(max_attempts)
    .fetch_all(pool)
    .await?;
    let (items, broken) = decode_rows(&rows);
    for (seq, error) in broken {
        // Decoding will never succeed, so park the row past the retry cap.
        sqlx::query(
            "UPDATE sync_queue SET status = 'failed', attempts = MAX(attempts + 1, ?), last_error = ?, updated_at = ? WHERE seq = ?",
        )
        .bind(max_attempts)
        .bind(error)
        .bind(now_ms())
        .bind(seq)
        .execute(pool)
        .await?;
    }
    Ok(items)
}

pub async fn get(pool: &Pool, client_ref: &str) -> Result<Option<QueueItem>> {
    let row = sqlx::query(&format!("{} WHERE client_ref = ?", SELECT_COLUMNS))
        .bind(client_ref)
        .fetch_optional(pool)
        .await?;
    row.as_ref().map(row_to_item).transpose()
}

/// Every item for a store in drain order, optionally filtered by status.
pub async fn list(pool: &Pool, store_id: i64, status: Option<QueueStatus>) -> Result<Vec<QueueItem>> {
    let rows = match status {
        Some(status) => {
            sqlx::query(&format!(
                "{} WHERE store_id = ? AND status = ? ORDER BY priority ASC, seq ASC",
                SELECT_COLUMNS
            ))
            .bind(store_id)
            .bind(status.as_str())
            .fetch_all(pool)
            .await?
        }
        None => {
            sqlx::query(&format!(
                "{} WHERE store_id = ? ORDER BY priority ASC, seq ASC",
                SELECT_COLUMNS
            ))
            .bind(store_id)
            .fetch_all(pool)
            .await?
        }
    };
    Ok(decode_rows(&rows).0)
}

pub async fn mark_item_syncing(pool: &Pool, client_ref: &str) -> Result<()> {
    sqlx::query("UPDATE sync_queue SET status = 'syncing', updated_at = ? WHERE client_ref = ?")
        .bind(now_ms())
        .bind(client_ref)
        .execute(pool)
        .await?;
    Ok(())
}

#[instrument(skip_all, fields(client_ref = client_ref))]
pub async fn mark_item_synced(pool: &Pool, client_ref: &str) -> Result<()> {
    let mut tx = pool.begin().await?;
    mark_item_synced_tx(&mut tx, client_ref).await?;
    tx.commit().await?;
    Ok(())
}

async fn mark_item_synced_tx(tx: &mut Transaction<'_, Sqlite>, client_ref: &str) -> Result<()> {
    let now = now_ms();
    let res = sqlx::query(
        "UPDATE sync_queue SET status = 'synced', last_error = NULL, synced_at = ?, updated_at = ? WHERE client_ref = ?",
    )
    .bind(now)
    .bind(now)
    .bind(client_ref)
    .execute(&mut **tx)
    .await?;
    if res.rows_affected() == 0 {
        return Err(anyhow!("queue item {} not found", client_ref));
    }
    Ok(())
}

/// Mark a create as synced and migrate its temporary id in the same
/// transaction, so a crash cannot leave children pointing at the old id.
pub async fn complete_create(
    pool: &Pool,
    client_ref: &str,
    local_id: Option<&str>,
    server_id: &str,
) -> Result<(), SyncError> {
    let mut tx = pool.begin().await.map_err(anyhow::Error::from)?;
    mark_item_synced_tx(&mut tx, client_ref).await?;
    if let Some(local_id) = local_id {
        cache::mark_synced_tx(&mut tx, local_id, server_id).await?;
    }
    tx.commit().await.map_err(anyhow::Error::from)?;
    Ok(())
}

#[instrument(skip_all, fields(client_ref = client_ref))]
pub async fn mark_item_failed(pool: &Pool, client_ref: &str, error: &str) -> Result<()> {
    sqlx::query(
        "UPDATE sync_queue SET status = 'failed', attempts = attempts + 1, last_error = ?, updated_at = ? WHERE client_ref = ?",
    )
    .bind(error)
    .bind(now_ms())
    .bind(client_ref)
    .execute(pool)
    .await?;
    Ok(())
}

/// Garbage-collect synced items older than `retention`. Returns rows removed.
#[instrument(skip_all, fields(store_id = store_id))]
pub async fn clear_synced(pool: &Pool, store_id: i64, retention: Duration) -> Result<u64> {
    let cutoff = now_ms() - retention.as_millis() as i64;
    let res = sqlx::query("DELETE FROM sync_queue WHERE store_id = ? AND status = 'synced' AND synced_at <= ?")
        .bind(store_id)
        .bind(cutoff)
        .execute(pool)
        .await?;
    Ok(res.rows_affected())
}

pub async fn counts(pool: &Pool, store_id: i64) -> Result<QueueCounts> {
    let rows: Vec<(String, i64)> =
        sqlx::query_as("SELECT status, COUNT(*) FROM sync_queue WHERE store_id = ? GROUP BY status")
            .bind(store_id)
            .fetch_all(pool)
            .await?;
    let mut counts = QueueCounts::default();
    for (status, n) in rows {
        match QueueStatus::parse(&status) {
            Some(QueueStatus::Pending) => counts.pending = n,
            Some(QueueStatus::Syncing) => counts.syncing = n,
            Some(QueueStatus::Synced) => counts.synced = n,
            Some(QueueStatus::Failed) => counts.failed = n,
            None => {}
        }
    }
    Ok(counts)
}

/// Whether a pass would find anything to do.
pub async fn has_retryable(pool: &Pool, store_id: i64, max_attempts: i64) -> Result<bool> {
    let n: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM sync_queue WHERE store_id = ? AND (status = 'pending' OR (status = 'failed' AND attempts < ?))",
    )
    .bind(store_id)
    .bind(max_attempts)
    .fetch_one(pool)
    .await?;
    Ok(n > 0)
}

/// Manual retry: failed items go back to pending with a fresh attempt budget.
#[instrument(skip_all, fields(store_id = store_id))]
pub async fn retry_failed(pool: &Pool, store_id: i64) -> Result<u64> {
    let res = sqlx::query(
        "UPDATE sync_queue SET status = 'pending', attempts = 0, updated_at = ? WHERE store_id = ? AND status = 'failed'",
    )
    .bind(now_ms())
    .bind(store_id)
    .execute(pool)
    .await?;
    Ok(res.rows_affected())
}

/// Drop outstanding items for a record that is being deleted before it ever
/// reached the server.
pub async fn cancel_for_local_id(pool: &Pool, local_id: &str) -> Result<u64> {
    let res = sqlx::query(
        "DELETE FROM sync_queue WHERE status != 'synced' AND (local_id = ? OR entity_id = ?)",
    )
    .bind(local_id)
    .bind(local_id)
    .execute(pool)
    .await?;
    Ok(res.rows_affected())
}

/// Items left in `syncing` by a crash mid-pass go back to `pending`.
pub async fn recover_interrupted(pool: &Pool) -> Result<u64> {
    let res = sqlx::query("UPDATE sync_queue SET status = 'pending', updated_at = ? WHERE status = 'syncing'")
        .bind(now_ms())
        .execute(pool)
        .await?;
    Ok(res.rows_affected())
}
