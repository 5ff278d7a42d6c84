//! Local Cache Store: durable copies of remote records, keyed by a temporary
//! local id until the server assigns one.
use std::collections::HashSet;

use anyhow::{Context, Result};
use serde_json::Value;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, Sqlite, Transaction};
use tracing::{instrument, warn};

use super::Pool;
use crate::error::SyncError;
use crate::model::{now_ms, CachedEntity, EntityType};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoveOutcome {
    /// The record never reached the server and is gone.
    HardDeleted,
    /// The record is hidden locally until the remote delete is confirmed.
    Tombstoned,
    NotFound,
}

const SELECT_COLUMNS: &str =
    "SELECT id, entity_type, store_id, local_id, server_id, payload, dirty, deleted, updated_at FROM cached_entities";

fn row_to_entity(row: &SqliteRow) -> Result<CachedEntity> {
    let entity_type: String = row.try_get("entity_type")?;
    let entity_type = EntityType::parse(&entity_type)
        .with_context(|| format!("unknown entity type {}", entity_type))?;
    let payload: String = row.try_get("payload")?;
    let payload: Value = serde_json::from_str(&payload).context("corrupt cached payload")?;
    Ok(CachedEntity {
        local_id: row.try_get("local_id")?,
        server_id: row.try_get("server_id")?,
        entity_type,
        store_id: row.try_get("store_id")?,
        payload,
        dirty: row.try_get::<i64, _>("dirty")? != 0,
        deleted: row.try_get::<i64, _>("deleted")? != 0,
        updated_at: row.try_get("updated_at")?,
    })
}

/// All live (non-tombstoned) records of one type for a store, newest first.
/// Rows that fail to decode are skipped.
#[instrument(skip_all, fields(entity = entity_type.as_str(), store_id = store_id))]
pub async fn get(pool: &Pool, entity_type: EntityType, store_id: i64) -> Result<Vec<CachedEntity>> {
    let rows = sqlx::query(&format!(
        "{} WHERE entity_type = ? AND store_id = ? AND deleted = 0 ORDER BY updated_at DESC, id DESC",
        SELECT_COLUMNS
    ))
    .bind(entity_type.as_str())
    .bind(store_id)
    .fetch_all(pool)
    .await
    .context("failed to read cache")?;

    let mut out = Vec::with_capacity(rows.len());
    for row in &rows {
        match row_to_entity(row) {
            Ok(entity) => out.push(entity),
            Err(err) => {
                let id: i64 = row.try_get("id").unwrap_or_default();
                warn!(?err, row_id = id, "skipping unreadable cache row");
            }
        }
    }
    Ok(out)
}

/// Like [`get`], but storage failures degrade to an empty cache.
pub async fn get_or_empty(pool: &Pool, entity_type: EntityType, store_id: i64) -> Vec<CachedEntity> {
    match get(pool, entity_type, store_id).await {
        Ok(rows) => rows,
        Err(err) => {
            warn!(?err, entity = entity_type.as_str(), store_id, "cache unavailable; treating as empty");
            Vec::new()
        }
    }
}

/// Lookup by local or server id, tombstones included.
pub async fn find(pool: &Pool, entity_type: EntityType, id: &str) -> Result<Option<CachedEntity>> {
    let row = sqlx::query(&format!(
        "{} WHERE entity_type = ? AND (local_id = ? OR server_id = ?) ORDER BY server_id IS NULL LIMIT 1",
        SELECT_COLUMNS
    ))
    .bind(entity_type.as_str())
    .bind(id)
    .bind(id)
    .fetch_optional(pool)
    .await?;
    row.as_ref().map(row_to_entity).transpose()
}

#[instrument(skip_all, fields(entity = record.entity_type.as_str(), id = record.id()))]
pub async fn put(pool: &Pool, record: &CachedEntity) -> Result<()> {
    let mut tx = pool.begin().await?;
    put_tx(&mut tx, record).await?;
    tx.commit().await?;
    Ok(())
}

/// Upsert keyed by `server_id` when known, else by `local_id`.
pub(crate) async fn put_tx(tx: &mut Transaction<'_, Sqlite>, record: &CachedEntity) -> Result<()> {
    let by_server = match record.server_id.as_deref() {
        Some(sid) => sqlx::query_scalar::<_, i64>(
            "SELECT id FROM cached_entities WHERE entity_type = ? AND server_id = ?",
        )
        .bind(record.entity_type.as_str())
        .bind(sid)
        .fetch_optional(&mut **tx)
        .await?,
        None => None,
    };
    let existing = match by_server {
        Some(id) => Some(id),
        None => {
            sqlx::query_scalar::<_, i64>(
                "SELECT id FROM cached_entities WHERE entity_type = ? AND local_id = ?",
            )
            .bind(record.entity_type.as_str())
            .bind(&record.local_id)
            .fetch_optional(&mut **tx)
            .await?
        }
    };

    let payload = serde_json::to_string(&record.payload)?;
    match existing {
        Some(row_id) => {
            sqlx::query(
                "UPDATE cached_entities SET store_id = ?, local_id = ?, server_id = ?, payload = ?, dirty = ?, deleted = ?, updated_at = ? WHERE id = ?",
            )
            .bind(record.store_id)
            .bind(&record.local_id)
            .bind(&record.server_id)
            .bind(payload)
            .bind(record.dirty as i64)
            .bind(record.deleted as i64)
            .bind(record.updated_at)
            .bind(row_id)
            .execute(&mut **tx)
            .await?;
        }
        None => {
            sqlx::query(
                "INSERT INTO cached_entities (entity_type, store_id, local_id, server_id, payload, dirty, deleted, updated_at) VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(record.entity_type.as_str())
            .bind(record.store_id)
            .bind(&record.local_id)
            .bind(&record.server_id)
            .bind(payload)
            .bind(record.dirty as i64)
            .bind(record.deleted as i64)
            .bind(record.updated_at)
            .execute(&mut **tx)
            .await?;
        }
    }
    Ok(())
}

/// Rewrite a temporary id to the server-assigned one across the cache and
/// the queue, in one transaction.
#[instrument(skip_all, fields(local_id = local_id, server_id = server_id))]
pub async fn mark_synced(pool: &Pool, local_id: &str, server_id: &str) -> Result<(), SyncError> {
    let mut tx = pool.begin().await.map_err(anyhow::Error::from)?;
    mark_synced_tx(&mut tx, local_id, server_id).await?;
    tx.commit().await.map_err(anyhow::Error::from)?;
    Ok(())
}

pub(crate) async fn mark_synced_tx(
    tx: &mut Transaction<'_, Sqlite>,
    local_id: &str,
    server_id: &str,
) -> Result<(), SyncError> {
    let current = sqlx::query(
        "SELECT id, entity_type, server_id FROM cached_entities WHERE local_id = ? OR server_id = ? ORDER BY local_id = ? DESC LIMIT 1",
    )
    .bind(local_id)
    .bind(local_id)
    .bind(local_id)
    .fetch_optional(&mut **tx)
    .await
    .map_err(anyhow::Error::from)?;

    if let Some(row) = current {
        let row_id: i64 = row.get("id");
        let entity_type: String = row.get("entity_type");
        let existing: Option<String> = row.get("server_id");
        if let Some(existing) = existing.filter(|s| s != server_id) {
            return Err(SyncError::Conflict(format!(
                "record {} already has server id {}, refusing {}",
                local_id, existing, server_id
            )));
        }

        // A refresh may already have cached the server's copy of this row.
        sqlx::query(
            "DELETE FROM cached_entities WHERE entity_type = ? AND (server_id = ? OR local_id = ?) AND id != ?",
        )
        .bind(&entity_type)
        .bind(server_id)
        .bind(server_id)
        .bind(row_id)
        .execute(&mut **tx)
        .await
        .map_err(anyhow::Error::from)?;

        sqlx::query(
            "UPDATE cached_entities SET local_id = ?, server_id = ?, updated_at = ?, \
             dirty = EXISTS (SELECT 1 FROM sync_queue WHERE status != 'synced' AND (entity_id IN (?, ?) OR local_id IN (?, ?))) \
             WHERE id = ?",
        )
        .bind(server_id)
        .bind(server_id)
        .bind(now_ms())
        .bind(local_id)
        .bind(server_id)
        .bind(local_id)
        .bind(server_id)
        .bind(row_id)
        .execute(&mut **tx)
        .await
        .map_err(anyhow::Error::from)?;
    }

    if local_id == server_id {
        return Ok(());
    }

    sqlx::query("UPDATE sync_queue SET entity_id = ? WHERE entity_id = ?")
        .bind(server_id)
        .bind(local_id)
        .execute(&mut **tx)
        .await
        .map_err(anyhow::Error::from)?;
    sqlx::query("UPDATE sync_queue SET local_id = ? WHERE local_id = ?")
        .bind(server_id)
        .bind(local_id)
        .execute(&mut **tx)
        .await
        .map_err(anyhow::Error::from)?;

    // Children that captured the temporary id in their payload.
    let queued = sqlx::query(
        "SELECT seq, data FROM sync_queue WHERE status != 'synced' AND instr(data, ?) > 0",
    )
    .bind(local_id)
    .fetch_all(&mut **tx)
    .await
    .map_err(anyhow::Error::from)?;
    for row in queued {
        let seq: i64 = row.get("seq");
        let data: String = row.get("data");
        let mut value: Value = serde_json::from_str(&data)?;
        if replace_id(&mut value, local_id, server_id) {
            sqlx::query("UPDATE sync_queue SET data = ? WHERE seq = ?")
                .bind(serde_json::to_string(&value)?)
                .bind(seq)
                .execute(&mut **tx)
                .await
                .map_err(anyhow::Error::from)?;
        }
    }

    let cached = sqlx::query("SELECT id, payload FROM cached_entities WHERE instr(payload, ?) > 0")
        .bind(local_id)
        .fetch_all(&mut **tx)
        .await
        .map_err(anyhow::Error::from)?;
    for row in cached {
        let row_id: i64 = row.get("id");
        let payload: String = row.get("payload");
        let Ok(mut value) = serde_json::from_str::<Value>(&payload) else {
            continue;
        };
        if replace_id(&mut value, local_id, server_id) {
            sqlx::query("UPDATE cached_entities SET payload = ? WHERE id = ?")
                .bind(serde_json::to_string(&value)?)
                .bind(row_id)
                .execute(&mut **tx)
                .await
                .map_err(anyhow::Error::from)?;
        }
    }
    Ok(())
}

/// Replace every string equal to `from` with `to`. Returns whether anything changed.
pub(crate) fn replace_id(value: &mut Value, from: &str, to: &str) -> bool {
    match value {
        Value::String(s) if s == from => {
            *s = to.to_string();
            true
        }
        Value::Array(items) => items
            .iter_mut()
            .fold(false, |changed, v| replace_id(v, from, to) || changed),
        Value::Object(map) => map
            .values_mut()
            .fold(false, |changed, v| replace_id(v, from, to) || changed),
        _ => false,
    }
}

/// Hard-delete records that never reached the server; tombstone the rest.
#[instrument(skip_all, fields(entity = entity_type.as_str(), entity_id = entity_id))]
pub async fn remove(
    pool: &Pool,
    entity_type: EntityType,
    entity_id: &str,
    store_id: i64,
) -> Result<RemoveOutcome> {
    let row = sqlx::query(
        "SELECT id, server_id FROM cached_entities WHERE entity_type = ? AND store_id = ? AND (local_id = ? OR server_id = ?)",
    )
    .bind(entity_type.as_str())
    .bind(store_id)
    .bind(entity_id)
    .bind(entity_id)
    .fetch_optional(pool)
    .await?;
    let Some(row) = row else {
        return Ok(RemoveOutcome::NotFound);
    };
    let row_id: i64 = row.get("id");
    let server_id: Option<String> = row.get("server_id");

    if server_id.is_none() {
        sqlx::query("DELETE FROM cached_entities WHERE id = ?")
            .bind(row_id)
            .execute(pool)
            .await?;
        return Ok(RemoveOutcome::HardDeleted);
    }

    sqlx::query("UPDATE cached_entities SET deleted = 1, dirty = 1, updated_at = ? WHERE id = ?")
        .bind(now_ms())
        .bind(row_id)
        .execute(pool)
        .await?;
    Ok(RemoveOutcome::Tombstoned)
}

/// Drop a record for good once the server confirmed its deletion.
pub async fn purge(pool: &Pool, entity_type: EntityType, entity_id: &str, store_id: i64) -> Result<()> {
    sqlx::query(
        "DELETE FROM cached_entities WHERE entity_type = ? AND store_id = ? AND (local_id = ? OR server_id = ?)",
    )
    .bind(entity_type.as_str())
    .bind(store_id)
    .bind(entity_id)
    .bind(entity_id)
    .execute(pool)
    .await?;
    Ok(())
}

/// Recompute the dirty flag of a record after one of its queue items synced.
pub async fn settle(pool: &Pool, entity_type: EntityType, entity_id: &str) -> Result<()> {
    sqlx::query(
        "UPDATE cached_entities SET dirty = EXISTS (SELECT 1 FROM sync_queue WHERE status != 'synced' AND (entity_id = ?1 OR local_id = ?1)) \
         WHERE entity_type = ?2 AND deleted = 0 AND (local_id = ?1 OR server_id = ?1)",
    )
    .bind(entity_id)
    .bind(entity_type.as_str())
    .execute(pool)
    .await?;
    Ok(())
}

/// Mirror the server's rows for a store. Dirty and tombstoned local rows win
/// over the server copy; clean rows the server no longer has are dropped.
#[instrument(skip_all, fields(entity = entity_type.as_str(), rows = rows.len()))]
pub async fn replace_clean(
    pool: &Pool,
    entity_type: EntityType,
    store_id: i64,
    rows: &[(String, Value)],
) -> Result<usize> {
    let mut tx = pool.begin().await?;
    let local: Vec<(String, i64, i64)> = sqlx::query_as(
        "SELECT server_id, dirty, deleted FROM cached_entities WHERE entity_type = ? AND store_id = ? AND server_id IS NOT NULL",
    )
    .bind(entity_type.as_str())
    .bind(store_id)
    .fetch_all(&mut *tx)
    .await?;
    let protected: HashSet<&str> = local
        .iter()
        .filter(|(_, dirty, deleted)| *dirty != 0 || *deleted != 0)
        .map(|(sid, _, _)| sid.as_str())
        .collect();

    let mut written = 0;
    for (server_id, payload) in rows {
        if protected.contains(server_id.as_str()) {
            continue;
        }
        let record = CachedEntity::synced(entity_type, store_id, server_id.clone(), payload.clone());
        put_tx(&mut tx, &record).await?;
        written += 1;
    }

    let remote_ids: HashSet<&str> = rows.iter().map(|(id, _)| id.as_str()).collect();
    for (server_id, dirty, deleted) in &local {
        if *dirty == 0 && *deleted == 0 && !remote_ids.contains(server_id.as_str()) {
            sqlx::query("DELETE FROM cached_entities WHERE entity_type = ? AND server_id = ?")
                .bind(entity_type.as_str())
                .bind(server_id)
                .execute(&mut *tx)
                .await?;
        }
    }
    tx.commit().await?;
    Ok(written)
}
