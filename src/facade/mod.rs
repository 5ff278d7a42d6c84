//! Domain Write Facades: one call per domain write, whether or not the
//! remote store is reachable.
//!
//! Online, a write goes straight to the remote store and the result is cached.
//! Offline, on a network failure, or while the write depends on a record that
//! has not synced yet, the write lands in the cache and the queue together and
//! the caller gets the record back tagged `pending`.

pub mod customers;
pub mod debts;
pub mod inventory;
pub mod sales;

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::connectivity::Connectivity;
use crate::db::{cache, queue, Pool};
use crate::error::{SyncError, SyncResult};
use crate::model::{is_temp_id, now_ms, CachedEntity, EntityType, NewQueueItem, Session};
use crate::mutation::Mutation;
use crate::remote::{Query, RemoteStore};
use crate::sync::apply::{self, Applied};
use crate::sync::engine;

pub use customers::CustomerFacade;
pub use debts::DebtFacade;
pub use inventory::InventoryFacade;
pub use sales::{Checkout, SalesFacade};

/// Result of a facade write. `pending` means the write is queued and `id` may
/// be a temporary id.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Written<T> {
    pub id: String,
    pub record: T,
    pub pending: bool,
}

impl Written<Value> {
    fn decode<T: DeserializeOwned>(self) -> SyncResult<Written<T>> {
        Ok(Written {
            id: self.id,
            record: serde_json::from_value(self.record)?,
            pending: self.pending,
        })
    }
}

/// Cached rows as typed records; rows that no longer match the schema are skipped.
fn decode_rows<T: DeserializeOwned>(rows: Vec<CachedEntity>) -> Vec<Written<T>> {
    rows.into_iter()
        .filter_map(|row| {
            let id = row.id().to_string();
            match serde_json::from_value(row.payload) {
                Ok(record) => Some(Written {
                    id,
                    record,
                    pending: row.dirty,
                }),
                Err(err) => {
                    warn!(%err, id = %id, entity = row.entity_type.as_str(), "skipping undecodable cached row");
                    None
                }
            }
        })
        .collect()
}

fn merge(target: &mut Value, patch: &Value) {
    if let (Value::Object(target), Value::Object(patch)) = (target, patch) {
        for (k, v) in patch {
            target.insert(k.clone(), v.clone());
        }
    }
}

/// The shared online/offline write path behind every facade.
#[derive(Clone)]
pub struct OfflineWriter {
    pool: Pool,
    remote: Arc<dyn RemoteStore>,
    connectivity: Connectivity,
}

impl OfflineWriter {
    pub fn new(pool: Pool, remote: Arc<dyn RemoteStore>, connectivity: Connectivity) -> Self {
        Self {
            pool,
            remote,
            connectivity,
        }
    }

    pub fn pool(&self) -> &Pool {
        &self.pool
    }

    fn note_queued(&self) {
        self.connectivity.notifier().update(|s| s.pending += 1);
    }

    /// Recount after items leave the queue outside a sync pass.
    async fn recount_pending(&self, store_id: i64) -> SyncResult<()> {
        let counts = queue::counts(&self.pool, store_id).await?;
        self.connectivity
            .notifier()
            .update(|s| s.pending = counts.pending + counts.syncing);
        Ok(())
    }

    /// Apply directly when possible. `Ok(None)` means the caller must queue,
    /// reusing `client_ref` since part of the write may already have landed.
    async fn try_direct(&self, mutation: &Mutation, client_ref: &str) -> SyncResult<Option<Applied>> {
        if !self.connectivity.is_online() || mutation.pending_reference().is_some() {
            return Ok(None);
        }
        match apply::apply(self.remote.as_ref(), mutation, client_ref).await {
            Ok(applied) => Ok(Some(applied)),
            Err(err) if err.is_network() => {
                warn!(
                    %err,
                    entity = mutation.entity_type().as_str(),
                    op = mutation.operation().as_str(),
                    "remote store unreachable; queueing write"
                );
                Ok(None)
            }
            Err(err) => Err(err),
        }
    }

    pub(crate) async fn create(&self, session: &Session, mutation: Mutation) -> SyncResult<Written<Value>> {
        mutation.validate()?;
        let entity_type = mutation.entity_type();
        let payload = mutation.data();
        let client_ref = Uuid::new_v4().to_string();

        if let Some(applied) = self.try_direct(&mutation, &client_ref).await? {
            let server_id = applied
                .server_id
                .ok_or_else(|| SyncError::Conflict(format!("{} insert returned no id", entity_type.as_str())))?;
            let row = applied.row.unwrap_or(payload);
            let record = CachedEntity::synced(entity_type, session.store_id, server_id.clone(), row.clone());
            cache::put(&self.pool, &record).await?;
            return Ok(Written {
                id: server_id,
                record: row,
                pending: false,
            });
        }

        let record = CachedEntity::pending(entity_type, session.store_id, payload.clone());
        let item = NewQueueItem::new(entity_type, mutation.operation(), payload.clone())
            .local_id(&record.local_id)
            .client_ref(client_ref);
        queue::enqueue_with_cache(&self.pool, &record, item).await?;
        self.note_queued();
        debug!(entity = entity_type.as_str(), local_id = %record.local_id, "create queued");
        Ok(Written {
            id: record.local_id,
            record: payload,
            pending: true,
        })
    }

    /// Updates go direct only when the record has no queued changes, so they
    /// reach the server in the order they were made.
    pub(crate) async fn update(&self, session: &Session, mutation: Mutation) -> SyncResult<Written<Value>> {
        mutation.validate()?;
        let entity_type = mutation.entity_type();
        let id = mutation
            .entity_id()
            .ok_or_else(|| SyncError::validation("update without a record id"))?
            .to_string();
        let patch = mutation.data();
        let cached = cache::find(&self.pool, entity_type, &id)
            .await?
            .filter(|c| !c.deleted);
        let client_ref = Uuid::new_v4().to_string();

        if cached.as_ref().map_or(true, |c| !c.dirty) {
            if let Some(applied) = self.try_direct(&mutation, &client_ref).await? {
                let mut row = cached.map(|c| c.payload).unwrap_or(Value::Null);
                match applied.row {
                    Some(server_row) if row.is_null() => row = server_row,
                    Some(server_row) => merge(&mut row, &server_row),
                    None => merge(&mut row, &patch),
                }
                let record = CachedEntity::synced(entity_type, session.store_id, id.clone(), row.clone());
                cache::put(&self.pool, &record).await?;
                return Ok(Written {
                    id,
                    record: row,
                    pending: false,
                });
            }
        }

        let Some(mut record) = cached else {
            return Err(SyncError::validation(format!(
                "{} {} is not available offline",
                entity_type.as_str(),
                id
            )));
        };
        merge(&mut record.payload, &patch);
        record.dirty = true;
        record.updated_at = now_ms();
        let item = NewQueueItem::new(entity_type, mutation.operation(), patch)
            .entity_id(&id)
            .local_id(&record.local_id)
            .client_ref(client_ref);
        queue::enqueue_with_cache(&self.pool, &record, item).await?;
        self.note_queued();
        debug!(entity = entity_type.as_str(), id = %id, "update queued");
        Ok(Written {
            id,
            record: record.payload,
            pending: true,
        })
    }

    pub(crate) async fn delete(&self, session: &Session, mutation: Mutation) -> SyncResult<Written<()>> {
        mutation.validate()?;
        let entity_type = mutation.entity_type();
        let id = mutation
            .entity_id()
            .ok_or_else(|| SyncError::validation("delete without a record id"))?
            .to_string();

        if is_temp_id(&id) {
            // Never reached the server: forget it locally.
            let cancelled = queue::cancel_for_local_id(&self.pool, &id).await?;
            cache::remove(&self.pool, entity_type, &id, session.store_id).await?;
            self.recount_pending(session.store_id).await?;
            debug!(entity = entity_type.as_str(), id = %id, cancelled, "unsynced record dropped");
            return Ok(Written {
                id,
                record: (),
                pending: false,
            });
        }

        let cached = cache::find(&self.pool, entity_type, &id).await?;
        let client_ref = Uuid::new_v4().to_string();
        if cached.as_ref().map_or(true, |c| !c.dirty) && self.try_direct(&mutation, &client_ref).await?.is_some() {
            cache::purge(&self.pool, entity_type, &id, session.store_id).await?;
            return Ok(Written {
                id,
                record: (),
                pending: false,
            });
        }

        let item = NewQueueItem::new(entity_type, mutation.operation(), mutation.data())
            .entity_id(&id)
            .client_ref(client_ref);
        match cached {
            Some(mut record) => {
                record.deleted = true;
                record.dirty = true;
                record.updated_at = now_ms();
                queue::enqueue_with_cache(&self.pool, &record, item).await?;
            }
            None => {
                queue::enqueue(&self.pool, session.store_id, item).await?;
            }
        }
        self.note_queued();
        debug!(entity = entity_type.as_str(), id = %id, "delete queued");
        Ok(Written {
            id,
            record: (),
            pending: true,
        })
    }

    /// For writes with no cached record of their own. `record` is the
    /// server's row when applied directly, `None` when queued.
    pub(crate) async fn submit(&self, session: &Session, mutation: Mutation) -> SyncResult<Written<Option<Value>>> {
        mutation.validate()?;
        let client_ref = Uuid::new_v4().to_string();
        if let Some(applied) = self.try_direct(&mutation, &client_ref).await? {
            return Ok(Written {
                id: applied.server_id.unwrap_or_default(),
                record: applied.row,
                pending: false,
            });
        }
        let item =
            NewQueueItem::new(mutation.entity_type(), mutation.operation(), mutation.data()).client_ref(client_ref);
        let client_ref = queue::enqueue(&self.pool, session.store_id, item).await?;
        self.note_queued();
        Ok(Written {
            id: client_ref,
            record: None,
            pending: true,
        })
    }

    /// Current state of one record: the cache first, then the server.
    pub(crate) async fn current(&self, entity_type: EntityType, id: &str) -> SyncResult<Option<Value>> {
        if let Some(c) = cache::find(&self.pool, entity_type, id).await?.filter(|c| !c.deleted) {
            return Ok(Some(c.payload));
        }
        if !self.connectivity.is_online() || is_temp_id(id) {
            return Ok(None);
        }
        match self
            .remote
            .select(entity_type.as_str(), &Query::new().eq("id", id).range(0, 0))
            .await
        {
            Ok(rows) => Ok(rows.into_iter().next()),
            Err(err) if err.is_network() => {
                warn!(%err, entity = entity_type.as_str(), id, "remote lookup failed");
                Ok(None)
            }
            Err(err) => Err(err),
        }
    }

    /// Cached rows for a store, refreshed from the server first when online.
    pub(crate) async fn list(&self, session: &Session, entity_type: EntityType) -> SyncResult<Vec<CachedEntity>> {
        if self.connectivity.is_online() {
            if let Err(err) = engine::refresh(&self.pool, self.remote.as_ref(), session, entity_type).await {
                warn!(%err, entity = entity_type.as_str(), "refresh failed; serving cached rows");
            }
        }
        Ok(cache::get_or_empty(&self.pool, entity_type, session.store_id).await)
    }

    pub(crate) fn remote(&self) -> &dyn RemoteStore {
        self.remote.as_ref()
    }

    pub(crate) fn is_online(&self) -> bool {
        self.connectivity.is_online()
    }
}
