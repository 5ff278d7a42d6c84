use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

use super::apply;
use super::status::{Notifier, SyncEvent, SyncStatus};
use crate::connectivity::Connectivity;
use crate::db::{cache, queue, sync_log, Pool};
use crate::error::{SyncError, SyncResult};
use crate::model::{now_ms, CachedEntity, EntityType, Operation, QueueItem, Session, SyncReport, MAX_ATTEMPTS};
use crate::mutation::Mutation;
use crate::remote::{row_id, Query, RemoteStore};

#[derive(Debug, Clone, Copy)]
pub struct EngineSettings {
    /// Items that failed this many times are left alone until retried by hand.
    pub max_attempts: i64,
    /// How long synced items are kept for inspection.
    pub retention: Duration,
    /// Upper bound for one item's remote round trips.
    pub item_timeout: Duration,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            max_attempts: MAX_ATTEMPTS,
            retention: Duration::from_secs(24 * 3600),
            item_timeout: Duration::from_secs(30),
        }
    }
}

/// Releases the drain flag when a pass ends, however it ends.
struct DrainGuard<'a>(&'a AtomicBool);

impl<'a> DrainGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| DrainGuard(flag))
    }
}

impl Drop for DrainGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Drains the mutation queue against the remote store.
pub struct SyncEngine {
    pool: Pool,
    remote: Arc<dyn RemoteStore>,
    connectivity: Connectivity,
    settings: EngineSettings,
    draining: AtomicBool,
}

impl SyncEngine {
    pub fn new(pool: Pool, remote: Arc<dyn RemoteStore>, connectivity: Connectivity, settings: EngineSettings) -> Self {
        Self {
            pool,
            remote,
            connectivity,
            settings,
            draining: AtomicBool::new(false),
        }
    }

    pub fn connectivity(&self) -> &Connectivity {
        &self.connectivity
    }

    fn notifier(&self) -> &Notifier {
        self.connectivity.notifier()
    }

    pub fn status(&self) -> SyncStatus {
        self.notifier().status()
    }

    pub fn is_draining(&self) -> bool {
        self.draining.load(Ordering::Acquire)
    }

    /// Whether a pass for this store would find anything to send.
    pub async fn has_work(&self, session: &Session) -> SyncResult<bool> {
        Ok(queue::has_retryable(&self.pool, session.store_id, self.settings.max_attempts).await?)
    }

    /// Drain the queue once. Returns `None` without touching anything when
    /// offline or when another pass is already running.
    #[instrument(skip_all, fields(store_id = session.store_id))]
    pub async fn run_sync_pass(&self, session: &Session) -> SyncResult<Option<SyncReport>> {
        if !self.connectivity.is_online() {
            debug!("offline; skipping sync pass");
            return Ok(None);
        }
        let Some(_guard) = DrainGuard::acquire(&self.draining) else {
            debug!("sync pass already running");
            return Ok(None);
        };

        self.notifier().update(|s| s.syncing = true);
        let outcome = self.drain(session).await;
        self.notifier().update(|s| s.syncing = false);

        let (report, last_error) = outcome?;
        let counts = queue::counts(&self.pool, session.store_id).await?;
        self.notifier().update(|s| {
            s.pending = counts.pending + counts.syncing;
            s.failed = counts.failed;
            s.last_report = Some(report);
            s.last_error = last_error;
        });
        if report.total > 0 {
            self.notifier().emit(SyncEvent::PassFinished(report));
        }
        Ok(Some(report))
    }

    async fn drain(&self, session: &Session) -> SyncResult<(SyncReport, Option<String>)> {
        let started_at = now_ms();
        let items = queue::get_pending(&self.pool, session.store_id, self.settings.max_attempts).await?;
        let mut report = SyncReport {
            total: items.len(),
            started_at,
            ..Default::default()
        };
        if items.is_empty() {
            report.finished_at = now_ms();
            return Ok((report, None));
        }

        info!(total = items.len(), "sync pass started");
        self.notifier().emit(SyncEvent::PassStarted { total: items.len() });

        let mut last_error = None;
        for queued in &items {
            // Earlier items in this pass may have rewritten temporary ids in this one.
            let Some(item) = queue::get(&self.pool, &queued.client_ref).await? else {
                report.total -= 1;
                continue;
            };
            match self.sync_item(&item).await {
                Ok(()) => report.synced += 1,
                Err(err) => {
                    let message = err.to_string();
                    warn!(
                        client_ref = %item.client_ref,
                        entity = item.entity_type.as_str(),
                        op = item.operation.as_str(),
                        attempt = item.attempts + 1,
                        error = %message,
                        "queue item failed"
                    );
                    queue::mark_item_failed(&self.pool, &item.client_ref, &message).await?;
                    self.notifier().emit(SyncEvent::ItemFailed {
                        client_ref: item.client_ref.clone(),
                        entity_type: item.entity_type.as_str().to_string(),
                        error: message.clone(),
                    });
                    report.failed += 1;
                    last_error = Some(message);
                }
            }
        }

        let cleared = queue::clear_synced(&self.pool, session.store_id, self.settings.retention).await?;
        report.finished_at = now_ms();
        sync_log::record_pass(&self.pool, session.store_id, &report, last_error.as_deref()).await?;
        info!(
            total = report.total,
            synced = report.synced,
            failed = report.failed,
            cleared,
            "sync pass finished"
        );
        Ok((report, last_error))
    }

    #[instrument(skip_all, fields(client_ref = %item.client_ref, entity = item.entity_type.as_str()))]
    async fn sync_item(&self, item: &QueueItem) -> SyncResult<()> {
        queue::mark_item_syncing(&self.pool, &item.client_ref).await?;
        let mutation = Mutation::from_item(item)?;
        if let Some(dep) = mutation.pending_reference() {
            return Err(SyncError::Dependency(dep.to_string()));
        }

        let applied = tokio::time::timeout(
            self.settings.item_timeout,
            apply::apply(self.remote.as_ref(), &mutation, &item.client_ref),
        )
        .await
        .map_err(|_| SyncError::Network(format!("timed out after {:?}", self.settings.item_timeout)))??;

        match item.operation {
            Operation::Create => {
                let server_id = applied
                    .server_id
                    .ok_or_else(|| SyncError::Conflict("created row has no id".into()))?;
                queue::complete_create(&self.pool, &item.client_ref, item.local_id.as_deref(), &server_id).await?;
                if item.local_id.is_none() {
                    if let Some(row) = applied.row {
                        let record = CachedEntity::synced(item.entity_type, item.store_id, server_id.clone(), row);
                        cache::put(&self.pool, &record).await?;
                    }
                }
                debug!(server_id = %server_id, duplicate = applied.duplicate, "create synced");
            }
            Operation::Update => {
                queue::mark_item_synced(&self.pool, &item.client_ref).await?;
                if let Some(id) = item.entity_id.as_deref() {
                    cache::settle(&self.pool, item.entity_type, id).await?;
                }
            }
            Operation::Delete => {
                queue::mark_item_synced(&self.pool, &item.client_ref).await?;
                if let Some(id) = item.entity_id.as_deref() {
                    cache::purge(&self.pool, item.entity_type, id, item.store_id).await?;
                }
            }
        }
        Ok(())
    }

    /// Pull the server's rows for one entity type into the cache. Local rows
    /// with unsynced changes are left alone.
    #[instrument(skip_all, fields(store_id = session.store_id, entity = entity_type.as_str()))]
    pub async fn refresh_cache(&self, session: &Session, entity_type: EntityType) -> SyncResult<usize> {
        refresh(&self.pool, self.remote.as_ref(), session, entity_type).await
    }
}

pub(crate) async fn refresh(
    pool: &Pool,
    remote: &dyn RemoteStore,
    session: &Session,
    entity_type: EntityType,
) -> SyncResult<usize> {
    let rows = remote
        .select(entity_type.as_str(), &Query::new().eq("store_id", session.store_id))
        .await?;
    let rows: Vec<(String, serde_json::Value)> = rows
        .into_iter()
        .filter_map(|row| row_id(&row).map(|id| (id, row)))
        .collect();
    let written = cache::replace_clean(pool, entity_type, session.store_id, &rows).await?;
    debug!(rows = rows.len(), written, "cache refreshed");
    Ok(written)
}
