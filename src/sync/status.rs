use serde::Serialize;
use std::sync::Arc;
use tokio::sync::{broadcast, watch};

use crate::model::SyncReport;

/// Snapshot for a status indicator: online state, pass in progress, queue depth.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SyncStatus {
    pub online: bool,
    pub syncing: bool,
    pub pending: i64,
    pub failed: i64,
    pub last_error: Option<String>,
    pub last_report: Option<SyncReport>,
}

/// Notifications a front end turns into toasts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncEvent {
    WentOnline,
    WentOffline,
    PassStarted { total: usize },
    ItemFailed { client_ref: String, entity_type: String, error: String },
    PassFinished(SyncReport),
}

/// Shared handle for status snapshots and events. Cheap to clone.
#[derive(Debug, Clone)]
pub struct Notifier {
    status: Arc<watch::Sender<SyncStatus>>,
    events: broadcast::Sender<SyncEvent>,
}

impl Default for Notifier {
    fn default() -> Self {
        Self::new()
    }
}

impl Notifier {
    pub fn new() -> Self {
        let (status, _) = watch::channel(SyncStatus::default());
        let (events, _) = broadcast::channel(64);
        Self {
            status: Arc::new(status),
            events,
        }
    }

    pub fn status(&self) -> SyncStatus {
        self.status.borrow().clone()
    }

    pub fn watch(&self) -> watch::Receiver<SyncStatus> {
        self.status.subscribe()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.events.subscribe()
    }

    /// Nobody listening is fine.
    pub(crate) fn emit(&self, event: SyncEvent) {
        let _ = self.events.send(event);
    }

    pub(crate) fn update(&self, f: impl FnOnce(&mut SyncStatus)) {
        self.status.send_modify(f);
    }
}
