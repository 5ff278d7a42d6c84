//! View models returned by repositories.
//!
//! Keep these structs focused on the data returned by queries. Business logic
//! should live in higher layers.

use serde::Serialize;

/// Queue depth per status for one store.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueCounts {
    pub pending: i64,
    pub syncing: i64,
    pub synced: i64,
    pub failed: i64,
}

impl QueueCounts {
    /// Items a future pass would still pick up.
    pub fn outstanding(&self) -> i64 {
        self.pending + self.syncing + self.failed
    }
}

/// One row of the `sync_log` audit table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, sqlx::FromRow)]
pub struct SyncLogEntry {
    pub id: i64,
    pub store_id: i64,
    pub started_at: i64,
    pub finished_at: i64,
    pub total: i64,
    pub synced: i64,
    pub failed: i64,
    pub last_error: Option<String>,
}
