//! Sync Engine: drains the mutation queue when online.
//!
//! - `apply`: one typed mutation against the remote store.
//! - `engine`: the pass loop, id reconciliation and cache refresh.
//! - `status`: observable status and events.

pub mod apply;
pub mod engine;
pub mod status;

pub use engine::{EngineSettings, SyncEngine};
pub use status::{Notifier, SyncEvent, SyncStatus};
