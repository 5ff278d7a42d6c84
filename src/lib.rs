//! Offline-first sync engine for a retail back office.
//!
//! Writes go through the domain facades in [`facade`]. When the remote store
//! is unreachable they land in the local cache and the mutation queue
//! ([`db`]); the [`sync`] engine replays the queue once [`connectivity`]
//! reports the store reachable again, driven by the [`scheduler`].

pub mod config;
pub mod connectivity;
pub mod db;
pub mod error;
pub mod facade;
pub mod model;
pub mod mutation;
pub mod remote;
pub mod scheduler;
pub mod sync;

pub use error::{SyncError, SyncResult};
