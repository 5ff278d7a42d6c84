//! Drives sync passes: a periodic timer plus a debounced reaction to coming
//! back online. Both paths end in the same `run_sync_pass`.
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info};

use crate::model::Session;
use crate::sync::SyncEngine;

#[derive(Debug, Clone, Copy)]
pub struct SchedulerSettings {
    pub interval: Duration,
    /// Quiet period after a reconnect before syncing; absorbs flapping links.
    pub reconnect_debounce: Duration,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
            reconnect_debounce: Duration::from_secs(2),
        }
    }
}

pub struct SchedulerHandle {
    shutdown: Arc<Notify>,
    task: JoinHandle<()>,
}

impl SchedulerHandle {
    /// Stop scheduling and wait for a pass in progress to finish.
    pub async fn shutdown(self) {
        self.shutdown.notify_one();
        if let Err(err) = self.task.await {
            error!(?err, "scheduler task ended abnormally");
        }
    }
}

pub fn spawn(engine: Arc<SyncEngine>, session: Session, settings: SchedulerSettings) -> SchedulerHandle {
    let shutdown = Arc::new(Notify::new());
    let stop = shutdown.clone();
    let mut online_rx = engine.connectivity().subscribe();
    let task = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(settings.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(
            store_id = session.store_id,
            interval_secs = settings.interval.as_secs(),
            "sync scheduler started"
        );

        loop {
            tokio::select! {
                _ = stop.notified() => break,
                _ = ticker.tick() => {
                    match engine.has_work(&session).await {
                        Ok(true) => run_pass(&engine, &session).await,
                        Ok(false) => {}
                        Err(err) => error!(?err, "failed to inspect queue"),
                    }
                }
                changed = online_rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    if !*online_rx.borrow_and_update() {
                        continue;
                    }
                    tokio::select! {
                        _ = stop.notified() => break,
                        _ = tokio::time::sleep(settings.reconnect_debounce) => {}
                    }
                    if engine.connectivity().is_online() {
                        run_pass(&engine, &session).await;
                    } else {
                        debug!("connection dropped again during debounce");
                    }
                }
            }
        }
        info!("sync scheduler stopped");
    });
    SchedulerHandle { shutdown, task }
}

async fn run_pass(engine: &SyncEngine, session: &Session) {
    if let Err(err) = engine.run_sync_pass(session).await {
        error!(?err, "sync pass failed");
    }
}
