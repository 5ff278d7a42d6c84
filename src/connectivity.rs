//! Connectivity Monitor: one online flag, published to whoever listens.
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::remote::RemoteStore;
use crate::sync::{Notifier, SyncEvent};

#[derive(Debug, Clone)]
pub struct Connectivity {
    online: Arc<watch::Sender<bool>>,
    notifier: Notifier,
}

impl Connectivity {
    pub fn new(initially_online: bool, notifier: Notifier) -> Self {
        let (online, _) = watch::channel(initially_online);
        notifier.update(|s| s.online = initially_online);
        Self {
            online: Arc::new(online),
            notifier,
        }
    }

    pub fn is_online(&self) -> bool {
        *self.online.borrow()
    }

    /// Record a new reachability observation. Returns true on a transition.
    pub fn set_online(&self, online: bool) -> bool {
        let changed = self.online.send_if_modified(|current| {
            if *current == online {
                return false;
            }
            *current = online;
            true
        });
        if changed {
            info!(online, "connectivity changed");
            self.notifier.update(|s| s.online = online);
            self.notifier.emit(if online {
                SyncEvent::WentOnline
            } else {
                SyncEvent::WentOffline
            });
        }
        changed
    }

    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.online.subscribe()
    }

    pub fn notifier(&self) -> &Notifier {
        &self.notifier
    }
}

/// Ping the remote store every `every` and feed the result into `connectivity`.
pub fn spawn_probe(remote: Arc<dyn RemoteStore>, connectivity: Connectivity, every: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            let reachable = match remote.ping().await {
                Ok(()) => true,
                Err(err) => {
                    debug!(%err, "remote store unreachable");
                    false
                }
            };
            connectivity.set_online(reachable);
        }
    })
}
