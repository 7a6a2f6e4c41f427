//! Online/offline signal shared by the sync engine and other collaborators.
//!
//! The platform (or [`ConnectivityMonitor::spawn_probe`]) reports the current
//! state through [`ConnectivityMonitor::set_online`]. Only changes are
//! published: repeated reports of the same state wake nobody.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::error::{Error, Result};

/// Notified once per offline-to-online transition.
///
/// Implemented by collaborators that keep their own connection, e.g. the
/// live proctoring stream, which needs to reconnect when the network returns.
#[async_trait]
pub trait ReconnectListener: Send + Sync {
    async fn on_reconnect(&self);
}

#[derive(Clone)]
pub struct ConnectivityMonitor {
    tx: Arc<watch::Sender<bool>>,
}

impl ConnectivityMonitor {
    pub fn new(initially_online: bool) -> Self {
        let (tx, _rx) = watch::channel(initially_online);
        Self { tx: Arc::new(tx) }
    }

    pub fn is_online(&self) -> bool {
        *self.tx.borrow()
    }

    /// Report the current state. Returns true if this was a transition.
    pub fn set_online(&self, online: bool) -> bool {
        let changed = self.tx.send_if_modified(|current| {
            if *current == online {
                false
            } else {
                *current = online;
                true
            }
        });

        if changed {
            tracing::info!(online, "Connectivity changed");
        }
        changed
    }

    /// Receiver that wakes on every transition
    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }

    /// Call `listener` on every offline-to-online edge until `shutdown` fires.
    pub fn spawn_reconnect_listener(
        &self,
        listener: Arc<dyn ReconnectListener>,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        let mut rx = self.subscribe();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    changed = rx.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        let online = *rx.borrow_and_update();
                        if online {
                            listener.on_reconnect().await;
                        }
                    }
                    _ = shutdown.changed() => break,
                }
            }
        })
    }

    /// Probe `url` once and report the result through [`Self::set_online`].
    ///
    /// Any response counts as online, even an error status; only a failed
    /// request means offline.
    pub async fn probe_once(&self, client: &reqwest::Client, url: &str) -> bool {
        let online = client.head(url).send().await.is_ok();
        tracing::trace!(url = %url, online, "Connectivity probe");
        self.set_online(online);
        online
    }

    /// Probe `url` every `interval` until `shutdown` fires.
    pub fn spawn_probe(
        &self,
        url: String,
        interval: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        let monitor = self.clone();
        tokio::spawn(async move {
            let client = match probe_client(interval) {
                Ok(client) => client,
                Err(e) => {
                    tracing::error!(error = %e, "Failed to build probe client");
                    return;
                }
            };

            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        monitor.probe_once(&client, &url).await;
                    }
                    _ = shutdown.changed() => break,
                }
            }
        })
    }
}

/// HTTP client for connectivity probes; a probe slower than `timeout` counts
/// as offline.
pub fn probe_client(timeout: Duration) -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(timeout)
        .build()
        .map_err(|e| Error::Config(format!("failed to create probe client: {}", e)))
}

impl Default for ConnectivityMonitor {
    fn default() -> Self {
        Self::new(true)
    }
}
