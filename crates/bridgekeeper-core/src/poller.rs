use crate::registry::BridgeTypeRegistry;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Periodic catalog refresh for the type registry.
pub struct CatalogPoller {
    registry: Arc<BridgeTypeRegistry>,
    interval: Duration,
}

impl CatalogPoller {
    pub fn new(registry: Arc<BridgeTypeRegistry>, interval: Duration) -> Self {
        Self { registry, interval }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// One poll. Failures are logged; the next tick tries again.
    pub async fn run_once(&self) {
        if let Err(e) = self.registry.poll_catalog().await {
            warn!("catalog poll failed: {e}");
        }
    }

    /// Poll every `interval` until `shutdown` flips to true. The first poll
    /// happens one interval after the call.
    pub fn spawn(self, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            info!("polling the catalog every {}s", self.interval.as_secs());
            loop {
                tokio::select! {
                    () = tokio::time::sleep(self.interval) => self.run_once().await,
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
            debug!("catalog poller stopped");
        })
    }
}
