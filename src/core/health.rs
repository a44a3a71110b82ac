use std::{
    fmt,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use tokio::{sync::Notify, task::JoinHandle};
use tracing::debug;

use super::worker_registry::WorkerRegistry;

/// Background task probing every registered worker on a fixed interval.
///
/// Probe results only reach routing through each worker's atomic health
/// state, so a slow or hanging worker never delays request handling.
pub struct HealthChecker {
    handle: Option<JoinHandle<()>>,
    shutdown: Arc<AtomicBool>,
    wake: Arc<Notify>,
}

impl fmt::Debug for HealthChecker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HealthChecker")
            .field("shutdown", &self.shutdown.load(Ordering::Relaxed))
            .finish()
    }
}

impl HealthChecker {
    pub fn start(
        registry: Arc<WorkerRegistry>,
        client: reqwest::Client,
        interval: Duration,
    ) -> Self {
        let shutdown = Arc::new(AtomicBool::new(false));
        let wake = Arc::new(Notify::new());

        let handle = {
            let shutdown = Arc::clone(&shutdown);
            let wake = Arc::clone(&wake);
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(interval);
                ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

                loop {
                    tokio::select! {
                        _ = ticker.tick() => {},
                        _ = wake.notified() => {},
                    }
                    if shutdown.load(Ordering::Acquire) {
                        debug!("Health checker shutting down");
                        break;
                    }
                    check_all(&registry, &client).await;
                }
            })
        };

        Self {
            handle: Some(handle),
            shutdown,
            wake,
        }
    }

    /// Stop probing and wait for an in-progress round to finish.
    pub async fn shutdown(mut self) {
        self.shutdown.store(true, Ordering::Release);
        self.wake.notify_one();
        if let Some(handle) = self.handle.take() {
            let _ = handle.await;
        }
    }
}

impl Drop for HealthChecker {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}

/// Probe every registered worker once, concurrently.
pub async fn check_all(registry: &WorkerRegistry, client: &reqwest::Client) {
    let workers = registry.all();
    let probes = workers.iter().map(|worker| worker.check_health(client));
    let results = futures::future::join_all(probes).await;
    debug!(
        probed = results.len(),
        healthy = results.iter().filter(|ok| **ok).count(),
        "Health check round complete"
    );
}
