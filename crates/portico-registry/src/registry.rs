//! Live endpoint set maintenance.

use futures::StreamExt;
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::event::{EndpointOp, EndpointSet};
use crate::store::CoordinationStore;

/// Configuration for the registry's watch loop.
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// Service name whose membership this registry tracks.
    pub service: String,
    /// Delay before the first reconnect attempt.
    pub initial_backoff: Duration,
    /// Upper bound for the reconnect delay.
    pub max_backoff: Duration,
    /// Multiplier applied to the delay after each failed attempt.
    pub backoff_multiplier: f64,
}

impl RegistryConfig {
    pub fn new(service: impl Into<String>) -> Self {
        Self {
            service: service.into(),
            initial_backoff: Duration::from_millis(50),
            max_backoff: Duration::from_secs(5),
            backoff_multiplier: 2.0,
        }
    }
}

/// Watches the coordination store and maintains the live endpoint set for
/// one service.
///
/// Readers take whole-set snapshots through a watch channel of
/// `Arc<EndpointSet>`; every snapshot reflects a prefix of the membership
/// event stream, never a half-applied update. On store disconnect the
/// registry goes STALE: the last published snapshot keeps being served while
/// a background reconnect loop retries with exponential backoff. A
/// disconnect alone never publishes an empty set; on reconnect the set is
/// rebuilt from the stream's replay and published once the sync marker
/// arrives, so a membership that emptied during the outage is observed as
/// empty rather than served stale forever.
pub struct EndpointRegistry {
    snapshot: watch::Receiver<Arc<EndpointSet>>,
    stale_since: Arc<RwLock<Option<Instant>>>,
    task: JoinHandle<()>,
}

impl EndpointRegistry {
    /// Starts the watch task and returns the registry handle. Dropping the
    /// registry aborts the task.
    pub fn spawn(store: Arc<dyn CoordinationStore>, config: RegistryConfig) -> Self {
        let (tx, rx) = watch::channel(Arc::new(EndpointSet::default()));
        let stale_since = Arc::new(RwLock::new(None));
        let task = tokio::spawn(watch_loop(store, config, tx, Arc::clone(&stale_since)));
        Self {
            snapshot: rx,
            stale_since,
            task,
        }
    }

    /// Returns the current endpoint snapshot. Cheap: clones an `Arc`.
    pub fn current(&self) -> Arc<EndpointSet> {
        self.snapshot.borrow().clone()
    }

    /// Returns a receiver that yields a new snapshot on every membership
    /// change.
    pub fn subscribe(&self) -> watch::Receiver<Arc<EndpointSet>> {
        self.snapshot.clone()
    }

    /// Whether the store connection is currently down and snapshots are
    /// last-known-good.
    pub fn is_stale(&self) -> bool {
        self.stale_since().is_some()
    }

    /// When the current staleness began, if the registry is stale.
    pub fn stale_since(&self) -> Option<Instant> {
        *self
            .stale_since
            .read()
            .unwrap_or_else(|e| e.into_inner())
    }
}

impl Drop for EndpointRegistry {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn watch_loop(
    store: Arc<dyn CoordinationStore>,
    config: RegistryConfig,
    tx: watch::Sender<Arc<EndpointSet>>,
    stale_since: Arc<RwLock<Option<Instant>>>,
) {
    let mut backoff = config.initial_backoff;
    loop {
        match store.watch(&config.service).await {
            Ok(mut stream) => {
                debug!(service = %config.service, "watch stream opened");

                // The stream opens with the full current membership as add
                // events, so the working set rebuilds from empty. Nothing is
                // published and staleness is not cleared until the sync
                // marker closes off the replay: only then is the rebuilt set
                // authoritative, including a rebuilt set that is empty
                // because the membership emptied during an outage. A stream
                // that dies mid-replay leaves the previous snapshot and the
                // stale flag untouched.
                let mut set = EndpointSet::default();
                let mut synced = false;
                loop {
                    match stream.next().await {
                        Some(Ok(event)) if event.op == EndpointOp::Sync => {
                            synced = true;
                            backoff = config.initial_backoff;
                            {
                                let mut stale =
                                    stale_since.write().unwrap_or_else(|e| e.into_inner());
                                if let Some(since) = stale.take() {
                                    info!(
                                        service = %config.service,
                                        stale_ms = since.elapsed().as_millis() as u64,
                                        endpoints = set.len(),
                                        "coordination store reconnected"
                                    );
                                } else {
                                    info!(
                                        service = %config.service,
                                        endpoints = set.len(),
                                        "watching coordination store"
                                    );
                                }
                            }
                            if tx.send(Arc::new(set.clone())).is_err() {
                                return;
                            }
                        }
                        Some(Ok(event)) => {
                            if set.apply(&event) && synced {
                                debug!(
                                    service = %config.service,
                                    op = ?event.op,
                                    address = %event.address,
                                    endpoints = set.len(),
                                    "membership changed"
                                );
                                if tx.send(Arc::new(set.clone())).is_err() {
                                    return;
                                }
                            }
                        }
                        Some(Err(e)) => {
                            warn!(service = %config.service, error = %e, "watch stream failed");
                            break;
                        }
                        None => {
                            warn!(service = %config.service, "watch stream ended");
                            break;
                        }
                    }
                }
            }
            Err(e) => {
                warn!(
                    service = %config.service,
                    error = %e,
                    backoff_ms = backoff.as_millis() as u64,
                    "coordination store unreachable"
                );
            }
        }

        if tx.is_closed() {
            return;
        }
        {
            let mut stale = stale_since.write().unwrap_or_else(|e| e.into_inner());
            if stale.is_none() {
                *stale = Some(Instant::now());
            }
        }
        tokio::time::sleep(backoff).await;
        backoff = next_backoff(backoff, &config);
    }
}

fn next_backoff(current: Duration, config: &RegistryConfig) -> Duration {
    current
        .mul_f64(config.backoff_multiplier)
        .min(config.max_backoff)
}
