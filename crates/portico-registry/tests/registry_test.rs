//! Integration tests for the endpoint registry's degraded-mode behavior.

use async_trait::async_trait;
use futures::StreamExt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};

use portico_common::protocol::{PorticoError, Result};
use portico_registry::{
    CoordinationStore, Endpoint, EndpointEvent, EndpointRegistry, EventStream, MemoryStore,
    RegistryConfig,
};

/// Store whose watch streams can be severed on demand, simulating a
/// coordination store outage. Taking the store down ends every live stream
/// and fails new watch attempts until it comes back up.
struct SeverableStore {
    inner: MemoryStore,
    down: watch::Sender<bool>,
    watch_attempts: AtomicUsize,
}

impl SeverableStore {
    fn new() -> Self {
        let (down, _) = watch::channel(false);
        Self {
            inner: MemoryStore::new(),
            down,
            watch_attempts: AtomicUsize::new(0),
        }
    }

    fn set_down(&self, down: bool) {
        self.down.send_replace(down);
    }

    fn watch_attempts(&self) -> usize {
        self.watch_attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CoordinationStore for SeverableStore {
    async fn register(&self, service: &str, endpoint: Endpoint) -> Result<()> {
        self.inner.register(service, endpoint).await
    }

    async fn deregister(&self, service: &str, address: &str) -> Result<()> {
        self.inner.deregister(service, address).await
    }

    async fn watch(&self, service: &str) -> Result<EventStream> {
        self.watch_attempts.fetch_add(1, Ordering::SeqCst);
        if *self.down.borrow() {
            return Err(PorticoError::RegistryUnavailable("store is down".into()));
        }
        let mut inner = self.inner.watch(service).await?;
        let mut down_rx = self.down.subscribe();
        let (tx, mut rx) = mpsc::channel::<Result<EndpointEvent>>(16);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    item = inner.next() => match item {
                        Some(event) => {
                            if tx.send(event).await.is_err() {
                                return;
                            }
                        }
                        None => return,
                    },
                    changed = down_rx.changed() => {
                        if changed.is_err() || *down_rx.borrow() {
                            return;
                        }
                    }
                }
            }
        });
        Ok(Box::pin(futures::stream::poll_fn(move |cx| {
            rx.poll_recv(cx)
        })))
    }
}

/// Store that hands out a stream which errors after its replay, forcing the
/// registry through its reconnect path.
struct OneShotStore {
    watch_count: AtomicUsize,
}

#[async_trait]
impl CoordinationStore for OneShotStore {
    async fn register(&self, _service: &str, _endpoint: Endpoint) -> Result<()> {
        Ok(())
    }

    async fn deregister(&self, _service: &str, _address: &str) -> Result<()> {
        Ok(())
    }

    async fn watch(&self, _service: &str) -> Result<EventStream> {
        let attempt = self.watch_count.fetch_add(1, Ordering::SeqCst);
        let (tx, mut rx) = mpsc::channel::<Result<EndpointEvent>>(8);
        tokio::spawn(async move {
            if attempt == 0 {
                let _ = tx.send(Ok(EndpointEvent::add("10.0.0.1:9090"))).await;
                let _ = tx.send(Ok(EndpointEvent::sync())).await;
                let _ = tx
                    .send(Err(PorticoError::Transport("connection reset".into())))
                    .await;
            } else {
                // Replay on reconnect, then hold the stream open.
                let _ = tx.send(Ok(EndpointEvent::add("10.0.0.1:9090"))).await;
                let _ = tx.send(Ok(EndpointEvent::add("10.0.0.2:9090"))).await;
                let _ = tx.send(Ok(EndpointEvent::sync())).await;
                std::future::pending::<()>().await;
            }
        });
        Ok(Box::pin(futures::stream::poll_fn(move |cx| {
            rx.poll_recv(cx)
        })))
    }
}

/// Store whose stream never produces anything; the stream holds a token so
/// tests can observe when the watch task lets go of it.
struct HoldOpenStore {
    token: Arc<()>,
}

#[async_trait]
impl CoordinationStore for HoldOpenStore {
    async fn register(&self, _service: &str, _endpoint: Endpoint) -> Result<()> {
        Ok(())
    }

    async fn deregister(&self, _service: &str, _address: &str) -> Result<()> {
        Ok(())
    }

    async fn watch(&self, _service: &str) -> Result<EventStream> {
        let token = Arc::clone(&self.token);
        Ok(Box::pin(futures::stream::poll_fn(move |_cx| {
            let _held = &token;
            std::task::Poll::Pending
        })))
    }
}

async fn wait_until<F: Fn() -> bool>(predicate: F) {
    tokio::time::timeout(Duration::from_secs(2), async {
        while !predicate() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

#[tokio::test]
async fn test_stale_snapshot_survives_outage() {
    let store = Arc::new(SeverableStore::new());
    store
        .register("svc", Endpoint::new("10.0.0.1:9090"))
        .await
        .unwrap();

    let registry = EndpointRegistry::spawn(store.clone(), RegistryConfig::new("svc"));
    wait_until(|| registry.current().contains("10.0.0.1:9090")).await;
    assert!(!registry.is_stale());

    // Take the store down. The live stream ends and new watch attempts fail,
    // but the snapshot must keep serving the last-known-good membership.
    store.set_down(true);
    let before = store.watch_attempts();
    wait_until(|| store.watch_attempts() > before + 1).await;
    assert!(registry.is_stale());

    let snapshot = registry.current();
    assert!(snapshot.contains("10.0.0.1:9090"));
    assert!(!snapshot.is_empty());
}

#[tokio::test]
async fn test_reconnect_clears_staleness_and_resyncs() {
    let store = Arc::new(SeverableStore::new());
    store.set_down(true);

    let registry = EndpointRegistry::spawn(store.clone(), RegistryConfig::new("svc"));
    wait_until(|| registry.is_stale()).await;

    // Membership changed while the registry was disconnected.
    store
        .register("svc", Endpoint::new("10.0.0.5:9090"))
        .await
        .unwrap();

    store.set_down(false);
    wait_until(|| registry.current().contains("10.0.0.5:9090")).await;
    assert!(!registry.is_stale());
}

#[tokio::test]
async fn test_reconnect_to_emptied_membership_publishes_empty_set() {
    let store = Arc::new(SeverableStore::new());
    store
        .register("svc", Endpoint::new("10.0.0.1:9090"))
        .await
        .unwrap();

    let registry = EndpointRegistry::spawn(store.clone(), RegistryConfig::new("svc"));
    wait_until(|| registry.current().contains("10.0.0.1:9090")).await;

    // The membership empties while the registry is disconnected. The
    // reconnect replay then carries zero endpoints before its sync marker,
    // and that empty set must replace the stale snapshot.
    store.set_down(true);
    store.deregister("svc", "10.0.0.1:9090").await.unwrap();
    wait_until(|| registry.is_stale()).await;

    store.set_down(false);
    wait_until(|| registry.current().is_empty()).await;
    assert!(!registry.is_stale());
}

#[tokio::test]
async fn test_failure_mid_replay_keeps_snapshot_and_staleness() {
    let store = Arc::new(SeverableStore::new());
    store
        .register("svc", Endpoint::new("10.0.0.1:9090"))
        .await
        .unwrap();

    let registry = EndpointRegistry::spawn(store.clone(), RegistryConfig::new("svc"));
    wait_until(|| registry.current().contains("10.0.0.1:9090")).await;

    store.set_down(true);
    wait_until(|| registry.is_stale()).await;

    // Still stale, still serving the last good set: no sync has arrived.
    assert!(registry.is_stale());
    assert!(registry.current().contains("10.0.0.1:9090"));
}

#[tokio::test]
async fn test_stream_failure_triggers_rewatch() {
    let store = Arc::new(OneShotStore {
        watch_count: AtomicUsize::new(0),
    });
    let registry = EndpointRegistry::spawn(store.clone(), RegistryConfig::new("svc"));

    // The first stream delivers one endpoint, then errors; the second
    // replays it plus a newcomer.
    wait_until(|| registry.current().len() == 2).await;
    let snapshot = registry.current();
    assert!(snapshot.contains("10.0.0.1:9090"));
    assert!(snapshot.contains("10.0.0.2:9090"));
    assert!(store.watch_count.load(Ordering::SeqCst) >= 2);
}

#[tokio::test]
async fn test_drop_aborts_watch_task() {
    let token = Arc::new(());
    let store = Arc::new(HoldOpenStore {
        token: Arc::clone(&token),
    });
    let registry = EndpointRegistry::spawn(store.clone(), RegistryConfig::new("svc"));

    // The watch task's stream holds a token clone.
    wait_until(|| Arc::strong_count(&token) >= 3).await;

    drop(registry);
    wait_until(|| Arc::strong_count(&token) == 2).await;
}

#[tokio::test]
async fn test_snapshots_are_never_torn() {
    // Apply many interleaved add/remove pairs while a reader snapshots
    // concurrently. Every snapshot must be internally consistent: an
    // address is either fully present or fully absent.
    let store = Arc::new(MemoryStore::new());
    let registry = EndpointRegistry::spawn(store.clone(), RegistryConfig::new("svc"));

    let writer = {
        let store = store.clone();
        tokio::spawn(async move {
            for round in 0..50u32 {
                for i in 0..4u32 {
                    let addr = format!("10.0.0.{}:9090", i);
                    if round % 2 == 0 {
                        store.register("svc", Endpoint::new(addr)).await.unwrap();
                    } else {
                        store.deregister("svc", &addr).await.unwrap();
                    }
                }
                tokio::task::yield_now().await;
            }
        })
    };

    for _ in 0..200 {
        let snapshot = registry.current();
        for addr in snapshot.addresses() {
            assert!(snapshot.get(addr).is_some());
            assert_eq!(snapshot.get(addr).map(|e| e.address.as_str()), Some(addr));
        }
        tokio::task::yield_now().await;
    }
    writer.await.unwrap();
}
