//! Coordination store boundary.
//!
//! The store is a strongly-consistent membership service: backends register
//! their addresses under a service name, watchers consume `{op, address,
//! metadata}` events. Two implementations are provided:
//!
//! - [`MemoryStore`]: in-process, used by tests and single-process setups.
//! - [`HttpCoordinationStore`]: client for an external store service
//!   speaking a small JSON protocol with an ND-JSON watch stream.

use async_trait::async_trait;
use bytes::Bytes;
use futures::Stream;
use http_body_util::{BodyExt, Full};
use hyper::header::CONTENT_TYPE;
use hyper::Method;
use std::collections::{BTreeMap, HashMap};
use std::pin::Pin;
use std::sync::Mutex;
use tokio::sync::{broadcast, mpsc};

use portico_common::protocol::{PorticoError, Result};
use portico_common::transport::{build_client, HttpClient};

use crate::event::{Endpoint, EndpointEvent, EndpointOp};

/// Lazy, infinite event sequence for one service. Ends only when the store
/// connection is lost; the consumer is expected to re-`watch`.
pub type EventStream = Pin<Box<dyn Stream<Item = Result<EndpointEvent>> + Send>>;

/// The coordination store as seen by backends (register/deregister) and by
/// the gateway's registry (watch).
#[async_trait]
pub trait CoordinationStore: Send + Sync {
    /// Registers an endpoint under a service name. Idempotent: re-registering
    /// the same address is a no-op for watchers.
    async fn register(&self, service: &str, endpoint: Endpoint) -> Result<()>;

    /// Removes an endpoint. Removing an absent address is not an error.
    async fn deregister(&self, service: &str, address: &str) -> Result<()>;

    /// Subscribes to membership changes for a service. The stream starts
    /// with the current membership as `add` events, then a `sync` marker,
    /// then live deltas. The marker lets a consumer tell a complete (possibly
    /// empty) replay apart from a stream that has produced nothing yet.
    /// Per-address ordering is preserved.
    async fn watch(&self, service: &str) -> Result<EventStream>;
}

/// In-process coordination store.
///
/// State lives under a sync mutex; change events fan out over a broadcast
/// channel. `watch` snapshots the current state and subscribes under the
/// same lock acquisition, so no event is missed or duplicated across the
/// snapshot/delta boundary.
pub struct MemoryStore {
    state: Mutex<HashMap<String, BTreeMap<String, Endpoint>>>,
    events: broadcast::Sender<(String, EndpointEvent)>,
}

impl MemoryStore {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            state: Mutex::new(HashMap::new()),
            events,
        }
    }

    fn lock_state(
        &self,
    ) -> std::sync::MutexGuard<'_, HashMap<String, BTreeMap<String, Endpoint>>> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CoordinationStore for MemoryStore {
    async fn register(&self, service: &str, endpoint: Endpoint) -> Result<()> {
        let mut state = self.lock_state();
        let members = state.entry(service.to_string()).or_default();
        if members.contains_key(&endpoint.address) {
            return Ok(());
        }
        let event = EndpointEvent {
            op: EndpointOp::Add,
            address: endpoint.address.clone(),
            metadata: endpoint.metadata.to_vec(),
        };
        members.insert(endpoint.address.clone(), endpoint);
        let _ = self.events.send((service.to_string(), event));
        Ok(())
    }

    async fn deregister(&self, service: &str, address: &str) -> Result<()> {
        let mut state = self.lock_state();
        let removed = state
            .get_mut(service)
            .map(|members| members.remove(address).is_some())
            .unwrap_or(false);
        if removed {
            let _ = self
                .events
                .send((service.to_string(), EndpointEvent::remove(address)));
        }
        Ok(())
    }

    async fn watch(&self, service: &str) -> Result<EventStream> {
        let (initial, mut sub) = {
            let state = self.lock_state();
            let sub = self.events.subscribe();
            let initial: Vec<EndpointEvent> = state
                .get(service)
                .map(|members| {
                    members
                        .values()
                        .map(|ep| EndpointEvent {
                            op: EndpointOp::Add,
                            address: ep.address.clone(),
                            metadata: ep.metadata.to_vec(),
                        })
                        .collect()
                })
                .unwrap_or_default();
            (initial, sub)
        };

        let (tx, mut rx) = mpsc::channel::<Result<EndpointEvent>>(64);
        let service = service.to_string();
        tokio::spawn(async move {
            for event in initial {
                if tx.send(Ok(event)).await.is_err() {
                    return;
                }
            }
            if tx.send(Ok(EndpointEvent::sync())).await.is_err() {
                return;
            }
            loop {
                match sub.recv().await {
                    Ok((svc, event)) if svc == service => {
                        if tx.send(Ok(event)).await.is_err() {
                            return;
                        }
                    }
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        let _ = tx
                            .send(Err(PorticoError::RegistryUnavailable(format!(
                                "watch lagged behind by {} events",
                                missed
                            ))))
                            .await;
                        return;
                    }
                    Err(broadcast::error::RecvError::Closed) => return,
                }
            }
        });

        Ok(Box::pin(futures::stream::poll_fn(move |cx| {
            rx.poll_recv(cx)
        })))
    }
}

/// HTTP client for an external coordination store service.
///
/// Protocol:
/// - `POST   {base}/v1/registry/{service}` with `{address, metadata}`
/// - `DELETE {base}/v1/registry/{service}/{address}`
/// - `GET    {base}/v1/registry/{service}/watch`: ND-JSON event stream,
///   initial membership as `add` events, one `{"op":"sync"}` marker line,
///   then deltas.
///
/// Multiple base URLs may be configured; operations try each in order.
pub struct HttpCoordinationStore {
    bases: Vec<String>,
    client: HttpClient,
}

impl HttpCoordinationStore {
    pub fn new(bases: Vec<String>) -> Self {
        Self {
            bases,
            client: build_client(),
        }
    }

    async fn send(&self, method: Method, path: &str, body: Option<Vec<u8>>) -> Result<()> {
        let mut last_err = PorticoError::RegistryUnavailable(
            "no coordination store endpoints configured".into(),
        );
        for base in &self.bases {
            let url = format!("{}{}", base, path);
            let mut builder = hyper::Request::builder().method(method.clone()).uri(&url);
            if body.is_some() {
                builder = builder.header(CONTENT_TYPE, "application/json");
            }
            let request = builder
                .body(Full::new(Bytes::from(body.clone().unwrap_or_default())))
                .map_err(|e| PorticoError::Transport(format!("failed to build request: {}", e)))?;

            match self.client.request(request).await {
                Ok(response) if response.status().is_success() => return Ok(()),
                Ok(response) => {
                    last_err = PorticoError::RegistryUnavailable(format!(
                        "{} returned {}",
                        url,
                        response.status()
                    ));
                }
                Err(e) => {
                    last_err =
                        PorticoError::RegistryUnavailable(format!("{} unreachable: {}", url, e));
                }
            }
        }
        Err(last_err)
    }
}

#[async_trait]
impl CoordinationStore for HttpCoordinationStore {
    async fn register(&self, service: &str, endpoint: Endpoint) -> Result<()> {
        let body = serde_json::to_vec(&EndpointEvent {
            op: EndpointOp::Add,
            address: endpoint.address,
            metadata: endpoint.metadata.to_vec(),
        })?;
        self.send(
            Method::POST,
            &format!("/v1/registry/{}", service),
            Some(body),
        )
        .await
    }

    async fn deregister(&self, service: &str, address: &str) -> Result<()> {
        self.send(
            Method::DELETE,
            &format!("/v1/registry/{}/{}", service, address),
            None,
        )
        .await
    }

    async fn watch(&self, service: &str) -> Result<EventStream> {
        let mut last_err = PorticoError::RegistryUnavailable(
            "no coordination store endpoints configured".into(),
        );
        for base in &self.bases {
            let url = format!("{}/v1/registry/{}/watch", base, service);
            let request = hyper::Request::builder()
                .method(Method::GET)
                .uri(&url)
                .body(Full::new(Bytes::new()))
                .map_err(|e| PorticoError::Transport(format!("failed to build request: {}", e)))?;

            let response = match self.client.request(request).await {
                Ok(r) if r.status().is_success() => r,
                Ok(r) => {
                    last_err = PorticoError::RegistryUnavailable(format!(
                        "{} returned {}",
                        url,
                        r.status()
                    ));
                    continue;
                }
                Err(e) => {
                    last_err =
                        PorticoError::RegistryUnavailable(format!("{} unreachable: {}", url, e));
                    continue;
                }
            };

            let (tx, mut rx) = mpsc::channel::<Result<EndpointEvent>>(64);
            let mut body = response.into_body();
            tokio::spawn(async move {
                let mut buf: Vec<u8> = Vec::new();
                loop {
                    match body.frame().await {
                        Some(Ok(frame)) => {
                            if let Ok(data) = frame.into_data() {
                                buf.extend_from_slice(&data);
                                while let Some(pos) = buf.iter().position(|&b| b == b'\n') {
                                    let line: Vec<u8> = buf.drain(..=pos).collect();
                                    let line = &line[..line.len() - 1];
                                    if line.is_empty() {
                                        continue;
                                    }
                                    match serde_json::from_slice::<EndpointEvent>(line) {
                                        Ok(event) => {
                                            if tx.send(Ok(event)).await.is_err() {
                                                return;
                                            }
                                        }
                                        Err(e) => {
                                            let _ = tx.send(Err(e.into())).await;
                                            return;
                                        }
                                    }
                                }
                            }
                        }
                        Some(Err(e)) => {
                            let _ = tx
                                .send(Err(PorticoError::Transport(format!(
                                    "watch stream failed: {}",
                                    e
                                ))))
                                .await;
                            return;
                        }
                        // End of stream: the registry treats this as a
                        // disconnect and re-watches with backoff.
                        None => return,
                    }
                }
            });

            return Ok(Box::pin(futures::stream::poll_fn(move |cx| {
                rx.poll_recv(cx)
            })));
        }
        Err(last_err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    #[tokio::test]
    async fn test_watch_replays_existing_members() {
        let store = MemoryStore::new();
        store
            .register("svc", Endpoint::new("10.0.0.1:9090"))
            .await
            .unwrap();
        store
            .register("svc", Endpoint::new("10.0.0.2:9090"))
            .await
            .unwrap();

        let mut stream = store.watch("svc").await.unwrap();
        let first = stream.next().await.unwrap().unwrap();
        let second = stream.next().await.unwrap().unwrap();
        assert_eq!(first.op, EndpointOp::Add);
        assert_eq!(second.op, EndpointOp::Add);
        let mut addrs = vec![first.address, second.address];
        addrs.sort();
        assert_eq!(addrs, vec!["10.0.0.1:9090", "10.0.0.2:9090"]);

        // The replay is closed off by the marker.
        let marker = stream.next().await.unwrap().unwrap();
        assert_eq!(marker.op, EndpointOp::Sync);
    }

    #[tokio::test]
    async fn test_watch_of_empty_service_syncs_immediately() {
        let store = MemoryStore::new();
        let mut stream = store.watch("svc").await.unwrap();
        let marker = stream.next().await.unwrap().unwrap();
        assert_eq!(marker.op, EndpointOp::Sync);
    }

    #[tokio::test]
    async fn test_watch_delivers_deltas() {
        let store = MemoryStore::new();
        let mut stream = store.watch("svc").await.unwrap();
        let marker = stream.next().await.unwrap().unwrap();
        assert_eq!(marker.op, EndpointOp::Sync);

        store
            .register("svc", Endpoint::new("10.0.0.1:9090"))
            .await
            .unwrap();
        let event = stream.next().await.unwrap().unwrap();
        assert_eq!(event.op, EndpointOp::Add);
        assert_eq!(event.address, "10.0.0.1:9090");

        store.deregister("svc", "10.0.0.1:9090").await.unwrap();
        let event = stream.next().await.unwrap().unwrap();
        assert_eq!(event.op, EndpointOp::Remove);
    }

    #[tokio::test]
    async fn test_duplicate_register_emits_no_event() {
        let store = MemoryStore::new();
        store
            .register("svc", Endpoint::new("a:1"))
            .await
            .unwrap();

        let mut stream = store.watch("svc").await.unwrap();
        // Replay of the existing member, then the marker.
        let replay = stream.next().await.unwrap().unwrap();
        assert_eq!(replay.address, "a:1");
        let marker = stream.next().await.unwrap().unwrap();
        assert_eq!(marker.op, EndpointOp::Sync);

        // Re-registering must not produce a second add.
        store
            .register("svc", Endpoint::new("a:1"))
            .await
            .unwrap();
        store
            .register("svc", Endpoint::new("b:2"))
            .await
            .unwrap();
        let next = stream.next().await.unwrap().unwrap();
        assert_eq!(next.address, "b:2");
    }

    #[tokio::test]
    async fn test_deregister_absent_is_silent() {
        let store = MemoryStore::new();
        store.deregister("svc", "ghost:1").await.unwrap();
    }

    #[tokio::test]
    async fn test_watches_are_scoped_per_service() {
        let store = MemoryStore::new();
        let mut stream = store.watch("svc-a").await.unwrap();
        let marker = stream.next().await.unwrap().unwrap();
        assert_eq!(marker.op, EndpointOp::Sync);

        store
            .register("svc-b", Endpoint::new("b:1"))
            .await
            .unwrap();
        store
            .register("svc-a", Endpoint::new("a:1"))
            .await
            .unwrap();

        let event = stream.next().await.unwrap().unwrap();
        assert_eq!(event.address, "a:1");
    }
}
