//! Node lifecycle: serve, announce, heartbeat, withdraw.

use bytes::Bytes;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tracing::{info, warn};

use portico_common::protocol::Result;
use portico_metrics::MetricsRegistry;
use portico_registry::{CoordinationStore, Endpoint};

use crate::http_server::build_app;
use crate::service::BackendService;

#[derive(Debug, Clone)]
pub struct BackendConfig {
    pub listen_addr: SocketAddr,
    /// Address registered into the coordination store. Defaults to the
    /// actual bound address, which also resolves a port-0 bind.
    pub advertise_addr: Option<String>,
    /// Service name to register under.
    pub service: String,
    /// Re-registration period. Keeps the entry alive against lease-style
    /// stores and restores it if the store lost state.
    pub heartbeat: Duration,
    /// Opaque metadata attached to the registration.
    pub metadata: Bytes,
}

impl BackendConfig {
    pub fn new(listen_addr: SocketAddr, service: impl Into<String>) -> Self {
        Self {
            listen_addr,
            advertise_addr: None,
            service: service.into(),
            heartbeat: Duration::from_secs(10),
            metadata: Bytes::new(),
        }
    }
}

/// A running backend: an RPC server plus its registration in the
/// coordination store.
pub struct BackendNode {
    config: BackendConfig,
    store: Arc<dyn CoordinationStore>,
    service: Arc<dyn BackendService>,
}

impl BackendNode {
    pub fn new(
        config: BackendConfig,
        store: Arc<dyn CoordinationStore>,
        service: Arc<dyn BackendService>,
    ) -> Self {
        Self {
            config,
            store,
            service,
        }
    }

    /// Binds, registers, and serves until `shutdown` resolves. The initial
    /// registration must succeed; heartbeat re-registrations only log.
    /// Deregistration on the way out is best-effort.
    pub async fn run<F>(self, shutdown: F) -> Result<()>
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let listener = TcpListener::bind(self.config.listen_addr).await?;
        let bound = listener.local_addr()?;
        let advertise = self
            .config
            .advertise_addr
            .clone()
            .unwrap_or_else(|| bound.to_string());

        self.store
            .register(
                &self.config.service,
                Endpoint::with_metadata(advertise.clone(), self.config.metadata.clone()),
            )
            .await?;
        info!(
            service = %self.config.service,
            address = %advertise,
            "backend registered"
        );

        let heartbeat = {
            let store = Arc::clone(&self.store);
            let service = self.config.service.clone();
            let endpoint =
                Endpoint::with_metadata(advertise.clone(), self.config.metadata.clone());
            let period = self.config.heartbeat;
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(period);
                ticker.tick().await; // first tick fires immediately
                loop {
                    ticker.tick().await;
                    if let Err(e) = store.register(&service, endpoint.clone()).await {
                        warn!(service = %service, error = %e, "heartbeat re-registration failed");
                    }
                }
            })
        };

        let metrics = Arc::new(MetricsRegistry::new());
        let app = build_app(Arc::clone(&self.service), metrics);
        info!(addr = %bound, "backend listening");
        let served = axum::serve(listener, app)
            .with_graceful_shutdown(shutdown)
            .await;

        heartbeat.abort();
        if let Err(e) = self
            .store
            .deregister(&self.config.service, &advertise)
            .await
        {
            warn!(service = %self.config.service, error = %e, "deregistration failed");
        } else {
            info!(address = %advertise, "backend deregistered");
        }

        served?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::service::EchoService;
    use futures::StreamExt;
    use portico_registry::{EndpointOp, MemoryStore};
    use tokio::sync::oneshot;

    #[tokio::test]
    async fn test_registers_and_deregisters() {
        let store = Arc::new(MemoryStore::new());
        let config = BackendConfig {
            advertise_addr: Some("10.0.0.1:9090".to_string()),
            ..BackendConfig::new("127.0.0.1:0".parse().unwrap(), "svc")
        };
        let node = BackendNode::new(config, store.clone(), Arc::new(EchoService));

        let (stop_tx, stop_rx) = oneshot::channel::<()>();
        let handle = tokio::spawn(node.run(async move {
            let _ = stop_rx.await;
        }));

        // Wait for the registration to land; the watch may open before the
        // node registers, in which case the sync marker comes first.
        let mut stream = store.watch("svc").await.unwrap();
        let address = tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                let event = stream.next().await.unwrap().unwrap();
                if event.op == EndpointOp::Add {
                    return event.address;
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(address, "10.0.0.1:9090");

        stop_tx.send(()).unwrap();
        handle.await.unwrap().unwrap();

        // After shutdown the replay is empty: the marker arrives first.
        let mut replay = store.watch("svc").await.unwrap();
        let next = tokio::time::timeout(Duration::from_secs(2), replay.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(
            next.op,
            EndpointOp::Sync,
            "expected no remaining registration"
        );
    }
}
