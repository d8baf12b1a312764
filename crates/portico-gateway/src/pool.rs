//! Backend connection pool.
//!
//! One shared hyper client serves every endpoint (the client keeps its own
//! per-host connection cache), so a [`Connection`] is an address plus a
//! client handle. What the pool really manages is selection and health:
//! round-robin over the endpoint snapshot taken at acquire time, skipping
//! endpoints marked unhealthy, with a single half-open probe per endpoint
//! after the cooldown elapses.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use portico_common::protocol::{PorticoError, Result};
use portico_common::transport::{build_client, HttpClient};
use portico_registry::EndpointRegistry;

#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Consecutive transport failures before an endpoint is unhealthy.
    pub failure_threshold: u32,
    /// How long an unhealthy endpoint sits out before a half-open probe.
    pub cooldown: Duration,
    /// Deadline for one backend call.
    pub request_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 3,
            cooldown: Duration::from_secs(30),
            request_timeout: Duration::from_secs(30),
        }
    }
}

/// A borrowed route to one backend.
#[derive(Clone, Debug)]
pub struct Connection {
    pub address: String,
    pub client: HttpClient,
    /// Whether this acquire is the half-open probe of an unhealthy endpoint.
    pub probe: bool,
}

#[derive(Debug, Default)]
struct EndpointHealth {
    consecutive_failures: u32,
    unhealthy_since: Option<Instant>,
    probing: bool,
}

impl EndpointHealth {
    fn is_unhealthy(&self) -> bool {
        self.unhealthy_since.is_some()
    }
}

pub struct ConnectionPool {
    registry: Arc<EndpointRegistry>,
    client: HttpClient,
    config: PoolConfig,
    cursor: AtomicUsize,
    health: Mutex<HashMap<String, EndpointHealth>>,
}

impl ConnectionPool {
    pub fn new(registry: Arc<EndpointRegistry>, config: PoolConfig) -> Self {
        Self {
            registry,
            client: build_client(),
            config,
            cursor: AtomicUsize::new(0),
            health: Mutex::new(HashMap::new()),
        }
    }

    pub fn request_timeout(&self) -> Duration {
        self.config.request_timeout
    }

    /// Picks the next healthy endpoint round-robin.
    ///
    /// Selection is consistent with one snapshot: endpoints that join after
    /// the snapshot was taken are not candidates, endpoints that left are
    /// never returned. An empty snapshot fails immediately without touching
    /// the network.
    pub fn acquire(&self) -> Result<Connection> {
        let snapshot = self.registry.current();
        if snapshot.is_empty() {
            return Err(PorticoError::NoBackendsAvailable(
                "no registered backends".into(),
            ));
        }

        let addresses: Vec<&str> = snapshot.addresses().collect();
        let start = self.cursor.fetch_add(1, Ordering::Relaxed) % addresses.len();

        let mut health = self.health.lock().unwrap_or_else(|e| e.into_inner());
        // Health state for endpoints that left the set is dropped here,
        // lazily, off any hot failure path.
        health.retain(|address, _| snapshot.contains(address));

        for i in 0..addresses.len() {
            let address = addresses[(start + i) % addresses.len()];
            let entry = health.entry(address.to_string()).or_default();

            if !entry.is_unhealthy() {
                return Ok(self.connection(address, false));
            }

            // One probe at a time per unhealthy endpoint.
            let cooled_down = entry
                .unhealthy_since
                .map(|since| since.elapsed() >= self.config.cooldown)
                .unwrap_or(false);
            if cooled_down && !entry.probing {
                entry.probing = true;
                debug!(address = %address, "sending half-open probe");
                return Ok(self.connection(address, true));
            }
        }

        Err(PorticoError::NoBackendsAvailable(
            "all backends unhealthy".into(),
        ))
    }

    /// Feeds the transport result of a call back into health accounting.
    /// `transport_ok` is about the wire, not the RPC: a well-formed backend
    /// error still counts as a healthy endpoint.
    pub fn report(&self, address: &str, transport_ok: bool) {
        let mut health = self.health.lock().unwrap_or_else(|e| e.into_inner());
        // Stale entries for endpoints that left the set are pruned on the
        // next acquire.
        let entry = health.entry(address.to_string()).or_default();

        if transport_ok {
            if entry.is_unhealthy() {
                info!(address = %address, "backend recovered");
            }
            entry.consecutive_failures = 0;
            entry.unhealthy_since = None;
            entry.probing = false;
            return;
        }

        entry.consecutive_failures += 1;
        if entry.is_unhealthy() {
            // Failed probe: restart the cooldown.
            entry.unhealthy_since = Some(Instant::now());
            entry.probing = false;
        } else if entry.consecutive_failures >= self.config.failure_threshold {
            warn!(
                address = %address,
                failures = entry.consecutive_failures,
                "backend marked unhealthy"
            );
            entry.unhealthy_since = Some(Instant::now());
        }
    }

    fn connection(&self, address: &str, probe: bool) -> Connection {
        Connection {
            address: address.to_string(),
            client: self.client.clone(),
            probe,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use portico_registry::{CoordinationStore, Endpoint, MemoryStore, RegistryConfig};

    async fn pool_with_endpoints(addresses: &[&str], config: PoolConfig) -> ConnectionPool {
        let store = Arc::new(MemoryStore::new());
        for address in addresses {
            store
                .register("svc", Endpoint::new(*address))
                .await
                .unwrap();
        }
        let registry = Arc::new(EndpointRegistry::spawn(store, RegistryConfig::new("svc")));
        // Wait for the watch task to publish the initial membership.
        let deadline = Instant::now() + Duration::from_secs(2);
        while registry.current().len() < addresses.len() {
            assert!(Instant::now() < deadline, "registry never caught up");
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        ConnectionPool::new(registry, config)
    }

    #[tokio::test]
    async fn test_empty_set_fails_without_connecting() {
        let pool = pool_with_endpoints(&[], PoolConfig::default()).await;
        let err = pool.acquire().unwrap_err();
        assert!(matches!(err, PorticoError::NoBackendsAvailable(_)));
    }

    #[tokio::test]
    async fn test_round_robin_rotates() {
        let pool = pool_with_endpoints(&["a:1", "b:2", "c:3"], PoolConfig::default()).await;
        let picks: Vec<String> = (0..6).map(|_| pool.acquire().unwrap().address).collect();
        assert_eq!(picks[0..3], picks[3..6]);
        let mut unique = picks[0..3].to_vec();
        unique.sort();
        assert_eq!(unique, vec!["a:1", "b:2", "c:3"]);
    }

    #[tokio::test]
    async fn test_unhealthy_endpoint_is_skipped() {
        let pool = pool_with_endpoints(&["a:1", "b:2"], PoolConfig::default()).await;
        for _ in 0..3 {
            pool.report("a:1", false);
        }
        for _ in 0..4 {
            assert_eq!(pool.acquire().unwrap().address, "b:2");
        }
    }

    #[tokio::test]
    async fn test_half_open_probe_after_cooldown() {
        let config = PoolConfig {
            failure_threshold: 1,
            cooldown: Duration::ZERO,
            ..PoolConfig::default()
        };
        let pool = pool_with_endpoints(&["a:1"], config).await;
        pool.report("a:1", false);

        // Cooldown elapsed: exactly one probe is handed out until it
        // reports back.
        let probe = pool.acquire().unwrap();
        assert!(probe.probe);
        assert!(pool.acquire().is_err());

        // Failed probe restarts the cycle; a successful one fully recovers.
        pool.report("a:1", false);
        let second = pool.acquire().unwrap();
        assert!(second.probe);
        pool.report("a:1", true);
        let healthy = pool.acquire().unwrap();
        assert!(!healthy.probe);
    }

    #[tokio::test]
    async fn test_failures_below_threshold_keep_endpoint() {
        let pool = pool_with_endpoints(&["a:1"], PoolConfig::default()).await;
        pool.report("a:1", false);
        pool.report("a:1", false);
        assert!(pool.acquire().is_ok());
        pool.report("a:1", true);
        pool.report("a:1", false);
        pool.report("a:1", false);
        assert!(pool.acquire().is_ok());
    }
}
