use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Membership change operation emitted by the coordination store.
///
/// `Sync` is the end-of-replay marker: a watch stream opens with the current
/// membership as `Add` events, then one `Sync`, then live deltas. Everything
/// before the marker is a snapshot of the store's state; everything after is
/// a change that happened while the watch was open.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EndpointOp {
    Add,
    Remove,
    Sync,
}

/// One membership change for a service.
///
/// The store guarantees in-order delivery per address; events for different
/// addresses may interleave arbitrarily. `Sync` events carry no address.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EndpointEvent {
    pub op: EndpointOp,
    #[serde(default)]
    pub address: String,
    #[serde(default)]
    pub metadata: Vec<u8>,
}

impl EndpointEvent {
    pub fn add(address: impl Into<String>) -> Self {
        Self {
            op: EndpointOp::Add,
            address: address.into(),
            metadata: Vec::new(),
        }
    }

    pub fn remove(address: impl Into<String>) -> Self {
        Self {
            op: EndpointOp::Remove,
            address: address.into(),
            metadata: Vec::new(),
        }
    }

    /// The end-of-replay marker.
    pub fn sync() -> Self {
        Self {
            op: EndpointOp::Sync,
            address: String::new(),
            metadata: Vec::new(),
        }
    }
}

/// One network-reachable backend instance. Identity is the address; the
/// metadata is carried opaquely and never interpreted.
#[derive(Debug, Clone, PartialEq)]
pub struct Endpoint {
    pub address: String,
    pub metadata: Bytes,
}

impl Endpoint {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            metadata: Bytes::new(),
        }
    }

    pub fn with_metadata(address: impl Into<String>, metadata: impl Into<Bytes>) -> Self {
        Self {
            address: address.into(),
            metadata: metadata.into(),
        }
    }
}

/// The set of live endpoints for one service.
///
/// Mutated only by the registry's watch task; readers see whole snapshots
/// through `Arc` replacement, never a partially-applied update. A `BTreeMap`
/// keeps address ordering stable for the pool's round-robin cursor.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EndpointSet {
    endpoints: BTreeMap<String, Endpoint>,
}

impl EndpointSet {
    /// Applies one membership event. Returns whether the set changed:
    /// duplicate adds and removes of absent addresses are no-ops.
    pub fn apply(&mut self, event: &EndpointEvent) -> bool {
        match event.op {
            EndpointOp::Add => {
                if self.endpoints.contains_key(&event.address) {
                    return false;
                }
                self.endpoints.insert(
                    event.address.clone(),
                    Endpoint::with_metadata(event.address.clone(), event.metadata.clone()),
                );
                true
            }
            EndpointOp::Remove => self.endpoints.remove(&event.address).is_some(),
            // Carries no membership change of its own.
            EndpointOp::Sync => false,
        }
    }

    pub fn contains(&self, address: &str) -> bool {
        self.endpoints.contains_key(address)
    }

    pub fn get(&self, address: &str) -> Option<&Endpoint> {
        self.endpoints.get(address)
    }

    pub fn addresses(&self) -> impl Iterator<Item = &str> {
        self.endpoints.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.endpoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.endpoints.is_empty()
    }
}
