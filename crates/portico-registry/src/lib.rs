//! Dynamic backend discovery.
//!
//! Backend nodes register their addresses into a coordination store; the
//! gateway's [`EndpointRegistry`] watches that store and maintains the live
//! endpoint set per service name. The store itself is an external
//! collaborator behind the [`CoordinationStore`] trait, with an in-process
//! implementation for tests and single-process deployments and an HTTP
//! client for a real store service.
//!
//! On store disconnect the registry degrades to STALE: `current()` keeps
//! returning the last-known-good set while a reconnect loop with exponential
//! backoff runs in the background. An empty set is never published because
//! of a disconnect alone.

pub mod event;
pub mod registry;
pub mod store;

pub use event::{Endpoint, EndpointEvent, EndpointOp, EndpointSet};
pub use registry::{EndpointRegistry, RegistryConfig};
pub use store::{CoordinationStore, EventStream, HttpCoordinationStore, MemoryStore};
