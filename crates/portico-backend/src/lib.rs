//! Backend RPC node.
//!
//! A [`BackendNode`] serves JSON-RPC over HTTP and announces itself to the
//! coordination store: register on startup, lease-style re-registration on
//! a heartbeat, best-effort deregistration on shutdown. Method bodies are
//! supplied through the [`BackendService`] trait.

pub mod http_server;
pub mod node;
pub mod service;

pub use http_server::build_app;
pub use node::{BackendConfig, BackendNode};
pub use service::{BackendService, EchoService};
