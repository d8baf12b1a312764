//! Portico Common Types and Transport
//!
//! Shared protocol and transport infrastructure for the Portico API gateway:
//!
//! - **Protocol layer**: JSON-RPC 2.0 request/response types and the
//!   workspace-wide error enum.
//! - **Transport layer**: hyper-based HTTP client plumbing used by the
//!   gateway's connection pool and by the registry's watch client.
//!
//! The gateway speaks plain JSON over HTTP on its inbound surface and
//! JSON-RPC 2.0 over HTTP towards backend nodes.

pub mod protocol;
pub mod transport;

pub use protocol::*;
