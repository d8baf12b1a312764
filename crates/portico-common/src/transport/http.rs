//! HTTP transport plumbing.
//!
//! One shared hyper client is used for all outbound traffic (backend RPC
//! calls and coordination-store requests). The client keeps its own internal
//! connection pool per host, so a handle is cheap to clone and safe to share
//! across tasks.

use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::header::CONTENT_TYPE;
use hyper::{Method, Request};
use hyper_util::client::legacy::{connect::HttpConnector, Client};
use hyper_util::rt::TokioExecutor;
use serde_json::Value;
use std::time::Duration;

use crate::protocol::{JsonRpcRequest, JsonRpcResponse, PorticoError, Result};

/// Shared hyper client type used for all outbound HTTP.
pub type HttpClient = Client<HttpConnector, Full<Bytes>>;

/// Builds the shared outbound HTTP client.
pub fn build_client() -> HttpClient {
    Client::builder(TokioExecutor::new()).build_http()
}

/// Sends one JSON-RPC call to a backend node and returns its result value.
///
/// Wire failures (connect, timeout, malformed body) surface as
/// [`PorticoError::Transport`] / [`PorticoError::Timeout`] and count against
/// the endpoint's health. A well-formed JSON-RPC error response surfaces as
/// [`PorticoError::Backend`] and does not.
pub async fn call_backend(
    client: &HttpClient,
    address: &str,
    req: &JsonRpcRequest,
    timeout: Duration,
) -> Result<Value> {
    let url = format!("http://{}/", address);
    let body = serde_json::to_vec(req)?;

    let http_request = Request::builder()
        .method(Method::POST)
        .uri(&url)
        .header(CONTENT_TYPE, "application/json")
        .body(Full::new(Bytes::from(body)))
        .map_err(|e| PorticoError::Transport(format!("failed to build request: {}", e)))?;

    let response = tokio::time::timeout(timeout, client.request(http_request))
        .await
        .map_err(|_| PorticoError::Timeout(timeout.as_millis() as u64))?
        .map_err(|e| PorticoError::Transport(format!("request to {} failed: {}", address, e)))?;

    let body = response
        .into_body()
        .collect()
        .await
        .map_err(|e| PorticoError::Transport(format!("failed to read response: {}", e)))?
        .to_bytes();

    let rpc_response: JsonRpcResponse = serde_json::from_slice(&body)?;

    if let Some(error) = rpc_response.error {
        return Err(PorticoError::backend(&req.method, error.message));
    }

    rpc_response
        .result
        .ok_or_else(|| PorticoError::Transport("response missing result".into()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_call_backend_connection_refused_is_transport() {
        let client = build_client();
        let req = JsonRpcRequest::new("echo", json!({}));
        // Nothing listens on this port.
        let err = call_backend(&client, "127.0.0.1:1", &req, Duration::from_millis(500))
            .await
            .unwrap_err();
        assert!(err.is_transport(), "expected transport error, got {}", err);
    }

    #[test]
    fn test_client_is_cloneable() {
        let client = build_client();
        let _clone = client.clone();
    }
}
