//! Pipeline terminal: path-to-method routing and backend dispatch.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

use portico_common::protocol::{JsonRpcRequest, PorticoError};
use portico_common::transport::call_backend;

use crate::context::RequestContext;
use crate::pipeline::{Outcome, Terminal};
use crate::pool::ConnectionPool;

/// Static mapping from inbound HTTP path to backend RPC method. Fixed at
/// startup; the dynamic part of the gateway is the endpoint set, not the
/// routes.
#[derive(Debug, Clone, Default)]
pub struct RoutingTable {
    routes: HashMap<String, String>,
}

impl RoutingTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, path: impl Into<String>, method: impl Into<String>) {
        self.routes.insert(path.into(), method.into());
    }

    pub fn method_for(&self, path: &str) -> Option<&str> {
        self.routes.get(path).map(String::as_str)
    }

    pub fn entries(&self) -> impl Iterator<Item = (&str, &str)> {
        self.routes
            .iter()
            .map(|(path, method)| (path.as_str(), method.as_str()))
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}

impl FromIterator<(String, String)> for RoutingTable {
    fn from_iter<T: IntoIterator<Item = (String, String)>>(iter: T) -> Self {
        Self {
            routes: iter.into_iter().collect(),
        }
    }
}

/// Forwards a request to one backend and translates the result.
///
/// `NoBackendsAvailable` is surfaced immediately as 503: retrying cannot
/// help while the endpoint set is empty, and queueing would only hide the
/// outage. The transport result of every call is reported back to the pool
/// so endpoint health tracks real traffic.
pub struct GatewayRouter {
    table: RoutingTable,
    pool: Arc<ConnectionPool>,
}

impl GatewayRouter {
    pub fn new(table: RoutingTable, pool: Arc<ConnectionPool>) -> Self {
        Self { table, pool }
    }

    pub fn table(&self) -> &RoutingTable {
        &self.table
    }
}

#[async_trait]
impl Terminal for GatewayRouter {
    async fn handle(&self, ctx: &RequestContext) -> Outcome {
        let Some(method) = self.table.method_for(&ctx.path) else {
            return Outcome::from_error(&PorticoError::MethodNotFound(ctx.path.clone()));
        };

        let connection = match self.pool.acquire() {
            Ok(connection) => connection,
            Err(e) => return Outcome::from_error(&e),
        };

        debug!(path = %ctx.path, method = %method, backend = %connection.address, "forwarding");
        let request = JsonRpcRequest::new(method, ctx.params.clone());
        match call_backend(
            &connection.client,
            &connection.address,
            &request,
            self.pool.request_timeout(),
        )
        .await
        {
            Ok(result) => {
                self.pool.report(&connection.address, true);
                Outcome::ok(result)
            }
            Err(e) => {
                // A well-formed RPC error means the backend is reachable
                // and healthy at the transport level.
                self.pool.report(&connection.address, !e.is_transport());
                Outcome::from_error(&e)
            }
        }
    }
}
