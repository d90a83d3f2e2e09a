#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

//! Typed client for the Netmaker REST API.
//!
//! The [`Client`] trait is the capability the reconciliation engine depends
//! on: authentication plus the host/node/egress endpoints. [`HttpClient`] is
//! the transport implementation; [`CachedClient`] decorates any client with a
//! bounded-TTL cache over the read endpoints.

mod cache;
mod client;
mod types;

pub use self::{
    cache::CachedClient,
    client::HttpClient,
    types::{Egress, EgressReq, Host, Node},
};

use async_trait::async_trait;

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Netmaker API operations. The network is a parameter on the endpoints that
/// need one; hosts and nodes are global.
#[async_trait]
pub trait Client: Send + Sync + 'static {
    /// Obtains a fresh bearer token.
    async fn authenticate(&self) -> Result<()>;

    /// Returns all hosts.
    async fn list_hosts(&self) -> Result<Vec<Host>>;

    /// Returns all nodes across all networks.
    async fn list_nodes(&self) -> Result<Vec<Node>>;

    /// Returns all egress gateways in `network`.
    async fn list_egress(&self, network: &str) -> Result<Vec<Egress>>;

    /// Creates an egress gateway in `req.network`.
    async fn create_egress(&self, req: EgressReq) -> Result<Egress>;

    /// Updates the egress gateway identified by `req.id`.
    async fn update_egress(&self, req: EgressReq) -> Result<Egress>;

    /// Removes an egress gateway by id.
    async fn delete_egress(&self, id: &str) -> Result<()>;
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The HTTP status was outside the operation's accepted set.
    #[error("{op} failed with HTTP status {status}: {body}")]
    Status {
        op: &'static str,
        status: reqwest::StatusCode,
        body: String,
    },

    /// The response did not declare a JSON content type.
    #[error("{op}: expected JSON response, got Content-Type {content_type:?}")]
    ContentType {
        op: &'static str,
        content_type: String,
    },

    /// The HTTP exchange succeeded but the body carried an API-level error.
    #[error("{op} failed with API code {code}: {message}")]
    Code {
        op: &'static str,
        code: i64,
        message: String,
    },

    /// The request was rejected again after a fresh authentication.
    #[error("{op}: unauthorized after re-authentication")]
    Unauthorized { op: &'static str },

    #[error("authentication succeeded but no token in response")]
    MissingToken,

    /// No host carries the requested name. Benign for callers that tolerate
    /// mesh hosts lagging behind cluster nodes.
    #[error("host not found with name {0}")]
    HostNotFound(String),

    #[error("{op}: {source}")]
    Http {
        op: &'static str,
        #[source]
        source: reqwest::Error,
    },

    #[error("invalid client configuration: {0}")]
    Config(&'static str),
}
