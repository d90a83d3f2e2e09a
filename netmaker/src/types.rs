//! Wire types for the Netmaker REST API. Unknown fields are ignored on
//! decode so newer servers remain compatible.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Request payload for `POST /api/users/adm/authenticate`.
#[derive(Debug, Serialize)]
pub(crate) struct AuthRequest<'a> {
    pub username: &'a str,
    pub password: &'a str,
}

/// Envelope wrapping the `/api/v1` responses; `Code` and `Message` carry
/// API-level errors on an otherwise successful HTTP exchange.
#[derive(Debug, Deserialize)]
#[serde(bound(deserialize = "T: Deserialize<'de> + Default"))]
pub(crate) struct Envelope<T> {
    #[serde(default, rename = "Code")]
    pub code: i64,
    #[serde(default, rename = "Message")]
    pub message: String,
    #[serde(default, rename = "Response")]
    pub response: T,
}

/// Token payload inside the authenticate envelope.
#[derive(Debug, Default, Deserialize)]
pub(crate) struct AuthToken {
    #[serde(default, rename = "AuthToken")]
    pub auth_token: String,
}

/// A Netmaker host. `name` matches the Kubernetes node name; `nodes` lists
/// the UUIDs of the per-network mesh nodes this host participates through.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize)]
pub struct Host {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub nodes: Vec<String>,
}

/// A Netmaker node: the per-network incarnation of a host.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize)]
pub struct Node {
    #[serde(default)]
    pub id: String,
    #[serde(default, rename = "hostid")]
    pub host_id: String,
    #[serde(default)]
    pub network: String,
}

/// A Netmaker egress gateway rule.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize)]
pub struct Egress {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub network: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub range: String,
    #[serde(default)]
    pub nat: bool,
    #[serde(default)]
    pub nodes: HashMap<String, u32>,
    #[serde(default)]
    pub status: bool,
}

/// Create/update request body for an egress gateway; `id` is set for updates
/// and omitted for creates.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct EgressReq {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub name: String,
    pub network: String,
    pub description: String,
    pub range: String,
    pub nat: bool,
    pub nodes: HashMap<String, u32>,
    pub status: bool,
}
