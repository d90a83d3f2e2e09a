//! Stable identity metadata carried in egress rule descriptions.
//!
//! The description string is the only durable tag on a managed rule: it names
//! the author, optionally the owning cluster, and the position of the pod
//! CIDR it projects. Parsing is strict on the author marker and permissive on
//! the payload so that a mangled payload never makes a managed rule look
//! foreign (which would orphan it forever).

/// Marker prefixing every managed egress description.
pub const EGRESS_MARKER: &str = "Managed by kaput-not (DO NOT EDIT)";

/// Fixed metric assigned to egress gateway nodes.
pub const EGRESS_METRIC: u32 = 500;

/// Metadata parsed from a managed egress description.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EgressMeta {
    /// Owning cluster; `None` for rules written in single-cluster mode.
    pub cluster: Option<String>,
    /// Position of the projected CIDR in the node's `podCIDRs` list.
    pub index: usize,
}

impl EgressMeta {
    /// Parses a description, returning `None` when the rule was not authored
    /// by this controller. Unknown keys are ignored, an empty `cluster=` is
    /// treated as absent, and a malformed `index` defaults to zero.
    pub fn parse(description: &str) -> Option<Self> {
        let payload = description.strip_prefix(EGRESS_MARKER)?.strip_prefix(": ")?;

        let mut meta = Self {
            cluster: None,
            index: 0,
        };
        for field in payload.split_whitespace() {
            let Some((key, value)) = field.split_once('=') else {
                continue;
            };
            match key {
                "cluster" if !value.is_empty() => meta.cluster = Some(value.to_string()),
                "index" => meta.index = value.parse().unwrap_or(0),
                _ => {}
            }
        }
        Some(meta)
    }

    /// Ownership filter: with no cluster configured only unscoped rules are
    /// owned; with a cluster configured only rules scoped to it are.
    pub fn matches_scope(&self, cluster: Option<&str>) -> bool {
        self.cluster.as_deref() == cluster
    }
}

/// Renders the description for an owned rule at `index`.
pub fn egress_description(cluster: Option<&str>, index: usize) -> String {
    match cluster {
        Some(cluster) => format!("{EGRESS_MARKER}: cluster={cluster} index={index}"),
        None => format!("{EGRESS_MARKER}: index={index}"),
    }
}

/// Human-readable rule name, e.g. `"node-a pods (1/2)"`.
pub fn egress_name(node: &str, index: usize, total: usize) -> String {
    format!("{} pods ({}/{})", node, index + 1, total)
}
