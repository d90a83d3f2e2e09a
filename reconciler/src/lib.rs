#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

//! Reconciles Kubernetes node pod CIDRs into Netmaker egress rules.
//!
//! A node's mesh host is found by name; the host's mesh nodes tell us which
//! networks it participates in, and each `(mesh node, pod CIDR index)` pair
//! maps to exactly one owned egress rule in that node's network. Rules are
//! keyed by the description metadata rather than by CIDR so a CIDR change
//! updates the existing rule in place instead of orphaning it.

mod identity;

#[cfg(test)]
mod tests;

pub use self::identity::{
    egress_description, egress_name, EgressMeta, EGRESS_MARKER, EGRESS_METRIC,
};

use anyhow::{anyhow, Context, Result};
use k8s_openapi::api::core::v1::Node;
use kaput_not_netmaker::{self as netmaker, CachedClient, Client, EgressReq};
use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
};
use tracing::{debug, info, instrument};

/// The effective pod CIDR list of a node: `podCIDRs` when populated, falling
/// back to the singular `podCIDR` on clusters that only set the legacy field.
pub fn pod_cidrs(node: &Node) -> Vec<String> {
    let Some(spec) = node.spec.as_ref() else {
        return Vec::new();
    };
    match &spec.pod_cidrs {
        Some(cidrs) if !cidrs.is_empty() => cidrs.clone(),
        _ => spec.pod_cidr.clone().into_iter().collect(),
    }
}

/// Drives a node's desired egress state into the mesh. Networks are
/// discovered from the mesh itself: every mesh node owned by the K8s node's
/// host names the network it lives in.
pub struct Reconciler<C> {
    client: Arc<CachedClient<C>>,
    cluster_name: Option<String>,
}

// === impl Reconciler ===

impl<C: Client> Reconciler<C> {
    /// `cluster_name` scopes rule ownership for deployments where several
    /// clusters share a mesh network.
    pub fn new(client: Arc<CachedClient<C>>, cluster_name: Option<String>) -> Self {
        Self {
            client,
            cluster_name,
        }
    }

    /// Syncs a node's pod CIDRs into every network its mesh host participates
    /// in. A missing mesh host is not an error: the mesh does not have to
    /// cover every cluster node.
    ///
    /// Failures are collected per network so that one broken network does not
    /// block progress in the others.
    #[instrument(skip_all, fields(node = ?node.metadata.name))]
    pub async fn reconcile_node(&self, node: &Node) -> Result<()> {
        let name = node.metadata.name.as_deref().unwrap_or_default();
        let pod_cidrs = pod_cidrs(node);
        if pod_cidrs.is_empty() {
            // The node may not have been allocated CIDRs yet.
            return Ok(());
        }

        let node_ids = match self.client.get_node_ids_by_hostname(name).await {
            Ok(ids) => ids,
            Err(netmaker::Error::HostNotFound(_)) => {
                debug!("no mesh host for node");
                return Ok(());
            }
            Err(error) => {
                return Err(error)
                    .with_context(|| format!("failed to get mesh node ids for node {name}"))
            }
        };
        if node_ids.is_empty() {
            return Ok(());
        }

        let all_nodes = self
            .client
            .list_nodes()
            .await
            .context("failed to list mesh nodes")?;

        let mut failed = Vec::new();
        for mesh_node in all_nodes.iter().filter(|n| node_ids.contains(&n.id)) {
            if let Err(error) = self
                .reconcile_in_network(name, &pod_cidrs, &mesh_node.id, &mesh_node.network)
                .await
            {
                failed.push(format!("network {}: {error:#}", mesh_node.network));
            }
        }
        if !failed.is_empty() {
            return Err(anyhow!(
                "failed to reconcile node {name} in some networks: [{}]",
                failed.join(", ")
            ));
        }
        Ok(())
    }

    /// Reconciles one mesh node in its network, sharing a single egress list
    /// fetch across all of the node's CIDRs.
    async fn reconcile_in_network(
        &self,
        node_name: &str,
        pod_cidrs: &[String],
        mesh_node_id: &str,
        network: &str,
    ) -> Result<()> {
        let egresses = self
            .client
            .list_egress(network)
            .await
            .with_context(|| format!("failed to list egress rules in network {network}"))?;

        for (index, cidr) in pod_cidrs.iter().enumerate() {
            self.reconcile_pod_cidr(
                node_name,
                mesh_node_id,
                cidr,
                index,
                pod_cidrs.len(),
                &egresses,
                network,
            )
            .await
            .with_context(|| {
                format!("failed to reconcile pod CIDR {cidr} (index={index}) in network {network}")
            })?;
        }

        // Rules left behind by a shrunken CIDR list still target a live mesh
        // node, so the orphan pass cannot collect them; drop them here.
        for egress in &egresses {
            let Some(meta) = EgressMeta::parse(&egress.description) else {
                continue;
            };
            if !meta.matches_scope(self.cluster_name.as_deref())
                || meta.index < pod_cidrs.len()
                || !egress.nodes.contains_key(mesh_node_id)
            {
                continue;
            }
            info!(
                id = %egress.id,
                index = meta.index,
                %network,
                "deleting egress beyond the current CIDR list"
            );
            self.client
                .delete_egress(&egress.id)
                .await
                .with_context(|| {
                    format!(
                        "failed to delete stale egress {} in network {network}",
                        egress.id
                    )
                })?;
        }
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    async fn reconcile_pod_cidr(
        &self,
        node_name: &str,
        mesh_node_id: &str,
        cidr: &str,
        index: usize,
        total: usize,
        egresses: &[netmaker::Egress],
        network: &str,
    ) -> Result<()> {
        let description = egress_description(self.cluster_name.as_deref(), index);
        let name = egress_name(node_name, index, total);
        let nodes = HashMap::from([(mesh_node_id.to_string(), EGRESS_METRIC)]);

        // First rule in scan order that is ours, carries this index, and
        // targets this mesh node.
        let existing = egresses.iter().find(|egress| {
            EgressMeta::parse(&egress.description)
                .map(|meta| {
                    meta.matches_scope(self.cluster_name.as_deref())
                        && meta.index == index
                        && egress.nodes.contains_key(mesh_node_id)
                })
                .unwrap_or(false)
        });

        let Some(existing) = existing else {
            info!(%cidr, index, %network, "creating egress");
            let req = EgressReq {
                id: None,
                name,
                network: network.to_string(),
                description,
                range: cidr.to_string(),
                nat: false,
                nodes,
                status: true,
            };
            self.client
                .create_egress(req)
                .await
                .with_context(|| format!("failed to create egress for CIDR {cidr}"))?;
            return Ok(());
        };

        if existing.range == cidr && existing.name == name && existing.description == description {
            return Ok(());
        }

        info!(
            id = %existing.id,
            old = %existing.range,
            new = %cidr,
            %network,
            "updating egress"
        );
        let req = EgressReq {
            id: Some(existing.id.clone()),
            name,
            network: existing.network.clone(),
            description,
            range: cidr.to_string(),
            nat: false,
            nodes,
            status: true,
        };
        self.client.update_egress(req).await.with_context(|| {
            format!(
                "failed to update egress {} (old CIDR={}, new CIDR={cidr})",
                existing.id, existing.range
            )
        })?;
        Ok(())
    }

    /// Removes every owned egress rule attached to the mesh nodes of a
    /// deleted Kubernetes node. A missing mesh host means there is nothing to
    /// delete.
    #[instrument(skip(self))]
    pub async fn delete_node(&self, node_name: &str) -> Result<()> {
        let node_ids = match self.client.get_node_ids_by_hostname(node_name).await {
            Ok(ids) => ids,
            Err(netmaker::Error::HostNotFound(_)) => return Ok(()),
            Err(error) => {
                return Err(error)
                    .with_context(|| format!("failed to get mesh node ids for node {node_name}"))
            }
        };
        if node_ids.is_empty() {
            return Ok(());
        }

        let all_nodes = self
            .client
            .list_nodes()
            .await
            .context("failed to list mesh nodes")?;

        let mut failed = Vec::new();
        for mesh_node in all_nodes.iter().filter(|n| node_ids.contains(&n.id)) {
            if let Err(error) = self
                .delete_from_network(&mesh_node.id, &mesh_node.network)
                .await
            {
                failed.push(format!("network {}: {error:#}", mesh_node.network));
            }
        }
        if !failed.is_empty() {
            return Err(anyhow!(
                "failed to delete node {node_name} from some networks: [{}]",
                failed.join(", ")
            ));
        }
        Ok(())
    }

    /// Deletes the owned egress rules in `network` that target `mesh_node_id`.
    async fn delete_from_network(&self, mesh_node_id: &str, network: &str) -> Result<()> {
        let egresses = self
            .client
            .list_egress(network)
            .await
            .with_context(|| format!("failed to list egress rules in network {network}"))?;

        let mut failed = Vec::new();
        for egress in &egresses {
            let owned = EgressMeta::parse(&egress.description)
                .map(|meta| meta.matches_scope(self.cluster_name.as_deref()))
                .unwrap_or(false);
            if !owned || !egress.nodes.contains_key(mesh_node_id) {
                continue;
            }
            info!(id = %egress.id, %network, "deleting egress");
            if let Err(error) = self.client.delete_egress(&egress.id).await {
                failed.push(format!(
                    "failed to delete egress {} in network {network}: {error}",
                    egress.id
                ));
            }
        }
        if !failed.is_empty() {
            return Err(anyhow!(
                "failed to delete some egress rules in network {network}: [{}]",
                failed.join(", ")
            ));
        }
        Ok(())
    }

    /// Deletes owned egress rules whose mesh node no longer belongs to any
    /// live Kubernetes node. Runs at startup and on every resync to repair
    /// drift left by downtime, dropped delete events, or manual edits.
    pub async fn cleanup_orphaned_egresses(&self, valid_node_ids: &HashSet<String>) -> Result<()> {
        let all_nodes = self
            .client
            .list_nodes()
            .await
            .context("failed to list mesh nodes")?;

        let mut by_network: HashMap<&str, Vec<&str>> = HashMap::new();
        for node in &all_nodes {
            by_network
                .entry(node.network.as_str())
                .or_default()
                .push(node.id.as_str());
        }

        let mut failed = Vec::new();
        for (network, ids) in by_network {
            for id in ids.into_iter().filter(|id| !valid_node_ids.contains(*id)) {
                debug!(mesh_node = %id, %network, "cleaning up orphaned mesh node");
                if let Err(error) = self.delete_from_network(id, network).await {
                    failed.push(format!("network {network}, mesh node {id}: {error:#}"));
                }
            }
        }
        if !failed.is_empty() {
            return Err(anyhow!(
                "failed to clean up some orphaned egress rules: [{}]",
                failed.join(", ")
            ));
        }
        Ok(())
    }
}
