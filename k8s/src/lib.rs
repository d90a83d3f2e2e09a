#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

//! Node controller: bridges a Kubernetes `Node` watch to the egress
//! reconciler.
//!
//! A reflector mirrors the cluster's nodes; watch events are filtered down to
//! pod-CIDR changes and queued by node name. Workers drain the queue through
//! the reconciler with rate-limited retry. Deletions bypass the queue, and an
//! orphan-cleanup pass runs at startup and on every resync to repair drift
//! the event stream missed.

mod queue;

use crate::queue::Workqueue;
use ahash::AHashMap;
use anyhow::{anyhow, Context, Result};
use futures::StreamExt;
use k8s_openapi::api::core::v1::Node;
use kaput_not_netmaker::{CachedClient, Client, Host};
use kaput_not_reconciler::{pod_cidrs, Reconciler};
use kube::{
    runtime::{
        reflector,
        reflector::{ObjectRef, Store},
        watcher,
    },
    Api, ResourceExt,
};
use std::{collections::HashSet, sync::Arc};
use tokio::time;
use tracing::{debug, info, info_span, warn, Instrument};

const DEFAULT_RESYNC_PERIOD: time::Duration = time::Duration::from_secs(10 * 60);

#[derive(Clone, Debug)]
pub struct Options {
    /// Interval between orphan-cleanup passes and full re-enqueues.
    pub resync_period: time::Duration,
    /// Number of concurrent reconciliation workers.
    pub workers: usize,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            resync_period: DEFAULT_RESYNC_PERIOD,
            workers: 1,
        }
    }
}

/// Watches cluster nodes and drives the reconciler.
pub struct Controller<C> {
    client: kube::Client,
    mesh: Arc<CachedClient<C>>,
    reconciler: Arc<Reconciler<C>>,
    options: Options,
}

// === impl Controller ===

impl<C: Client> Controller<C> {
    pub fn new(
        client: kube::Client,
        mesh: Arc<CachedClient<C>>,
        reconciler: Arc<Reconciler<C>>,
        options: Options,
    ) -> Self {
        Self {
            client,
            mesh,
            reconciler,
            options,
        }
    }

    /// Runs the controller until `drain` signals shutdown.
    ///
    /// Workers are started only after the initial node list has been synced
    /// and a first orphan-cleanup pass has run.
    pub async fn run(self, drain: drain::Watch) -> Result<()> {
        let api = Api::<Node>::all(self.client.clone());
        let (store, writer) = reflector::store::<Node>();
        let mut events = std::pin::pin!(reflector(writer, watcher(api, watcher::Config::default())));

        let queue = Workqueue::new();
        // Last observed CIDR list per node, so unrelated node updates do not
        // trigger reconciliation.
        let mut last_cidrs = AHashMap::new();
        let mut synced = false;
        let mut shutdown = std::pin::pin!(drain.clone().signaled());

        loop {
            let event = tokio::select! {
                _ = &mut shutdown => break,
                event = events.next() => event,
            };
            let event = match event {
                Some(Ok(event)) => event,
                Some(Err(error)) => {
                    info!(%error, "node watch disconnected");
                    continue;
                }
                None => {
                    queue.shut_down();
                    return Err(anyhow!("node watch stream ended unexpectedly"));
                }
            };

            match event {
                watcher::Event::Init => {}
                watcher::Event::InitApply(node) | watcher::Event::Apply(node) => {
                    let name = node.name_any();
                    if cidrs_changed(&mut last_cidrs, &name, pod_cidrs(&node)) {
                        debug!(node = %name, "enqueueing");
                        queue.add(name);
                    }
                }
                watcher::Event::InitDone if !synced => {
                    synced = true;
                    info!(nodes = store.state().len(), "node cache synced");
                    if let Err(error) = self.cleanup_orphans(&store).await {
                        warn!(?error, "initial orphan cleanup failed");
                    }
                    self.spawn_workers(&queue, &store);
                    self.spawn_resync(&queue, &store, drain.clone());
                }
                watcher::Event::InitDone => {}
                watcher::Event::Delete(node) => {
                    let name = node.name_any();
                    last_cidrs.remove(&name);
                    let span = info_span!("delete", node = %name);
                    let reconciler = self.reconciler.clone();
                    tokio::spawn(
                        async move {
                            info!("node deleted; removing its egress rules");
                            if let Err(error) = reconciler.delete_node(&name).await {
                                warn!(?error, "failed to delete egress rules");
                            }
                        }
                        .instrument(span),
                    );
                }
            }
        }

        queue.shut_down();
        Ok(())
    }

    fn spawn_workers(&self, queue: &Workqueue, store: &Store<Node>) {
        for id in 0..self.options.workers.max(1) {
            let queue = queue.clone();
            let store = store.clone();
            let reconciler = self.reconciler.clone();
            tokio::spawn(
                async move {
                    while let Some(key) = queue.next().await {
                        let result = sync(&reconciler, &store, &key).await;
                        queue.done(&key);
                        match result {
                            Ok(()) => queue.forget(&key),
                            Err(error) => {
                                warn!(node = %key, ?error, "sync failed; requeueing");
                                queue.add_rate_limited(key);
                            }
                        }
                    }
                    debug!("worker stopped");
                }
                .instrument(info_span!("worker", id)),
            );
        }
    }

    /// Periodically repairs drift: cleans up orphans, then re-enqueues every
    /// known node so missed updates converge within one resync period.
    fn spawn_resync(&self, queue: &Workqueue, store: &Store<Node>, drain: drain::Watch) {
        let queue = queue.clone();
        let store = store.clone();
        let mesh = self.mesh.clone();
        let reconciler = self.reconciler.clone();
        let period = self.options.resync_period;
        tokio::spawn(
            async move {
                loop {
                    tokio::select! {
                        _ = drain.clone().signaled() => return,
                        _ = time::sleep(period) => {}
                    }
                    debug!("resync");
                    if let Err(error) = cleanup_orphans(&mesh, &reconciler, &store).await {
                        warn!(?error, "orphan cleanup failed");
                    }
                    for node in store.state() {
                        queue.add(node.name_any());
                    }
                }
            }
            .instrument(info_span!("resync")),
        );
    }

    async fn cleanup_orphans(&self, store: &Store<Node>) -> Result<()> {
        cleanup_orphans(&self.mesh, &self.reconciler, store).await
    }
}

/// Looks the key up in the node cache and reconciles it. A missing node means
/// the deletion was already handled.
async fn sync<C: Client>(
    reconciler: &Reconciler<C>,
    store: &Store<Node>,
    key: &str,
) -> Result<()> {
    let Some(node) = store.get(&ObjectRef::new(key)) else {
        return Ok(());
    };
    reconciler
        .reconcile_node(&node)
        .await
        .with_context(|| format!("failed to reconcile node {key}"))
}

async fn cleanup_orphans<C: Client>(
    mesh: &CachedClient<C>,
    reconciler: &Reconciler<C>,
    store: &Store<Node>,
) -> Result<()> {
    let hosts = mesh.list_hosts().await.context("failed to list mesh hosts")?;
    let valid = valid_node_ids(&store.state(), &hosts);
    reconciler.cleanup_orphaned_egresses(&valid).await
}

/// Folds the cluster's nodes against the mesh's hosts into the set of
/// mesh-node UUIDs that are backed by a live node with pod CIDRs. The host
/// map is built once so the fold stays `O(n + m)`.
fn valid_node_ids(nodes: &[Arc<Node>], hosts: &[Host]) -> HashSet<String> {
    let by_name: AHashMap<&str, &[String]> = hosts
        .iter()
        .map(|host| (host.name.as_str(), host.nodes.as_slice()))
        .collect();

    let mut valid = HashSet::new();
    for node in nodes {
        if pod_cidrs(node).is_empty() {
            continue;
        }
        if let Some(ids) = by_name.get(node.name_any().as_str()) {
            valid.extend(ids.iter().cloned());
        }
    }
    valid
}

/// Records the node's effective CIDR list, reporting whether it differs from
/// the last observed one. First sightings always count as changed.
fn cidrs_changed(last: &mut AHashMap<String, Vec<String>>, name: &str, cidrs: Vec<String>) -> bool {
    if last.get(name) == Some(&cidrs) {
        return false;
    }
    last.insert(name.to_string(), cidrs);
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::NodeSpec;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

    fn mk_node(name: &str, cidrs: &[&str]) -> Node {
        Node {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                ..ObjectMeta::default()
            },
            spec: Some(NodeSpec {
                pod_cidrs: Some(cidrs.iter().map(|cidr| cidr.to_string()).collect()),
                ..NodeSpec::default()
            }),
            ..Node::default()
        }
    }

    fn mk_host(name: &str, nodes: &[&str]) -> Host {
        Host {
            id: format!("host-{name}"),
            name: name.to_string(),
            nodes: nodes.iter().map(|id| id.to_string()).collect(),
        }
    }

    #[test]
    fn cidr_filter_enqueues_only_changes() {
        let mut last = AHashMap::new();

        // First sighting always counts.
        assert!(cidrs_changed(
            &mut last,
            "node-a",
            vec!["10.0.0.0/24".to_string()]
        ));
        // Unchanged list is filtered.
        assert!(!cidrs_changed(
            &mut last,
            "node-a",
            vec!["10.0.0.0/24".to_string()]
        ));
        // Growth counts.
        assert!(cidrs_changed(
            &mut last,
            "node-a",
            vec!["10.0.0.0/24".to_string(), "fd00::/64".to_string()]
        ));
        // The comparison is order-sensitive.
        assert!(cidrs_changed(
            &mut last,
            "node-a",
            vec!["fd00::/64".to_string(), "10.0.0.0/24".to_string()]
        ));
    }

    #[test]
    fn valid_node_ids_folds_nodes_against_hosts() {
        let nodes = vec![
            Arc::new(mk_node("node-a", &["10.0.0.0/24"])),
            // No CIDRs yet: contributes nothing even though the host exists.
            Arc::new(mk_node("node-b", &[])),
            // No matching mesh host.
            Arc::new(mk_node("node-c", &["10.2.0.0/24"])),
        ];
        let hosts = vec![
            mk_host("node-a", &["u1", "u2"]),
            mk_host("node-b", &["u3"]),
            mk_host("node-z", &["u9"]),
        ];

        let valid = valid_node_ids(&nodes, &hosts);
        assert_eq!(
            valid,
            HashSet::from(["u1".to_string(), "u2".to_string()])
        );
    }
}
