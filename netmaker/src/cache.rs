use crate::{Client, Egress, EgressReq, Error, Host, Node, Result};
use std::collections::HashMap;
use tokio::sync::RwLock;
use tokio::time::{Duration, Instant};

const DEFAULT_TTL: Duration = Duration::from_secs(30);

/// Bounded-TTL cache over a [`Client`]'s read endpoints with write-through
/// invalidation.
///
/// Hosts and nodes are cached globally; egress lists per network. The write
/// guard is held across a refetch so only one refetch is in flight per cache
/// key; waiters re-check the entry once they acquire the guard.
pub struct CachedClient<C> {
    inner: C,
    ttl: Duration,
    state: RwLock<State>,
}

#[derive(Default)]
struct State {
    hosts: Option<Entry<Vec<Host>>>,
    nodes: Option<Entry<Vec<Node>>>,
    egress: HashMap<String, Entry<Vec<Egress>>>,
}

struct Entry<T> {
    value: T,
    fetched_at: Instant,
}

impl<T: Clone> Entry<T> {
    fn new(value: T) -> Self {
        Self {
            value,
            fetched_at: Instant::now(),
        }
    }

    fn fresh(&self, ttl: Duration) -> Option<T> {
        (self.fetched_at.elapsed() < ttl).then(|| self.value.clone())
    }
}

impl<C> CachedClient<C> {
    /// Wraps `inner` with a TTL cache. A zero `ttl` selects the 30s default.
    pub fn new(inner: C, ttl: Duration) -> Self {
        let ttl = if ttl.is_zero() { DEFAULT_TTL } else { ttl };
        Self {
            inner,
            ttl,
            state: RwLock::new(State::default()),
        }
    }
}

impl<C: Client> CachedClient<C> {
    /// Returns the mesh-node UUIDs of the host named `hostname`, resolved
    /// through the hosts cache only.
    pub async fn get_node_ids_by_hostname(&self, hostname: &str) -> Result<Vec<String>> {
        let hosts = self.list_hosts().await?;
        hosts
            .into_iter()
            .find(|host| host.name == hostname)
            .map(|host| host.nodes)
            .ok_or_else(|| Error::HostNotFound(hostname.to_string()))
    }
}

#[async_trait::async_trait]
impl<C: Client> Client for CachedClient<C> {
    async fn authenticate(&self) -> Result<()> {
        self.inner.authenticate().await
    }

    async fn list_hosts(&self) -> Result<Vec<Host>> {
        if let Some(hosts) = self
            .state
            .read()
            .await
            .hosts
            .as_ref()
            .and_then(|entry| entry.fresh(self.ttl))
        {
            return Ok(hosts);
        }

        let mut state = self.state.write().await;
        // Another task may have refetched while we waited for the guard.
        if let Some(hosts) = state.hosts.as_ref().and_then(|entry| entry.fresh(self.ttl)) {
            return Ok(hosts);
        }
        let hosts = self.inner.list_hosts().await?;
        state.hosts = Some(Entry::new(hosts.clone()));
        Ok(hosts)
    }

    async fn list_nodes(&self) -> Result<Vec<Node>> {
        if let Some(nodes) = self
            .state
            .read()
            .await
            .nodes
            .as_ref()
            .and_then(|entry| entry.fresh(self.ttl))
        {
            return Ok(nodes);
        }

        let mut state = self.state.write().await;
        if let Some(nodes) = state.nodes.as_ref().and_then(|entry| entry.fresh(self.ttl)) {
            return Ok(nodes);
        }
        let nodes = self.inner.list_nodes().await?;
        state.nodes = Some(Entry::new(nodes.clone()));
        Ok(nodes)
    }

    async fn list_egress(&self, network: &str) -> Result<Vec<Egress>> {
        if let Some(egress) = self
            .state
            .read()
            .await
            .egress
            .get(network)
            .and_then(|entry| entry.fresh(self.ttl))
        {
            return Ok(egress);
        }

        let mut state = self.state.write().await;
        if let Some(egress) = state.egress.get(network).and_then(|entry| entry.fresh(self.ttl)) {
            return Ok(egress);
        }
        let egress = self.inner.list_egress(network).await?;
        state.egress.insert(network.to_string(), Entry::new(egress.clone()));
        Ok(egress)
    }

    async fn create_egress(&self, req: EgressReq) -> Result<Egress> {
        let network = req.network.clone();
        let egress = self.inner.create_egress(req).await?;
        self.state.write().await.egress.remove(&network);
        Ok(egress)
    }

    async fn update_egress(&self, req: EgressReq) -> Result<Egress> {
        let network = req.network.clone();
        let egress = self.inner.update_egress(req).await?;
        self.state.write().await.egress.remove(&network);
        Ok(egress)
    }

    async fn delete_egress(&self, id: &str) -> Result<()> {
        self.inner.delete_egress(id).await?;
        // The egress id does not reveal its network, so drop every entry.
        self.state.write().await.egress.clear();
        Ok(())
    }
}
