use super::*;
use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Node as K8sNode, NodeSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kaput_not_netmaker::{
    Egress, Error as NetmakerError, Host, Node as MeshNode, Result as NetmakerResult,
};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Write operations observed by the mock mesh, in order.
#[derive(Clone, Debug, PartialEq, Eq)]
enum Op {
    Create(EgressReq),
    Update(EgressReq),
    Delete(String),
}

/// In-memory mesh: canned hosts and nodes, a live egress store so repeated
/// passes observe earlier writes, and a log of every write issued.
#[derive(Default)]
struct MockMesh {
    hosts: Vec<Host>,
    nodes: Vec<MeshNode>,
    egress: Arc<Mutex<HashMap<String, Vec<Egress>>>>,
    ops: Arc<Mutex<Vec<Op>>>,
    next_id: Arc<AtomicUsize>,
    /// Networks whose egress list endpoint fails.
    broken_networks: Vec<String>,
}

/// Test-side view of the mock's shared state, alive after the mock has been
/// moved into the cached client.
#[derive(Clone)]
struct MeshHandle {
    egress: Arc<Mutex<HashMap<String, Vec<Egress>>>>,
    ops: Arc<Mutex<Vec<Op>>>,
}

impl MockMesh {
    fn with_egress(self, network: &str, rules: Vec<Egress>) -> Self {
        self.egress.lock().insert(network.to_string(), rules);
        self
    }

    fn handle(&self) -> MeshHandle {
        MeshHandle {
            egress: self.egress.clone(),
            ops: self.ops.clone(),
        }
    }
}

impl MeshHandle {
    fn ops(&self) -> Vec<Op> {
        self.ops.lock().clone()
    }

    fn rules(&self, network: &str) -> Vec<Egress> {
        self.egress.lock().get(network).cloned().unwrap_or_default()
    }
}

#[async_trait]
impl Client for MockMesh {
    async fn authenticate(&self) -> NetmakerResult<()> {
        Ok(())
    }

    async fn list_hosts(&self) -> NetmakerResult<Vec<Host>> {
        Ok(self.hosts.clone())
    }

    async fn list_nodes(&self) -> NetmakerResult<Vec<MeshNode>> {
        Ok(self.nodes.clone())
    }

    async fn list_egress(&self, network: &str) -> NetmakerResult<Vec<Egress>> {
        if self.broken_networks.iter().any(|n| n == network) {
            return Err(NetmakerError::Code {
                op: "list_egress",
                code: 500,
                message: "internal error".to_string(),
            });
        }
        Ok(self.egress.lock().get(network).cloned().unwrap_or_default())
    }

    async fn create_egress(&self, req: EgressReq) -> NetmakerResult<Egress> {
        self.ops.lock().push(Op::Create(req.clone()));
        let egress = Egress {
            id: format!("egress-{}", self.next_id.fetch_add(1, Ordering::SeqCst) + 1),
            name: req.name,
            network: req.network.clone(),
            description: req.description,
            range: req.range,
            nat: req.nat,
            nodes: req.nodes,
            status: req.status,
        };
        self.egress
            .lock()
            .entry(req.network)
            .or_default()
            .push(egress.clone());
        Ok(egress)
    }

    async fn update_egress(&self, req: EgressReq) -> NetmakerResult<Egress> {
        self.ops.lock().push(Op::Update(req.clone()));
        let id = req.id.clone().expect("update must carry an id");
        let mut egress = self.egress.lock();
        let rules = egress.entry(req.network.clone()).or_default();
        let rule = rules
            .iter_mut()
            .find(|rule| rule.id == id)
            .expect("update must target an existing rule");
        rule.name = req.name;
        rule.description = req.description;
        rule.range = req.range;
        rule.nat = req.nat;
        rule.nodes = req.nodes;
        rule.status = req.status;
        Ok(rule.clone())
    }

    async fn delete_egress(&self, id: &str) -> NetmakerResult<()> {
        self.ops.lock().push(Op::Delete(id.to_string()));
        for rules in self.egress.lock().values_mut() {
            rules.retain(|rule| rule.id != id);
        }
        Ok(())
    }
}

fn mk_host(id: &str, name: &str, nodes: &[&str]) -> Host {
    Host {
        id: id.to_string(),
        name: name.to_string(),
        nodes: nodes.iter().map(|id| id.to_string()).collect(),
    }
}

fn mk_mesh_node(id: &str, host_id: &str, network: &str) -> MeshNode {
    MeshNode {
        id: id.to_string(),
        host_id: host_id.to_string(),
        network: network.to_string(),
    }
}

fn mk_node(name: &str, cidrs: &[&str]) -> K8sNode {
    K8sNode {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            ..ObjectMeta::default()
        },
        spec: Some(NodeSpec {
            pod_cidrs: Some(cidrs.iter().map(|cidr| cidr.to_string()).collect()),
            ..NodeSpec::default()
        }),
        ..K8sNode::default()
    }
}

fn mk_rule(id: &str, description: &str, range: &str, name: &str, mesh_node: &str) -> Egress {
    Egress {
        id: id.to_string(),
        name: name.to_string(),
        network: "net".to_string(),
        description: description.to_string(),
        range: range.to_string(),
        nat: false,
        nodes: HashMap::from([(mesh_node.to_string(), EGRESS_METRIC)]),
        status: true,
    }
}

/// One host `node-a` with a single mesh node `u1` in network `net`.
fn single_node_mesh() -> MockMesh {
    MockMesh {
        hosts: vec![mk_host("h1", "node-a", &["u1"])],
        nodes: vec![mk_mesh_node("u1", "h1", "net")],
        ..MockMesh::default()
    }
}

fn reconciler(mesh: MockMesh, cluster: Option<&str>) -> (MeshHandle, Reconciler<MockMesh>) {
    let handle = mesh.handle();
    let client = Arc::new(CachedClient::new(mesh, std::time::Duration::ZERO));
    let reconciler = Reconciler::new(client, cluster.map(|c| c.to_string()));
    (handle, reconciler)
}

#[tokio::test]
async fn creates_egress_for_new_pod_cidr() {
    let (mesh, reconciler) = reconciler(single_node_mesh(), None);

    reconciler
        .reconcile_node(&mk_node("node-a", &["10.0.0.0/24"]))
        .await
        .expect("reconcile");

    assert_eq!(
        mesh.ops(),
        vec![Op::Create(EgressReq {
            id: None,
            name: "node-a pods (1/1)".to_string(),
            network: "net".to_string(),
            description: "Managed by kaput-not (DO NOT EDIT): index=0".to_string(),
            range: "10.0.0.0/24".to_string(),
            nat: false,
            nodes: HashMap::from([("u1".to_string(), EGRESS_METRIC)]),
            status: true,
        })]
    );
}

#[tokio::test]
async fn reconcile_is_idempotent() {
    let (mesh, reconciler) = reconciler(single_node_mesh(), None);
    let node = mk_node("node-a", &["10.0.0.0/24"]);

    reconciler.reconcile_node(&node).await.expect("first pass");
    reconciler.reconcile_node(&node).await.expect("second pass");

    assert_eq!(mesh.ops().len(), 1, "second pass must not write");
}

#[tokio::test]
async fn cidr_change_updates_the_rule_in_place() {
    let (mesh, reconciler) = reconciler(single_node_mesh(), None);

    reconciler
        .reconcile_node(&mk_node("node-a", &["10.0.0.0/24"]))
        .await
        .expect("seed");
    reconciler
        .reconcile_node(&mk_node("node-a", &["10.0.1.0/24"]))
        .await
        .expect("update");

    let ops = mesh.ops();
    assert_eq!(ops.len(), 2);
    match &ops[1] {
        Op::Update(req) => {
            assert_eq!(req.id.as_deref(), Some("egress-1"), "id must be preserved");
            assert_eq!(req.network, "net");
            assert_eq!(req.range, "10.0.1.0/24");
        }
        other => panic!("expected update, got {other:?}"),
    }
}

#[tokio::test]
async fn dual_stack_addition_renames_and_creates() {
    let (mesh, reconciler) = reconciler(single_node_mesh(), None);

    reconciler
        .reconcile_node(&mk_node("node-a", &["10.0.0.0/24"]))
        .await
        .expect("seed");
    reconciler
        .reconcile_node(&mk_node("node-a", &["10.0.0.0/24", "fd00::/64"]))
        .await
        .expect("dual stack");

    let ops = mesh.ops();
    assert_eq!(ops.len(), 3);
    match &ops[1] {
        Op::Update(req) => {
            assert_eq!(req.id.as_deref(), Some("egress-1"));
            assert_eq!(req.name, "node-a pods (1/2)");
            assert_eq!(req.range, "10.0.0.0/24", "range must not change");
            assert_eq!(
                req.description,
                "Managed by kaput-not (DO NOT EDIT): index=0"
            );
        }
        other => panic!("expected update, got {other:?}"),
    }
    match &ops[2] {
        Op::Create(req) => {
            assert_eq!(req.name, "node-a pods (2/2)");
            assert_eq!(req.range, "fd00::/64");
            assert_eq!(
                req.description,
                "Managed by kaput-not (DO NOT EDIT): index=1"
            );
        }
        other => panic!("expected create, got {other:?}"),
    }
}

#[tokio::test]
async fn foreign_cluster_rules_are_left_alone() {
    let mesh = single_node_mesh().with_egress(
        "net",
        vec![mk_rule(
            "eu-1",
            "Managed by kaput-not (DO NOT EDIT): cluster=eu-west index=0",
            "10.0.0.0/24",
            "node-a pods (1/1)",
            "u1",
        )],
    );
    let (mesh, reconciler) = reconciler(mesh, Some("us-east"));

    reconciler
        .reconcile_node(&mk_node("node-a", &["10.9.0.0/24"]))
        .await
        .expect("reconcile");

    let ops = mesh.ops();
    assert_eq!(ops.len(), 1);
    match &ops[0] {
        Op::Create(req) => {
            assert_eq!(
                req.description,
                "Managed by kaput-not (DO NOT EDIT): cluster=us-east index=0"
            );
            assert_eq!(req.range, "10.9.0.0/24");
        }
        other => panic!("expected create, got {other:?}"),
    }
    // The eu-west rule is untouched.
    assert!(mesh.rules("net").iter().any(|r| r.id == "eu-1"));
}

#[tokio::test]
async fn unscoped_mode_does_not_adopt_scoped_rules() {
    let mesh = single_node_mesh().with_egress(
        "net",
        vec![mk_rule(
            "eu-1",
            "Managed by kaput-not (DO NOT EDIT): cluster=eu-west index=0",
            "10.0.0.0/24",
            "node-a pods (1/1)",
            "u1",
        )],
    );
    let (mesh, reconciler) = reconciler(mesh, None);

    reconciler
        .reconcile_node(&mk_node("node-a", &["10.0.0.0/24"]))
        .await
        .expect("reconcile");

    // A fresh unscoped rule is created; the scoped one is not updated.
    assert!(matches!(&mesh.ops()[..], [Op::Create(_)]));
}

#[tokio::test]
async fn missing_mesh_host_is_silent_success() {
    let (mesh, reconciler) = reconciler(single_node_mesh(), None);

    reconciler
        .reconcile_node(&mk_node("node-z", &["10.0.0.0/24"]))
        .await
        .expect("unknown host must not error");
    assert!(mesh.ops().is_empty());
}

#[tokio::test]
async fn nodes_without_cidrs_are_skipped() {
    let (mesh, reconciler) = reconciler(single_node_mesh(), None);

    reconciler
        .reconcile_node(&mk_node("node-a", &[]))
        .await
        .expect("no CIDRs is not an error");
    assert!(mesh.ops().is_empty());
}

#[tokio::test]
async fn singular_pod_cidr_is_used_as_fallback() {
    let (mesh, reconciler) = reconciler(single_node_mesh(), None);

    let mut node = mk_node("node-a", &[]);
    node.spec = Some(NodeSpec {
        pod_cidr: Some("10.0.0.0/24".to_string()),
        ..NodeSpec::default()
    });
    reconciler.reconcile_node(&node).await.expect("reconcile");

    assert!(
        matches!(&mesh.ops()[..], [Op::Create(req)] if req.range == "10.0.0.0/24"),
        "ops: {:?}",
        mesh.ops()
    );
}

#[tokio::test]
async fn delete_node_removes_only_owned_rules() {
    let mesh = single_node_mesh().with_egress(
        "net",
        vec![
            mk_rule(
                "ours",
                "Managed by kaput-not (DO NOT EDIT): index=0",
                "10.0.0.0/24",
                "node-a pods (1/1)",
                "u1",
            ),
            mk_rule("theirs", "hand made, hands off", "10.1.0.0/24", "vpn", "u1"),
        ],
    );
    let (mesh, reconciler) = reconciler(mesh, None);

    reconciler.delete_node("node-a").await.expect("delete");

    assert_eq!(mesh.ops(), vec![Op::Delete("ours".to_string())]);
    assert!(mesh.rules("net").iter().any(|r| r.id == "theirs"));
}

#[tokio::test]
async fn delete_node_without_mesh_host_is_silent_success() {
    let (mesh, reconciler) = reconciler(single_node_mesh(), None);

    reconciler.delete_node("node-z").await.expect("delete");
    assert!(mesh.ops().is_empty());
}

#[tokio::test]
async fn orphan_cleanup_removes_rules_for_dead_mesh_nodes() {
    let mesh = single_node_mesh().with_egress(
        "net",
        vec![mk_rule(
            "stale",
            "Managed by kaput-not (DO NOT EDIT): index=0",
            "10.0.0.0/24",
            "node-a pods (1/1)",
            "u1",
        )],
    );
    let (mesh, reconciler) = reconciler(mesh, None);

    // u1 is still claimed by a live node: nothing happens.
    let valid = HashSet::from(["u1".to_string()]);
    reconciler
        .cleanup_orphaned_egresses(&valid)
        .await
        .expect("cleanup");
    assert!(mesh.ops().is_empty());

    // u1 is no longer claimed: its owned rule goes away.
    reconciler
        .cleanup_orphaned_egresses(&HashSet::new())
        .await
        .expect("cleanup");
    assert_eq!(mesh.ops(), vec![Op::Delete("stale".to_string())]);
}

#[tokio::test]
async fn shrunken_cidr_lists_drop_rules_beyond_the_list() {
    let mesh = single_node_mesh().with_egress(
        "net",
        vec![
            mk_rule(
                "keep",
                "Managed by kaput-not (DO NOT EDIT): index=0",
                "10.0.0.0/24",
                "node-a pods (1/1)",
                "u1",
            ),
            mk_rule(
                "drop",
                "Managed by kaput-not (DO NOT EDIT): index=1",
                "fd00::/64",
                "node-a pods (2/2)",
                "u1",
            ),
        ],
    );
    let (mesh, reconciler) = reconciler(mesh, None);

    reconciler
        .reconcile_node(&mk_node("node-a", &["10.0.0.0/24"]))
        .await
        .expect("shrink");

    assert_eq!(mesh.ops(), vec![Op::Delete("drop".to_string())]);
    assert!(mesh.rules("net").iter().any(|r| r.id == "keep"));
}

#[tokio::test]
async fn malformed_index_is_repaired_in_place() {
    let mesh = single_node_mesh().with_egress(
        "net",
        vec![mk_rule(
            "mangled",
            "Managed by kaput-not (DO NOT EDIT): index=zero",
            "10.0.0.0/24",
            "node-a pods (1/1)",
            "u1",
        )],
    );
    let (mesh, reconciler) = reconciler(mesh, None);

    reconciler
        .reconcile_node(&mk_node("node-a", &["10.0.0.0/24"]))
        .await
        .expect("reconcile");

    // The mangled payload parses as index 0, so the rule is matched and its
    // description normalized rather than duplicated.
    let ops = mesh.ops();
    assert_eq!(ops.len(), 1);
    match &ops[0] {
        Op::Update(req) => {
            assert_eq!(req.id.as_deref(), Some("mangled"));
            assert_eq!(
                req.description,
                "Managed by kaput-not (DO NOT EDIT): index=0"
            );
        }
        other => panic!("expected update, got {other:?}"),
    }
}

#[tokio::test]
async fn failures_accumulate_across_networks() {
    let mesh = MockMesh {
        hosts: vec![mk_host("h1", "node-a", &["u1", "u2"])],
        nodes: vec![
            mk_mesh_node("u1", "h1", "net-a"),
            mk_mesh_node("u2", "h1", "net-b"),
        ],
        broken_networks: vec!["net-b".to_string()],
        ..MockMesh::default()
    };
    let (mesh, reconciler) = reconciler(mesh, None);

    let error = reconciler
        .reconcile_node(&mk_node("node-a", &["10.0.0.0/24"]))
        .await
        .expect_err("net-b must fail");

    assert!(error.to_string().contains("net-b"), "error: {error:#}");
    // The healthy network still made progress.
    assert!(mesh
        .ops()
        .iter()
        .any(|op| matches!(op, Op::Create(req) if req.network == "net-a")));
}
