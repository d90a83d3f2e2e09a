#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

//! Process wiring for the kaput-not controller: configuration, clients,
//! leader election, and shutdown.

mod lease;

use anyhow::{bail, Context, Result};
use clap::Parser;
use kaput_not_k8s::{Controller, Options};
use kaput_not_netmaker::{CachedClient, Client as _, HttpClient};
use kaput_not_reconciler::Reconciler;
use std::sync::Arc;
use tokio::time::Duration;
use tracing::{error, info, info_span, Instrument};

/// Mounted into every pod; its presence is how we detect running in-cluster.
const SERVICE_ACCOUNT_NAMESPACE_FILE: &str =
    "/var/run/secrets/kubernetes.io/serviceaccount/namespace";

const DEFAULT_LEASE_NAMESPACE: &str = "kube-system";

#[derive(Debug, Parser)]
#[clap(
    name = "kaput-not",
    about = "Projects Kubernetes node pod CIDRs onto Netmaker egress rules",
    version
)]
pub struct Args {
    #[clap(long, default_value = "kaput_not=info,warn", env = "KAPUT_NOT_LOG")]
    log_level: kubert::LogFilter,

    #[clap(long, default_value = "plain")]
    log_format: kubert::LogFormat,

    #[clap(flatten)]
    client: kubert::ClientArgs,

    #[clap(flatten)]
    admin: kubert::AdminArgs,

    /// Base URL of the Netmaker API.
    #[clap(long, env = "NETMAKER_API_URL")]
    netmaker_api_url: String,

    #[clap(long, env = "NETMAKER_USERNAME")]
    netmaker_username: String,

    #[clap(long, env = "NETMAKER_PASSWORD", hide_env_values = true)]
    netmaker_password: String,

    /// Scopes egress rule ownership to this cluster so several clusters can
    /// share a Netmaker network.
    #[clap(long, env = "CLUSTER_NAME")]
    cluster_name: Option<String>,

    /// Overrides the in-cluster auto-detection; accepts true/false/1/0.
    #[clap(long, env = "LEADER_ELECTION_ENABLED")]
    leader_election_enabled: Option<String>,

    /// Namespace of the election lease; defaults to the pod's namespace
    /// in-cluster and to kube-system elsewhere.
    #[clap(long, env = "LEADER_ELECTION_NAMESPACE")]
    leader_election_namespace: Option<String>,

    /// Name of the election lease.
    #[clap(long, env = "LEADER_ELECTION_ID", default_value = "kaput-not")]
    leader_election_id: String,

    /// Number of concurrent reconciliation workers.
    #[clap(long, env = "WORKER_COUNT", default_value = "1")]
    workers: usize,
}

// === impl Args ===

impl Args {
    pub async fn parse_and_run() -> Result<()> {
        Self::parse().run().await
    }

    pub async fn run(self) -> Result<()> {
        let Self {
            log_level,
            log_format,
            client,
            admin,
            netmaker_api_url,
            netmaker_username,
            netmaker_password,
            cluster_name,
            leader_election_enabled,
            leader_election_namespace,
            leader_election_id,
            workers,
        } = self;

        let runtime = kubert::Runtime::builder()
            .with_log(log_level, log_format)
            .with_admin(admin)
            .with_client(client)
            .build()
            .await?;

        let pod_namespace = pod_namespace();
        let in_cluster = pod_namespace.is_some();
        let elect = election_enabled(leader_election_enabled.as_deref(), in_cluster);
        let lease_namespace = lease_namespace(leader_election_namespace, pod_namespace);

        // Fail fast on bad credentials before touching anything else.
        let mesh = HttpClient::new(netmaker_api_url, netmaker_username, netmaker_password)
            .context("failed to create Netmaker client")?;
        let mesh = Arc::new(CachedClient::new(mesh, Duration::ZERO));
        mesh.authenticate()
            .await
            .context("failed to authenticate with Netmaker")?;
        info!("authenticated with Netmaker");

        let cluster_name = cluster_name.filter(|name| !name.is_empty());
        if let Some(cluster) = &cluster_name {
            info!(%cluster, "multi-cluster mode");
        }
        let reconciler = Arc::new(Reconciler::new(mesh.clone(), cluster_name));
        let controller = Controller::new(
            runtime.client(),
            mesh,
            reconciler,
            Options {
                workers,
                ..Options::default()
            },
        );

        let shutdown = runtime.shutdown_handle();
        let controller_task = {
            let drain = shutdown.clone();
            async move {
                if let Err(error) = controller.run(drain).await {
                    error!(?error, "controller failed");
                    std::process::exit(1);
                }
            }
            .instrument(info_span!("controller"))
        };

        let mut election = None;
        let mut gate = None;
        if elect {
            info!(
                namespace = %lease_namespace,
                lease = %leader_election_id,
                "leader election enabled"
            );
            let el = lease::init(
                &runtime.client(),
                &lease_namespace,
                &leader_election_id,
                &hostname(),
            )
            .await
            .context("failed to initialize leader election")?;

            let mut claims = el.claims();
            let identity = el.identity().to_string();
            gate = Some(tokio::spawn(
                async move {
                    if let Err(error) = lease::await_leadership(&mut claims, &identity).await {
                        error!(?error, "leader election failed");
                        std::process::exit(1);
                    }
                    info!(%identity, "became leader; starting controller");
                    tokio::spawn(controller_task);

                    // Stepping down mid-flight leaves no safe state to keep
                    // running from; exit and let the platform restart us.
                    match lease::await_loss(&mut claims, &identity).await {
                        Ok(claim) => error!(leader = %claim.holder, "lost leadership; exiting"),
                        Err(error) => error!(?error, "leader election failed"),
                    }
                    std::process::exit(1);
                }
                .instrument(info_span!("election")),
            ));
            election = Some(el);
        } else {
            info!("leader election disabled; running as a single instance");
            tokio::spawn(controller_task);
        }

        // Block on the shutdown signal, then let the background tasks drain.
        if runtime.run().await.is_err() {
            bail!("aborted");
        }

        if let Some(gate) = gate {
            gate.abort();
        }
        if let Some(election) = election {
            if let Err(error) = election.vacate().await {
                tracing::warn!(?error, "failed to release lease");
            }
        }
        Ok(())
    }
}

/// The pod's namespace when running in-cluster.
fn pod_namespace() -> Option<String> {
    std::fs::read_to_string(SERVICE_ACCOUNT_NAMESPACE_FILE)
        .ok()
        .map(|ns| ns.trim().to_string())
        .filter(|ns| !ns.is_empty())
}

/// Leader election defaults on (HA) in-cluster and off for local runs; an
/// explicit override wins when it parses, and falls back to the detected
/// default when it does not.
fn election_enabled(override_value: Option<&str>, in_cluster: bool) -> bool {
    match override_value {
        Some(value) => match value.to_ascii_lowercase().as_str() {
            "true" | "1" => true,
            "false" | "0" => false,
            _ => in_cluster,
        },
        None => in_cluster,
    }
}

fn lease_namespace(override_value: Option<String>, pod_namespace: Option<String>) -> String {
    override_value
        .or(pod_namespace)
        .unwrap_or_else(|| DEFAULT_LEASE_NAMESPACE.to_string())
}

fn hostname() -> String {
    std::env::var("HOSTNAME")
        .ok()
        .filter(|hostname| !hostname.is_empty())
        .unwrap_or_else(|| "unknown".to_string())
}
