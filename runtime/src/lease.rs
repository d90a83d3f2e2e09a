//! Single-writer lease for the controller.
//!
//! A Kubernetes `Lease` elects one active replica. The claim task renews the
//! lease in the background and publishes claim changes on a watch; the
//! controller is gated on holding the claim, and the lease is vacated on
//! shutdown so the next replica does not have to wait the lease out.

use anyhow::{anyhow, Result};
use k8s_openapi::api::coordination::v1 as coordv1;
use kube::api::{Api, ObjectMeta, Patch, PatchParams};
use kubert::lease::{Claim, ClaimParams, LeaseManager};
use std::sync::Arc;
use tokio::{sync::watch, task::JoinHandle, time};
use tracing::{debug, info};

const LEASE_DURATION: time::Duration = time::Duration::from_secs(15);
const RENEW_GRACE_PERIOD: time::Duration = time::Duration::from_secs(5);
const FIELD_MANAGER: &str = "kaput-not";

/// A live claim on the controller lease.
pub struct Election {
    claims: watch::Receiver<Arc<Claim>>,
    task: JoinHandle<LeaseManager>,
    identity: String,
}

/// Ensures the Lease resource exists and spawns the claim task for it.
pub async fn init(
    client: &kube::Client,
    namespace: &str,
    name: &str,
    identity: &str,
) -> Result<Election> {
    let api = Api::<coordv1::Lease>::namespaced(client.clone(), namespace);

    let lease = coordv1::Lease {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            // Resource version "0" creates the Lease only if it does not
            // already exist.
            resource_version: Some("0".to_string()),
            ..Default::default()
        },
        spec: None,
    };
    let params = PatchParams {
        field_manager: Some(FIELD_MANAGER.to_string()),
        ..Default::default()
    };
    match api.patch(name, &params, &Patch::Apply(lease)).await {
        Ok(_) => info!(lease = %name, %namespace, "created lease"),
        Err(kube::Error::Api(_)) => debug!(lease = %name, %namespace, "lease already exists"),
        Err(error) => return Err(error.into()),
    }

    let manager = LeaseManager::init(api, name)
        .await?
        .with_field_manager(FIELD_MANAGER);
    let params = ClaimParams {
        lease_duration: LEASE_DURATION,
        renew_grace_period: RENEW_GRACE_PERIOD,
    };
    let (claims, task) = manager.spawn(identity, params).await?;

    Ok(Election {
        claims,
        task,
        identity: identity.to_string(),
    })
}

/// Blocks until `identity` holds the lease, logging the leaders seen while
/// waiting.
pub async fn await_leadership(
    claims: &mut watch::Receiver<Arc<Claim>>,
    identity: &str,
) -> Result<()> {
    loop {
        let claim = claims.borrow_and_update().clone();
        if claim.is_current_for(identity) {
            return Ok(());
        }
        info!(leader = %claim.holder, "waiting for leadership");
        claims
            .changed()
            .await
            .map_err(|_| anyhow!("lease claim task stopped"))?;
    }
}

/// Resolves once the lease is no longer held by `identity`, returning the
/// usurping claim.
pub async fn await_loss(
    claims: &mut watch::Receiver<Arc<Claim>>,
    identity: &str,
) -> Result<Arc<Claim>> {
    loop {
        claims
            .changed()
            .await
            .map_err(|_| anyhow!("lease claim task stopped"))?;
        let claim = claims.borrow_and_update().clone();
        if !claim.is_current_for(identity) {
            return Ok(claim);
        }
    }
}

// === impl Election ===

impl Election {
    pub fn identity(&self) -> &str {
        &self.identity
    }

    /// A receiver for observing claim changes.
    pub fn claims(&self) -> watch::Receiver<Arc<Claim>> {
        self.claims.clone()
    }

    /// Releases the lease so the next replica can claim it immediately.
    pub async fn vacate(self) -> Result<()> {
        let Self {
            claims,
            task,
            identity,
        } = self;
        // The claim task completes once every receiver is gone.
        drop(claims);
        let manager = task.await?;
        let released = manager.vacate(&identity).await?;
        if released {
            info!("released lease");
        }
        Ok(())
    }
}
