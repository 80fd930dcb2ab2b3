//! Cluster-singleton gateway election. One agent at a time holds a
//! coordination Lease; while leading it assigns a healthy worker node to
//! every StaticEgressIP and publishes the choice in the resource status.
//! The status write feeds back into every node's reconciler through the
//! resource watch; election never happens inside the reconciler itself.

use std::env;
use std::net::Ipv4Addr;
use std::time::Duration;

use chrono::Utc;
use k8s_openapi::api::coordination::v1::{Lease, LeaseSpec};
use k8s_openapi::api::core::v1::Node;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::MicroTime;
use kube::api::{ListParams, ObjectMeta, Patch, PatchParams, PostParams};
use kube::runtime::reflector::Store;
use kube::{Api, Client, ResourceExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use static_egress_crds::v1alpha1::staticegressip::StaticEgressIP;

use crate::kubernetes::{node_ip, node_ready};
use crate::{Error, Result};

pub const LEASE_NAMESPACE: &str = "kube-system";
pub const LEASE_NAME: &str = "static-egress-ip-configmap";

const MASTER_ROLE_LABEL: &str = "node-role.kubernetes.io/master";
const FIELD_MANAGER: &str = "static-egress-gateway-elector";

const LEASE_DURATION: Duration = Duration::from_secs(60);
const RENEW_INTERVAL: Duration = Duration::from_secs(15);
const RETRY_INTERVAL: Duration = Duration::from_secs(5);
const TICK_INTERVAL: Duration = Duration::from_secs(5);

pub struct GatewayElector {
    client: Client,
    egressip_store: Store<StaticEgressIP>,
    identity: String,
}

impl GatewayElector {
    /// Identity is this pod's IP, taken from the `POD_IP` environment
    /// variable; its absence is a configuration error.
    pub fn new(client: Client, egressip_store: Store<StaticEgressIP>) -> Result<Self> {
        let identity = env::var("POD_IP")
            .map_err(|_| Error::ConfigInvalid("POD_IP must be set for gateway election".into()))?;
        Ok(Self {
            client,
            egressip_store,
            identity,
        })
    }

    pub async fn run(self, cancel: CancellationToken) -> Result<()> {
        let api: Api<Lease> = Api::namespaced(self.client.clone(), LEASE_NAMESPACE);
        info!(identity = %self.identity, "waiting for gateway-elector leadership");
        loop {
            if cancel.is_cancelled() {
                return Ok(());
            }
            match self.try_acquire(&api).await {
                Ok(true) => {
                    info!(identity = %self.identity, "leading the gateway elector");
                    self.lead(&api, &cancel).await;
                    if cancel.is_cancelled() {
                        // The ticker has stopped; releasing now lets a
                        // successor acquire without waiting out the lease.
                        self.release(&api).await;
                        return Ok(());
                    }
                    warn!(identity = %self.identity, "gateway-elector leadership lost");
                }
                Ok(false) => {
                    debug!(identity = %self.identity, "lease held by another agent");
                }
                Err(e) => {
                    warn!(identity = %self.identity, error = %e, "failed to acquire lease");
                }
            }
            tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                _ = tokio::time::sleep(RETRY_INTERVAL) => {}
            }
        }
    }

    // Leader body: assign gateways every tick, renew the lease on its own
    // cadence, stop on cancellation or a failed renewal.
    async fn lead(&self, api: &Api<Lease>, cancel: &CancellationToken) {
        let mut tick = tokio::time::interval(TICK_INTERVAL);
        let mut renew = tokio::time::interval(RENEW_INTERVAL);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tick.tick() => {
                    if let Err(e) = self.allocate_gateways().await {
                        warn!(error = %e, "gateway allocation pass failed");
                    }
                }
                _ = renew.tick() => {
                    match self.try_acquire(api).await {
                        Ok(true) => {}
                        Ok(false) => return,
                        Err(e) => {
                            warn!(error = %e, "lease renewal failed");
                            return;
                        }
                    }
                }
            }
        }
    }

    async fn try_acquire(&self, api: &Api<Lease>) -> Result<bool> {
        let now = Utc::now();
        match api.get(LEASE_NAME).await {
            Ok(lease) => {
                let spec = lease.spec.as_ref();
                let holder = spec.and_then(|s| s.holder_identity.as_deref());
                if holder == Some(self.identity.as_str()) {
                    return self.renew(api, now).await;
                }
                let renew_time = spec.and_then(|s| s.renew_time.as_ref());
                let duration = spec.and_then(|s| s.lease_duration_seconds);
                let expired = match (holder, renew_time, duration) {
                    (None, _, _) => true,
                    (_, Some(rt), Some(duration)) => {
                        now > rt.0 + chrono::Duration::seconds(i64::from(duration))
                    }
                    _ => true,
                };
                if expired {
                    let transitions = spec.and_then(|s| s.lease_transitions).unwrap_or(0);
                    self.take_over(api, now, transitions).await
                } else {
                    Ok(false)
                }
            }
            Err(kube::Error::Api(e)) if e.code == 404 => self.create(api, now).await,
            Err(e) => Err(e.into()),
        }
    }

    async fn create(&self, api: &Api<Lease>, now: chrono::DateTime<Utc>) -> Result<bool> {
        let lease = Lease {
            metadata: ObjectMeta {
                name: Some(LEASE_NAME.into()),
                namespace: Some(LEASE_NAMESPACE.into()),
                ..Default::default()
            },
            spec: Some(LeaseSpec {
                holder_identity: Some(self.identity.clone()),
                lease_duration_seconds: Some(LEASE_DURATION.as_secs() as i32),
                acquire_time: Some(MicroTime(now)),
                renew_time: Some(MicroTime(now)),
                lease_transitions: Some(0),
                ..Default::default()
            }),
        };
        match api.create(&PostParams::default(), &lease).await {
            Ok(_) => Ok(true),
            Err(kube::Error::Api(e)) if e.code == 409 => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn renew(&self, api: &Api<Lease>, now: chrono::DateTime<Utc>) -> Result<bool> {
        let patch = serde_json::json!({
            "apiVersion": "coordination.k8s.io/v1",
            "kind": "Lease",
            "metadata": { "name": LEASE_NAME, "namespace": LEASE_NAMESPACE },
            "spec": { "renewTime": MicroTime(now) },
        });
        api.patch(
            LEASE_NAME,
            &PatchParams::apply(FIELD_MANAGER).force(),
            &Patch::Apply(&patch),
        )
        .await?;
        Ok(true)
    }

    async fn take_over(
        &self,
        api: &Api<Lease>,
        now: chrono::DateTime<Utc>,
        transitions: i32,
    ) -> Result<bool> {
        let patch = serde_json::json!({
            "apiVersion": "coordination.k8s.io/v1",
            "kind": "Lease",
            "metadata": { "name": LEASE_NAME, "namespace": LEASE_NAMESPACE },
            "spec": {
                "holderIdentity": self.identity,
                "acquireTime": MicroTime(now),
                "renewTime": MicroTime(now),
                "leaseDurationSeconds": LEASE_DURATION.as_secs() as i32,
                "leaseTransitions": transitions + 1,
            },
        });
        match api
            .patch(
                LEASE_NAME,
                &PatchParams::apply(FIELD_MANAGER).force(),
                &Patch::Apply(&patch),
            )
            .await
        {
            Ok(_) => {
                info!(transitions = transitions + 1, "took over expired lease");
                Ok(true)
            }
            Err(kube::Error::Api(e)) if e.code == 409 => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn release(&self, api: &Api<Lease>) {
        let patch = serde_json::json!({
            "spec": { "holderIdentity": null, "renewTime": null },
        });
        if let Err(e) = api
            .patch(LEASE_NAME, &PatchParams::default(), &Patch::Merge(&patch))
            .await
        {
            warn!(error = %e, "failed to release gateway-elector lease");
        } else {
            info!(identity = %self.identity, "released gateway-elector lease");
        }
    }

    /// One allocation pass over every StaticEgressIP.
    async fn allocate_gateways(&self) -> Result<()> {
        let nodes = Api::<Node>::all(self.client.clone())
            .list(&ListParams::default())
            .await?
            .items;

        for egress in self.egressip_store.state() {
            let ns = egress.namespace().unwrap_or_default();
            let name = egress.name_any();
            let Some((node_uid, gateway_ip)) = choose_gateway(&egress, &nodes) else {
                warn!(
                    "no ready worker node available to act as gateway for {}/{}",
                    ns, name
                );
                continue;
            };

            let current = egress.status.clone().unwrap_or_default();
            if current.gateway_node == node_uid && current.gateway_ip == gateway_ip.to_string() {
                continue;
            }
            if !current.gateway_node.is_empty() {
                info!(
                    "gateway for {}/{} changed from {} to {}",
                    ns, name, current.gateway_node, node_uid
                );
            } else {
                info!("gateway {} chosen for {}/{}", node_uid, ns, name);
            }

            let api: Api<StaticEgressIP> = Api::namespaced(self.client.clone(), &ns);
            let patch = serde_json::json!({
                "status": {
                    "gateway-node": node_uid,
                    "gateway-ip": gateway_ip.to_string(),
                },
            });
            if let Err(e) = api
                .patch_status(&name, &PatchParams::default(), &Patch::Merge(&patch))
                .await
            {
                warn!(error = %e, "failed to publish gateway for {}/{}", ns, name);
            }
        }
        Ok(())
    }
}

/// Picks the gateway node for one resource: the already-published node when
/// it is still Ready (stickiness prevents flapping), else the first listed
/// Ready node that is not a control-plane master.
pub(crate) fn choose_gateway(
    egress: &StaticEgressIP,
    nodes: &[Node],
) -> Option<(String, Ipv4Addr)> {
    if let Some(uid) = egress.gateway_node()
        && let Some(node) = nodes.iter().find(|n| n.uid().as_deref() == Some(uid))
        && node_ready(node)
    {
        let ip = egress.gateway_ip().or_else(|| node_ip(node))?;
        return Some((uid.to_string(), ip));
    }

    nodes
        .iter()
        .filter(|node| node_ready(node) && !node.labels().contains_key(MASTER_ROLE_LABEL))
        .find_map(|node| Some((node.uid()?, node_ip(node)?)))
}
