use kube::CustomResource;
use kube::KubeSchema;
use kube::runtime::reflector::Store;
use serde::{Deserialize, Serialize};

use std::net::Ipv4Addr;
use std::sync::Arc;

use data_encoding::BASE32;
use k8s_openapi::api::discovery::v1::{EndpointConditions, EndpointSlice};
use kube::ResourceExt;
use sha2::{Digest, Sha256};

use crate::SERVICE_OWNER_LABEL;

pub const NAME_GROUP_STATICEGRESSIP: &str = "staticegressips.egressip.nirmata.io";

/// Tag prefixed to every per-rule kernel object (ipset name, rule comments).
pub const RULE_ID_PREFIX: &str = "EGRESS-IP-";

/// StaticEgressIP declares that egress traffic from the pods behind a
/// service toward a destination CIDR must leave the cluster with a fixed
/// source IP. The status block carries the gateway choice published by the
/// elector.
#[derive(CustomResource, KubeSchema, Serialize, Deserialize, Default, PartialEq, Clone, Debug)]
#[kube(
    group = "egressip.nirmata.io",
    version = "v1alpha1",
    kind = "StaticEgressIP",
    status = "StaticEgressIPStatus",
    derive = "Default",
    derive = "PartialEq",
    namespaced
)]
pub struct StaticEgressIPSpec {
    pub rules: Vec<EgressRule>,
}

#[derive(KubeSchema, Serialize, Deserialize, Default, PartialEq, Clone, Debug)]
pub struct EgressRule {
    #[serde(rename = "service-name")]
    pub service_name: String,

    #[serde(rename = "egressip")]
    pub egress_ip: String,

    pub cidr: String,
}

/// Written only by the gateway elector.
#[derive(KubeSchema, Serialize, Deserialize, Default, PartialEq, Clone, Debug)]
pub struct StaticEgressIPStatus {
    #[serde(rename = "gateway-node", default)]
    pub gateway_node: String,

    #[serde(rename = "gateway-ip", default)]
    pub gateway_ip: String,
}

impl StaticEgressIP {
    /// Gateway address published in status, when present and parseable.
    pub fn gateway_ip(&self) -> Option<Ipv4Addr> {
        self.status.as_ref()?.gateway_ip.parse().ok()
    }

    /// Node UID published in status, when non-empty.
    pub fn gateway_node(&self) -> Option<&str> {
        let uid = self.status.as_ref()?.gateway_node.as_str();
        (!uid.is_empty()).then_some(uid)
    }

    pub fn references_service(&self, service: &str) -> bool {
        self.spec.rules.iter().any(|r| r.service_name == service)
    }
}

/// Deterministic per-rule tag, stable across restarts and usable as a kernel
/// object name (26 chars, alphanumeric plus `-`).
pub fn rule_id(namespace: &str, name: &str, index: usize) -> String {
    let mut hasher = Sha256::new();
    hasher.update(namespace.as_bytes());
    hasher.update(name.as_bytes());
    hasher.update(index.to_string().as_bytes());
    let digest = hasher.finalize();
    let encoded = BASE32.encode(digest.as_slice());
    format!("{RULE_ID_PREFIX}{}", &encoded[..16])
}

/// Resolves the current pod IPs backing a service: the union of ready
/// addresses over every EndpointSlice owned by the service in the
/// namespace, de-duplicated.
pub fn pod_ips_for_service(
    store: &Store<EndpointSlice>,
    namespace: &str,
    service: &str,
) -> Vec<Ipv4Addr> {
    let mut ips = Vec::new();
    for slice in slices_owned_by_service(store, namespace, service) {
        for endpoint in &slice.endpoints {
            if !endpoint_ready(endpoint.conditions.as_ref()) {
                continue;
            }
            for addr in &endpoint.addresses {
                let Ok(ip) = addr.parse::<Ipv4Addr>() else {
                    continue;
                };
                if !ips.contains(&ip) {
                    ips.push(ip);
                }
            }
        }
    }
    ips
}

fn slices_owned_by_service(
    store: &Store<EndpointSlice>,
    namespace: &str,
    service: &str,
) -> Vec<Arc<EndpointSlice>> {
    let mut slices: Vec<Arc<EndpointSlice>> = store
        .state()
        .iter()
        .filter(|slice| {
            slice.namespace().as_deref() == Some(namespace)
                && slice.labels().get(SERVICE_OWNER_LABEL).map(String::as_str) == Some(service)
        })
        .cloned()
        .collect();
    // Store iteration order is arbitrary; keep membership derivation stable.
    slices.sort_by_key(|slice| slice.name_any());
    slices
}

// Absent conditions count as ready, matching the EndpointSlice contract.
fn endpoint_ready(conditions: Option<&EndpointConditions>) -> bool {
    let Some(cond) = conditions else {
        return true;
    };
    (cond.ready == Some(true) || cond.ready.is_none()) && cond.terminating != Some(true)
}
