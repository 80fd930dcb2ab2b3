use std::net::Ipv4Addr;

use dashmap::DashMap;
use k8s_openapi::api::discovery::v1::EndpointSlice;
use kube::Client;
use kube::runtime::reflector::Store;

use static_egress_crds::v1alpha1::staticegressip::StaticEgressIP;

use crate::dataplane::Programmer;
use crate::kubernetes::NodeRole;
use crate::metrics::ControllerMetrics;

pub struct Context<P: Programmer> {
    pub client: Client,
    pub egressip_store: Store<StaticEgressIP>,
    pub endpoint_slice_store: Store<EndpointSlice>,
    pub programmer: P,
    pub role: NodeRole,
    /// Annotation-derived gateway address, used by directors until the
    /// elector publishes one in the resource status.
    pub fallback_gateway_ip: Option<Ipv4Addr>,
    pub metrics: ControllerMetrics,
    /// Consecutive failures per object key, for exponential requeue.
    pub failures: DashMap<String, u32>,
}
