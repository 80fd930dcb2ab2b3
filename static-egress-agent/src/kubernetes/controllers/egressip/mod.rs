mod context;
mod controller;

use std::net::Ipv4Addr;
use std::sync::Arc;

use futures::StreamExt;
use k8s_openapi::api::discovery::v1::EndpointSlice;
use kube::Client;
use kube::runtime::Controller;
use kube::runtime::controller::Config;
use kube::runtime::reflector::{ReflectHandle, Store as KubeStore};
use tokio_util::sync::CancellationToken;
use tracing::info;

use static_egress_crds::v1alpha1::staticegressip::StaticEgressIP;

use crate::dataplane::Programmer;
use crate::kubernetes::NodeRole;
use crate::metrics::ControllerMetrics;
use crate::Result;

pub use context::Context;
pub use controller::DATAPLANE_FINALIZER;

use controller::{egressips_for_slice, error_policy, reconcile};

const WORKER_COUNT: u16 = 2;

/// Runs the per-node reconciliation loop: StaticEgressIP changes and
/// endpoint changes for any referenced service collapse onto the same
/// object key, and a small worker pool drains them with per-key
/// serialization.
#[allow(clippy::too_many_arguments)]
pub async fn start_egressip_controller<P>(
    client: Client,
    egressip_store: KubeStore<StaticEgressIP>,
    egressip_stream: ReflectHandle<StaticEgressIP>,
    endpoint_slice_store: KubeStore<EndpointSlice>,
    endpoint_slice_stream: ReflectHandle<EndpointSlice>,
    programmer: P,
    role: NodeRole,
    fallback_gateway_ip: Option<Ipv4Addr>,
    metrics: ControllerMetrics,
    cancel: CancellationToken,
) -> Result<()>
where
    P: Programmer + Send + Sync + 'static,
{
    let context = Arc::new(Context {
        client,
        egressip_store: egressip_store.clone(),
        endpoint_slice_store,
        programmer,
        role,
        fallback_gateway_ip,
        metrics,
        failures: Default::default(),
    });

    let mapper_store = egressip_store.clone();

    info!("starting StaticEgressIP controller in {:?} role", role);
    Controller::for_shared_stream(egressip_stream, egressip_store)
        .with_config(Config::default().concurrency(WORKER_COUNT))
        .graceful_shutdown_on(crate::kubernetes::controllers::shutdown(cancel))
        .watches_shared_stream(endpoint_slice_stream, move |slice| {
            egressips_for_slice(&mapper_store, &slice)
        })
        .run(reconcile, error_policy, context)
        .filter_map(|x| async move { std::result::Result::ok(x) })
        .for_each(|_| futures::future::ready(()))
        .await;
    Ok(())
}
