use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;

use k8s_openapi::api::discovery::v1::EndpointSlice;
use kube::runtime::controller::Action;
use kube::runtime::finalizer::{Event, finalizer};
use kube::runtime::reflector::{ObjectRef, Store};
use kube::{Api, ResourceExt};
use tracing::{error, info};

use static_egress_crds::SERVICE_OWNER_LABEL;
use static_egress_crds::v1alpha1::staticegressip::{
    EgressRule, StaticEgressIP, pod_ips_for_service, rule_id,
};

use crate::dataplane::{DataplaneError, Programmer};
use crate::kubernetes::NodeRole;
use crate::kubernetes::controllers::egressip::context::Context;
use crate::{Error, Result};

pub const DATAPLANE_FINALIZER: &str = "egressip.nirmata.io/dataplane";

const AWAIT_GATEWAY_REQUEUE: Duration = Duration::from_secs(10);
const BASE_BACKOFF_SECS: u64 = 1;
const MAX_BACKOFF_SECS: u64 = 300;

#[tracing::instrument(skip(ctx, egress))]
pub(crate) async fn reconcile<P>(
    egress: Arc<StaticEgressIP>,
    ctx: Arc<Context<P>>,
) -> Result<Action>
where
    P: Programmer + Send + Sync + 'static,
{
    let _timer = ctx.metrics.count_and_measure(egress.as_ref());
    let ns = egress
        .namespace()
        .ok_or(Error::MissingObjectKey("namespace"))?;
    let key = format!("{}/{}", ns, egress.name_any());

    let api: Api<StaticEgressIP> = Api::namespaced(ctx.client.clone(), &ns);
    let action = finalizer(&api, DATAPLANE_FINALIZER, egress, |event| async {
        match event {
            Event::Apply(egress) => apply(egress, &ctx).await,
            Event::Cleanup(egress) => cleanup(egress, &ctx).await,
        }
    })
    .await?;

    ctx.failures.remove(&key);
    Ok(action)
}

pub(crate) async fn apply<P>(egress: Arc<StaticEgressIP>, ctx: &Context<P>) -> Result<Action>
where
    P: Programmer + Send + Sync,
{
    let ns = egress
        .namespace()
        .ok_or(Error::MissingObjectKey("namespace"))?;
    let name = egress.name_any();
    info!("started reconciling StaticEgressIP {}/{}", ns, name);

    let mut awaiting_gateway = false;
    for (index, rule) in egress.spec.rules.iter().enumerate() {
        let id = rule_id(&ns, &name, index);
        let source_ips = pod_ips_for_service(&ctx.endpoint_slice_store, &ns, &rule.service_name);

        let target = match rule_target(&egress, rule, ctx) {
            Target::Address(ip) => ip,
            Target::AwaitGateway => {
                info!("no gateway published yet for {}/{}; waiting", ns, name);
                awaiting_gateway = true;
                continue;
            }
            Target::InvalidSpec(msg) => {
                error!("rule {} of {}/{} dropped: {}", index, ns, name, msg);
                continue;
            }
        };

        match ctx
            .programmer
            .program(&id, &source_ips, &rule.cidr, target)
            .await
        {
            Ok(()) => {}
            Err(e @ DataplaneError::Denied(_)) => {
                error!(
                    "dataplane denied programming rule {} of {}/{}: {}; manual intervention required",
                    index, ns, name, e
                );
            }
            Err(DataplaneError::Invalid(msg)) => {
                error!(
                    "rule {} of {}/{} permanently rejected by the dataplane: {}",
                    index, ns, name, msg
                );
            }
            Err(e) => return Err(e.into()),
        }
    }

    ctx.programmer
        .sweep(&live_destinations(&ctx.egressip_store))
        .await?;

    if awaiting_gateway {
        return Ok(Action::requeue(AWAIT_GATEWAY_REQUEUE));
    }
    Ok(Action::await_change())
}

pub(crate) async fn cleanup<P>(egress: Arc<StaticEgressIP>, ctx: &Context<P>) -> Result<Action>
where
    P: Programmer + Send + Sync,
{
    let ns = egress
        .namespace()
        .ok_or(Error::MissingObjectKey("namespace"))?;
    let name = egress.name_any();
    info!("tearing down StaticEgressIP {}/{}", ns, name);

    for (index, rule) in egress.spec.rules.iter().enumerate() {
        let id = rule_id(&ns, &name, index);
        let target = match ctx.role {
            NodeRole::Gateway => rule.egress_ip.parse().ok(),
            NodeRole::Director => egress.gateway_ip().or(ctx.fallback_gateway_ip),
        };
        match ctx.programmer.unprogram(&id, &rule.cidr, target).await {
            Ok(()) => {}
            Err(e @ DataplaneError::Denied(_)) => {
                error!(
                    "dataplane denied removing rule {} of {}/{}: {}; manual intervention required",
                    index, ns, name, e
                );
            }
            Err(DataplaneError::Invalid(msg)) => {
                error!(
                    "leaving rule {} of {}/{} behind: {}",
                    index, ns, name, msg
                );
            }
            Err(e) => return Err(e.into()),
        }
    }

    Ok(Action::await_change())
}

pub(crate) fn error_policy<P>(
    egress: Arc<StaticEgressIP>,
    error: &Error,
    ctx: Arc<Context<P>>,
) -> Action
where
    P: Programmer + Send + Sync,
{
    ctx.metrics.count_failure(egress.as_ref(), error);
    let key = format!(
        "{}/{}",
        egress.namespace().unwrap_or_default(),
        egress.name_any()
    );
    let attempts = {
        let mut entry = ctx.failures.entry(key).or_insert(0);
        *entry += 1;
        *entry
    };
    let exponent = attempts.saturating_sub(1).min(16);
    let secs = (BASE_BACKOFF_SECS << exponent).min(MAX_BACKOFF_SECS);
    error!(
        ?error,
        "reconcile error for StaticEgressIP {}; retrying in {}s", attempts, secs
    );
    Action::requeue(Duration::from_secs(secs))
}

enum Target {
    Address(Ipv4Addr),
    AwaitGateway,
    InvalidSpec(String),
}

// The programmed target is the gateway address on a director and the
// declared egress IP on the gateway.
fn rule_target<P: Programmer>(
    egress: &StaticEgressIP,
    rule: &EgressRule,
    ctx: &Context<P>,
) -> Target {
    match ctx.role {
        NodeRole::Gateway => match rule.egress_ip.parse() {
            Ok(ip) => Target::Address(ip),
            Err(_) => Target::InvalidSpec(format!(
                "egress IP {} is not an IPv4 address",
                rule.egress_ip
            )),
        },
        NodeRole::Director => match egress.gateway_ip().or(ctx.fallback_gateway_ip) {
            Some(ip) => Target::Address(ip),
            None => Target::AwaitGateway,
        },
    }
}

/// Destinations still declared by any resource; everything else in the
/// custom routing table is stale.
pub(crate) fn live_destinations(store: &Store<StaticEgressIP>) -> Vec<String> {
    let mut destinations = Vec::new();
    for egress in store.state() {
        for rule in &egress.spec.rules {
            if !destinations.contains(&rule.cidr) {
                destinations.push(rule.cidr.clone());
            }
        }
    }
    destinations
}

/// Maps an endpoint-slice event onto every StaticEgressIP in the same
/// namespace whose rules reference the slice's owning service.
pub(crate) fn egressips_for_slice(
    store: &Store<StaticEgressIP>,
    slice: &EndpointSlice,
) -> Vec<ObjectRef<StaticEgressIP>> {
    let Some(ns) = slice.namespace() else {
        return Vec::new();
    };
    let Some(service) = slice.labels().get(SERVICE_OWNER_LABEL) else {
        return Vec::new();
    };
    store
        .state()
        .iter()
        .filter(|egress| {
            egress.namespace().as_deref() == Some(ns.as_str())
                && egress.references_service(service)
        })
        .map(|egress| ObjectRef::new(&egress.name_any()).within(&ns))
        .collect()
}
