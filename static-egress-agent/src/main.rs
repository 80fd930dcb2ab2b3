use std::sync::Arc;

use clap::Parser;
use k8s_openapi::api::core::v1::Node;
use k8s_openapi::api::discovery::v1::EndpointSlice;
use kube::Api;
use kube::api::ListParams;
use tokio::task::JoinError;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use static_egress_agent::config::{Cli, Commands, ControllerArgs};
use static_egress_agent::dataplane::director::EgressDirector;
use static_egress_agent::dataplane::gateway::EgressGateway;
use static_egress_agent::dataplane::{Programmer, SysCommander};
use static_egress_agent::ha::GatewayElector;
use static_egress_agent::kubernetes::controllers::egressip::start_egressip_controller;
use static_egress_agent::kubernetes::{self, NodeRole};
use static_egress_agent::metrics::Metrics;
use static_egress_agent::{Error, Result, http};
use static_egress_crds::v1alpha1::staticegressip::StaticEgressIP;
use static_egress_k8s_utils::create_store_and_subscriber;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Commands::Controller(args) => {
            setup_subscriber();
            run_controller(args).await?;
            info!("Exiting...");
        }
        Commands::CrdGen => static_egress_crds::crd_gen_staticegressip()?,
    }
    Ok(())
}

async fn run_controller(args: ControllerArgs) -> Result<()> {
    let client = kubernetes::build_client(&args).await?;
    let node = kubernetes::get_node(client.clone(), &args.node_name).await?;
    let node_ip = kubernetes::node_ip(&node)
        .ok_or_else(|| Error::NodeAddressMissing(args.node_name.clone()))?;
    let role = kubernetes::node_role(&node);
    info!(
        "node {} ({}) starting in egress {:?} role",
        args.node_name, node_ip, role
    );

    let fallback_gateway_ip = match role {
        NodeRole::Director => {
            let nodes = Api::<Node>::all(client.clone())
                .list(&ListParams::default())
                .await?
                .items;
            let gateway_ip = kubernetes::lookup_gateway_ip(&nodes);
            if gateway_ip.is_none() {
                warn!("no node is annotated as egress gateway; waiting for the elector");
            }
            gateway_ip
        }
        NodeRole::Gateway => None,
    };

    let metrics = Arc::new(Metrics::default());
    let cancel = tokio_util::sync::CancellationToken::new();

    let (egressip_store, egressip_stream) =
        create_store_and_subscriber(Api::<StaticEgressIP>::all(client.clone())).await?;
    let (endpoint_slice_store, endpoint_slice_stream) =
        create_store_and_subscriber(Api::<EndpointSlice>::all(client.clone())).await?;

    let elector = GatewayElector::new(client.clone(), egressip_store.clone())?;

    let mut metrics_handle = tokio::spawn(http::serve(
        args.metrics_address,
        Arc::new(http::State::new(metrics.clone())),
        cancel.child_token(),
    ));
    let mut elector_handle = tokio::spawn(elector.run(cancel.child_token()));

    let controller_metrics = metrics.controller.clone();
    let mut controller_handle = match role {
        NodeRole::Director => {
            let director = EgressDirector::new(SysCommander::default(), node_ip);
            director.setup().await.map_err(Error::Bootstrap)?;
            tokio::spawn(start_egressip_controller(
                client,
                egressip_store,
                egressip_stream,
                endpoint_slice_store,
                endpoint_slice_stream,
                director,
                role,
                fallback_gateway_ip,
                controller_metrics,
                cancel.child_token(),
            ))
        }
        NodeRole::Gateway => {
            let gateway = EgressGateway::new(SysCommander::default());
            gateway.setup().await.map_err(Error::Bootstrap)?;
            tokio::spawn(start_egressip_controller(
                client,
                egressip_store,
                egressip_stream,
                endpoint_slice_store,
                endpoint_slice_stream,
                gateway,
                role,
                fallback_gateway_ip,
                controller_metrics,
                cancel.child_token(),
            ))
        }
    };

    let mut shutdown_handle = tokio::spawn(async move { shutdown_signal().await });
    // watch for shutdown and errors
    tokio::select! {
        h = &mut metrics_handle => exit("metrics", h),
        h = &mut controller_handle => exit("controller", h),
        h = &mut elector_handle => exit("elector", h),
        _ = &mut shutdown_handle => {
            cancel.cancel();
            let (metrics, controller, elector) =
                tokio::join!(metrics_handle, controller_handle, elector_handle);
            if let Err(m) = metrics {
                error!("metrics exited with error: {}", m.to_string());
            }
            if let Err(c) = controller {
                error!("controller exited with error: {}", c.to_string());
            }
            if let Err(e) = elector {
                error!("elector exited with error: {}", e.to_string());
            }
        },
    };
    Ok(())
}

fn setup_subscriber() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "static_egress_agent=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };
    tokio::select! {
        _ = ctrl_c => {
          info!("captured ctrl_c signal");
        },
        _ = terminate => {},
    }
}

fn exit(task: &str, out: Result<Result<()>, JoinError>) {
    match out {
        Ok(Ok(_)) => {
            info!("{task} exited")
        }
        Ok(Err(e)) => {
            error!("{task} failed with error: {e}")
        }
        Err(e) => {
            error!("{task} task failed to complete: {e}")
        }
    }
}
