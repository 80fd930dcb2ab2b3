use std::net::SocketAddr;
use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Debug, Parser)]
#[command(version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Clone, Subcommand, Debug)]
pub enum Commands {
    /// Run the per-node egress controller
    Controller(ControllerArgs),

    /// Print the StaticEgressIP CRD manifest
    CrdGen,
}

#[derive(Parser, Debug, Clone)]
pub struct ControllerArgs {
    /// Address of the Kubernetes API server; overrides any value in the
    /// kubeconfig and is only required out-of-cluster
    #[arg(long)]
    pub master: Option<String>,

    /// Path to a kubeconfig; only required out-of-cluster
    #[arg(long, env = "KUBECONFIG")]
    pub kubeconfig: Option<PathBuf>,

    /// Name of the node the agent is running on
    #[arg(long, env = "NODE_NAME")]
    pub node_name: String,

    /// Metrics listener for the agent
    #[arg(long, default_value = "0.0.0.0:9090")]
    pub metrics_address: SocketAddr,
}
