pub mod config;
pub mod dataplane;
pub mod ha;
pub mod http;
pub mod kubernetes;
pub mod metrics;

use thiserror::Error;

use crate::dataplane::DataplaneError;

#[derive(Error, Debug)]
pub enum Error {
    #[error("io error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("kube error: {0}")]
    KubeError(#[from] kube::Error),

    #[error("kubeconfig error: {0}")]
    KubeconfigError(#[from] kube::config::KubeconfigError),

    #[error("kube config inference error: {0}")]
    InferConfigError(#[from] kube::config::InferConfigError),

    #[error("invalid API server address: {0}")]
    InvalidApiServerAddress(#[from] ::http::uri::InvalidUri),

    #[error("failed to create store: {0}")]
    StoreCreation(String),

    #[error("invalid configuration: {0}")]
    ConfigInvalid(String),

    #[error("node {0} not found in the cluster")]
    NodeNotFound(String),

    #[error("node {0} has no usable IPv4 address")]
    NodeAddressMissing(String),

    #[error("one-time dataplane setup failed: {0}")]
    Bootstrap(#[source] DataplaneError),

    #[error("dataplane error: {0}")]
    Dataplane(#[from] DataplaneError),

    #[error("missing object metadata: {0}")]
    MissingObjectKey(&'static str),

    #[error("finalizer error: {0}")]
    Finalizer(#[source] Box<kube::runtime::finalizer::Error<Error>>),

    #[error("crd generation error: {0}")]
    CrdGen(#[from] static_egress_crds::Error),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

impl From<static_egress_k8s_utils::Error> for Error {
    fn from(err: static_egress_k8s_utils::Error) -> Self {
        match err {
            static_egress_k8s_utils::Error::StoreCreation(msg) => Self::StoreCreation(msg),
            static_egress_k8s_utils::Error::KubeError(e) => Self::KubeError(e),
        }
    }
}

impl From<kube::runtime::finalizer::Error<Error>> for Error {
    fn from(err: kube::runtime::finalizer::Error<Error>) -> Self {
        Self::Finalizer(Box::new(err))
    }
}

impl Error {
    /// Stable label used on the failure counter.
    pub fn metric_label(&self) -> String {
        match self {
            Self::ConfigInvalid(_) => "config-invalid",
            Self::KubeError(_) | Self::StoreCreation(_) => "api-unreachable",
            Self::NodeNotFound(_) | Self::MissingObjectKey(_) => "object-missing",
            Self::Bootstrap(_) => "bootstrap-failed",
            Self::Dataplane(DataplaneError::Busy(_)) => "dataplane-busy",
            Self::Dataplane(DataplaneError::Denied(_)) => "dataplane-denied",
            Self::Dataplane(DataplaneError::Invalid(_)) => "dataplane-invalid",
            Self::Dataplane(DataplaneError::Io(_)) => "dataplane-io",
            Self::Finalizer(_) => "finalizer",
            _ => "internal",
        }
        .into()
    }
}
