use thiserror::Error;

pub mod v1alpha1;

use kube::CustomResourceExt;

pub const SERVICE_OWNER_LABEL: &str = "kubernetes.io/service-name";

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("yaml error: {0}")]
    YamlError(#[from] serde_yaml::Error),
}

pub fn crd_gen_staticegressip() -> Result<()> {
    print!(
        "---\n{}",
        serde_yaml::to_string(&v1alpha1::staticegressip::StaticEgressIP::crd())?
    );
    Ok(())
}
