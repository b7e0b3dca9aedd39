use kube::config::{InferConfigError, KubeConfigOptions, KubeconfigError};
use kube::{Client, Config};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("failed to infer cluster configuration: {0}")]
    InferConfig(#[source] InferConfigError),

    #[error("failed to load kubeconfig context: {0}")]
    Kubeconfig(#[source] KubeconfigError),

    #[error("Kubernetes reported error: {0}")]
    Kube(#[source] kube::Error),
}

/// Builds a cluster client for the given kubeconfig context, falling back to
/// the inferred configuration (current context or in-cluster) when no context
/// is named.
pub async fn new_client(context: Option<&str>) -> Result<Client, Error> {
    let config = match context {
        Some(context) => Config::from_kubeconfig(&KubeConfigOptions {
            context: Some(context.to_owned()),
            ..KubeConfigOptions::default()
        })
        .await
        .map_err(Error::Kubeconfig)?,
        None => Config::infer().await.map_err(Error::InferConfig)?,
    };
    Client::try_from(config).map_err(Error::Kube)
}
