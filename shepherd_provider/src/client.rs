//! kube client construction.
//!
//! Cluster rows store kubeconfigs sealed with AES-GCM; the plaintext only
//! exists here while a client is being built.

use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::{Client, Config};

use shepherd_definitions::Error as DomainError;

use crate::{Error, Result};

/// Build a client from a kubeconfig document (already decrypted).
pub async fn from_kubeconfig_yaml(yaml: &str) -> Result<Client> {
    let kubeconfig: Kubeconfig = serde_yaml::from_str(yaml)
        .map_err(|e| Error::Domain(DomainError::Validation(format!("invalid kubeconfig: {}", e))))?;
    let config = Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
        .await
        .map_err(|e| {
            Error::Domain(DomainError::Validation(format!("unusable kubeconfig: {}", e)))
        })?;
    Client::try_from(config).map_err(Error::from)
}

/// In-cluster or local fallback, used by development setups where the
/// shepherd itself runs next to the only cluster it manages.
pub async fn infer() -> Result<Client> {
    Client::try_default().await.map_err(Error::from)
}
