//! Cluster-facing side of the control plane.
//!
//! The provider is a family of narrow capability traits; a realization is
//! whatever subset of them it satisfies. Callers depend on the narrowest
//! trait that covers their need, and discover optional capabilities at
//! runtime instead of downcasting.

use std::collections::BTreeSet;
use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error as ThisError;

use shepherd_definitions::PowerAction;

/// KubeVirt CRD subsets used on the wire
pub mod types;

/// Anti-corruption mapping from external objects to domain views
pub mod mapping;
pub use mapping::ExternalVm;

/// Client construction from sealed kubeconfigs
pub mod client;

/// Circuit breaker guarding each cluster connection
pub mod breaker;
pub use breaker::CircuitBreaker;

/// Read-mostly per-cluster resource cache
pub mod cache;
pub use cache::{CacheStatus, ClusterCache};

/// The list-watch loop feeding the cache
pub mod watcher;

/// Real KubeVirt-backed provider
pub mod kubevirt;
pub use kubevirt::KubeVirtProvider;

/// Scripted in-memory provider for tests
pub mod mock;
pub use mock::MockProvider;

pub type Result<T> = std::result::Result<T, Error>;

/// Provider-layer errors.
///
/// Kube transport errors are classified here once so the dispatcher only
/// has to ask `is_retryable`.
#[derive(Debug, ThisError)]
pub enum Error {
    #[error(transparent)]
    Domain(#[from] shepherd_definitions::Error),

    #[error("kubernetes api error: {0}")]
    Kube(#[source] kube::Error),

    #[error("cluster '{0}' circuit open")]
    CircuitOpen(String),

    #[error("capability '{0}' not supported by this cluster")]
    Unsupported(Capability),
}

impl From<kube::Error> for Error {
    fn from(e: kube::Error) -> Self {
        Error::Kube(e)
    }
}

impl Error {
    /// Whether the queue should retry with backoff, as opposed to failing
    /// the ticket permanently.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Kube(kube::Error::Api(resp)) => {
                matches!(resp.code, 408 | 429 | 500 | 502 | 503 | 504)
            }
            // transport level problems are always worth another attempt
            Error::Kube(_) => true,
            Error::CircuitOpen(_) => true,
            Error::Domain(shepherd_definitions::Error::ServiceUnavailable(_)) => true,
            Error::Domain(_) => false,
            Error::Unsupported(_) => false,
        }
    }

    /// HTTP-ish status of the underlying kube response, if any
    pub fn api_code(&self) -> Option<u16> {
        match self {
            Error::Kube(kube::Error::Api(resp)) => Some(resp.code),
            _ => None,
        }
    }
}

/// Optional capabilities a provider may declare beyond base lifecycle.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum Capability {
    Lifecycle,
    Power,
    Console,
    Snapshot,
    Migrate,
    Instancetype,
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Capability::Lifecycle => "lifecycle",
            Capability::Power => "power",
            Capability::Console => "console",
            Capability::Snapshot => "snapshot",
            Capability::Migrate => "migrate",
            Capability::Instancetype => "instancetype",
        };
        f.write_str(s)
    }
}

/// Outcome of a power operation; current state is always checked first so
/// a repeat delivery is a no-op rather than a duplicate side effect.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
pub enum PowerOutcome {
    Changed,
    AlreadyInState,
}

/// Report produced by a cluster probe sweep.
#[derive(Serialize, Deserialize, Clone, Debug, Default)]
pub struct ProbeReport {
    pub reachable: bool,
    pub crd_installed: bool,
    pub kubevirt_version: Option<String>,
    pub feature_gates: Vec<String>,
    pub storage_classes: Vec<String>,
    pub default_storage_class: Option<String>,
}

/// Base lifecycle every provider must satisfy.
///
/// `apply_vm` is idempotent by contract: server-side apply with a fixed
/// field owner and forced ownership, so re-delivery converges instead of
/// conflicting. `delete_vm` treats an absent resource as success.
#[async_trait]
pub trait VmLifecycle: Send + Sync {
    async fn get_vm(&self, namespace: &str, name: &str) -> Result<Option<ExternalVm>>;
    async fn list_vms(&self, namespace: Option<&str>) -> Result<Vec<ExternalVm>>;
    async fn apply_vm(&self, namespace: &str, name: &str, manifest: &Value) -> Result<ExternalVm>;
    async fn delete_vm(&self, namespace: &str, name: &str) -> Result<()>;
}

/// Start/stop/restart with read-before-write semantics.
#[async_trait]
pub trait PowerOps: Send + Sync {
    async fn power(&self, namespace: &str, name: &str, action: PowerAction)
        -> Result<PowerOutcome>;
    async fn power_state(&self, namespace: &str, name: &str) -> Result<Option<String>>;
}

/// VNC / serial console access.
#[async_trait]
pub trait ConsoleAccess: Send + Sync {
    /// Returns the cluster-relative subresource path a stream proxy dials
    async fn vnc_path(&self, namespace: &str, name: &str) -> Result<String>;
}

/// Point-in-time snapshots.
#[async_trait]
pub trait SnapshotOps: Send + Sync {
    async fn snapshot(&self, namespace: &str, name: &str, snapshot_name: &str) -> Result<String>;
}

/// Live migration between nodes.
#[async_trait]
pub trait MigrateOps: Send + Sync {
    async fn migrate(&self, namespace: &str, name: &str) -> Result<String>;
}

/// Cluster-side instancetype catalogue.
#[async_trait]
pub trait InstancetypeOps: Send + Sync {
    async fn list_instancetypes(&self) -> Result<Vec<String>>;
}

/// Health and capability probing used by the detector loop.
#[async_trait]
pub trait ClusterProbe: Send + Sync {
    async fn probe(&self) -> Result<ProbeReport>;
}

/// A full provider: base lifecycle + power, plus discoverable extras.
///
/// The accessor methods return `None` when the capability is absent, so
/// callers branch without downcasting.
pub trait Provider: VmLifecycle + PowerOps + ClusterProbe {
    fn capabilities(&self) -> BTreeSet<Capability>;

    fn console(&self) -> Option<&dyn ConsoleAccess> {
        None
    }
    fn snapshots(&self) -> Option<&dyn SnapshotOps> {
        None
    }
    fn migration(&self) -> Option<&dyn MigrateOps> {
        None
    }
    fn instancetypes(&self) -> Option<&dyn InstancetypeOps> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kube_error_classification() {
        let not_found = kube::Error::Api(kube::error::ErrorResponse {
            status: "Failure".into(),
            message: "not found".into(),
            reason: "NotFound".into(),
            code: 404,
        });
        assert!(!Error::from(not_found).is_retryable());

        let unavailable = kube::Error::Api(kube::error::ErrorResponse {
            status: "Failure".into(),
            message: "etcd leader changed".into(),
            reason: "ServiceUnavailable".into(),
            code: 503,
        });
        assert!(Error::from(unavailable).is_retryable());

        let forbidden = kube::Error::Api(kube::error::ErrorResponse {
            status: "Failure".into(),
            message: "rbac".into(),
            reason: "Forbidden".into(),
            code: 403,
        });
        assert!(!Error::from(forbidden).is_retryable());
    }
}
