//! Scripted in-memory provider for tests.
//!
//! Behaves like a tiny cluster: apply upserts, delete tolerates absence,
//! power checks state first. Failures are scripted per-operation so flow
//! tests can exercise the retryable/permanent split without a cluster.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::Mutex;

use async_trait::async_trait;
use serde_json::Value;

use shepherd_definitions::{Error as DomainError, PowerAction};

use crate::mapping::ExternalVm;
use crate::{
    Capability, ClusterProbe, ConsoleAccess, Error, InstancetypeOps, MigrateOps, PowerOps,
    PowerOutcome, ProbeReport, Provider, Result, SnapshotOps, VmLifecycle,
};

/// What the next scripted failure should look like.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MockFailure {
    /// Transient transport-style failure; the queue should back off
    Retryable,
    /// Permanent rejection; the ticket should fail without retries
    Permanent,
}

impl MockFailure {
    fn into_error(self) -> Error {
        match self {
            MockFailure::Retryable => Error::Kube(kube::Error::Api(kube::error::ErrorResponse {
                status: "Failure".into(),
                message: "mock transient failure".into(),
                reason: "ServiceUnavailable".into(),
                code: 503,
            })),
            MockFailure::Permanent => Error::Kube(kube::Error::Api(kube::error::ErrorResponse {
                status: "Failure".into(),
                message: "mock admission rejection".into(),
                reason: "Invalid".into(),
                code: 422,
            })),
        }
    }
}

#[derive(Default)]
struct MockState {
    vms: BTreeMap<(String, String), ExternalVm>,
    failures: VecDeque<MockFailure>,
    calls: Vec<String>,
    manifests: Vec<Value>,
    probe: ProbeReport,
}

/// The mock. Not Clone; share via `Arc`.
#[derive(Default)]
pub struct MockProvider {
    state: Mutex<MockState>,
}

impl MockProvider {
    pub fn new() -> Self {
        let mut probe = ProbeReport::default();
        probe.reachable = true;
        probe.crd_installed = true;
        probe.kubevirt_version = Some("1.2.0".into());
        probe.storage_classes = vec!["standard".into()];
        probe.default_storage_class = Some("standard".into());
        MockProvider {
            state: Mutex::new(MockState {
                probe,
                ..MockState::default()
            }),
        }
    }

    /// Queue a failure for the next mutating call.
    pub fn script_failure(&self, failure: MockFailure) {
        self.state.lock().unwrap().failures.push_back(failure);
    }

    /// Operations invoked so far, e.g. `apply prod-shop/shop-api-01`.
    pub fn calls(&self) -> Vec<String> {
        self.state.lock().unwrap().calls.clone()
    }

    /// Every manifest handed to apply, in order.
    pub fn applied_manifests(&self) -> Vec<Value> {
        self.state.lock().unwrap().manifests.clone()
    }

    pub fn vm_count(&self) -> usize {
        self.state.lock().unwrap().vms.len()
    }

    /// Pre-seed a VM so power/delete flows have something to act on.
    pub fn seed_vm(&self, namespace: &str, name: &str, power_state: &str) {
        let mut g = self.state.lock().unwrap();
        g.vms.insert(
            (namespace.to_string(), name.to_string()),
            ExternalVm {
                name: name.into(),
                namespace: namespace.into(),
                uid: format!("mock-uid-{}", name),
                labels: BTreeMap::new(),
                power_state: Some(power_state.into()),
                ready: power_state == "Running",
                created_at: None,
            },
        );
    }

    pub fn set_probe(&self, probe: ProbeReport) {
        self.state.lock().unwrap().probe = probe;
    }

    fn take_failure(&self, call: &str) -> Result<()> {
        let mut g = self.state.lock().unwrap();
        g.calls.push(call.to_string());
        match g.failures.pop_front() {
            Some(f) => Err(f.into_error()),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl VmLifecycle for MockProvider {
    async fn get_vm(&self, namespace: &str, name: &str) -> Result<Option<ExternalVm>> {
        let g = self.state.lock().unwrap();
        Ok(g.vms.get(&(namespace.to_string(), name.to_string())).cloned())
    }

    async fn list_vms(&self, namespace: Option<&str>) -> Result<Vec<ExternalVm>> {
        let g = self.state.lock().unwrap();
        Ok(g.vms
            .values()
            .filter(|vm| namespace.map(|ns| vm.namespace == ns).unwrap_or(true))
            .cloned()
            .collect())
    }

    async fn apply_vm(&self, namespace: &str, name: &str, manifest: &Value) -> Result<ExternalVm> {
        self.take_failure(&format!("apply {}/{}", namespace, name))?;
        let labels: BTreeMap<String, String> = manifest
            .pointer("/metadata/labels")
            .and_then(Value::as_object)
            .map(|m| {
                m.iter()
                    .filter_map(|(k, v)| v.as_str().map(|s| (k.clone(), s.to_string())))
                    .collect()
            })
            .unwrap_or_default();
        let mut g = self.state.lock().unwrap();
        g.manifests.push(manifest.clone());
        let key = (namespace.to_string(), name.to_string());
        // apply converges: a second delivery updates in place, it never
        // creates a sibling
        let vm = g.vms.entry(key).or_insert_with(|| ExternalVm {
            name: name.into(),
            namespace: namespace.into(),
            uid: format!("mock-uid-{}", name),
            labels: BTreeMap::new(),
            power_state: Some("Running".into()),
            ready: true,
            created_at: None,
        });
        vm.labels = labels;
        Ok(vm.clone())
    }

    async fn delete_vm(&self, namespace: &str, name: &str) -> Result<()> {
        self.take_failure(&format!("delete {}/{}", namespace, name))?;
        let mut g = self.state.lock().unwrap();
        g.vms.remove(&(namespace.to_string(), name.to_string()));
        Ok(())
    }
}

#[async_trait]
impl PowerOps for MockProvider {
    async fn power(
        &self,
        namespace: &str,
        name: &str,
        action: PowerAction,
    ) -> Result<PowerOutcome> {
        self.take_failure(&format!("power-{} {}/{}", action, namespace, name))?;
        let mut g = self.state.lock().unwrap();
        let vm = g
            .vms
            .get_mut(&(namespace.to_string(), name.to_string()))
            .ok_or_else(|| {
                Error::Domain(DomainError::NotFound(format!("vm {}/{}", namespace, name)))
            })?;
        let current = vm.power_state.as_deref().unwrap_or("Unknown");
        let (target, outcome) = match action {
            PowerAction::Start if current == "Running" => ("Running", PowerOutcome::AlreadyInState),
            PowerAction::Start => ("Running", PowerOutcome::Changed),
            PowerAction::Stop if current == "Stopped" => ("Stopped", PowerOutcome::AlreadyInState),
            PowerAction::Stop => ("Stopped", PowerOutcome::Changed),
            PowerAction::Restart => ("Running", PowerOutcome::Changed),
        };
        vm.power_state = Some(target.into());
        vm.ready = target == "Running";
        Ok(outcome)
    }

    async fn power_state(&self, namespace: &str, name: &str) -> Result<Option<String>> {
        let g = self.state.lock().unwrap();
        Ok(g.vms
            .get(&(namespace.to_string(), name.to_string()))
            .and_then(|vm| vm.power_state.clone()))
    }
}

#[async_trait]
impl ConsoleAccess for MockProvider {
    async fn vnc_path(&self, namespace: &str, name: &str) -> Result<String> {
        Ok(format!("/mock/vnc/{}/{}", namespace, name))
    }
}

#[async_trait]
impl SnapshotOps for MockProvider {
    async fn snapshot(&self, namespace: &str, name: &str, snapshot_name: &str) -> Result<String> {
        self.take_failure(&format!("snapshot {}/{}", namespace, name))?;
        Ok(snapshot_name.into())
    }
}

#[async_trait]
impl MigrateOps for MockProvider {
    async fn migrate(&self, namespace: &str, name: &str) -> Result<String> {
        self.take_failure(&format!("migrate {}/{}", namespace, name))?;
        Ok(format!("{}-migration", name))
    }
}

#[async_trait]
impl InstancetypeOps for MockProvider {
    async fn list_instancetypes(&self) -> Result<Vec<String>> {
        Ok(vec!["u1.small".into(), "u1.medium".into()])
    }
}

#[async_trait]
impl ClusterProbe for MockProvider {
    async fn probe(&self) -> Result<ProbeReport> {
        Ok(self.state.lock().unwrap().probe.clone())
    }
}

impl Provider for MockProvider {
    fn capabilities(&self) -> BTreeSet<Capability> {
        [
            Capability::Lifecycle,
            Capability::Power,
            Capability::Console,
            Capability::Snapshot,
            Capability::Migrate,
            Capability::Instancetype,
        ]
        .into()
    }

    fn console(&self) -> Option<&dyn ConsoleAccess> {
        Some(self)
    }
    fn snapshots(&self) -> Option<&dyn SnapshotOps> {
        Some(self)
    }
    fn migration(&self) -> Option<&dyn MigrateOps> {
        Some(self)
    }
    fn instancetypes(&self) -> Option<&dyn InstancetypeOps> {
        Some(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn apply_twice_yields_one_vm() {
        let p = MockProvider::new();
        let manifest = json!({"metadata": {"labels": {"shepherd.io/ticket-id": "t-1"}}});
        p.apply_vm("ns", "web-01", &manifest).await.unwrap();
        p.apply_vm("ns", "web-01", &manifest).await.unwrap();
        assert_eq!(p.vm_count(), 1);
        let vm = p.get_vm("ns", "web-01").await.unwrap().unwrap();
        assert_eq!(vm.labels.get("shepherd.io/ticket-id").unwrap(), "t-1");
    }

    #[tokio::test]
    async fn delete_absent_succeeds() {
        let p = MockProvider::new();
        assert!(p.delete_vm("ns", "ghost").await.is_ok());
    }

    #[tokio::test]
    async fn scripted_failure_surfaces_then_clears() {
        let p = MockProvider::new();
        p.script_failure(MockFailure::Retryable);
        let err = p
            .apply_vm("ns", "web-01", &json!({}))
            .await
            .expect_err("first call fails");
        assert!(err.is_retryable());
        assert!(p.apply_vm("ns", "web-01", &json!({})).await.is_ok());
        assert_eq!(p.vm_count(), 1);
    }

    #[tokio::test]
    async fn power_checks_state_first() {
        let p = MockProvider::new();
        p.seed_vm("ns", "db-01", "Running");
        let outcome = p.power("ns", "db-01", PowerAction::Start).await.unwrap();
        assert_eq!(outcome, PowerOutcome::AlreadyInState);
        let outcome = p.power("ns", "db-01", PowerAction::Stop).await.unwrap();
        assert_eq!(outcome, PowerOutcome::Changed);
        assert_eq!(
            p.power_state("ns", "db-01").await.unwrap().as_deref(),
            Some("Stopped")
        );
    }
}
