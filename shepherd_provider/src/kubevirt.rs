//! The real KubeVirt-backed provider.
//!
//! All mutations are idempotent: apply is server-side apply under the
//! fixed field owner `shepherd` with forced ownership, delete treats an
//! absent object as success, and power operations read the current state
//! before writing. A redelivered job therefore converges instead of
//! duplicating side effects.

use std::collections::BTreeSet;

use async_trait::async_trait;
use k8s_openapi::api::storage::v1::StorageClass;
use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use kube::api::{Api, ApiResource, DeleteParams, DynamicObject, ListParams, Patch, PatchParams, PostParams};
use kube::core::GroupVersionKind;
use kube::{Client, ResourceExt};
use log::{debug, info};
use serde_json::{json, Value};

use shepherd_definitions::{Error as DomainError, PowerAction};

use crate::mapping::{map_vm, ExternalVm};
use crate::types::{
    KubeVirt, SnapshotSource, VirtualMachine, VirtualMachineInstance,
    VirtualMachineInstanceMigration, VirtualMachineInstanceMigrationSpec, VirtualMachineSnapshot,
    VirtualMachineSnapshotSpec, VM_CRD_NAME,
};
use crate::{
    Capability, ClusterProbe, ConsoleAccess, Error, InstancetypeOps, MigrateOps, PowerOps,
    PowerOutcome, ProbeReport, Provider, Result, SnapshotOps, VmLifecycle,
};

/// Field owner for server-side apply; a constant so ownership never forks
const FIELD_OWNER: &str = "shepherd";

/// Printable statuses that count as "running" for power idempotency checks
const RUNNING_STATES: [&str; 2] = ["Running", "Starting"];
const STOPPED_STATES: [&str; 3] = ["Stopped", "Halted", "Terminating"];

pub struct KubeVirtProvider {
    client: Client,
    cluster: String,
    capabilities: BTreeSet<Capability>,
}

impl KubeVirtProvider {
    /// Build a provider for one cluster. Optional capabilities are derived
    /// from the feature set the detector recorded for it.
    pub fn new(client: Client, cluster: impl Into<String>, features: &BTreeSet<String>) -> Self {
        let mut capabilities: BTreeSet<Capability> =
            [Capability::Lifecycle, Capability::Power, Capability::Console].into();
        if features.contains("snapshot") {
            capabilities.insert(Capability::Snapshot);
        }
        if features.contains("migration") {
            capabilities.insert(Capability::Migrate);
        }
        if features.contains("instancetype") {
            capabilities.insert(Capability::Instancetype);
        }
        KubeVirtProvider {
            client,
            cluster: cluster.into(),
            capabilities,
        }
    }

    fn vms(&self, namespace: &str) -> Api<VirtualMachine> {
        Api::namespaced(self.client.clone(), namespace)
    }

    fn vmis(&self, namespace: &str) -> Api<VirtualMachineInstance> {
        Api::namespaced(self.client.clone(), namespace)
    }

    async fn current_state(&self, namespace: &str, name: &str) -> Result<(VirtualMachine, String)> {
        let vm = self
            .vms(namespace)
            .get_opt(name)
            .await?
            .ok_or_else(|| Error::Domain(DomainError::NotFound(format!("vm {}/{}", namespace, name))))?;
        let state = vm
            .status
            .as_ref()
            .and_then(|s| s.printable_status.clone())
            .unwrap_or_else(|| "Unknown".into());
        Ok((vm, state))
    }

    async fn set_run_strategy(&self, namespace: &str, name: &str, strategy: &str) -> Result<()> {
        // merge patch clears the legacy `running` field so the two power
        // knobs never conflict
        let patch = json!({"spec": {"runStrategy": strategy, "running": null}});
        self.vms(namespace)
            .patch(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }
}

#[async_trait]
impl VmLifecycle for KubeVirtProvider {
    async fn get_vm(&self, namespace: &str, name: &str) -> Result<Option<ExternalVm>> {
        match self.vms(namespace).get_opt(name).await? {
            Some(vm) => Ok(Some(map_vm(&vm)?)),
            None => Ok(None),
        }
    }

    async fn list_vms(&self, namespace: Option<&str>) -> Result<Vec<ExternalVm>> {
        let api: Api<VirtualMachine> = match namespace {
            Some(ns) => Api::namespaced(self.client.clone(), ns),
            None => Api::all(self.client.clone()),
        };
        let list = api.list(&ListParams::default()).await?;
        let mut out = Vec::with_capacity(list.items.len());
        for vm in &list.items {
            out.push(map_vm(vm)?);
        }
        Ok(out)
    }

    async fn apply_vm(&self, namespace: &str, name: &str, manifest: &Value) -> Result<ExternalVm> {
        let pp = PatchParams::apply(FIELD_OWNER).force();
        let applied = self
            .vms(namespace)
            .patch(name, &pp, &Patch::Apply(manifest))
            .await?;
        debug!("applied vm {}/{} on {}", namespace, name, self.cluster);
        map_vm(&applied)
    }

    async fn delete_vm(&self, namespace: &str, name: &str) -> Result<()> {
        match self.vms(namespace).delete(name, &DeleteParams::default()).await {
            Ok(_) => Ok(()),
            // deleting what is already gone is success, not an error
            Err(kube::Error::Api(resp)) if resp.code == 404 => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[async_trait]
impl PowerOps for KubeVirtProvider {
    async fn power(
        &self,
        namespace: &str,
        name: &str,
        action: PowerAction,
    ) -> Result<PowerOutcome> {
        let (_vm, state) = self.current_state(namespace, name).await?;
        match action {
            PowerAction::Start => {
                if RUNNING_STATES.contains(&state.as_str()) {
                    return Ok(PowerOutcome::AlreadyInState);
                }
                self.set_run_strategy(namespace, name, "Always").await?;
                Ok(PowerOutcome::Changed)
            }
            PowerAction::Stop => {
                if STOPPED_STATES.contains(&state.as_str()) {
                    return Ok(PowerOutcome::AlreadyInState);
                }
                self.set_run_strategy(namespace, name, "Halted").await?;
                Ok(PowerOutcome::Changed)
            }
            PowerAction::Restart => {
                // ensure the controller will recreate, then drop the live
                // instance; absent VMI means the machine was off anyway
                self.set_run_strategy(namespace, name, "Always").await?;
                match self.vmis(namespace).delete(name, &DeleteParams::default()).await {
                    Ok(_) => Ok(PowerOutcome::Changed),
                    Err(kube::Error::Api(resp)) if resp.code == 404 => Ok(PowerOutcome::Changed),
                    Err(e) => Err(e.into()),
                }
            }
        }
    }

    async fn power_state(&self, namespace: &str, name: &str) -> Result<Option<String>> {
        match self.vms(namespace).get_opt(name).await? {
            Some(vm) => Ok(vm.status.and_then(|s| s.printable_status)),
            None => Ok(None),
        }
    }
}

#[async_trait]
impl ConsoleAccess for KubeVirtProvider {
    async fn vnc_path(&self, namespace: &str, name: &str) -> Result<String> {
        // confirm the instance is live before handing out a path
        let vmi = self.vmis(namespace).get_opt(name).await?;
        if vmi.is_none() {
            return Err(Error::Domain(DomainError::PreconditionFailed(format!(
                "vm {}/{} has no running instance",
                namespace, name
            ))));
        }
        Ok(format!(
            "/apis/subresources.kubevirt.io/v1/namespaces/{}/virtualmachineinstances/{}/vnc",
            namespace, name
        ))
    }
}

#[async_trait]
impl SnapshotOps for KubeVirtProvider {
    async fn snapshot(&self, namespace: &str, name: &str, snapshot_name: &str) -> Result<String> {
        let api: Api<VirtualMachineSnapshot> = Api::namespaced(self.client.clone(), namespace);
        let mut snap = VirtualMachineSnapshot::new(
            snapshot_name,
            VirtualMachineSnapshotSpec {
                source: SnapshotSource {
                    api_group: Some("kubevirt.io".into()),
                    kind: "VirtualMachine".into(),
                    name: name.into(),
                },
            },
        );
        snap.metadata.namespace = Some(namespace.into());
        match api.create(&PostParams::default(), &snap).await {
            Ok(created) => Ok(created.name_any()),
            // an existing snapshot under the requested name is the job
            // re-delivering; report the prior result
            Err(kube::Error::Api(resp)) if resp.code == 409 => Ok(snapshot_name.into()),
            Err(e) => Err(e.into()),
        }
    }
}

#[async_trait]
impl MigrateOps for KubeVirtProvider {
    async fn migrate(&self, namespace: &str, name: &str) -> Result<String> {
        let api: Api<VirtualMachineInstanceMigration> =
            Api::namespaced(self.client.clone(), namespace);
        let mig_name = format!("{}-migration", name);
        let mut mig = VirtualMachineInstanceMigration::new(
            &mig_name,
            VirtualMachineInstanceMigrationSpec {
                vmi_name: name.into(),
            },
        );
        mig.metadata.namespace = Some(namespace.into());
        match api.create(&PostParams::default(), &mig).await {
            Ok(created) => Ok(created.name_any()),
            Err(kube::Error::Api(resp)) if resp.code == 409 => Ok(mig_name),
            Err(e) => Err(e.into()),
        }
    }
}

#[async_trait]
impl InstancetypeOps for KubeVirtProvider {
    async fn list_instancetypes(&self) -> Result<Vec<String>> {
        let gvk = GroupVersionKind::gvk(
            "instancetype.kubevirt.io",
            "v1beta1",
            "VirtualMachineClusterInstancetype",
        );
        let ar = ApiResource::from_gvk(&gvk);
        let api: Api<DynamicObject> = Api::all_with(self.client.clone(), &ar);
        let list = api.list(&ListParams::default()).await?;
        Ok(list.items.iter().map(|o| o.name_any()).collect())
    }
}

#[async_trait]
impl ClusterProbe for KubeVirtProvider {
    async fn probe(&self) -> Result<ProbeReport> {
        let mut report = ProbeReport::default();

        // reachability is the gate for everything else
        if self.client.apiserver_version().await.is_err() {
            return Ok(report);
        }
        report.reachable = true;

        let crds: Api<CustomResourceDefinition> = Api::all(self.client.clone());
        report.crd_installed = crds.get_opt(VM_CRD_NAME).await?.is_some();
        if !report.crd_installed {
            return Ok(report);
        }

        // the platform CR carries observed version and explicit gates
        let kv: Api<KubeVirt> = Api::all(self.client.clone());
        if let Some(cr) = kv.list(&ListParams::default()).await?.items.into_iter().next() {
            report.kubevirt_version = cr
                .status
                .as_ref()
                .and_then(|s| s.observed_kube_virt_version.clone());
            report.feature_gates = cr
                .spec
                .configuration
                .as_ref()
                .and_then(|c| c.developer_configuration.as_ref())
                .map(|d| d.feature_gates.clone())
                .unwrap_or_default();
        }

        let scs: Api<StorageClass> = Api::all(self.client.clone());
        let classes = scs.list(&ListParams::default()).await?;
        for sc in &classes.items {
            let name = sc.name_any();
            let is_default = sc
                .metadata
                .annotations
                .as_ref()
                .and_then(|a| a.get("storageclass.kubernetes.io/is-default-class"))
                .map(|v| v == "true")
                .unwrap_or(false);
            if is_default {
                report.default_storage_class = Some(name.clone());
            }
            report.storage_classes.push(name);
        }
        info!(
            "probed cluster {}: kubevirt={:?} storage_classes={}",
            self.cluster,
            report.kubevirt_version,
            report.storage_classes.len()
        );
        Ok(report)
    }
}

impl Provider for KubeVirtProvider {
    fn capabilities(&self) -> BTreeSet<Capability> {
        self.capabilities.clone()
    }

    fn console(&self) -> Option<&dyn ConsoleAccess> {
        Some(self)
    }

    fn snapshots(&self) -> Option<&dyn SnapshotOps> {
        self.capabilities
            .contains(&Capability::Snapshot)
            .then_some(self as &dyn SnapshotOps)
    }

    fn migration(&self) -> Option<&dyn MigrateOps> {
        self.capabilities
            .contains(&Capability::Migrate)
            .then_some(self as &dyn MigrateOps)
    }

    fn instancetypes(&self) -> Option<&dyn InstancetypeOps> {
        self.capabilities
            .contains(&Capability::Instancetype)
            .then_some(self as &dyn InstancetypeOps)
    }
}
