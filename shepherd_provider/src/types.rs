//! Minimal KubeVirt CRD subsets.
//!
//! Only the fields the control plane reads or writes are modelled; the
//! rest of the document rides along as raw JSON so server-side apply can
//! still submit whatever the template produced.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// kubevirt.io/v1 VirtualMachine, spec subset.
#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, Default, JsonSchema)]
#[kube(
    group = "kubevirt.io",
    version = "v1",
    kind = "VirtualMachine",
    namespaced,
    status = "VirtualMachineStatus",
    plural = "virtualmachines",
    shortname = "vm"
)]
#[serde(rename_all = "camelCase")]
pub struct VirtualMachineSpec {
    /// Declarative power intent; mutually exclusive with `running`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_strategy: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub running: Option<bool>,
    /// Pod-style template the VM boots from; opaque to shepherd
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instancetype: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preference: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_volume_templates: Option<Value>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct VirtualMachineStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub printable_status: Option<String>,
    #[serde(default)]
    pub created: bool,
    #[serde(default)]
    pub ready: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Value>,
}

/// kubevirt.io/v1 VirtualMachineInstance, read-only subset used for node
/// placement and console routing.
#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, Default, JsonSchema)]
#[kube(
    group = "kubevirt.io",
    version = "v1",
    kind = "VirtualMachineInstance",
    namespaced,
    status = "VirtualMachineInstanceStatus",
    plural = "virtualmachineinstances",
    shortname = "vmi"
)]
#[serde(rename_all = "camelCase")]
pub struct VirtualMachineInstanceSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub domain: Option<Value>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct VirtualMachineInstanceStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_name: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub interfaces: Vec<VmiInterface>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct VmiInterface {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip_address: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

/// snapshot.kubevirt.io/v1beta1 VirtualMachineSnapshot, create-only subset.
#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, Default, JsonSchema)]
#[kube(
    group = "snapshot.kubevirt.io",
    version = "v1beta1",
    kind = "VirtualMachineSnapshot",
    namespaced,
    plural = "virtualmachinesnapshots"
)]
#[serde(rename_all = "camelCase")]
pub struct VirtualMachineSnapshotSpec {
    pub source: SnapshotSource,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotSource {
    pub api_group: Option<String>,
    pub kind: String,
    pub name: String,
}

/// kubevirt.io/v1 VirtualMachineInstanceMigration, create-only subset.
#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, Default, JsonSchema)]
#[kube(
    group = "kubevirt.io",
    version = "v1",
    kind = "VirtualMachineInstanceMigration",
    namespaced,
    plural = "virtualmachineinstancemigrations"
)]
#[serde(rename_all = "camelCase")]
pub struct VirtualMachineInstanceMigrationSpec {
    pub vmi_name: String,
}

/// kubevirt.io/v1 KubeVirt platform CR, read-only subset the detector uses
/// for version and feature-gate discovery.
#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, Default, JsonSchema)]
#[kube(
    group = "kubevirt.io",
    version = "v1",
    kind = "KubeVirt",
    namespaced,
    status = "KubeVirtCrStatus",
    plural = "kubevirts"
)]
#[serde(rename_all = "camelCase")]
pub struct KubeVirtSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub configuration: Option<KubeVirtConfiguration>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct KubeVirtConfiguration {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub developer_configuration: Option<DeveloperConfiguration>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct DeveloperConfiguration {
    #[serde(default)]
    pub feature_gates: Vec<String>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct KubeVirtCrStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_kube_virt_version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<String>,
}

/// The fully-qualified CRD name whose presence means KubeVirt is installed
pub const VM_CRD_NAME: &str = "virtualmachines.kubevirt.io";

/// Build a VirtualMachine document for server-side apply from an opaque
/// manifest blob plus the ownership labels shepherd stamps on everything.
pub fn vm_apply_document(
    namespace: &str,
    name: &str,
    manifest: &Value,
    labels: &BTreeMap<String, String>,
) -> Value {
    let mut doc = manifest.clone();
    if !doc.is_object() {
        doc = serde_json::json!({});
    }
    let obj = doc.as_object_mut().unwrap();
    obj.insert("apiVersion".into(), "kubevirt.io/v1".into());
    obj.insert("kind".into(), "VirtualMachine".into());
    let metadata = obj
        .entry("metadata")
        .or_insert_with(|| serde_json::json!({}));
    if let Some(meta) = metadata.as_object_mut() {
        meta.insert("name".into(), name.into());
        meta.insert("namespace".into(), namespace.into());
        let label_map = meta.entry("labels").or_insert_with(|| serde_json::json!({}));
        if let Some(lm) = label_map.as_object_mut() {
            for (k, v) in labels {
                lm.insert(k.clone(), Value::String(v.clone()));
            }
        }
    }
    doc
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn apply_document_stamps_identity_and_labels() {
        let manifest = json!({
            "spec": {"runStrategy": "Always", "template": {"spec": {}}}
        });
        let mut labels = BTreeMap::new();
        labels.insert("app.kubernetes.io/managed-by".to_string(), "shepherd".to_string());
        let doc = vm_apply_document("prod-shop", "shop-api-01", &manifest, &labels);
        assert_eq!(doc["apiVersion"], "kubevirt.io/v1");
        assert_eq!(doc["kind"], "VirtualMachine");
        assert_eq!(doc["metadata"]["name"], "shop-api-01");
        assert_eq!(doc["metadata"]["namespace"], "prod-shop");
        assert_eq!(doc["metadata"]["labels"]["app.kubernetes.io/managed-by"], "shepherd");
        // the template's spec rides along untouched
        assert_eq!(doc["spec"]["runStrategy"], "Always");
    }
}
