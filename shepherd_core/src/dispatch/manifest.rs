//! Build the VirtualMachine document a create/modify event applies.
//!
//! The template content is the base; the instance size sets the scheduling
//! fields and its restricted spec.* overrides; the effective spec (which
//! is the admin's replacement when one exists) wins last for cpu, memory
//! and disk. The precedence is deliberate: whatever the approver signed
//! off on is what reaches the cluster.

use std::collections::BTreeMap;

use serde_json::{json, Value};

use shepherd_definitions::{InstanceSize, Template};
use shepherd_provider::types::vm_apply_document;

/// Set a dotted path inside a JSON object, creating objects on the way.
fn set_path(doc: &mut Value, path: &str, value: Value) {
    let mut cursor = doc;
    let parts: Vec<&str> = path.split('.').collect();
    for (i, part) in parts.iter().enumerate() {
        if i == parts.len() - 1 {
            if let Some(obj) = cursor.as_object_mut() {
                obj.insert(part.to_string(), value);
            }
            return;
        }
        if !cursor.get(*part).map(Value::is_object).unwrap_or(false) {
            if let Some(obj) = cursor.as_object_mut() {
                obj.insert(part.to_string(), json!({}));
            }
        }
        cursor = cursor.get_mut(*part).expect("just inserted");
    }
}

// spec knobs may sit at the top level (admin replacements) or under the
// request's spec object; top level wins
fn effective_str(effective: &Value, key: &str) -> Option<String> {
    effective
        .get(key)
        .or_else(|| effective.pointer(&format!("/spec/{}", key)))
        .and_then(Value::as_str)
        .map(String::from)
}

fn effective_i64(effective: &Value, key: &str) -> Option<i64> {
    effective
        .get(key)
        .or_else(|| effective.pointer(&format!("/spec/{}", key)))
        .and_then(Value::as_i64)
}

pub fn build_vm_manifest(
    template: &Template,
    size: &InstanceSize,
    effective: &Value,
    namespace: &str,
    name: &str,
    labels: &BTreeMap<String, String>,
) -> Value {
    let mut doc = if template.content.is_object() {
        template.content.clone()
    } else {
        json!({})
    };

    // size first, restricted overrides next, effective spec last
    set_path(
        &mut doc,
        "spec.template.spec.domain.cpu.cores",
        json!(size.cpu),
    );
    set_path(
        &mut doc,
        "spec.template.spec.domain.memory.guest",
        json!(format!("{}Mi", size.memory_mi)),
    );
    let mut disk_gi = size.disk_gi;

    for (path, value) in &size.spec_overrides {
        set_path(&mut doc, path, value.clone());
    }

    if let Some(cpu) = effective_i64(effective, "cpu") {
        set_path(&mut doc, "spec.template.spec.domain.cpu.cores", json!(cpu));
    }
    if let Some(memory) = effective_str(effective, "memory") {
        set_path(&mut doc, "spec.template.spec.domain.memory.guest", json!(memory));
    }
    if let Some(disk) = effective_str(effective, "disk") {
        if let Some(gi) = disk.strip_suffix("Gi").and_then(|d| d.parse::<i64>().ok()) {
            disk_gi = gi;
        }
    }

    // size the boot volume when the template carries one
    if doc.pointer("/spec/dataVolumeTemplates/0").is_some() {
        if let Some(dv) = doc
            .pointer_mut("/spec/dataVolumeTemplates/0")
            .and_then(Value::as_object_mut)
        {
            let mut storage = json!({});
            set_path(
                &mut storage,
                "spec.storage.resources.requests.storage",
                json!(format!("{}Gi", disk_gi)),
            );
            if let Some(spec) = storage.pointer("/spec").cloned() {
                merge_into(dv, "spec", spec);
            }
        }
    }

    // annotation keys carry dots and slashes, so they bypass the
    // dotted-path helper
    if let Some(image) = &template.os_image {
        if !doc.get("metadata").map(Value::is_object).unwrap_or(false) {
            if let Some(obj) = doc.as_object_mut() {
                obj.insert("metadata".into(), json!({}));
            }
        }
        if let Some(meta) = doc.get_mut("metadata").and_then(Value::as_object_mut) {
            let annotations = meta.entry("annotations").or_insert_with(|| json!({}));
            if let Some(a) = annotations.as_object_mut() {
                a.insert("shepherd.io/os-image".into(), json!(image));
            }
        }
    }

    vm_apply_document(namespace, name, &doc, labels)
}

fn merge_into(target: &mut serde_json::Map<String, Value>, key: &str, addition: Value) {
    match (target.get_mut(key), addition) {
        (Some(Value::Object(existing)), Value::Object(new)) => {
            for (k, v) in new {
                merge_into(existing, &k, v);
            }
        }
        (slot, new) => {
            if let Some(s) = slot {
                *s = new;
            } else {
                target.insert(key.to_string(), new);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use shepherd_definitions::template::TemplateStatus;
    use uuid::Uuid;

    fn template(content: Value) -> Template {
        Template {
            id: Uuid::new_v4(),
            name: "ubuntu-22".into(),
            version: "3".into(),
            status: TemplateStatus::Active,
            content,
            os_image: Some("quay.io/containerdisks/ubuntu:22.04".into()),
            cloud_init: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    fn size() -> InstanceSize {
        InstanceSize {
            id: Uuid::new_v4(),
            name: "m1.large".into(),
            cpu: 4,
            memory_mi: 8192,
            disk_gi: 50,
            required_capabilities: Default::default(),
            spec_overrides: Default::default(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn size_fields_land_in_domain_paths() {
        let tpl = template(json!({"spec": {"runStrategy": "Always"}}));
        let doc = build_vm_manifest(&tpl, &size(), &json!({}), "prod-shop", "shop-api-01", &Default::default());
        assert_eq!(doc["spec"]["template"]["spec"]["domain"]["cpu"]["cores"], 4);
        assert_eq!(doc["spec"]["template"]["spec"]["domain"]["memory"]["guest"], "8192Mi");
        assert_eq!(doc["spec"]["runStrategy"], "Always");
        assert_eq!(doc["metadata"]["name"], "shop-api-01");
    }

    #[test]
    fn effective_spec_wins_over_size() {
        let tpl = template(json!({"spec": {}}));
        let effective = json!({"cpu": 2, "memory": "4Gi"});
        let doc = build_vm_manifest(&tpl, &size(), &effective, "prod-shop", "shop-api-01", &Default::default());
        assert_eq!(doc["spec"]["template"]["spec"]["domain"]["cpu"]["cores"], 2);
        assert_eq!(doc["spec"]["template"]["spec"]["domain"]["memory"]["guest"], "4Gi");
    }

    #[test]
    fn size_overrides_apply_but_cannot_outrank_effective() {
        let tpl = template(json!({"spec": {}}));
        let mut s = size();
        s.spec_overrides.insert(
            "spec.template.spec.domain.devices.autoattachSerialConsole".into(),
            json!(true),
        );
        let doc = build_vm_manifest(&tpl, &s, &json!({"cpu": 8}), "ns", "vm-1", &Default::default());
        assert_eq!(
            doc["spec"]["template"]["spec"]["domain"]["devices"]["autoattachSerialConsole"],
            true
        );
        assert_eq!(doc["spec"]["template"]["spec"]["domain"]["cpu"]["cores"], 8);
    }

    #[test]
    fn boot_volume_is_sized_when_present() {
        let tpl = template(json!({
            "spec": {"dataVolumeTemplates": [{"metadata": {"name": "root"}}]}
        }));
        let doc = build_vm_manifest(
            &tpl,
            &size(),
            &json!({"disk": "80Gi"}),
            "ns",
            "vm-1",
            &Default::default(),
        );
        assert_eq!(
            doc["spec"]["dataVolumeTemplates"][0]["spec"]["storage"]["resources"]["requests"]["storage"],
            "80Gi"
        );
    }
}
