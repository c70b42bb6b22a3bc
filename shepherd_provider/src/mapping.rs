//! Anti-corruption boundary between kubernetes objects and the domain.
//!
//! Critical fields must be present or the mapping fails loudly with
//! `IncompatibleSchema`; optional fields are nil-guarded so schema drift on
//! the cluster side degrades instead of panicking.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use kube::ResourceExt;
use serde::{Deserialize, Serialize};

use shepherd_definitions::{vm::labels, Error as DomainError};

use crate::types::VirtualMachine;
use crate::{Error, Result};

/// Domain view of a VM as it exists on a cluster.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct ExternalVm {
    pub name: String,
    pub namespace: String,
    pub uid: String,
    pub labels: BTreeMap<String, String>,
    /// KubeVirt printable status, e.g. Running, Stopped, Provisioning
    pub power_state: Option<String>,
    pub ready: bool,
    pub created_at: Option<DateTime<Utc>>,
}

impl ExternalVm {
    /// Whether this resource claims shepherd ownership
    pub fn is_platform_managed(&self) -> bool {
        self.labels.get(labels::MANAGED_BY).map(String::as_str) == Some(labels::MANAGED_BY_VALUE)
    }

    /// The ticket that applied this resource, if the label survived
    pub fn ticket_label(&self) -> Option<&str> {
        self.labels.get(labels::TICKET_ID).map(String::as_str)
    }
}

/// Map a cluster VirtualMachine into the domain view.
pub fn map_vm(vm: &VirtualMachine) -> Result<ExternalVm> {
    let name = vm
        .metadata
        .name
        .clone()
        .ok_or_else(|| missing("metadata.name"))?;
    let namespace = vm
        .metadata
        .namespace
        .clone()
        .ok_or_else(|| missing("metadata.namespace"))?;
    let uid = vm
        .metadata
        .uid
        .clone()
        .ok_or_else(|| missing("metadata.uid"))?;

    let status = vm.status.as_ref();
    Ok(ExternalVm {
        labels: vm.labels().clone(),
        power_state: status.and_then(|s| s.printable_status.clone()),
        ready: status.map(|s| s.ready).unwrap_or(false),
        created_at: vm.metadata.creation_timestamp.as_ref().map(|t| t.0),
        name,
        namespace,
        uid,
    })
}

fn missing(field: &str) -> Error {
    Error::Domain(DomainError::IncompatibleSchema(format!(
        "external VirtualMachine lacks {}",
        field
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{VirtualMachineSpec, VirtualMachineStatus};
    use kube::core::ObjectMeta;

    fn vm(name: Option<&str>, uid: Option<&str>) -> VirtualMachine {
        let mut v = VirtualMachine::new(
            name.unwrap_or_default(),
            VirtualMachineSpec::default(),
        );
        v.metadata = ObjectMeta {
            name: name.map(String::from),
            namespace: Some("prod-shop".into()),
            uid: uid.map(String::from),
            ..ObjectMeta::default()
        };
        v.status = Some(VirtualMachineStatus {
            printable_status: Some("Running".into()),
            created: true,
            ready: true,
            conditions: vec![],
        });
        v
    }

    #[test]
    fn maps_complete_objects() {
        let mapped = map_vm(&vm(Some("shop-api-01"), Some("uid-1"))).unwrap();
        assert_eq!(mapped.name, "shop-api-01");
        assert_eq!(mapped.namespace, "prod-shop");
        assert_eq!(mapped.power_state.as_deref(), Some("Running"));
        assert!(mapped.ready);
    }

    #[test]
    fn missing_uid_is_an_incompatible_schema() {
        let err = map_vm(&vm(Some("shop-api-01"), None)).unwrap_err();
        match err {
            Error::Domain(DomainError::IncompatibleSchema(msg)) => {
                assert!(msg.contains("metadata.uid"))
            }
            other => panic!("unexpected error {:?}", other),
        }
    }

    #[test]
    fn ownership_labels_are_recognised() {
        let mut v = vm(Some("adopted-vm"), Some("uid-2"));
        v.metadata
            .labels
            .get_or_insert_with(Default::default)
            .insert(labels::MANAGED_BY.into(), labels::MANAGED_BY_VALUE.into());
        let mapped = map_vm(&v).unwrap();
        assert!(mapped.is_platform_managed());
        assert!(mapped.ticket_label().is_none());
    }
}
