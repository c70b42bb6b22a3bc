use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::{Error, Result};

/// Hardware capabilities a size can require from a cluster.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "kebab-case")]
pub enum Capability {
    Gpu,
    Sriov,
    Hugepages,
    DedicatedCpu,
}

impl Capability {
    pub fn as_str(&self) -> &'static str {
        match self {
            Capability::Gpu => "gpu",
            Capability::Sriov => "sriov",
            Capability::Hugepages => "hugepages",
            Capability::DedicatedCpu => "dedicated-cpu",
        }
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Capability {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "gpu" => Ok(Capability::Gpu),
            "sriov" => Ok(Capability::Sriov),
            "hugepages" => Ok(Capability::Hugepages),
            "dedicated-cpu" => Ok(Capability::DedicatedCpu),
            other => Err(Error::Validation(format!("unknown capability '{}'", other))),
        }
    }
}

/// Override paths that would shadow the indexed scheduling columns.
///
/// cpu/memory/disk live in real columns so the scheduler can filter on
/// them; letting an override rewrite the same values would make the index
/// lie.
const RESERVED_OVERRIDE_PATHS: [&str; 4] = [
    "spec.template.spec.domain.cpu",
    "spec.template.spec.domain.memory",
    "spec.template.spec.domain.resources",
    "spec.template.spec.volumes",
];

/// A named instance size.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct InstanceSize {
    pub id: Uuid,
    pub name: String,
    pub cpu: i32,
    pub memory_mi: i64,
    pub disk_gi: i64,
    #[serde(default)]
    pub required_capabilities: BTreeSet<Capability>,
    /// Extra manifest tweaks, restricted to spec.* paths
    #[serde(default)]
    pub spec_overrides: BTreeMap<String, Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl InstanceSize {
    /// Validate the override map: spec.* paths only, none shadowing the
    /// indexed scheduling columns.
    pub fn validate_overrides(&self) -> Result<()> {
        for path in self.spec_overrides.keys() {
            if !path.starts_with("spec.") {
                return Err(Error::Validation(format!(
                    "override path '{}' must start with 'spec.'",
                    path
                )));
            }
            for reserved in RESERVED_OVERRIDE_PATHS {
                if path == reserved || path.starts_with(&format!("{}.", reserved)) {
                    return Err(Error::Validation(format!(
                        "override path '{}' conflicts with a scheduling column",
                        path
                    )));
                }
            }
        }
        Ok(())
    }

    /// Whether a cluster's feature set satisfies this size.
    pub fn satisfied_by(&self, features: &BTreeSet<String>) -> bool {
        self.required_capabilities
            .iter()
            .all(|c| features.contains(c.as_str()))
    }

    /// Capabilities the cluster is missing, for error reporting
    pub fn missing_from(&self, features: &BTreeSet<String>) -> Vec<Capability> {
        self.required_capabilities
            .iter()
            .filter(|c| !features.contains(c.as_str()))
            .copied()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn size() -> InstanceSize {
        InstanceSize {
            id: Uuid::new_v4(),
            name: "m1.large".into(),
            cpu: 4,
            memory_mi: 8192,
            disk_gi: 50,
            required_capabilities: BTreeSet::new(),
            spec_overrides: BTreeMap::new(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn overrides_must_live_under_spec() {
        let mut s = size();
        s.spec_overrides
            .insert("metadata.labels.foo".into(), json!("bar"));
        assert!(s.validate_overrides().is_err());
        s.spec_overrides.clear();
        s.spec_overrides
            .insert("spec.template.spec.domain.devices.autoattachSerialConsole".into(), json!(true));
        assert!(s.validate_overrides().is_ok());
    }

    #[test]
    fn overrides_cannot_shadow_scheduling_columns() {
        let mut s = size();
        s.spec_overrides
            .insert("spec.template.spec.domain.cpu.cores".into(), json!(64));
        assert!(s.validate_overrides().is_err());
    }

    #[test]
    fn capability_matching() {
        let mut s = size();
        s.required_capabilities.insert(Capability::Gpu);
        s.required_capabilities.insert(Capability::Hugepages);

        let mut feats: BTreeSet<String> = BTreeSet::new();
        feats.insert("gpu".into());
        assert!(!s.satisfied_by(&feats));
        assert_eq!(s.missing_from(&feats), vec![Capability::Hugepages]);

        feats.insert("hugepages".into());
        assert!(s.satisfied_by(&feats));
    }
}
