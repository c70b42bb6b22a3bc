use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use semver::Version;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{Environment, Error, Result};

/// Health of a managed cluster as seen by the capability detector.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ClusterHealth {
    Unknown,
    Healthy,
    Unhealthy,
    Unreachable,
}

impl ClusterHealth {
    pub fn as_str(&self) -> &'static str {
        match self {
            ClusterHealth::Unknown => "UNKNOWN",
            ClusterHealth::Healthy => "HEALTHY",
            ClusterHealth::Unhealthy => "UNHEALTHY",
            ClusterHealth::Unreachable => "UNREACHABLE",
        }
    }
}

impl fmt::Display for ClusterHealth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ClusterHealth {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "UNKNOWN" => Ok(ClusterHealth::Unknown),
            "HEALTHY" => Ok(ClusterHealth::Healthy),
            "UNHEALTHY" => Ok(ClusterHealth::Unhealthy),
            "UNREACHABLE" => Ok(ClusterHealth::Unreachable),
            other => Err(Error::Internal(format!("unknown cluster health '{}'", other))),
        }
    }
}

/// A managed KubeVirt cluster.
///
/// `credentials` is the encrypted kubeconfig blob; the plaintext only ever
/// exists inside the provider while building a client.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct Cluster {
    pub id: Uuid,
    pub name: String,
    pub api_url: String,
    /// AES-GCM sealed kubeconfig, never serialized outwards
    #[serde(skip_serializing, default)]
    pub credentials: Vec<u8>,
    pub environment: Environment,
    pub health: ClusterHealth,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kubevirt_version: Option<String>,
    #[serde(default)]
    pub enabled_features: BTreeSet<String>,
    /// Ordered by scheduling preference
    #[serde(default)]
    pub storage_classes: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_storage_class: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_probed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_detected_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Cluster {
    /// Whether this cluster can currently accept writes.
    pub fn is_schedulable(&self) -> bool {
        self.health == ClusterHealth::Healthy
    }

    /// Features available on this cluster: the GA set for its detected
    /// version plus any explicitly enabled feature gates.
    pub fn effective_features(&self) -> BTreeSet<String> {
        let mut set: BTreeSet<String> = self
            .kubevirt_version
            .as_deref()
            .and_then(|v| Version::parse(v).ok())
            .map(|v| ga_features(&v).into_iter().map(String::from).collect())
            .unwrap_or_default();
        set.extend(self.enabled_features.iter().cloned());
        set
    }
}

/// Features generally available per KubeVirt minor version.
///
/// Gates not in this table must be enabled explicitly on the cluster row
/// (mirrors the featureGates section of the KubeVirt CR).
pub fn ga_features(version: &Version) -> Vec<&'static str> {
    let mut feats = vec![];
    if version.major >= 1 {
        feats.extend(["snapshot", "export", "instancetype"]);
        if version.minor >= 1 {
            feats.push("migration");
        }
        if version.minor >= 2 {
            feats.extend(["hotplug-volumes", "cpu-manager"]);
        }
        if version.minor >= 3 {
            feats.push("memory-hotplug");
        }
    } else if version.minor >= 59 {
        // late 0.x releases shipped snapshot support only
        feats.push("snapshot");
    }
    feats
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ga_table_is_monotonic_in_version() {
        let old = ga_features(&Version::parse("0.59.2").unwrap());
        let v10 = ga_features(&Version::parse("1.0.0").unwrap());
        let v12 = ga_features(&Version::parse("1.2.1").unwrap());
        assert_eq!(old, vec!["snapshot"]);
        assert!(v10.contains(&"instancetype"));
        assert!(!v10.contains(&"migration"));
        assert!(v12.contains(&"migration"));
        assert!(v12.contains(&"hotplug-volumes"));
        assert!(v12.len() > v10.len());
    }

    #[test]
    fn explicit_gates_extend_the_ga_set() {
        let mut c = Cluster {
            id: Uuid::new_v4(),
            name: "cluster-a".into(),
            api_url: "https://10.0.0.1:6443".into(),
            credentials: vec![],
            environment: Environment::Prod,
            health: ClusterHealth::Healthy,
            kubevirt_version: Some("1.0.0".into()),
            enabled_features: BTreeSet::new(),
            storage_classes: vec!["fast".into(), "standard".into()],
            default_storage_class: Some("fast".into()),
            last_probed_at: None,
            last_detected_at: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        c.enabled_features.insert("gpu".into());
        let feats = c.effective_features();
        assert!(feats.contains("gpu"));
        assert!(feats.contains("snapshot"));
    }
}
