use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::{Error, Result};

/// Publication status of a template version.
///
/// At most one `Active` row may exist per template name; publishing a new
/// active version auto-deprecates the previous one (enforced in the
/// repository transaction).
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TemplateStatus {
    Draft,
    Active,
    Deprecated,
    Archived,
}

impl TemplateStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TemplateStatus::Draft => "draft",
            TemplateStatus::Active => "active",
            TemplateStatus::Deprecated => "deprecated",
            TemplateStatus::Archived => "archived",
        }
    }

    /// Forward-only lifecycle; drafts can activate, actives deprecate, and
    /// anything can be archived.
    pub fn can_transition(&self, next: TemplateStatus) -> bool {
        use TemplateStatus::*;
        match (self, next) {
            (Draft, Active) => true,
            (Active, Deprecated) => true,
            (Draft, Archived) | (Active, Archived) | (Deprecated, Archived) => true,
            _ => false,
        }
    }
}

impl fmt::Display for TemplateStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TemplateStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "draft" => Ok(TemplateStatus::Draft),
            "active" => Ok(TemplateStatus::Active),
            "deprecated" => Ok(TemplateStatus::Deprecated),
            "archived" => Ok(TemplateStatus::Archived),
            other => Err(Error::Internal(format!("unknown template status '{}'", other))),
        }
    }
}

/// A versioned VM template.
///
/// The content blob is opaque to the control plane; identified by
/// (name, version) and rendered by the provider into a kubernetes manifest.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct Template {
    pub id: Uuid,
    pub name: String,
    pub version: String,
    pub status: TemplateStatus,
    /// Opaque manifest-producing blob
    pub content: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub os_image: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cloud_init: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lifecycle_is_forward_only() {
        use TemplateStatus::*;
        assert!(Draft.can_transition(Active));
        assert!(Active.can_transition(Deprecated));
        assert!(Deprecated.can_transition(Archived));
        assert!(!Deprecated.can_transition(Active));
        assert!(!Archived.can_transition(Draft));
        assert!(!Archived.can_transition(Active));
    }
}
