use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::{Error, Result};

/// Resolution state of a proposed adoption.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AdoptionStatus {
    Pending,
    Adopted,
    Ignored,
}

impl AdoptionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AdoptionStatus::Pending => "PENDING",
            AdoptionStatus::Adopted => "ADOPTED",
            AdoptionStatus::Ignored => "IGNORED",
        }
    }
}

impl fmt::Display for AdoptionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AdoptionStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "PENDING" => Ok(AdoptionStatus::Pending),
            "ADOPTED" => Ok(AdoptionStatus::Adopted),
            "IGNORED" => Ok(AdoptionStatus::Ignored),
            other => Err(Error::Internal(format!("unknown adoption status '{}'", other))),
        }
    }
}

/// An external resource carrying platform ownership labels but lacking a
/// local record. Found by the reconciler sweep, resolved by an admin.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct PendingAdoption {
    pub id: Uuid,
    pub cluster_id: Uuid,
    pub namespace: String,
    pub resource_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_label: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_label: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instance_label: Option<String>,
    pub external_uid: String,
    /// Spec as observed at discovery time
    pub spec_snapshot: Value,
    pub status: AdoptionStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}
