use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{Environment, Error, Result};

/// A registered namespace.
///
/// Names are globally unique and environment-tagged but not bound to a
/// cluster; the binding happens at approval time, where the environment of
/// the selected cluster must equal the namespace's.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct NamespaceRecord {
    pub id: Uuid,
    pub name: String,
    pub environment: Environment,
    #[serde(default)]
    pub description: String,
    pub created_at: DateTime<Utc>,
}

impl NamespaceRecord {
    /// DNS-1123 label check, same rule kubernetes applies
    pub fn validate_name(name: &str) -> Result<()> {
        let ok = !name.is_empty()
            && name.len() <= 63
            && name.chars().all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
            && !name.starts_with('-')
            && !name.ends_with('-');
        if !ok {
            return Err(Error::Validation(format!(
                "namespace '{}' is not a valid dns-1123 label",
                name
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn name_validation() {
        assert!(NamespaceRecord::validate_name("prod-shop").is_ok());
        assert!(NamespaceRecord::validate_name("a1").is_ok());
        assert!(NamespaceRecord::validate_name("").is_err());
        assert!(NamespaceRecord::validate_name("Prod").is_err());
        assert!(NamespaceRecord::validate_name("-lead").is_err());
        assert!(NamespaceRecord::validate_name("trail-").is_err());
        assert!(NamespaceRecord::validate_name(&"x".repeat(64)).is_err());
    }
}
