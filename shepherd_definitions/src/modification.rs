//! Rules for admin spec modification at approval time.
//!
//! A modified spec replaces the original wholesale. These checks exist to
//! catch fat-fingered replacements (dropping half the document) and to
//! block the two fields whose change would amount to privilege escalation.

use log::warn;
use serde_json::Value;

use crate::{Error, Result};

/// Fields an approver may never change; submit-time values are immutable.
const IMMUTABLE_FIELDS: [&str; 2] = ["namespace", "service_id"];

/// Fields a modified spec must still carry.
const REQUIRED_FIELDS: [&str; 3] = ["cpu", "memory", "disk"];

/// Dropping this many top-level fields aborts instead of warning
const MAX_DROPPED_FIELDS: usize = 5;

/// Validate a full-replacement spec against the original payload.
///
/// Returns the list of dropped top-level keys (already logged) so callers
/// can surface them in the approval audit record.
pub fn validate_replacement(original: &Value, modified: &Value) -> Result<Vec<String>> {
    let orig = original
        .as_object()
        .ok_or_else(|| Error::Internal("ticket payload is not an object".into()))?;
    let modi = modified
        .as_object()
        .ok_or_else(|| Error::Validation("modified spec must be a JSON object".into()))?;

    for field in IMMUTABLE_FIELDS {
        if let (Some(o), Some(m)) = (orig.get(field), modi.get(field)) {
            if o != m {
                return Err(Error::Validation(format!(
                    "field '{}' is immutable once submitted",
                    field
                )));
            }
        }
    }

    let dropped: Vec<String> = orig
        .keys()
        .filter(|k| !modi.contains_key(*k))
        .cloned()
        .collect();

    for field in REQUIRED_FIELDS {
        if orig.contains_key(field) && !modi.contains_key(field) {
            return Err(Error::Validation(format!(
                "modified spec removes required field '{}'",
                field
            )));
        }
    }
    if dropped.len() >= MAX_DROPPED_FIELDS {
        return Err(Error::Validation(format!(
            "modified spec drops {} top-level fields ({}), refusing",
            dropped.len(),
            dropped.join(", ")
        )));
    }
    if !dropped.is_empty() {
        warn!("modified spec drops fields: {}", dropped.join(", "));
    }
    Ok(dropped)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn replacement_with_same_shape_passes() {
        let orig = json!({"cpu": 4, "memory": "8Gi", "disk": "50Gi"});
        let modi = json!({"cpu": 2, "memory": "4Gi", "disk": "50Gi"});
        assert!(validate_replacement(&orig, &modi).unwrap().is_empty());
    }

    #[test]
    fn immutable_fields_cannot_change() {
        let orig = json!({"cpu": 4, "namespace": "prod-shop", "service_id": "svc-1"});
        let modi = json!({"cpu": 4, "namespace": "prod-other", "service_id": "svc-1"});
        assert!(validate_replacement(&orig, &modi).is_err());
    }

    #[test]
    fn dropping_a_required_field_aborts() {
        let orig = json!({"cpu": 4, "memory": "8Gi", "disk": "50Gi"});
        let modi = json!({"cpu": 4, "memory": "8Gi"});
        assert!(validate_replacement(&orig, &modi).is_err());
    }

    #[test]
    fn dropping_too_many_fields_aborts() {
        let orig = json!({
            "cpu": 1, "memory": "1Gi", "disk": "1Gi",
            "a": 1, "b": 2, "c": 3, "d": 4, "e": 5
        });
        let modi = json!({"cpu": 1, "memory": "1Gi", "disk": "1Gi"});
        assert!(validate_replacement(&orig, &modi).is_err());
    }

    #[test]
    fn small_drops_warn_and_report() {
        let orig = json!({"cpu": 1, "memory": "1Gi", "disk": "1Gi", "note": "x"});
        let modi = json!({"cpu": 1, "memory": "1Gi", "disk": "1Gi"});
        let dropped = validate_replacement(&orig, &modi).unwrap();
        assert_eq!(dropped, vec!["note".to_string()]);
    }
}
