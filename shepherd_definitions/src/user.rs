use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{Error, Result};

/// Minimum accepted password length; 15+ is what the docs recommend
pub const MIN_PASSWORD_LEN: usize = 8;

/// Passwords rejected regardless of length.
///
/// Deliberately a short embedded list of the usual offenders rather than a
/// full corpus; admins wanting more plug a bigger file into the deployment.
const COMMON_PASSWORDS: [&str; 24] = [
    "password",
    "password1",
    "password123",
    "passw0rd",
    "12345678",
    "123456789",
    "1234567890",
    "qwertyuiop",
    "qwerty123",
    "iloveyou",
    "admin123",
    "administrator",
    "letmein1",
    "welcome1",
    "sunshine",
    "princess",
    "football",
    "baseball",
    "superman",
    "trustno1",
    "dragon123",
    "master123",
    "shepherd",
    "kubevirt",
];

/// A platform user. Never hard-deleted; `disabled` instead, so audit rows
/// keep a resolvable actor.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct User {
    pub id: Uuid,
    pub username: String,
    /// argon2id PHC string, never serialized outwards
    #[serde(skip_serializing)]
    pub password_hash: String,
    pub force_password_change: bool,
    pub disabled: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Password policy: length floor plus blocklist, no composition rules and
/// no forced rotation.
pub fn validate_password(password: &str) -> Result<()> {
    if password.len() < MIN_PASSWORD_LEN {
        return Err(Error::Validation(format!(
            "password must be at least {} characters",
            MIN_PASSWORD_LEN
        )));
    }
    let lowered = password.to_lowercase();
    if COMMON_PASSWORDS.contains(&lowered.as_str()) {
        return Err(Error::Validation(
            "password is on the common-password blocklist".into(),
        ));
    }
    Ok(())
}

pub fn validate_username(username: &str) -> Result<()> {
    let ok = !username.is_empty()
        && username.len() <= 64
        && username
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.');
    if !ok {
        return Err(Error::Validation(format!("invalid username '{}'", username)));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn password_policy_is_length_and_blocklist_only() {
        assert!(validate_password("short").is_err());
        assert!(validate_password("Password123").is_err()); // blocklist, case-insensitive
        assert!(validate_password("aaaaaaaa").is_ok()); // no composition rules
        assert!(validate_password("correct horse battery staple").is_ok());
    }

    #[test]
    fn usernames_are_conservative() {
        assert!(validate_username("alice").is_ok());
        assert!(validate_username("svc.deploy-bot_2").is_ok());
        assert!(validate_username("").is_err());
        assert!(validate_username("has space").is_err());
    }
}
