//! User management and password verification.

use argon2::password_hash::rand_core::OsRng;
use argon2::password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString};
use argon2::Argon2;
use chrono::Utc;
use serde_json::json;
use uuid::Uuid;

use shepherd_definitions::audit::AuditAction;
use shepherd_definitions::rbac::Permission;
use shepherd_definitions::user::{validate_password, validate_username};
use shepherd_definitions::{Error as DomainError, User};

use crate::audit::{append, Audit, RequestContext};
use crate::rbac::Actor;
use crate::{db, Db, Result};

pub fn hash_password(password: &str) -> Result<String> {
    let salt = SaltString::generate(&mut OsRng);
    Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map(|h| h.to_string())
        .map_err(|e| DomainError::Internal(format!("password hashing failed: {}", e)).into())
}

pub fn verify_password(password: &str, hash: &str) -> bool {
    PasswordHash::new(hash)
        .map(|parsed| {
            Argon2::default()
                .verify_password(password.as_bytes(), &parsed)
                .is_ok()
        })
        .unwrap_or(false)
}

/// Credential check for login. Failures are uniform: the caller can not
/// distinguish a missing user from a wrong password, and the message never
/// echoes what was submitted.
pub async fn authenticate(db: &Db, username: &str, password: &str) -> Result<User> {
    let user = db::users::get_by_username(db.pool(), username).await?;
    let Some(user) = user else {
        // burn the same time as a real verification to keep timing flat
        let _ = verify_password(password, DUMMY_HASH);
        return Err(DomainError::Unauthorized.into());
    };
    if user.disabled || !verify_password(password, &user.password_hash) {
        return Err(DomainError::Unauthorized.into());
    }
    Ok(user)
}

// a hash of nothing in particular, used to equalize failed-login timing
const DUMMY_HASH: &str = "$argon2id$v=19$m=19456,t=2,p=1$p8H5eLONk1rQcNOHLoL8aA$cbcGJIgtb07hSYS9aVSYO1iJUJGVFso2MGCAQ8P9dBs";

pub async fn create_user(
    db: &Db,
    actor: &Actor,
    ctx: &RequestContext,
    username: &str,
    password: &str,
    force_change: bool,
) -> Result<User> {
    actor.require(Permission::UserManage)?;
    validate_username(username)?;
    validate_password(password)?;
    let now = Utc::now();
    let user = User {
        id: Uuid::new_v4(),
        username: username.to_string(),
        password_hash: hash_password(password)?,
        force_password_change: force_change,
        disabled: false,
        created_at: now,
        updated_at: now,
    };
    let created = user.clone();
    db.with_tx(move |conn| {
        let user = user.clone();
        let actor = actor.clone();
        let ctx = ctx.clone();
        Box::pin(async move {
            db::users::insert(conn, &user).await?;
            append(
                conn,
                Audit::new(AuditAction::UserCreated, actor.id)
                    .details(json!({"username": user.username, "user_id": user.id}))
                    .context(&ctx),
            )
            .await?;
            Ok(())
        })
    })
    .await?;
    Ok(created)
}

/// Self-service password change; clears the force-change flag.
pub async fn change_password(
    db: &Db,
    user_id: Uuid,
    current: &str,
    new_password: &str,
) -> Result<()> {
    let user = db::users::get(db.pool(), user_id)
        .await?
        .ok_or(DomainError::Unauthorized)?;
    if !verify_password(current, &user.password_hash) {
        return Err(DomainError::Unauthorized.into());
    }
    validate_password(new_password)?;
    let hash = hash_password(new_password)?;
    db.with_tx(move |conn| {
        let hash = hash.clone();
        Box::pin(async move {
            db::users::set_password(conn, user_id, &hash, false).await?;
            append(
                conn,
                Audit::new(AuditAction::PasswordChanged, user_id)
                    .details(json!({"user_id": user_id})),
            )
            .await?;
            Ok(())
        })
    })
    .await
}

/// Disable instead of delete, so audit actors stay resolvable.
pub async fn disable_user(
    db: &Db,
    actor: &Actor,
    ctx: &RequestContext,
    user_id: Uuid,
) -> Result<()> {
    actor.require(Permission::UserManage)?;
    if actor.id == user_id {
        return Err(DomainError::Validation("cannot disable your own account".into()).into());
    }
    db.with_tx(move |conn| {
        let actor = actor.clone();
        let ctx = ctx.clone();
        Box::pin(async move {
            if !db::users::set_disabled(conn, user_id, true).await? {
                return Err(DomainError::NotFound(format!("user {}", user_id)).into());
            }
            append(
                conn,
                Audit::new(AuditAction::UserDisabled, actor.id)
                    .details(json!({"user_id": user_id}))
                    .context(&ctx),
            )
            .await?;
            Ok(())
        })
    })
    .await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_and_verify_round_trip() {
        let hash = hash_password("correct horse battery staple").unwrap();
        assert!(verify_password("correct horse battery staple", &hash));
        assert!(!verify_password("wrong", &hash));
        // phc string, not plaintext
        assert!(hash.starts_with("$argon2id$"));
    }

    #[test]
    fn dummy_hash_parses() {
        // the timing-equalizer must stay a valid phc string
        assert!(PasswordHash::new(DUMMY_HASH).is_ok());
    }
}
