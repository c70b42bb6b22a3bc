//! Bearer token issuance and validation.
//!
//! HS256 only, enforced by an explicit algorithm allow-list; issuer and
//! audience are pinned, exp/nbf validated by the library. Revocation is a
//! pluggable checker so a deployment can wire a denylist without touching
//! the boundary.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use actix_web::{web, FromRequest, HttpRequest};
use chrono::{Duration, Utc};
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use shepherd_core::audit::RequestContext;
use shepherd_core::rbac::{load_actor, Actor};
use shepherd_definitions::Error as DomainError;

use crate::errors::ApiError;
use crate::state::AppState;

const ISSUER: &str = "shepherd";
const AUDIENCE: &str = "shepherd-api";
const TOKEN_TTL_HOURS: i64 = 12;

/// Short-lived token minted for an approved console session.
pub const CONSOLE_TOKEN_TTL_SECS: i64 = 60;

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct Claims {
    pub sub: Uuid,
    pub iss: String,
    pub aud: String,
    pub exp: i64,
    pub nbf: i64,
    pub iat: i64,
    pub jti: Uuid,
    /// Present only on console stream tokens
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub console_path: Option<String>,
}

/// Pluggable revocation lookup; the default denies nothing.
pub trait RevocationCheck: Send + Sync {
    fn is_revoked(&self, jti: Uuid) -> bool;
}

pub struct NoRevocation;

impl RevocationCheck for NoRevocation {
    fn is_revoked(&self, _jti: Uuid) -> bool {
        false
    }
}

#[derive(Clone)]
pub struct JwtKeys {
    encoding: EncodingKey,
    decoding: DecodingKey,
    revocation: Arc<dyn RevocationCheck>,
}

impl JwtKeys {
    pub fn new(secret: &[u8], revocation: Arc<dyn RevocationCheck>) -> Self {
        JwtKeys {
            encoding: EncodingKey::from_secret(secret),
            decoding: DecodingKey::from_secret(secret),
            revocation,
        }
    }

    pub fn issue(&self, user_id: Uuid) -> Result<String, ApiError> {
        let now = Utc::now();
        let claims = Claims {
            sub: user_id,
            iss: ISSUER.into(),
            aud: AUDIENCE.into(),
            iat: now.timestamp(),
            nbf: now.timestamp(),
            exp: (now + Duration::hours(TOKEN_TTL_HOURS)).timestamp(),
            jti: Uuid::new_v4(),
            console_path: None,
        };
        encode(&Header::new(Algorithm::HS256), &claims, &self.encoding)
            .map_err(|e| DomainError::Internal(format!("token issue failed: {}", e)).into())
    }

    pub fn issue_console(&self, user_id: Uuid, console_path: &str) -> Result<String, ApiError> {
        let now = Utc::now();
        let claims = Claims {
            sub: user_id,
            iss: ISSUER.into(),
            aud: AUDIENCE.into(),
            iat: now.timestamp(),
            nbf: now.timestamp(),
            exp: (now + Duration::seconds(CONSOLE_TOKEN_TTL_SECS)).timestamp(),
            jti: Uuid::new_v4(),
            console_path: Some(console_path.into()),
        };
        encode(&Header::new(Algorithm::HS256), &claims, &self.encoding)
            .map_err(|e| DomainError::Internal(format!("token issue failed: {}", e)).into())
    }

    pub fn validate(&self, token: &str) -> Result<Claims, ApiError> {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.set_issuer(&[ISSUER]);
        validation.set_audience(&[AUDIENCE]);
        validation.validate_nbf = true;
        let data = decode::<Claims>(token, &self.decoding, &validation)
            .map_err(|_| ApiError::from(DomainError::Unauthorized))?;
        if self.revocation.is_revoked(data.claims.jti) {
            return Err(DomainError::Unauthorized.into());
        }
        Ok(data.claims)
    }
}

fn bearer_of(req: &HttpRequest) -> Option<String> {
    req.headers()
        .get("Authorization")?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
        .map(String::from)
}

/// The authenticated caller, resolved to an [`Actor`] with its grants,
/// plus the request context audit rows want.
pub struct Authed {
    pub actor: Actor,
    pub claims: Claims,
    pub context: RequestContext,
}

impl FromRequest for Authed {
    type Error = ApiError;
    type Future = Pin<Box<dyn Future<Output = Result<Authed, ApiError>>>>;

    fn from_request(req: &HttpRequest, _payload: &mut actix_web::dev::Payload) -> Self::Future {
        let req = req.clone();
        Box::pin(async move {
            let state = req
                .app_data::<web::Data<AppState>>()
                .ok_or_else(|| ApiError::from(DomainError::Internal("state missing".into())))?
                .clone();
            let token = bearer_of(&req).ok_or(DomainError::Unauthorized)?;
            let claims = state.jwt.validate(&token)?;
            let actor = load_actor(state.db.pool(), claims.sub).await?;
            let context = RequestContext {
                ip: req
                    .connection_info()
                    .realip_remote_addr()
                    .map(String::from),
                user_agent: req
                    .headers()
                    .get("User-Agent")
                    .and_then(|v| v.to_str().ok())
                    .map(String::from),
            };
            Ok(Authed {
                actor,
                claims,
                context,
            })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn keys() -> JwtKeys {
        JwtKeys::new(b"test-secret-at-least-32-bytes-long!", Arc::new(NoRevocation))
    }

    #[test]
    fn issue_validate_round_trip() {
        let keys = keys();
        let user = Uuid::new_v4();
        let token = keys.issue(user).unwrap();
        let claims = keys.validate(&token).unwrap();
        assert_eq!(claims.sub, user);
        assert_eq!(claims.iss, ISSUER);
        assert!(claims.console_path.is_none());
    }

    #[test]
    fn wrong_secret_is_rejected() {
        let token = keys().issue(Uuid::new_v4()).unwrap();
        let other = JwtKeys::new(b"a-completely-different-signing-key!!", Arc::new(NoRevocation));
        assert!(other.validate(&token).is_err());
    }

    #[test]
    fn revoked_jti_is_rejected() {
        struct RevokeAll;
        impl RevocationCheck for RevokeAll {
            fn is_revoked(&self, _jti: Uuid) -> bool {
                true
            }
        }
        let keys = JwtKeys::new(b"test-secret-at-least-32-bytes-long!", Arc::new(RevokeAll));
        let token = keys.issue(Uuid::new_v4()).unwrap();
        assert!(keys.validate(&token).is_err());
    }

    #[test]
    fn console_token_carries_the_path() {
        let keys = keys();
        let token = keys.issue_console(Uuid::new_v4(), "/vnc/ns/vm").unwrap();
        let claims = keys.validate(&token).unwrap();
        assert_eq!(claims.console_path.as_deref(), Some("/vnc/ns/vm"));
    }
}
