//! Login and password change.
//!
//! Login failures are uniform and never echo what was submitted; a burst
//! of failures throttles the username before the hasher is even invoked.

use actix_web::{web, HttpResponse};
use serde::Deserialize;
use serde_json::json;

use shepherd_core::users;
use shepherd_definitions::Error as DomainError;

use crate::auth::Authed;
use crate::errors::ApiError;
use crate::state::AppState;

#[derive(Deserialize)]
pub struct LoginBody {
    username: String,
    password: String,
}

pub async fn login(
    state: web::Data<AppState>,
    body: web::Json<LoginBody>,
) -> Result<HttpResponse, ApiError> {
    if !state.login_allowed(&body.username) {
        return Err(DomainError::RateLimited {
            limit_type: "login_attempts".into(),
            current: 5,
            max: 5,
            retry_after_seconds: 900,
        }
        .into());
    }
    match users::authenticate(&state.db, &body.username, &body.password).await {
        Ok(user) => {
            state.record_login_success(&body.username);
            let token = state.jwt.issue(user.id)?;
            Ok(HttpResponse::Ok().json(json!({
                "token": token,
                "force_password_change": user.force_password_change,
            })))
        }
        Err(e) => {
            state.record_login_failure(&body.username);
            Err(e.into())
        }
    }
}

#[derive(Deserialize)]
pub struct PasswordBody {
    current_password: String,
    new_password: String,
}

pub async fn change_password(
    state: web::Data<AppState>,
    authed: Authed,
    body: web::Json<PasswordBody>,
) -> Result<HttpResponse, ApiError> {
    users::change_password(
        &state.db,
        authed.actor.id,
        &body.current_password,
        &body.new_password,
    )
    .await?;
    Ok(HttpResponse::NoContent().finish())
}
