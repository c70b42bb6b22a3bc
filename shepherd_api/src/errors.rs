//! Error rendering: the taxonomy maps to HTTP statuses here and nowhere
//! else. Handlers return `Result<HttpResponse, ApiError>` and the
//! conversion chain does the rest.

use std::fmt;
use std::sync::OnceLock;

use actix_web::http::StatusCode;
use actix_web::{HttpResponse, ResponseError};
use log::error;
use serde_json::json;

use shepherd_definitions::Error as DomainError;

/// Set once at startup; outside production deployments the raw detail of
/// internal errors is rendered to help debugging.
static VERBOSE_ERRORS: OnceLock<bool> = OnceLock::new();

pub fn set_verbose_errors(verbose: bool) {
    let _ = VERBOSE_ERRORS.set(verbose);
}

fn verbose() -> bool {
    *VERBOSE_ERRORS.get().unwrap_or(&false)
}

#[derive(Debug)]
pub struct ApiError {
    domain: DomainError,
}

impl ApiError {
    pub fn domain(&self) -> &DomainError {
        &self.domain
    }
}

impl fmt::Display for ApiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.domain.fmt(f)
    }
}

impl From<DomainError> for ApiError {
    fn from(domain: DomainError) -> Self {
        ApiError { domain }
    }
}

impl From<shepherd_core::Error> for ApiError {
    fn from(e: shepherd_core::Error) -> Self {
        match e {
            shepherd_core::Error::Domain(d) => ApiError { domain: d },
            shepherd_core::Error::Provider(shepherd_provider::Error::Domain(d)) => {
                ApiError { domain: d }
            }
            other => {
                // full detail stays server-side
                error!("internal error reached the boundary: {:?}", other);
                ApiError {
                    domain: DomainError::Internal(other.to_string()),
                }
            }
        }
    }
}

impl From<shepherd_provider::Error> for ApiError {
    fn from(e: shepherd_provider::Error) -> Self {
        ApiError::from(shepherd_core::Error::from(e))
    }
}

impl ResponseError for ApiError {
    fn status_code(&self) -> StatusCode {
        StatusCode::from_u16(self.domain.status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
    }

    fn error_response(&self) -> HttpResponse {
        let message = if self.domain.is_public() || verbose() {
            self.domain.to_string()
        } else {
            "internal error".to_string()
        };
        let mut body = json!({
            "error": {
                "code": self.domain.code(),
                "message": message,
            }
        });
        if let DomainError::RateLimited {
            limit_type,
            current,
            max,
            retry_after_seconds,
        } = &self.domain
        {
            body["error"]["details"] = json!({
                "limit_type": limit_type,
                "current": current,
                "max": max,
                "retry_after_seconds": retry_after_seconds,
            });
        }
        HttpResponse::build(self.status_code()).json(body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn statuses_follow_the_taxonomy() {
        let e = ApiError::from(DomainError::NotFound("vm".into()));
        assert_eq!(e.status_code(), StatusCode::NOT_FOUND);
        let e = ApiError::from(DomainError::RateLimited {
            limit_type: "user_batch_cooldown".into(),
            current: 1,
            max: 1,
            retry_after_seconds: 90,
        });
        assert_eq!(e.status_code(), StatusCode::TOO_MANY_REQUESTS);
        let e = ApiError::from(DomainError::PreconditionFailed("confirm".into()));
        assert_eq!(e.status_code(), StatusCode::PRECONDITION_FAILED);
    }

    #[test]
    fn rate_limit_body_carries_retry_after() {
        let e = ApiError::from(DomainError::RateLimited {
            limit_type: "user_batch_cooldown".into(),
            current: 1,
            max: 1,
            retry_after_seconds: 90,
        });
        let resp = e.error_response();
        assert_eq!(resp.status(), StatusCode::TOO_MANY_REQUESTS);
    }
}
