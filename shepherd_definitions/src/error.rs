use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// The control plane error taxonomy.
///
/// Each kind maps to exactly one HTTP status at the boundary. Crates further
/// out wrap this type with their transport errors (sqlx, kube) and classify
/// into these kinds as early as possible, so handlers and the worker only
/// ever branch on kinds.
#[derive(Debug, Error)]
pub enum Error {
    /// Malformed input or a failed structural check
    #[error("{0}")]
    Validation(String),

    /// Missing or invalid token
    #[error("authentication required")]
    Unauthorized,

    /// Permission or resource role insufficient
    #[error("{0}")]
    Forbidden(String),

    /// Referenced entity absent
    #[error("{0} not found")]
    NotFound(String),

    /// Unique conflict, or a transition refused from a terminal state
    #[error("{0}")]
    Conflict(String),

    /// A rate limit window is full; carries everything a 429 needs
    #[error("rate limit {limit_type} exceeded ({current}/{max})")]
    RateLimited {
        limit_type: String,
        current: i64,
        max: i64,
        retry_after_seconds: u64,
    },

    /// Confirm-name mismatch, namespace/environment mismatch
    #[error("{0}")]
    PreconditionFailed(String),

    /// Circuit open, cluster unreachable, or cache rebuilding on a write
    #[error("{0}")]
    ServiceUnavailable(String),

    /// External resource missing critical fields during mapping
    #[error("incompatible schema: {0}")]
    IncompatibleSchema(String),

    /// Everything else; detail is logged server side, never echoed in prod
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Stable machine-readable code for the response envelope
    pub fn code(&self) -> &'static str {
        match self {
            Error::Validation(_) => "validation_failed",
            Error::Unauthorized => "unauthorized",
            Error::Forbidden(_) => "forbidden",
            Error::NotFound(_) => "not_found",
            Error::Conflict(_) => "conflict",
            Error::RateLimited { .. } => "rate_limited",
            Error::PreconditionFailed(_) => "precondition_failed",
            Error::ServiceUnavailable(_) => "service_unavailable",
            Error::IncompatibleSchema(_) => "incompatible_schema",
            Error::Internal(_) => "internal_error",
        }
    }

    /// HTTP status the boundary renders for this kind
    pub fn status(&self) -> u16 {
        match self {
            Error::Validation(_) => 400,
            Error::Unauthorized => 401,
            Error::Forbidden(_) => 403,
            Error::NotFound(_) => 404,
            Error::Conflict(_) => 409,
            Error::PreconditionFailed(_) => 412,
            Error::RateLimited { .. } => 429,
            Error::ServiceUnavailable(_) => 503,
            Error::IncompatibleSchema(_) => 500,
            Error::Internal(_) => 500,
        }
    }

    /// Whether the client may safely show the message verbatim.
    ///
    /// Internal and schema errors get a generic message in production.
    pub fn is_public(&self) -> bool {
        !matches!(self, Error::Internal(_) | Error::IncompatibleSchema(_))
    }
}

/// Shorthand for the most common rejection
pub fn validation<S: Into<String>>(msg: S) -> Error {
    Error::Validation(msg.into())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_map_to_expected_statuses() {
        assert_eq!(Error::Validation("x".into()).status(), 400);
        assert_eq!(Error::Unauthorized.status(), 401);
        assert_eq!(Error::Forbidden("x".into()).status(), 403);
        assert_eq!(Error::NotFound("vm".into()).status(), 404);
        assert_eq!(Error::Conflict("x".into()).status(), 409);
        assert_eq!(Error::PreconditionFailed("x".into()).status(), 412);
        let rl = Error::RateLimited {
            limit_type: "user_batch_cooldown".into(),
            current: 3,
            max: 3,
            retry_after_seconds: 42,
        };
        assert_eq!(rl.status(), 429);
        assert_eq!(rl.code(), "rate_limited");
        assert_eq!(Error::ServiceUnavailable("x".into()).status(), 503);
        assert_eq!(Error::Internal("x".into()).status(), 500);
    }

    #[test]
    fn internal_detail_is_not_public() {
        assert!(!Error::Internal("pg connection refused".into()).is_public());
        assert!(Error::NotFound("ticket".into()).is_public());
    }
}
