//! The governance core.
//!
//! Everything durable lives behind [`persistence::Db`]: tickets, events,
//! the job queue, audit, notifications and the rbac tables. The central
//! contract is the atomic co-commit: a governance decision and its queue
//! entry are inserted through one physical transaction, so an event exists
//! as "enqueued" iff its job row exists iff its ticket exists.

use thiserror::Error as ThisError;

pub type Result<T> = std::result::Result<T, Error>;

/// Core-layer error: the domain taxonomy plus classified transport errors.
#[derive(Debug, ThisError)]
pub enum Error {
    #[error(transparent)]
    Domain(shepherd_definitions::Error),

    #[error("database error: {0}")]
    Database(#[source] sqlx::Error),

    #[error(transparent)]
    Provider(#[from] shepherd_provider::Error),
}

impl From<shepherd_definitions::Error> for Error {
    fn from(e: shepherd_definitions::Error) -> Self {
        Error::Domain(e)
    }
}

impl From<sqlx::Error> for Error {
    fn from(e: sqlx::Error) -> Self {
        use shepherd_definitions::Error as D;
        match &e {
            sqlx::Error::RowNotFound => Error::Domain(D::NotFound("record".into())),
            sqlx::Error::Database(db) => match db.kind() {
                sqlx::error::ErrorKind::UniqueViolation => {
                    Error::Domain(D::Conflict("already exists".into()))
                }
                sqlx::error::ErrorKind::ForeignKeyViolation => {
                    Error::Domain(D::Conflict("operation violates a reference constraint".into()))
                }
                _ => Error::Database(e),
            },
            _ => Error::Database(e),
        }
    }
}

impl Error {
    /// View of the domain kind, when classification reached one
    pub fn domain(&self) -> Option<&shepherd_definitions::Error> {
        match self {
            Error::Domain(d) => Some(d),
            Error::Provider(shepherd_provider::Error::Domain(d)) => Some(d),
            _ => None,
        }
    }

    /// Worker-facing classification: retry with backoff, or fail the
    /// ticket permanently.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Provider(p) => p.is_retryable(),
            Error::Database(e) => is_serialization_failure(e) || is_transient_db_error(e),
            Error::Domain(shepherd_definitions::Error::ServiceUnavailable(_)) => true,
            Error::Domain(_) => false,
        }
    }
}

/// Postgres serialization/deadlock failures worth retrying the transaction
pub(crate) fn is_serialization_failure(e: &sqlx::Error) -> bool {
    match e {
        sqlx::Error::Database(db) => {
            matches!(db.code().as_deref(), Some("40001") | Some("40P01"))
        }
        _ => false,
    }
}

fn is_transient_db_error(e: &sqlx::Error) -> bool {
    matches!(
        e,
        sqlx::Error::PoolTimedOut | sqlx::Error::Io(_) | sqlx::Error::PoolClosed
    )
}

/// Connection pool + the transaction primitive
pub mod persistence;
pub use persistence::Db;

/// Plain query modules, one per table family
pub mod db;

/// Durable job queue with skip-locked claims
pub mod queue;
pub use queue::{Job, JobKind, JobState};

/// Bounded cooperative worker pool
pub mod workers;
pub use workers::WorkerPool;

/// Actor resolution and permission checks
pub mod rbac;
pub use rbac::Actor;

/// Ticket state machine and the atomic write path
pub mod governance;

/// Batch parents, children and their counters
pub mod batch;

/// Two-layer rate limiting
pub mod ratelimit;

/// Event dispatcher invoked by queue workers
pub mod dispatch;

/// Transactional audit append with redaction
pub mod audit;

/// Transactional inbox writes
pub mod notify;

/// Password hashing and user management
pub mod users;

/// Idempotent first-boot seeding
pub mod seed;

/// Credential sealing and key persistence
pub mod crypto;

/// Per-cluster health and capability detection loop
pub mod detector;

/// Orphan discovery / adoption sweep
pub mod reconcile;

/// Queue retention and event archival loops
pub mod hygiene;
