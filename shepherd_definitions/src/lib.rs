//! Shared domain definitions for the shepherd control plane.
//!
//! Everything in this crate is plain data: status enums with explicit
//! transition rules, the error taxonomy, validated config structs, and the
//! policy tables that drive approvals. No I/O happens here; the core and
//! provider crates wire these types to postgres and kubernetes.

/// Error taxonomy shared by every layer
pub mod error;
pub use error::{Error, Result};

/// The two-valued environment label that drives policy
pub mod environment;
pub use environment::Environment;

/// Runtime configuration, env-var driven with an optional file
pub mod config;
pub use config::ShepherdConfig;

/// Approval tickets and their state machine
pub mod ticket;
pub use ticket::{ApprovalTicket, OperationType, TicketStatus};

/// Domain events owned by tickets
pub mod event;
pub use event::{DomainEvent, EventStatus};

/// Batch parents and their derived status
pub mod batch;
pub use batch::{BatchStatus, BatchTicket};

/// Cluster records, health states and the feature GA table
pub mod cluster;
pub use cluster::{Cluster, ClusterHealth};

/// Namespace registry entries
pub mod namespace;
pub use namespace::NamespaceRecord;

/// Versioned VM templates
pub mod template;
pub use template::{Template, TemplateStatus};

/// Instance sizes and capability requirements
pub mod instance_size;
pub use instance_size::{Capability, InstanceSize};

/// Roles, permissions and bindings
pub mod rbac;
pub use rbac::{Permission, ResourceRole, ResourceType, Role};

/// Platform users
pub mod user;
pub use user::User;

/// Audit actions, retention and redaction
pub mod audit;
pub use audit::{AuditAction, AuditEntry};

/// In-app notification rows
pub mod notification;
pub use notification::{Notification, NotificationKind};

/// VM requests, specs and the resource hierarchy
pub mod vm;
pub use vm::{PowerAction, Service, System, VmRecord, VmRequest};

/// Admin modification rules for approved specs
pub mod modification;

/// Externally created resources awaiting adoption
pub mod adoption;
pub use adoption::{AdoptionStatus, PendingAdoption};

/// Rate limit types, defaults and window arithmetic
pub mod ratelimit;
pub use ratelimit::{LimitType, RateLimits};
