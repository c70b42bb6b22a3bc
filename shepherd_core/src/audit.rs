//! Transactional audit append.
//!
//! Every governance-visible change calls [`append`] on the transaction
//! that performs the change, so the audit trail can never diverge from
//! the state it describes. Redaction runs here, before the row exists.

use chrono::Utc;
use serde_json::Value;
use sqlx::PgConnection;
use uuid::Uuid;

use shepherd_definitions::audit::{redact, AuditAction, AuditEntry};
use shepherd_definitions::rbac::ResourceType;
use shepherd_definitions::Environment;

use crate::{db, Result};

/// Request-scoped context carried from the HTTP boundary into audit rows.
#[derive(Clone, Debug, Default)]
pub struct RequestContext {
    pub ip: Option<String>,
    pub user_agent: Option<String>,
}

/// Builder for one audit row.
pub struct Audit<'a> {
    pub action: AuditAction,
    pub actor_id: Uuid,
    pub resource: Option<(ResourceType, Uuid, &'a str)>,
    pub parent: Option<(ResourceType, Uuid)>,
    pub environment: Option<Environment>,
    pub details: Value,
    pub context: Option<&'a RequestContext>,
}

impl<'a> Audit<'a> {
    pub fn new(action: AuditAction, actor_id: Uuid) -> Self {
        Audit {
            action,
            actor_id,
            resource: None,
            parent: None,
            environment: None,
            details: Value::Null,
            context: None,
        }
    }

    pub fn resource(mut self, t: ResourceType, id: Uuid, name: &'a str) -> Self {
        self.resource = Some((t, id, name));
        self
    }

    pub fn parent(mut self, t: ResourceType, id: Uuid) -> Self {
        self.parent = Some((t, id));
        self
    }

    pub fn environment(mut self, env: Environment) -> Self {
        self.environment = Some(env);
        self
    }

    pub fn details(mut self, details: Value) -> Self {
        self.details = details;
        self
    }

    pub fn context(mut self, ctx: &'a RequestContext) -> Self {
        self.context = Some(ctx);
        self
    }
}

/// Append one row on the caller's transaction. Details are redacted
/// unconditionally.
pub async fn append(conn: &mut PgConnection, audit: Audit<'_>) -> Result<()> {
    let entry = AuditEntry {
        id: Uuid::new_v4(),
        action: audit.action,
        actor_id: audit.actor_id,
        resource_type: audit.resource.map(|(t, _, _)| t),
        resource_id: audit.resource.map(|(_, id, _)| id),
        resource_name: audit.resource.map(|(_, _, n)| n.to_string()),
        parent_type: audit.parent.map(|(t, _)| t),
        parent_id: audit.parent.map(|(_, id)| id),
        environment: audit.environment,
        details: redact(&audit.details),
        ip: audit.context.and_then(|c| c.ip.clone()),
        user_agent: audit.context.and_then(|c| c.user_agent.clone()),
        created_at: Utc::now(),
    };
    db::audit::insert(conn, &entry).await
}
