//! Transactional inbox writes.
//!
//! Inserts ride the caller's transaction, same contract as audit. Any
//! realtime channel layered on top is a hint only; clients re-fetch the
//! canonical rows through the read API.

use chrono::Utc;
use serde_json::Value;
use sqlx::PgConnection;
use uuid::Uuid;

use shepherd_definitions::notification::{Notification, NotificationKind};

use crate::{db, Result};

/// Insert one notification row for a recipient.
pub async fn push(
    conn: &mut PgConnection,
    recipient: Uuid,
    kind: NotificationKind,
    title: &str,
    body: &str,
    metadata: Value,
) -> Result<()> {
    let n = Notification {
        id: Uuid::new_v4(),
        recipient,
        kind,
        title: title.into(),
        body: body.into(),
        metadata,
        read: false,
        created_at: Utc::now(),
        read_at: None,
    };
    db::notifications::insert(conn, &n).await
}

/// Same payload to several recipients; used for approver fan-out.
pub async fn push_many(
    conn: &mut PgConnection,
    recipients: &[Uuid],
    kind: NotificationKind,
    title: &str,
    body: &str,
    metadata: &Value,
) -> Result<()> {
    for recipient in recipients {
        push(conn, *recipient, kind, title, body, metadata.clone()).await?;
    }
    Ok(())
}
