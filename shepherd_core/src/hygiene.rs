//! Retention loops: queue row cleanup, event archival, stale rate-limit
//! windows.
//!
//! The aggressive autovacuum settings in the migrations are the other
//! half of this; deletes here only pay off because the dead tuples get
//! vacuumed promptly.

use std::time::Duration;

use log::{info, warn};
use tokio::sync::watch;

use crate::{db, queue, Db, Result};

/// How often the cleaner wakes up
const CLEAN_EVERY: Duration = Duration::from_secs(300);
/// Terminal events leave the hot indexes after this many days
const EVENT_ARCHIVE_DAYS: i64 = 7;
/// Rate windows older than this are dead weight
const WINDOW_RETENTION_HOURS: i64 = 24;
/// Running jobs older than this lost their worker and get rescued
const STUCK_AFTER_SECS: i64 = 15 * 60;

pub async fn run(db: Db, mut shutdown: watch::Receiver<bool>) {
    info!("hygiene loop started");
    loop {
        tokio::select! {
            _ = tokio::time::sleep(CLEAN_EVERY) => {}
            _ = shutdown.changed() => break,
        }
        if let Err(e) = sweep(&db).await {
            warn!("hygiene sweep failed: {}", e);
        }
    }
    info!("hygiene loop stopped");
}

pub async fn sweep(db: &Db) -> Result<()> {
    let rescued = queue::rescue_stuck(db.pool(), STUCK_AFTER_SECS).await?;
    if rescued > 0 {
        info!("hygiene: rescued {} jobs from dead workers", rescued);
    }
    let removed = queue::cleanup(db.pool()).await?;
    if removed > 0 {
        info!("hygiene: removed {} settled queue rows", removed);
    }
    let (archived, windows) = db
        .with_tx(|conn| {
            Box::pin(async move {
                let archived = db::events::archive_terminal(conn, EVENT_ARCHIVE_DAYS).await?;
                let windows =
                    db::ratelimits::cleanup_windows(conn, WINDOW_RETENTION_HOURS).await?;
                Ok((archived, windows))
            })
        })
        .await?;
    if archived > 0 || windows > 0 {
        info!("hygiene: archived {} events, dropped {} rate windows", archived, windows);
    }
    Ok(())
}
