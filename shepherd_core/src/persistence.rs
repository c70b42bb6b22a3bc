//! Connection pool and the shared transaction primitive.
//!
//! Every write path in the governance core runs through [`Db::with_tx`];
//! the closure receives a `&mut PgConnection` that both the governance
//! query modules and the queue's query module accept, which is what makes
//! the ticket/event/audit/notification/job co-commit possible in one
//! physical transaction.

use std::time::Duration;

use futures::future::BoxFuture;
use log::{debug, warn};
use rand::Rng;
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgConnection, PgPool};

use shepherd_definitions::ShepherdConfig;

use crate::{is_serialization_failure, Error, Result};

/// Serialization failures are retried this many times before surfacing
const TX_RETRIES: u32 = 3;

/// Shared handle over the pool; cheap to clone.
#[derive(Clone)]
pub struct Db {
    pool: PgPool,
}

impl Db {
    pub async fn connect(cfg: &ShepherdConfig) -> Result<Db> {
        let pool = PgPoolOptions::new()
            .max_connections(cfg.max_db_connections)
            .acquire_timeout(Duration::from_secs(10))
            .connect(&cfg.database_url)
            .await?;
        Ok(Db { pool })
    }

    pub fn from_pool(pool: PgPool) -> Db {
        Db { pool }
    }

    /// Reads of a single statement go straight to the pool; never open a
    /// transaction for these.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Apply embedded migrations, including the autovacuum stability SQL.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| Error::Database(sqlx::Error::Migrate(Box::new(e))))?;
        Ok(())
    }

    /// Run `f` inside a transaction: commit on Ok, roll back on Err.
    ///
    /// Serialization failures (40001/40P01) retry up to [`TX_RETRIES`]
    /// times with jittered backoff. A panic inside `f` unwinds through
    /// here; the transaction guard rolls back on drop before the panic
    /// resurfaces. Deadline errors are not retried.
    pub async fn with_tx<T, F>(&self, f: F) -> Result<T>
    where
        F: for<'c> Fn(&'c mut PgConnection) -> BoxFuture<'c, Result<T>>,
    {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let mut tx = self.pool.begin().await.map_err(Error::from)?;
            match f(&mut tx).await {
                Ok(val) => match tx.commit().await {
                    Ok(()) => return Ok(val),
                    Err(e) if is_serialization_failure(&e) && attempt < TX_RETRIES => {
                        warn!("commit hit serialization failure, retrying (attempt {})", attempt);
                        tokio::time::sleep(tx_backoff(attempt)).await;
                    }
                    Err(e) => return Err(e.into()),
                },
                Err(e) => {
                    if let Err(re) = tx.rollback().await {
                        warn!("rollback failed: {}", re);
                    }
                    let retryable = matches!(
                        &e,
                        Error::Database(inner) if is_serialization_failure(inner)
                    );
                    if retryable && attempt < TX_RETRIES {
                        debug!("transaction serialization failure, retrying (attempt {})", attempt);
                        tokio::time::sleep(tx_backoff(attempt)).await;
                        continue;
                    }
                    return Err(e);
                }
            }
        }
    }
}

/// Full-jitter backoff for transaction retries: 0..(50ms << attempt)
fn tx_backoff(attempt: u32) -> Duration {
    let ceiling = 50u64.saturating_mul(1 << attempt.min(6));
    let ms = rand::thread_rng().gen_range(0..=ceiling);
    Duration::from_millis(ms)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tx_backoff_stays_bounded() {
        for attempt in 1..10 {
            let d = tx_backoff(attempt);
            assert!(d <= Duration::from_millis(50 * 64));
        }
    }
}
