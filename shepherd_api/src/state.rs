//! Shared application state.
//!
//! One instance behind `web::Data`; handlers consume public impls only.
//! The login throttle is deliberately in-process: it protects the
//! password hasher, not a distributed invariant.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Duration, Utc};

use shepherd_core::crypto::SecretBox;
use shepherd_core::dispatch::ProviderRegistry;
use shepherd_core::{Db, WorkerPool};
use shepherd_definitions::ShepherdConfig;
use shepherd_provider::CacheStatus;

use crate::auth::JwtKeys;

/// Failed logins before the account is throttled
const LOCKOUT_THRESHOLD: u32 = 5;
/// Throttle duration
const LOCKOUT_MINUTES: i64 = 15;

#[derive(Default)]
struct LoginThrottle {
    failures: HashMap<String, (u32, DateTime<Utc>)>,
}

#[derive(Clone)]
pub struct AppState {
    pub db: Db,
    pub registry: Arc<ProviderRegistry>,
    pub jwt: JwtKeys,
    pub secrets: SecretBox,
    pub config: ShepherdConfig,
    pub general_pool: WorkerPool,
    pub cluster_pool: WorkerPool,
    throttle: Arc<Mutex<LoginThrottle>>,
}

impl AppState {
    pub fn new(
        db: Db,
        registry: Arc<ProviderRegistry>,
        jwt: JwtKeys,
        secrets: SecretBox,
        config: ShepherdConfig,
        general_pool: WorkerPool,
        cluster_pool: WorkerPool,
    ) -> Self {
        AppState {
            db,
            registry,
            jwt,
            secrets,
            config,
            general_pool,
            cluster_pool,
            throttle: Arc::new(Mutex::new(LoginThrottle::default())),
        }
    }

    /// Check the login throttle before touching the password hasher.
    pub fn login_allowed(&self, username: &str) -> bool {
        let g = self.throttle.lock().unwrap();
        match g.failures.get(username) {
            Some((count, since)) if *count >= LOCKOUT_THRESHOLD => {
                Utc::now() - *since > Duration::minutes(LOCKOUT_MINUTES)
            }
            _ => true,
        }
    }

    pub fn record_login_failure(&self, username: &str) {
        let mut g = self.throttle.lock().unwrap();
        let entry = g.failures.entry(username.to_string()).or_insert((0, Utc::now()));
        entry.0 += 1;
        entry.1 = Utc::now();
    }

    pub fn record_login_success(&self, username: &str) {
        self.throttle.lock().unwrap().failures.remove(username);
    }

    /// Cache freshness for a cluster, as reported on read responses.
    pub fn cache_status(&self, cluster_id: uuid::Uuid) -> Option<CacheStatus> {
        self.registry.cache(cluster_id).map(|c| c.status())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn throttle_trips_after_threshold() {
        let throttle = Arc::new(Mutex::new(LoginThrottle::default()));
        // exercise the raw structure without a full AppState
        {
            let mut g = throttle.lock().unwrap();
            g.failures.insert("mallory".into(), (LOCKOUT_THRESHOLD, Utc::now()));
        }
        let g = throttle.lock().unwrap();
        let (count, since) = g.failures["mallory"];
        assert!(count >= LOCKOUT_THRESHOLD);
        assert!(Utc::now() - since <= Duration::minutes(LOCKOUT_MINUTES));
    }
}
