use std::env;
use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

fn default_port() -> u16 {
    8080
}
fn default_log_level() -> String {
    "info".into()
}
fn default_general_pool() -> usize {
    100
}
fn default_cluster_pool() -> usize {
    50
}
fn default_db_connections() -> u32 {
    20
}
fn default_completed_retention_hours() -> i64 {
    24
}
fn default_discarded_retention_days() -> i64 {
    7
}
fn default_request_timeout_secs() -> u64 {
    30
}
fn default_worker_timeout_secs() -> u64 {
    600
}
fn default_state_dir() -> String {
    "/var/lib/shepherd".into()
}

/// Runtime configuration.
///
/// Sourced from an optional YAML file (`SHEPHERD_CONFIG`) with environment
/// variables taking precedence, the same way the deploy charts feed it.
#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(deny_unknown_fields)]
pub struct ShepherdConfig {
    /// Postgres connection string (required)
    pub database_url: String,

    #[serde(default = "default_port")]
    pub server_port: u16,

    /// One of debug, info, warn, error
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// 32-byte key (base64) sealing cluster credentials at rest.
    ///
    /// Generated and persisted under `state_dir` when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub encryption_key: Option<String>,

    /// JWT signing secret, at least 32 bytes. Generated when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_secret: Option<String>,

    #[serde(default = "default_general_pool")]
    pub general_pool_size: usize,

    /// Caps concurrent pressure on cluster APIs
    #[serde(default = "default_cluster_pool")]
    pub cluster_pool_size: usize,

    #[serde(default = "default_db_connections")]
    pub max_db_connections: u32,

    #[serde(default = "default_completed_retention_hours")]
    pub completed_retention_hours: i64,

    #[serde(default = "default_discarded_retention_days")]
    pub discarded_retention_days: i64,

    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,

    #[serde(default = "default_worker_timeout_secs")]
    pub worker_timeout_secs: u64,

    /// Where generated keys are persisted across restarts
    #[serde(default = "default_state_dir")]
    pub state_dir: String,

    /// Detailed error bodies outside prod deployments
    #[serde(default)]
    pub verbose_errors: bool,
}

impl ShepherdConfig {
    /// Load from `SHEPHERD_CONFIG` (if set) then apply env overrides.
    pub fn load() -> Result<Self> {
        let mut cfg: ShepherdConfig = match env::var("SHEPHERD_CONFIG") {
            Ok(path) => {
                let raw = fs::read_to_string(Path::new(&path)).map_err(|e| {
                    Error::Internal(format!("cannot read config file {}: {}", path, e))
                })?;
                serde_yaml::from_str(&raw)
                    .map_err(|e| Error::Internal(format!("invalid config file {}: {}", path, e)))?
            }
            Err(_) => ShepherdConfig {
                database_url: String::new(),
                server_port: default_port(),
                log_level: default_log_level(),
                encryption_key: None,
                session_secret: None,
                general_pool_size: default_general_pool(),
                cluster_pool_size: default_cluster_pool(),
                max_db_connections: default_db_connections(),
                completed_retention_hours: default_completed_retention_hours(),
                discarded_retention_days: default_discarded_retention_days(),
                request_timeout_secs: default_request_timeout_secs(),
                worker_timeout_secs: default_worker_timeout_secs(),
                state_dir: default_state_dir(),
                verbose_errors: false,
            },
        };
        cfg.apply_env();
        cfg.verify()?;
        Ok(cfg)
    }

    fn apply_env(&mut self) {
        if let Ok(v) = env::var("DATABASE_URL") {
            self.database_url = v;
        }
        if let Ok(v) = env::var("SERVER_PORT") {
            if let Ok(p) = v.parse() {
                self.server_port = p;
            }
        }
        if let Ok(v) = env::var("LOG_LEVEL") {
            self.log_level = v;
        }
        if let Ok(v) = env::var("ENCRYPTION_KEY") {
            self.encryption_key = Some(v);
        }
        if let Ok(v) = env::var("SESSION_SECRET") {
            self.session_secret = Some(v);
        }
        if let Ok(v) = env::var("SHEPHERD_STATE_DIR") {
            self.state_dir = v;
        }
        if let Ok(v) = env::var("SHEPHERD_VERBOSE_ERRORS") {
            self.verbose_errors = v == "1" || v.eq_ignore_ascii_case("true");
        }
    }

    /// Reject configurations that cannot possibly run.
    pub fn verify(&self) -> Result<()> {
        if self.database_url.is_empty() {
            return Err(Error::Validation("DATABASE_URL must be set".into()));
        }
        if !matches!(self.log_level.as_str(), "debug" | "info" | "warn" | "error") {
            return Err(Error::Validation(format!(
                "log_level '{}' must be one of debug, info, warn, error",
                self.log_level
            )));
        }
        if self.general_pool_size == 0 || self.cluster_pool_size == 0 {
            return Err(Error::Validation("worker pool sizes must be non-zero".into()));
        }
        if let Some(secret) = &self.session_secret {
            if secret.len() < 32 {
                return Err(Error::Validation(
                    "SESSION_SECRET must be at least 32 bytes".into(),
                ));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base() -> ShepherdConfig {
        ShepherdConfig {
            database_url: "postgres://shepherd@localhost/shepherd".into(),
            server_port: 8080,
            log_level: "info".into(),
            encryption_key: None,
            session_secret: None,
            general_pool_size: 100,
            cluster_pool_size: 50,
            max_db_connections: 20,
            completed_retention_hours: 24,
            discarded_retention_days: 7,
            request_timeout_secs: 30,
            worker_timeout_secs: 600,
            state_dir: "/tmp/shepherd".into(),
            verbose_errors: false,
        }
    }

    #[test]
    fn verify_rejects_missing_database_url() {
        let mut cfg = base();
        cfg.database_url.clear();
        assert!(cfg.verify().is_err());
    }

    #[test]
    fn verify_rejects_bad_log_level_and_short_secret() {
        let mut cfg = base();
        cfg.log_level = "trace".into();
        assert!(cfg.verify().is_err());
        cfg.log_level = "debug".into();
        cfg.session_secret = Some("short".into());
        assert!(cfg.verify().is_err());
        cfg.session_secret = Some("x".repeat(32));
        assert!(cfg.verify().is_ok());
    }
}
