//! Configuration loading and validation.

use crate::error::{ConfigError, Result};
use serde::Deserialize;
use std::time::Duration;

/// Worker configuration. Loaded once at startup; failure to load or
/// validate is fatal.
#[derive(Debug, Clone, Deserialize)]
pub struct WorkerConfig {
    pub etcd: EtcdConfig,
    pub log_store: LogStoreConfig,
    #[serde(default)]
    pub job_log: JobLogConfig,
    #[serde(default)]
    pub lease: LeaseConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EtcdConfig {
    pub endpoints: Vec<String>,
    #[serde(default = "default_dial_timeout_ms")]
    pub dial_timeout_ms: u64,
}

fn default_dial_timeout_ms() -> u64 {
    5_000
}

#[derive(Debug, Clone, Deserialize)]
pub struct LogStoreConfig {
    pub uri: String,
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
}

fn default_connect_timeout_ms() -> u64 {
    5_000
}

#[derive(Debug, Clone, Deserialize)]
pub struct JobLogConfig {
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_commit_timeout_ms")]
    pub commit_timeout_ms: u64,
}

fn default_batch_size() -> usize {
    20
}

fn default_commit_timeout_ms() -> u64 {
    500
}

impl Default for JobLogConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            commit_timeout_ms: default_commit_timeout_ms(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LeaseConfig {
    #[serde(default = "default_registrar_ttl")]
    pub registrar_lease_ttl_secs: i64,
    #[serde(default = "default_lock_ttl")]
    pub worker_lock_ttl_secs: i64,
}

fn default_registrar_ttl() -> i64 {
    10
}

fn default_lock_ttl() -> i64 {
    5
}

impl Default for LeaseConfig {
    fn default() -> Self {
        Self {
            registrar_lease_ttl_secs: default_registrar_ttl(),
            worker_lock_ttl_secs: default_lock_ttl(),
        }
    }
}

impl WorkerConfig {
    /// Load from an optional explicit path, falling back to `./worker.toml`,
    /// layered with `WORKER_`-prefixed environment variable overrides.
    pub fn load(path: Option<&std::path::Path>) -> Result<Self> {
        let default_path = std::path::PathBuf::from("worker.toml");
        let path = path.unwrap_or(&default_path);

        let builder = config::Config::builder()
            .add_source(config::File::from(path.to_path_buf()).required(false))
            .add_source(config::Environment::with_prefix("WORKER").separator("__"));

        let raw = builder.build().map_err(|e| ConfigError::Load {
            path: path.display().to_string(),
            source: Box::new(e),
        })?;

        let config: WorkerConfig = raw
            .try_deserialize()
            .map_err(|e| ConfigError::Invalid(e.to_string()))?;

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> std::result::Result<(), ConfigError> {
        if self.etcd.endpoints.is_empty() {
            return Err(ConfigError::MissingKey("etcd.endpoints".into()));
        }
        if self.job_log.batch_size == 0 {
            return Err(ConfigError::Invalid(
                "job_log.batch_size must be greater than zero".into(),
            ));
        }
        if self.lease.registrar_lease_ttl_secs <= 0 || self.lease.worker_lock_ttl_secs <= 0 {
            return Err(ConfigError::Invalid(
                "lease TTLs must be positive".into(),
            ));
        }
        Ok(())
    }

    pub fn commit_timeout(&self) -> Duration {
        Duration::from_millis(self.job_log.commit_timeout_ms)
    }

    pub fn dial_timeout(&self) -> Duration {
        Duration::from_millis(self.etcd.dial_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_empty_endpoints() {
        let config = WorkerConfig {
            etcd: EtcdConfig {
                endpoints: vec![],
                dial_timeout_ms: default_dial_timeout_ms(),
            },
            log_store: LogStoreConfig {
                uri: "postgres://localhost/worker".into(),
                connect_timeout_ms: default_connect_timeout_ms(),
            },
            job_log: JobLogConfig::default(),
            lease: LeaseConfig::default(),
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::MissingKey(_))
        ));
    }
}
