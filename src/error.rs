//! Top-level error types for the worker.

pub type Result<T> = std::result::Result<T, Error>;

/// Top-level error enum wrapping domain-specific errors.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Lock(#[from] LockError),

    #[error(transparent)]
    Cron(#[from] CronError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Configuration loading errors. Fatal at startup; never retried.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to load config from {path}: {source}")]
    Load {
        path: String,
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error("invalid configuration: {0}")]
    Invalid(String),

    #[error("missing required config key: {0}")]
    MissingKey(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Coordination-store errors (connect, watch, lease, txn).
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("failed to connect to coordination store: {0}")]
    Connect(String),

    #[error("lease grant failed: {0}")]
    LeaseGrant(String),

    #[error("lease keep-alive channel closed")]
    KeepAliveClosed,

    #[error("watch stream closed unexpectedly")]
    WatchClosed,

    #[error("transaction failed: {0}")]
    Txn(String),

    #[error("get failed: {0}")]
    Get(String),

    #[error("put failed: {0}")]
    Put(String),

    #[error("failed to decode value at key {key}: {source}")]
    Decode {
        key: String,
        source: serde_json::Error,
    },

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Distributed-lock errors.
#[derive(Debug, thiserror::Error)]
pub enum LockError {
    /// Another worker already holds the lock for this firing. Expected and
    /// common; callers must not log this as a failure.
    #[error("lock already held")]
    AlreadyHeld,

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Cron-expression parsing errors.
#[derive(Debug, thiserror::Error)]
pub enum CronError {
    #[error("invalid cron expression {expr:?}: {reason}")]
    Parse { expr: String, reason: String },

    #[error("cron expression {0:?} has no future occurrence")]
    NoUpcoming(String),
}

/// Log-store (sink backend) errors. Always recovered locally; never fatal.
#[derive(Debug, thiserror::Error)]
pub enum LogStoreError {
    #[error("failed to connect to log store: {0}")]
    Connect(#[from] sqlx::Error),

    #[error("failed to commit batch of {count} records: {source}")]
    Commit { count: usize, source: sqlx::Error },
}
