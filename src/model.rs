//! Core data types shared by the scheduler, executor, and log sink.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

/// A user-defined periodic shell job, as published by the master under
/// `jobs/<name>`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Job {
    pub name: String,
    pub command: String,
    pub cron_expr: String,
}

/// The scheduler's live view of a [`Job`]: the parsed schedule plus the next
/// time it is due to fire. Owned exclusively by the scheduler loop.
#[derive(Debug, Clone)]
pub struct SchedulePlan {
    pub job: Job,
    pub next_fire_time: DateTime<Utc>,
}

/// One firing of a job, from dispatch to result. Created by the scheduler,
/// consumed by the executor, and removed from the executing table when its
/// matching [`ExecuteResult`] arrives.
#[derive(Debug, Clone)]
pub struct ExecuteInfo {
    pub job: Job,
    /// When the cron schedule said this firing was due.
    pub plan_time: DateTime<Utc>,
    /// Wall clock at the moment the scheduler dispatched it.
    pub real_time: DateTime<Utc>,
    /// Triggered by a `Kill` event; cancels the in-flight child process.
    pub cancel: CancellationToken,
}

impl ExecuteInfo {
    pub fn new(job: Job, plan_time: DateTime<Utc>) -> Self {
        Self {
            job,
            plan_time,
            real_time: Utc::now(),
            cancel: CancellationToken::new(),
        }
    }
}

/// The outcome of one firing, reported back to the scheduler.
#[derive(Debug, Clone)]
pub struct ExecuteResult {
    pub info: ExecuteInfo,
    pub output: Vec<u8>,
    pub error: Option<ExecError>,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
}

/// Distinguishes the one error that must never produce a log record from
/// every other execution failure.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ExecError {
    #[error("lock already held by another worker")]
    LockAlreadyHeld,
    #[error("execution cancelled")]
    Cancelled,
    #[error("{0}")]
    Failed(String),
}

/// Events the watcher delivers to the scheduler. The only channel by which
/// external state enters the scheduler loop.
#[derive(Debug, Clone)]
pub enum JobEvent {
    Save(Job),
    Delete(String),
    Kill(String),
}

/// A completed firing, shaped for the log store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogRecord {
    pub job_name: String,
    pub command: String,
    pub err: String,
    pub output: String,
    /// Epoch milliseconds.
    pub plan_time: i64,
    /// Epoch milliseconds.
    pub schedule_time: i64,
    /// Epoch milliseconds.
    pub start_time: i64,
    /// Epoch milliseconds.
    pub end_time: i64,
}

impl LogRecord {
    pub fn from_result(result: &ExecuteResult) -> Self {
        Self {
            job_name: result.info.job.name.clone(),
            command: result.info.job.command.clone(),
            err: result
                .error
                .as_ref()
                .map(|e| e.to_string())
                .unwrap_or_default(),
            output: String::from_utf8_lossy(&result.output).into_owned(),
            plan_time: result.info.plan_time.timestamp_millis(),
            schedule_time: result.info.real_time.timestamp_millis(),
            start_time: result.start_time.timestamp_millis(),
            end_time: result.end_time.timestamp_millis(),
        }
    }
}
