//! Buffered, best-effort log commit. `append` never blocks execution: a full
//! queue silently drops records, and commit failures are logged, not
//! propagated.

use crate::error::LogStoreError;
use crate::model::{ExecuteResult, LogRecord};
use async_trait::async_trait;
use sqlx::PgPool;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::{Duration, Instant};
use tracing::error;

const APPEND_CHANNEL_CAPACITY: usize = 1000;

/// Pluggable commit backend. The concrete implementation here targets a SQL
/// store; nothing about the batching logic above this trait depends on the
/// choice of backend.
#[async_trait]
pub trait LogStore: Send + Sync {
    async fn commit_batch(&self, records: &[LogRecord]) -> Result<(), LogStoreError>;
}

pub struct PgLogStore {
    pool: PgPool,
}

impl PgLogStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl LogStore for PgLogStore {
    async fn commit_batch(&self, records: &[LogRecord]) -> Result<(), LogStoreError> {
        if records.is_empty() {
            return Ok(());
        }
        let mut tx = self.pool.begin().await?;
        for record in records {
            sqlx::query(
                r#"
                INSERT INTO job_logs
                    (job_name, command, err, output, plan_time, schedule_time, start_time, end_time)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
                "#,
            )
            .bind(&record.job_name)
            .bind(&record.command)
            .bind(&record.err)
            .bind(&record.output)
            .bind(record.plan_time)
            .bind(record.schedule_time)
            .bind(record.start_time)
            .bind(record.end_time)
            .execute(&mut *tx)
            .await
            .map_err(|source| LogStoreError::Commit {
                count: records.len(),
                source,
            })?;
        }
        tx.commit().await.map_err(|source| LogStoreError::Commit {
            count: records.len(),
            source,
        })?;
        Ok(())
    }
}

struct Batch {
    generation: u64,
    records: Vec<LogRecord>,
}

pub struct LogSink {
    append_tx: mpsc::Sender<LogRecord>,
}

impl LogSink {
    /// Spawn the writer task and return a handle whose `append` is the only
    /// public entry point callers need.
    pub fn spawn(store: Arc<dyn LogStore>, batch_size: usize, commit_timeout: Duration) -> Self {
        let (append_tx, append_rx) = mpsc::channel(APPEND_CHANNEL_CAPACITY);
        tokio::spawn(writer_loop(store, batch_size, commit_timeout, append_rx));
        Self { append_tx }
    }

    /// Non-blocking: drops the record if the channel is full rather than
    /// backpressuring the scheduler.
    pub fn append(&self, result: &ExecuteResult) {
        let record = LogRecord::from_result(result);
        if self.append_tx.try_send(record).is_err() {
            error!("log sink queue full, dropping record");
        }
    }
}

async fn writer_loop(
    store: Arc<dyn LogStore>,
    batch_size: usize,
    commit_timeout: Duration,
    mut append_rx: mpsc::Receiver<LogRecord>,
) {
    let (commit_tx, mut commit_rx) = mpsc::channel::<u64>(16);
    let mut current: Option<Batch> = None;
    let mut next_generation: u64 = 0;

    loop {
        tokio::select! {
            record = append_rx.recv() => {
                let Some(record) = record else {
                    if let Some(batch) = current.take() {
                        commit(&store, batch.records).await;
                    }
                    return;
                };

                let batch = current.get_or_insert_with(|| {
                    let generation = next_generation;
                    next_generation += 1;
                    arm_timer(commit_tx.clone(), generation, commit_timeout);
                    Batch { generation, records: Vec::new() }
                });
                batch.records.push(record);

                if batch.records.len() >= batch_size {
                    let batch = current.take().unwrap();
                    commit(&store, batch.records).await;
                }
            }
            Some(generation) = commit_rx.recv() => {
                // Stale timer: the batch it was armed for was already
                // committed by the size threshold, or a newer batch has
                // since started. Only the matching generation commits.
                if let Some(batch) = &current {
                    if batch.generation == generation {
                        let batch = current.take().unwrap();
                        commit(&store, batch.records).await;
                    }
                }
            }
        }
    }
}

fn arm_timer(commit_tx: mpsc::Sender<u64>, generation: u64, timeout: Duration) {
    tokio::spawn(async move {
        tokio::time::sleep_until(Instant::now() + timeout).await;
        let _ = commit_tx.send(generation).await;
    });
}

async fn commit(store: &Arc<dyn LogStore>, records: Vec<LogRecord>) {
    if records.is_empty() {
        return;
    }
    let count = records.len();
    if let Err(e) = store.commit_batch(&records).await {
        error!(count, error = %e, "failed to commit log batch");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ExecuteInfo, Job};
    use std::sync::Mutex;
    use tokio::time::sleep;

    #[derive(Default)]
    struct RecordingStore {
        batches: Mutex<Vec<Vec<LogRecord>>>,
    }

    #[async_trait]
    impl LogStore for RecordingStore {
        async fn commit_batch(&self, records: &[LogRecord]) -> Result<(), LogStoreError> {
            self.batches.lock().unwrap().push(records.to_vec());
            Ok(())
        }
    }

    fn sample_result(name: &str) -> ExecuteResult {
        let info = ExecuteInfo::new(
            Job {
                name: name.into(),
                command: "echo hi".into(),
                cron_expr: "* * * * * * *".into(),
            },
            chrono::Utc::now(),
        );
        ExecuteResult {
            info,
            output: b"hi\n".to_vec(),
            error: None,
            start_time: chrono::Utc::now(),
            end_time: chrono::Utc::now(),
        }
    }

    #[tokio::test]
    async fn commits_on_size_threshold() {
        let store = Arc::new(RecordingStore::default());
        let sink = LogSink::spawn(store.clone(), 2, Duration::from_secs(10));

        sink.append(&sample_result("a"));
        sink.append(&sample_result("b"));
        sleep(Duration::from_millis(50)).await;

        let batches = store.batches.lock().unwrap();
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].len(), 2);
    }

    #[tokio::test]
    async fn commits_on_timeout_when_under_size_threshold() {
        let store = Arc::new(RecordingStore::default());
        let sink = LogSink::spawn(store.clone(), 10, Duration::from_millis(50));

        sink.append(&sample_result("a"));
        sleep(Duration::from_millis(150)).await;

        let batches = store.batches.lock().unwrap();
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].len(), 1);
    }
}
