//! Runs dispatched firings: jitter, distributed lock, shell execution,
//! cancellation, result reporting.

use crate::lock::JobLock;
use crate::model::{ExecError, ExecuteInfo, ExecuteResult};
use crate::store::CoordinationStore;
use chrono::Utc;
use rand::Rng as _;
use std::io::Read;
use std::sync::Arc;
use std::time::Duration;
use tokio::process::Command;
use tokio::sync::mpsc;
use tracing::{info, warn};

/// Upper bound of the randomized pre-lock delay. Load-bearing: without it,
/// every worker observing the same fire-tick hits the store at once.
const MAX_JITTER_MS: u64 = 1000;

pub struct Executor {
    store: Arc<dyn CoordinationStore>,
    lock_ttl_secs: i64,
}

impl Executor {
    pub fn new(store: Arc<dyn CoordinationStore>, lock_ttl_secs: i64) -> Self {
        Self {
            store,
            lock_ttl_secs,
        }
    }

    /// Pull dispatched firings off `dispatch_rx` and run each as an
    /// independent concurrent task, forwarding its result to `result_tx`.
    pub async fn run(
        self: Arc<Self>,
        mut dispatch_rx: mpsc::Receiver<ExecuteInfo>,
        result_tx: mpsc::Sender<ExecuteResult>,
    ) {
        while let Some(info) = dispatch_rx.recv().await {
            let this = self.clone();
            let result_tx = result_tx.clone();
            tokio::spawn(async move {
                let result = this.execute(info).await;
                let _ = result_tx.send(result).await;
            });
        }
    }

    async fn execute(&self, info: ExecuteInfo) -> ExecuteResult {
        let mut start_time = Utc::now();
        let job_name = info.job.name.clone();

        let jitter_ms = rand::rng().random_range(0..=MAX_JITTER_MS);
        tokio::select! {
            _ = tokio::time::sleep(Duration::from_millis(jitter_ms)) => {}
            _ = info.cancel.cancelled() => {
                return self.cancelled_result(info, start_time);
            }
        }

        let mut lock = JobLock::new(self.store.clone(), &job_name, self.lock_ttl_secs);
        if let Err(e) = lock.try_lock().await {
            let error = match e {
                crate::error::LockError::AlreadyHeld => ExecError::LockAlreadyHeld,
                crate::error::LockError::Store(source) => ExecError::Failed(source.to_string()),
            };
            let end_time = Utc::now();
            return ExecuteResult {
                info,
                output: Vec::new(),
                error: Some(error),
                start_time,
                end_time,
            };
        }

        // Only count actual execution time, not queueing/jitter/lock wait.
        start_time = Utc::now();
        info!(job = %job_name, "firing");

        let result = self.run_command(&info).await;
        let _ = lock.unlock().await;

        let (output, error) = result;
        ExecuteResult {
            info,
            output,
            error,
            start_time,
            end_time: Utc::now(),
        }
    }

    async fn run_command(&self, info: &ExecuteInfo) -> (Vec<u8>, Option<ExecError>) {
        // stdout and stderr share one pipe so captured bytes preserve the
        // order they were actually written in, matching CombinedOutput.
        let (reader, writer) = match os_pipe::pipe() {
            Ok(pair) => pair,
            Err(e) => return (Vec::new(), Some(ExecError::Failed(e.to_string()))),
        };
        let writer_clone = match writer.try_clone() {
            Ok(w) => w,
            Err(e) => return (Vec::new(), Some(ExecError::Failed(e.to_string()))),
        };

        // Dropping the `child` below (the cancellation branch of the select)
        // drops the owned `Child`, which `kill_on_drop` turns into a kill of
        // the underlying process.
        let mut child = match Command::new("/bin/bash")
            .arg("-c")
            .arg(&info.job.command)
            .stdout(writer)
            .stderr(writer_clone)
            .kill_on_drop(true)
            .spawn()
        {
            Ok(child) => child,
            Err(e) => {
                warn!(job = %info.job.name, error = %e, "failed to spawn job command");
                return (Vec::new(), Some(ExecError::Failed(e.to_string())));
            }
        };

        // Our copies of the write end were moved into the builder above and
        // dropped at the end of that statement; only the child's duplicated
        // descriptors keep the pipe open now, so this read unblocks exactly
        // when the child closes both streams.
        let output_task = tokio::task::spawn_blocking(move || {
            let mut reader = reader;
            let mut buf = Vec::new();
            let _ = reader.read_to_end(&mut buf);
            buf
        });

        tokio::select! {
            status = child.wait() => {
                let output = output_task.await.unwrap_or_default();
                match status {
                    Ok(status) if status.success() => (output, None),
                    Ok(status) => (
                        output,
                        Some(ExecError::Failed(format!("exited with status {status}"))),
                    ),
                    Err(e) => (output, Some(ExecError::Failed(e.to_string()))),
                }
            }
            _ = info.cancel.cancelled() => {
                (Vec::new(), Some(ExecError::Cancelled))
            }
        }
    }

    fn cancelled_result(
        &self,
        info: ExecuteInfo,
        start_time: chrono::DateTime<Utc>,
    ) -> ExecuteResult {
        ExecuteResult {
            info,
            output: Vec::new(),
            error: Some(ExecError::Cancelled),
            start_time,
            end_time: Utc::now(),
        }
    }
}
