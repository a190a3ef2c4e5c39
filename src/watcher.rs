//! Translates coordination-store mutations on the jobs and killer prefixes
//! into [`JobEvent`]s for the scheduler.

use crate::error::StoreError;
use crate::keys::{extract_job_name, extract_killer_name, JOBS_PREFIX, KILLER_PREFIX};
use crate::model::{Job, JobEvent};
use crate::store::{CoordinationStore, WatchEvent};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, warn};

const EVENT_CHANNEL_CAPACITY: usize = 1000;

pub struct JobWatcher {
    store: Arc<dyn CoordinationStore>,
}

impl JobWatcher {
    pub fn new(store: Arc<dyn CoordinationStore>) -> Self {
        Self { store }
    }

    /// Spawn the jobs and killer subscriptions, returning the receiving end
    /// of the merged event stream. Both subscriptions run until the process
    /// exits; there is no explicit shutdown handshake because a worker that
    /// stops watching mid-life cannot safely keep scheduling.
    pub async fn run(&self) -> Result<mpsc::Receiver<JobEvent>, StoreError> {
        let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);

        self.spawn_jobs_subscription(tx.clone()).await?;
        self.spawn_killer_subscription(tx).await?;

        Ok(rx)
    }

    async fn spawn_jobs_subscription(&self, tx: mpsc::Sender<JobEvent>) -> Result<(), StoreError> {
        let existing = self.store.get_prefix(JOBS_PREFIX).await?;
        for kv in &existing.kvs {
            if extract_job_name(&kv.key).is_none() {
                continue;
            }
            match serde_json::from_slice::<Job>(&kv.value) {
                Ok(job) => {
                    let _ = tx.send(JobEvent::Save(job)).await;
                }
                Err(e) => warn!(key = %kv.key, error = %e, "failed to decode existing job"),
            }
        }

        // Resume the watch from the revision right after the snapshot read so
        // no mutation is missed or delivered twice.
        let mut watch_rx = self
            .store
            .watch_prefix(JOBS_PREFIX, existing.revision + 1)
            .await?;
        tokio::spawn(async move {
            while let Some(event) = watch_rx.recv().await {
                match event {
                    Ok(WatchEvent::Put(kv)) => {
                        let Some(name) = extract_job_name(&kv.key) else {
                            continue;
                        };
                        match serde_json::from_slice::<Job>(&kv.value) {
                            Ok(job) => {
                                debug!(job = %name, "job saved");
                                if tx.send(JobEvent::Save(job)).await.is_err() {
                                    return;
                                }
                            }
                            Err(e) => warn!(job = %name, error = %e, "failed to decode saved job"),
                        }
                    }
                    Ok(WatchEvent::Delete { key }) => {
                        let Some(name) = extract_job_name(&key) else {
                            continue;
                        };
                        debug!(job = %name, "job deleted");
                        if tx.send(JobEvent::Delete(name.to_string())).await.is_err() {
                            return;
                        }
                    }
                    Err(e) => {
                        warn!(error = %e, "jobs watch stream error, stopping subscription");
                        return;
                    }
                }
            }
        });

        Ok(())
    }

    async fn spawn_killer_subscription(
        &self,
        tx: mpsc::Sender<JobEvent>,
    ) -> Result<(), StoreError> {
        let mut watch_rx = self.store.watch_prefix(KILLER_PREFIX, 0).await?;
        tokio::spawn(async move {
            while let Some(event) = watch_rx.recv().await {
                match event {
                    Ok(WatchEvent::Put(kv)) => {
                        let Some(name) = extract_killer_name(&kv.key) else {
                            continue;
                        };
                        debug!(job = %name, "kill requested");
                        if tx.send(JobEvent::Kill(name.to_string())).await.is_err() {
                            return;
                        }
                    }
                    // Deletes on this prefix are expected lease expiries; ignore.
                    Ok(WatchEvent::Delete { .. }) => {}
                    Err(e) => {
                        warn!(error = %e, "killer watch stream error, stopping subscription");
                        return;
                    }
                }
            }
        });

        Ok(())
    }
}
