//! Publishes this worker's routable identity so the master can list live
//! workers. Runs forever; never exits while the process lives.

use crate::keys::worker_key;
use crate::store::CoordinationStore;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

const REGISTRAR_LEASE_TTL_SECS: i64 = 10;
const RETRY_DELAY: Duration = Duration::from_secs(1);

pub struct Registrar {
    store: Arc<dyn CoordinationStore>,
    worker_ip: String,
    lease_ttl_secs: i64,
}

impl Registrar {
    pub fn new(store: Arc<dyn CoordinationStore>, worker_ip: String, lease_ttl_secs: i64) -> Self {
        Self {
            store,
            worker_ip,
            lease_ttl_secs,
        }
    }

    pub fn with_defaults(store: Arc<dyn CoordinationStore>, worker_ip: String) -> Self {
        Self::new(store, worker_ip, REGISTRAR_LEASE_TTL_SECS)
    }

    /// Run the register-and-renew loop until `shutdown` fires. Any failure
    /// (lease grant, renewal loss, put) restarts the cycle from scratch after
    /// a short delay.
    pub async fn run(&self, shutdown: CancellationToken) {
        let key = worker_key(&self.worker_ip);

        loop {
            if shutdown.is_cancelled() {
                return;
            }

            match self.register_once(&key).await {
                Ok(mut lease) => {
                    info!(worker_ip = %self.worker_ip, "worker registered");
                    tokio::select! {
                        _ = shutdown.cancelled() => {
                            lease.cancel();
                            let _ = self.store.revoke_lease(lease.lease_id).await;
                            return;
                        }
                        _ = lease.renewal_lost() => {
                            warn!(worker_ip = %self.worker_ip, "lease renewal lost, re-registering");
                            let _ = self.store.revoke_lease(lease.lease_id).await;
                            tokio::select! {
                                _ = tokio::time::sleep(RETRY_DELAY) => {}
                                _ = shutdown.cancelled() => return,
                            }
                        }
                    }
                }
                Err(e) => {
                    warn!(error = %e, "worker registration failed, retrying");
                    tokio::select! {
                        _ = tokio::time::sleep(RETRY_DELAY) => {}
                        _ = shutdown.cancelled() => return,
                    }
                }
            }
        }
    }

    async fn register_once(
        &self,
        key: &str,
    ) -> Result<crate::store::LeaseHandle, crate::error::StoreError> {
        let lease = self.store.grant_lease(self.lease_ttl_secs).await?;
        if let Err(e) = self
            .store
            .put(key, self.worker_ip.as_bytes(), Some(lease.lease_id))
            .await
        {
            lease.cancel();
            error!(error = %e, "failed to publish worker key");
            return Err(e);
        }
        Ok(lease)
    }
}
