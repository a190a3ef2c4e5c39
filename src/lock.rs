//! Distributed per-job mutual exclusion.
//!
//! A `JobLock` claims `lock/<name>` for the duration of one firing. Acquiring
//! it grants a lease, renews it in the background, and attempts a
//! create-revision-zero transaction; losing that race is the expected,
//! non-error outcome [`LockError::AlreadyHeld`].

use crate::error::{LockError, StoreError};
use crate::keys::lock_key;
use crate::store::{ClaimOutcome, CoordinationStore, LeaseHandle};
use std::sync::Arc;

pub struct JobLock {
    store: Arc<dyn CoordinationStore>,
    key: String,
    lease_ttl_secs: i64,
    held: Option<LeaseHandle>,
}

impl JobLock {
    pub fn new(store: Arc<dyn CoordinationStore>, job_name: &str, lease_ttl_secs: i64) -> Self {
        Self {
            store,
            key: lock_key(job_name),
            lease_ttl_secs,
            held: None,
        }
    }

    /// Attempt to acquire the lock. On `Ok(())` the caller owns the lock
    /// until [`JobLock::unlock`] is called. On [`LockError::AlreadyHeld`]
    /// another worker holds it and no cleanup is required.
    pub async fn try_lock(&mut self) -> Result<(), LockError> {
        let lease = self
            .store
            .grant_lease(self.lease_ttl_secs)
            .await
            .map_err(LockError::Store)?;

        let outcome = match self.store.claim_if_absent(&self.key, lease.lease_id).await {
            Ok(outcome) => outcome,
            Err(e) => {
                lease.cancel();
                let _ = self.store.revoke_lease(lease.lease_id).await;
                return Err(LockError::Store(e));
            }
        };

        match outcome {
            ClaimOutcome::Acquired => {
                self.held = Some(lease);
                Ok(())
            }
            ClaimOutcome::AlreadyHeld => {
                lease.cancel();
                let _ = self.store.revoke_lease(lease.lease_id).await;
                Err(LockError::AlreadyHeld)
            }
        }
    }

    /// Release the lock if held. Revoking the lease is the sole release
    /// signal; the key disappears as a consequence.
    pub async fn unlock(&mut self) -> Result<(), StoreError> {
        if let Some(lease) = self.held.take() {
            lease.cancel();
            self.store.revoke_lease(lease.lease_id).await?;
        }
        Ok(())
    }
}

impl Drop for JobLock {
    fn drop(&mut self) {
        if let Some(lease) = &self.held {
            lease.cancel();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{PrefixSnapshot, WatchEvent};
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::Mutex;
    use tokio::sync::mpsc;

    /// Minimal in-memory fake: enough to exercise the claim/release protocol
    /// without a live etcd cluster.
    #[derive(Default)]
    struct FakeStore {
        claimed: Mutex<HashMap<String, i64>>,
        next_lease: Mutex<i64>,
    }

    #[async_trait]
    impl CoordinationStore for FakeStore {
        async fn grant_lease(&self, _ttl_secs: i64) -> Result<LeaseHandle, StoreError> {
            let mut n = self.next_lease.lock().unwrap();
            *n += 1;
            let id = *n;
            Ok(LeaseHandle {
                lease_id: id,
                renew_task: tokio::spawn(async {}),
            })
        }

        async fn revoke_lease(&self, lease_id: i64) -> Result<(), StoreError> {
            self.claimed.lock().unwrap().retain(|_, v| *v != lease_id);
            Ok(())
        }

        async fn put(
            &self,
            _key: &str,
            _value: &[u8],
            _lease_id: Option<i64>,
        ) -> Result<(), StoreError> {
            Ok(())
        }

        async fn get_prefix(&self, _prefix: &str) -> Result<PrefixSnapshot, StoreError> {
            Ok(PrefixSnapshot {
                kvs: vec![],
                revision: 0,
            })
        }

        async fn claim_if_absent(
            &self,
            key: &str,
            lease_id: i64,
        ) -> Result<ClaimOutcome, StoreError> {
            let mut claimed = self.claimed.lock().unwrap();
            if claimed.contains_key(key) {
                Ok(ClaimOutcome::AlreadyHeld)
            } else {
                claimed.insert(key.to_string(), lease_id);
                Ok(ClaimOutcome::Acquired)
            }
        }

        async fn watch_prefix(
            &self,
            _prefix: &str,
            _start_revision: i64,
        ) -> Result<mpsc::Receiver<Result<WatchEvent, StoreError>>, StoreError> {
            let (_tx, rx) = mpsc::channel(1);
            Ok(rx)
        }
    }

    #[tokio::test]
    async fn second_locker_sees_already_held() {
        let store: Arc<dyn CoordinationStore> = Arc::new(FakeStore::default());
        let mut a = JobLock::new(store.clone(), "job1", 5);
        let mut b = JobLock::new(store.clone(), "job1", 5);

        a.try_lock().await.expect("first locker should win");
        let err = b.try_lock().await.expect_err("second locker should lose");
        assert!(matches!(err, LockError::AlreadyHeld));
    }

    #[tokio::test]
    async fn unlock_frees_the_key_for_reacquisition() {
        let store: Arc<dyn CoordinationStore> = Arc::new(FakeStore::default());
        let mut a = JobLock::new(store.clone(), "job1", 5);
        a.try_lock().await.unwrap();
        a.unlock().await.unwrap();

        let mut b = JobLock::new(store.clone(), "job1", 5);
        b.try_lock()
            .await
            .expect("lock should be free after unlock");
    }
}
