//! Coordination store abstraction.
//!
//! Wraps an `etcd_client::Client` behind a small trait so the scheduler,
//! registrar, watcher, and lock can be exercised in tests against an
//! in-memory fake instead of a live etcd cluster.

use crate::error::StoreError;
use async_trait::async_trait;
use etcd_client::{
    Client, Compare, CompareOp, ConnectOptions, GetOptions, PutOptions, Txn, TxnOp, WatchOptions,
};
use std::time::Duration;

/// A single key/value pair as observed in a `get` or `watch` response.
#[derive(Debug, Clone)]
pub struct Kv {
    pub key: String,
    pub value: Vec<u8>,
}

/// The mutation carried by one watch event.
#[derive(Debug, Clone)]
pub enum WatchEvent {
    Put(Kv),
    Delete { key: String },
}

/// Result of a prefix read, including the store's revision at the time of
/// the read so a caller can resume a watch from exactly where the read left
/// off without missing or duplicating events.
#[derive(Debug, Clone)]
pub struct PrefixSnapshot {
    pub kvs: Vec<Kv>,
    pub revision: i64,
}

/// Outcome of a create-if-absent transaction, as used by [`crate::lock`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClaimOutcome {
    Acquired,
    AlreadyHeld,
}

/// Coordination-store operations needed by this worker. Deliberately narrow:
/// it is not a general etcd client facade, only the handful of primitives
/// the registrar/watcher/lock actually use.
#[async_trait]
pub trait CoordinationStore: Send + Sync {
    /// Grant a lease with the given TTL (seconds) and start renewing it on a
    /// background task every `ttl/3`. Returns the lease id and a cancellation
    /// handle that stops renewal (it does not revoke the lease).
    async fn grant_lease(&self, ttl_secs: i64) -> Result<LeaseHandle, StoreError>;

    /// Revoke a previously granted lease, deleting any keys attached to it.
    async fn revoke_lease(&self, lease_id: i64) -> Result<(), StoreError>;

    async fn put(&self, key: &str, value: &[u8], lease_id: Option<i64>) -> Result<(), StoreError>;

    async fn get_prefix(&self, prefix: &str) -> Result<PrefixSnapshot, StoreError>;

    /// Attempt to atomically claim `key` by creating it (with `lease_id`) iff
    /// it does not already exist (create-revision 0).
    async fn claim_if_absent(
        &self,
        key: &str,
        lease_id: i64,
    ) -> Result<ClaimOutcome, StoreError>;

    /// Watch every mutation under `prefix`, starting from `start_revision`
    /// (0 means "now"). Events are pushed onto the returned channel until the
    /// stream closes or the task is dropped.
    async fn watch_prefix(
        &self,
        prefix: &str,
        start_revision: i64,
    ) -> Result<tokio::sync::mpsc::Receiver<Result<WatchEvent, StoreError>>, StoreError>;
}

/// A live lease plus the task renewing it. Dropping or cancelling
/// [`LeaseHandle::cancel`] stops renewal; the lease itself must still be
/// revoked explicitly via [`CoordinationStore::revoke_lease`].
pub struct LeaseHandle {
    pub lease_id: i64,
    pub(crate) renew_task: tokio::task::JoinHandle<()>,
}

impl LeaseHandle {
    pub fn cancel(&self) {
        self.renew_task.abort();
    }

    /// Resolves when the background renewal task stops, whether by
    /// cancellation or because renewal failed. Callers that need to react to
    /// unexpected renewal loss (as opposed to their own cancel) select on
    /// this alongside their own shutdown signal.
    pub async fn renewal_lost(&mut self) {
        let _ = (&mut self.renew_task).await;
    }
}

/// `etcd_client`-backed implementation.
pub struct EtcdStore {
    client: Client,
}

impl EtcdStore {
    pub async fn connect(endpoints: &[String], dial_timeout: Duration) -> Result<Self, StoreError> {
        let options = ConnectOptions::new().with_connect_timeout(dial_timeout);
        let client = Client::connect(endpoints, Some(options))
            .await
            .map_err(|e| StoreError::Connect(e.to_string()))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl CoordinationStore for EtcdStore {
    async fn grant_lease(&self, ttl_secs: i64) -> Result<LeaseHandle, StoreError> {
        let mut client = self.client.clone();
        let lease = client
            .lease_grant(ttl_secs, None)
            .await
            .map_err(|e| StoreError::LeaseGrant(e.to_string()))?;
        let lease_id = lease.id();
        let ttl = lease.ttl().max(1) as u64;

        let (mut keeper, mut stream) = client
            .lease_keep_alive(lease_id)
            .await
            .map_err(|e| StoreError::LeaseGrant(e.to_string()))?;

        let renew_task = tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs((ttl / 3).max(1)));
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                if keeper.keep_alive().await.is_err() {
                    break;
                }
                match stream.message().await {
                    Ok(Some(_)) => continue,
                    _ => break,
                }
            }
        });

        Ok(LeaseHandle {
            lease_id,
            renew_task,
        })
    }

    async fn revoke_lease(&self, lease_id: i64) -> Result<(), StoreError> {
        let mut client = self.client.clone();
        client
            .lease_revoke(lease_id)
            .await
            .map_err(|e| StoreError::Put(e.to_string()))?;
        Ok(())
    }

    async fn put(&self, key: &str, value: &[u8], lease_id: Option<i64>) -> Result<(), StoreError> {
        let mut client = self.client.clone();
        let opts = lease_id.map(|id| PutOptions::new().with_lease(id));
        client
            .put(key, value, opts)
            .await
            .map_err(|e| StoreError::Put(e.to_string()))?;
        Ok(())
    }

    async fn get_prefix(&self, prefix: &str) -> Result<PrefixSnapshot, StoreError> {
        let mut client = self.client.clone();
        let resp = client
            .get(prefix, Some(GetOptions::new().with_prefix()))
            .await
            .map_err(|e| StoreError::Get(e.to_string()))?;
        let revision = resp
            .header()
            .map(|h| h.revision())
            .unwrap_or_default();
        let kvs = resp
            .kvs()
            .iter()
            .map(|kv| Kv {
                key: String::from_utf8_lossy(kv.key()).into_owned(),
                value: kv.value().to_vec(),
            })
            .collect();
        Ok(PrefixSnapshot { kvs, revision })
    }

    async fn claim_if_absent(
        &self,
        key: &str,
        lease_id: i64,
    ) -> Result<ClaimOutcome, StoreError> {
        let mut client = self.client.clone();
        let txn = Txn::new()
            .when([Compare::create_revision(key, CompareOp::Equal, 0)])
            .and_then([TxnOp::put(
                key,
                "",
                Some(PutOptions::new().with_lease(lease_id)),
            )])
            .or_else([TxnOp::get(key, None)]);

        let resp = client
            .txn(txn)
            .await
            .map_err(|e| StoreError::Txn(e.to_string()))?;

        if resp.succeeded() {
            Ok(ClaimOutcome::Acquired)
        } else {
            Ok(ClaimOutcome::AlreadyHeld)
        }
    }

    async fn watch_prefix(
        &self,
        prefix: &str,
        start_revision: i64,
    ) -> Result<tokio::sync::mpsc::Receiver<Result<WatchEvent, StoreError>>, StoreError> {
        let mut client = self.client.clone();
        let mut opts = WatchOptions::new().with_prefix();
        if start_revision > 0 {
            opts = opts.with_start_revision(start_revision);
        }

        let (_watcher, mut stream) = client
            .watch(prefix, Some(opts))
            .await
            .map_err(|e| StoreError::Get(e.to_string()))?;

        let (tx, rx) = tokio::sync::mpsc::channel(1000);
        tokio::spawn(async move {
            // Keep the watcher alive for the lifetime of the forwarding task.
            let _watcher = _watcher;
            loop {
                match stream.message().await {
                    Ok(Some(msg)) => {
                        for event in msg.events() {
                            let Some(kv) = event.kv() else { continue };
                            let key = String::from_utf8_lossy(kv.key()).into_owned();
                            let mapped = match event.event_type() {
                                etcd_client::EventType::Put => WatchEvent::Put(Kv {
                                    key,
                                    value: kv.value().to_vec(),
                                }),
                                etcd_client::EventType::Delete => WatchEvent::Delete { key },
                            };
                            if tx.send(Ok(mapped)).await.is_err() {
                                return;
                            }
                        }
                    }
                    Ok(None) => {
                        let _ = tx.send(Err(StoreError::WatchClosed)).await;
                        return;
                    }
                    Err(e) => {
                        let _ = tx.send(Err(StoreError::Get(e.to_string()))).await;
                        return;
                    }
                }
            }
        });

        Ok(rx)
    }
}
