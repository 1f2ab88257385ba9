//! Thin wrapper around the etcd client. Everything the rest of the crate
//! needs from the store goes through [`StoreClient`], which maps the
//! provider's errors onto a small taxonomy and owns the lease plumbing for
//! the failover lock.

use std::time::Duration;

use etcd_client::{
    Client, Compare, CompareOp, ConnectOptions, LockOptions, Txn, TxnOp, WatchOptions,
    WatchStream, Watcher,
};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// One observed key/value state, either from a watch or a poll.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreEvent {
    pub key: String,
    pub value: Vec<u8>,
    pub mod_revision: i64,
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("key not found: {0}")]
    NotFound(String),
    #[error("store operation timed out")]
    Timeout,
    #[error("store unavailable: {0}")]
    Unavailable(#[source] etcd_client::Error),
    #[error("conflicting write on key {0}")]
    Conflict(String),
}

impl StoreError {
    fn from_etcd(err: etcd_client::Error) -> Self {
        match &err {
            etcd_client::Error::GRpcStatus(status)
                if status.code() == tonic::Code::DeadlineExceeded =>
            {
                StoreError::Timeout
            }
            _ => StoreError::Unavailable(err),
        }
    }
}

#[derive(Debug, Clone)]
pub struct StoreOptions {
    pub endpoints: Vec<String>,
    pub timeout: Duration,
    pub dial_timeout: Duration,
    pub keepalive_time: Duration,
    pub keepalive_timeout: Duration,
}

/// Clusterdata key for a given store prefix and cluster name, as published by
/// the stolon sentinel.
pub fn clusterdata_key(prefix: &str, cluster_name: &str) -> String {
    format!("{prefix}/{cluster_name}/clusterdata")
}

#[derive(Clone)]
pub struct StoreClient {
    client: Client,
    timeout: Duration,
}

impl StoreClient {
    pub async fn connect(opt: StoreOptions) -> Result<Self, StoreError> {
        let connect_options = ConnectOptions::new()
            .with_timeout(opt.timeout)
            .with_connect_timeout(opt.dial_timeout)
            .with_keep_alive(opt.keepalive_time, opt.keepalive_timeout);

        let client = Client::connect(&opt.endpoints, Some(connect_options))
            .await
            .map_err(StoreError::from_etcd)?;

        Ok(StoreClient {
            client,
            timeout: opt.timeout,
        })
    }

    /// Fetches the current value of `key`. Fails with `NotFound` when the key
    /// has never been written or has been deleted.
    pub async fn get(&self, key: &str) -> Result<StoreEvent, StoreError> {
        let mut client = self.client.clone();
        let resp = tokio::time::timeout(self.timeout, client.get(key, None))
            .await
            .map_err(|_| StoreError::Timeout)?
            .map_err(StoreError::from_etcd)?;

        match resp.kvs().first() {
            None => Err(StoreError::NotFound(key.to_string())),
            Some(kv) => Ok(StoreEvent {
                key: key.to_string(),
                value: kv.value().to_vec(),
                mod_revision: kv.mod_revision(),
            }),
        }
    }

    pub async fn put(&self, key: &str, value: Vec<u8>) -> Result<(), StoreError> {
        let mut client = self.client.clone();
        tokio::time::timeout(self.timeout, client.put(key, value, None))
            .await
            .map_err(|_| StoreError::Timeout)?
            .map_err(StoreError::from_etcd)?;

        Ok(())
    }

    /// Writes `value` only when the stored value differs, leaving the key's
    /// revision untouched otherwise. The comparison and the write are one
    /// etcd transaction guarded on the state the read observed, so a
    /// concurrent writer surfaces as `Conflict` rather than being clobbered.
    ///
    /// Returns true when a write happened.
    pub async fn compare_and_put(&self, key: &str, value: Vec<u8>) -> Result<bool, StoreError> {
        let current = match self.get(key).await {
            Ok(event) => Some(event),
            Err(StoreError::NotFound(_)) => None,
            Err(err) => return Err(err),
        };

        let guard = match plan_write(current.as_ref(), &value) {
            WritePlan::Skip => {
                debug!(key, "value unchanged, skipping write");
                return Ok(false);
            }
            WritePlan::ReplaceAt(revision) => Compare::mod_revision(key, CompareOp::Equal, revision),
            WritePlan::Create => Compare::create_revision(key, CompareOp::Equal, 0),
        };

        let txn = Txn::new()
            .when(vec![guard])
            .and_then(vec![TxnOp::put(key, value, None)]);

        let mut client = self.client.clone();
        let resp = tokio::time::timeout(self.timeout, client.txn(txn))
            .await
            .map_err(|_| StoreError::Timeout)?
            .map_err(StoreError::from_etcd)?;

        if !resp.succeeded() {
            return Err(StoreError::Conflict(key.to_string()));
        }

        Ok(true)
    }

    /// Opens a watch on every key under `prefix`. The provider may deliver
    /// events duplicated or out of order; see [`crate::stream`] for the
    /// filters that restore logical ordering.
    pub async fn watch(&self, prefix: &str) -> Result<(Watcher, WatchStream), StoreError> {
        let mut client = self.client.clone();
        client
            .watch(prefix, Some(WatchOptions::new().with_prefix()))
            .await
            .map_err(StoreError::from_etcd)
    }

    /// Cluster-wide mutex on `<key>/failover`, backed by a lease whose expiry
    /// releases the lock if this process dies while holding it.
    pub fn failover_lock(&self, clusterdata_key: &str) -> FailoverLock {
        FailoverLock {
            client: self.client.clone(),
            name: format!("{clusterdata_key}/failover"),
            lease: None,
            held_key: None,
            keepalive: None,
        }
    }
}

/// How a conditional write proceeds given the state a read observed.
#[derive(Debug, PartialEq, Eq)]
enum WritePlan {
    /// The stored value already matches; leave the revision untouched.
    Skip,
    /// Write, guarded on the revision the read observed.
    ReplaceAt(i64),
    /// The key was absent; write, guarded on it staying absent.
    Create,
}

fn plan_write(current: Option<&StoreEvent>, value: &[u8]) -> WritePlan {
    match current {
        Some(event) if event.value == value => WritePlan::Skip,
        Some(event) => WritePlan::ReplaceAt(event.mod_revision),
        None => WritePlan::Create,
    }
}

/// Lease TTL for the failover lock. Keepalives run at a third of this, so the
/// lock survives the holder as long as the holder survives.
const LOCK_LEASE_TTL_SECONDS: i64 = 15;

pub struct FailoverLock {
    client: Client,
    name: String,
    lease: Option<i64>,
    held_key: Option<Vec<u8>>,
    keepalive: Option<JoinHandle<()>>,
}

impl FailoverLock {
    /// Blocks until the lock is granted. Callers bound this with their own
    /// deadline; on abandonment [`FailoverLock::unlock`] still revokes the
    /// lease, which removes any waiter this call enqueued on the server.
    pub async fn lock(&mut self) -> Result<(), StoreError> {
        let mut client = self.client.clone();

        let lease = client
            .lease_grant(LOCK_LEASE_TTL_SECONDS, None)
            .await
            .map_err(StoreError::from_etcd)?
            .id();
        self.lease = Some(lease);
        self.keepalive = Some(tokio::spawn(keep_lease_alive(self.client.clone(), lease)));

        let resp = client
            .lock(self.name.as_str(), Some(LockOptions::new().with_lease(lease)))
            .await
            .map_err(StoreError::from_etcd)?;
        self.held_key = Some(resp.key().to_vec());

        Ok(())
    }

    pub async fn unlock(&mut self) -> Result<(), StoreError> {
        if let Some(keepalive) = self.keepalive.take() {
            keepalive.abort();
        }

        let mut client = self.client.clone();
        if let Some(key) = self.held_key.take() {
            client.unlock(key).await.map_err(StoreError::from_etcd)?;
        }

        // Revoking the lease also deletes a lock waiter that never got the
        // grant, so an abandoned lock() attempt cannot acquire later.
        if let Some(lease) = self.lease.take() {
            client
                .lease_revoke(lease)
                .await
                .map_err(StoreError::from_etcd)?;
        }

        Ok(())
    }
}

async fn keep_lease_alive(client: Client, lease: i64) {
    let mut client = client;
    let (mut keeper, mut responses) = match client.lease_keep_alive(lease).await {
        Ok(pair) => pair,
        Err(err) => {
            warn!(lease, "failed to start lease keepalive: {err}");
            return;
        }
    };

    let interval = Duration::from_secs(LOCK_LEASE_TTL_SECONDS as u64 / 3);
    loop {
        if let Err(err) = keeper.keep_alive().await {
            warn!(lease, "lease keepalive failed: {err}");
            return;
        }
        if let Err(err) = responses.message().await {
            warn!(lease, "lease keepalive stream failed: {err}");
            return;
        }
        tokio::time::sleep(interval).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clusterdata_key_joins_prefix_and_cluster() {
        assert_eq!(
            clusterdata_key("stolon/cluster", "main"),
            "stolon/cluster/main/clusterdata"
        );
    }

    fn event(value: &str, mod_revision: i64) -> StoreEvent {
        StoreEvent {
            key: "/key".to_string(),
            value: value.as_bytes().to_vec(),
            mod_revision,
        }
    }

    #[test]
    fn plan_write_skips_unchanged_values() {
        assert_eq!(plan_write(Some(&event("value", 4)), b"value"), WritePlan::Skip);
    }

    #[test]
    fn plan_write_guards_replacement_on_observed_revision() {
        assert_eq!(
            plan_write(Some(&event("value", 4)), b"changed"),
            WritePlan::ReplaceAt(4)
        );
    }

    #[test]
    fn plan_write_creates_absent_keys() {
        assert_eq!(plan_write(None, b"value"), WritePlan::Create);
    }
}
