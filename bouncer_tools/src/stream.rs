//! Store events arrive from two producers: the watch API, which pushes
//! changes but may duplicate or reorder them, and a poller, which guarantees
//! the current value is seen at boot and at a steady cadence even if the
//! watch silently breaks down. Both write into one channel; the filters
//! below restore logical ordering before events drive side effects.

use std::collections::HashMap;
use std::future::Future;
use std::time::Duration;

use etcd_client::EventType;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::store::{StoreClient, StoreError, StoreEvent};

const STREAM_BUFFER: usize = 16;

#[derive(Debug, Clone)]
pub struct StreamOptions {
    pub keys: Vec<String>,
    pub poll_interval: Duration,
    pub get_timeout: Duration,
}

/// Starts the watch and poll workers for the given keys. The returned channel
/// ends once every worker has wound down after `cancel` fires.
pub fn spawn(
    store: StoreClient,
    cancel: CancellationToken,
    opt: StreamOptions,
) -> mpsc::Receiver<StoreEvent> {
    let (tx, rx) = mpsc::channel(STREAM_BUFFER);

    for key in opt.keys.clone() {
        tokio::spawn(watch_key(
            store.clone(),
            key,
            tx.clone(),
            cancel.clone(),
            opt.poll_interval,
        ));
    }
    tokio::spawn(poll_keys(store, opt, tx, cancel));

    rx
}

/// Watches a single key, re-establishing the watch if the provider drops it.
/// The prefix watch also matches subkeys (the failover lock lives under the
/// clusterdata key), so events are filtered back down to the exact key.
async fn watch_key(
    store: StoreClient,
    key: String,
    tx: mpsc::Sender<StoreEvent>,
    cancel: CancellationToken,
    retry_interval: Duration,
) {
    loop {
        if cancel.is_cancelled() {
            return;
        }

        // The watcher handle cancels the server-side watch when dropped.
        let (_watcher, mut events) = match store.watch(&key).await {
            Ok(pair) => pair,
            Err(err) => {
                warn!(%key, "failed to establish watch: {err}");
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = tokio::time::sleep(retry_interval) => continue,
                }
            }
        };
        info!(%key, "watch established");

        loop {
            let message = tokio::select! {
                _ = cancel.cancelled() => return,
                message = events.message() => message,
            };

            let resp = match message {
                Ok(Some(resp)) => resp,
                Ok(None) => {
                    warn!(%key, "watch channel closed, re-establishing");
                    break;
                }
                Err(err) => {
                    warn!(%key, "watch failed, re-establishing: {err}");
                    break;
                }
            };

            if resp.canceled() {
                warn!(%key, "watch cancelled by server, re-establishing");
                break;
            }

            for event in resp.events() {
                if event.event_type() != EventType::Put {
                    continue;
                }
                let Some(kv) = event.kv() else { continue };
                if kv.key_str().map(|k| k != key).unwrap_or(true) {
                    continue;
                }

                let event = StoreEvent {
                    key: key.clone(),
                    value: kv.value().to_vec(),
                    mod_revision: kv.mod_revision(),
                };
                if tx.send(event).await.is_err() {
                    return;
                }
            }
        }

        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(retry_interval) => {}
        }
    }
}

/// Fetches every key at the polling cadence, pushing current values into the
/// stream as if they were watch events. Transient store errors are logged and
/// absorbed; the next tick tries again.
async fn poll_keys(
    store: StoreClient,
    opt: StreamOptions,
    tx: mpsc::Sender<StoreEvent>,
    cancel: CancellationToken,
) {
    loop {
        for key in &opt.keys {
            let event = match tokio::time::timeout(opt.get_timeout, store.get(key)).await {
                Err(_) => {
                    warn!(%key, "poll timed out");
                    continue;
                }
                Ok(Err(StoreError::NotFound(_))) => {
                    warn!(%key, "key has no value (is supervise running?)");
                    continue;
                }
                Ok(Err(err)) => {
                    warn!(%key, "poll failed: {err}");
                    continue;
                }
                Ok(Ok(event)) => event,
            };

            if tx.send(event).await.is_err() {
                return;
            }
        }

        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(opt.poll_interval) => {}
        }
    }
}

/// Drops any event whose revision does not advance the last forwarded
/// revision for its key. The first event per key always passes.
pub fn revision_filter(mut events: mpsc::Receiver<StoreEvent>) -> mpsc::Receiver<StoreEvent> {
    let (tx, rx) = mpsc::channel(STREAM_BUFFER);
    tokio::spawn(async move {
        let mut last_revisions: HashMap<String, i64> = HashMap::new();
        while let Some(event) = events.recv().await {
            match last_revisions.get(&event.key) {
                Some(&previous) if previous >= event.mod_revision => {
                    debug!(
                        key = %event.key,
                        revision = event.mod_revision,
                        previous,
                        "dropping stale revision"
                    );
                }
                _ => {
                    last_revisions.insert(event.key.clone(), event.mod_revision);
                    if tx.send(event).await.is_err() {
                        return;
                    }
                }
            }
        }
    });
    rx
}

/// Drops any event whose value matches the previously forwarded value for
/// its key.
pub fn dedupe_filter(mut events: mpsc::Receiver<StoreEvent>) -> mpsc::Receiver<StoreEvent> {
    let (tx, rx) = mpsc::channel(STREAM_BUFFER);
    tokio::spawn(async move {
        let mut last_values: HashMap<String, Vec<u8>> = HashMap::new();
        while let Some(event) = events.recv().await {
            if last_values.get(&event.key) == Some(&event.value) {
                debug!(key = %event.key, "dropping unchanged value");
                continue;
            }
            last_values.insert(event.key.clone(), event.value.clone());
            if tx.send(event).await.is_err() {
                return;
            }
        }
    });
    rx
}

#[derive(Debug, Clone, Copy)]
pub struct RetryFoldOptions {
    pub interval: Duration,
    pub timeout: Duration,
}

/// Runs `op` for every event, retrying a failed operation ad infinitum with
/// each attempt bounded by `timeout`. A retry waits up to `interval`, but a
/// newer event arriving first replaces the event being retried: the point of
/// the fold is to converge on the latest observed value, and retrying a stale
/// event when a newer one is queued is wasted work.
///
/// Returns when the input stream ends.
pub async fn retry_fold<O, Fut>(
    mut events: mpsc::Receiver<StoreEvent>,
    opt: RetryFoldOptions,
    mut op: O,
) where
    O: FnMut(StoreEvent) -> Fut,
    Fut: Future<Output = anyhow::Result<()>>,
{
    'events: while let Some(mut event) = events.recv().await {
        loop {
            match tokio::time::timeout(opt.timeout, op(event.clone())).await {
                Ok(Ok(())) => continue 'events,
                Ok(Err(err)) => warn!(key = %event.key, "operation failed: {err:#}"),
                Err(_) => warn!(key = %event.key, "operation timed out"),
            }

            tokio::select! {
                newer = events.recv() => match newer {
                    Some(newer) => {
                        debug!(key = %newer.key, "newer event supersedes retry");
                        event = newer;
                    }
                    None => break 'events,
                },
                _ = tokio::time::sleep(opt.interval) => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    use anyhow::bail;

    use super::*;

    fn event(key: &str, value: &str, mod_revision: i64) -> StoreEvent {
        StoreEvent {
            key: key.to_string(),
            value: value.as_bytes().to_vec(),
            mod_revision,
        }
    }

    async fn collect(mut events: mpsc::Receiver<StoreEvent>) -> Vec<StoreEvent> {
        let mut out = Vec::new();
        while let Some(event) = events.recv().await {
            out.push(event);
        }
        out
    }

    #[tokio::test]
    async fn revision_filter_drops_stale_revisions() {
        let (tx, rx) = mpsc::channel(STREAM_BUFFER);
        tx.send(event("/key", "value", 2)).await.unwrap();
        tx.send(event("/key", "value", 1)).await.unwrap();
        tx.send(event("/key", "value", 2)).await.unwrap();
        drop(tx);

        assert_eq!(
            collect(revision_filter(rx)).await,
            vec![event("/key", "value", 2)]
        );
    }

    #[tokio::test]
    async fn revision_filter_tracks_keys_independently() {
        let (tx, rx) = mpsc::channel(STREAM_BUFFER);
        tx.send(event("/key", "value", 2)).await.unwrap();
        tx.send(event("/another_key", "value", 1)).await.unwrap();
        drop(tx);

        assert_eq!(
            collect(revision_filter(rx)).await,
            vec![event("/key", "value", 2), event("/another_key", "value", 1)]
        );
    }

    #[tokio::test]
    async fn dedupe_filter_drops_repeated_values() {
        let (tx, rx) = mpsc::channel(STREAM_BUFFER);
        tx.send(event("/key", "value", 0)).await.unwrap();
        tx.send(event("/key", "value", 1)).await.unwrap();
        tx.send(event("/key", "changed", 2)).await.unwrap();
        drop(tx);

        assert_eq!(
            collect(dedupe_filter(rx)).await,
            vec![event("/key", "value", 0), event("/key", "changed", 2)]
        );
    }

    #[tokio::test]
    async fn dedupe_filter_tracks_keys_independently() {
        let (tx, rx) = mpsc::channel(STREAM_BUFFER);
        tx.send(event("/key", "value", 0)).await.unwrap();
        tx.send(event("/another_key", "value", 0)).await.unwrap();
        drop(tx);

        assert_eq!(
            collect(dedupe_filter(rx)).await,
            vec![event("/key", "value", 0), event("/another_key", "value", 0)]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn retry_fold_retries_until_success() {
        let (tx, rx) = mpsc::channel(STREAM_BUFFER);
        tx.send(event("/key", "value", 1)).await.unwrap();

        let attempts = Arc::new(AtomicUsize::new(0));
        let opt = RetryFoldOptions {
            interval: Duration::from_secs(1),
            timeout: Duration::from_secs(5),
        };

        // The sender stays open so retries wait out their interval rather
        // than observing a finished stream; success closes it to end the fold.
        let tx_slot = Arc::new(Mutex::new(Some(tx)));
        let counter = attempts.clone();
        retry_fold(rx, opt, move |_event| {
            let counter = counter.clone();
            let tx_slot = tx_slot.clone();
            async move {
                if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                    bail!("transient");
                }
                tx_slot.lock().unwrap().take();
                Ok(())
            }
        })
        .await;

        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn retry_fold_prefers_newer_event_over_retry() {
        let (tx, rx) = mpsc::channel(STREAM_BUFFER);
        tx.send(event("/key", "stale", 1)).await.unwrap();
        tx.send(event("/key", "fresh", 2)).await.unwrap();
        drop(tx);

        let seen = Arc::new(Mutex::new(Vec::new()));
        let opt = RetryFoldOptions {
            interval: Duration::from_secs(60),
            timeout: Duration::from_secs(5),
        };

        let log = seen.clone();
        retry_fold(rx, opt, move |event| {
            let log = log.clone();
            async move {
                let value = String::from_utf8(event.value).unwrap();
                log.lock().unwrap().push(value.clone());
                if value == "stale" {
                    bail!("must not apply stale value");
                }
                Ok(())
            }
        })
        .await;

        // The retry of the stale event is abandoned for the queued newer one.
        assert_eq!(*seen.lock().unwrap(), vec!["stale", "fresh"]);
    }
}
