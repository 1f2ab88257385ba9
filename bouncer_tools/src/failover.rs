//! The failover orchestrator. Modelled as a pipeline of steps with deferred
//! cleanups scheduled before each primary action runs, so that however the
//! run ends the cluster is returned to its initial state: pools resumed,
//! sleep interval restored, lock released.

use std::collections::HashMap;
use std::fmt::Write as _;
use std::future::Future;
use std::process::Stdio;
use std::time::{Duration, Instant};

use anyhow::{anyhow, bail, Context};
use futures::future::join_all;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::cluster::{self, Clusterdata, Db};
use crate::pauser::proto::health_check_response::Status as HealthStatus;
use crate::pauser::{self, proto, proto_duration};
use crate::pipeline::{self, Step};
use crate::stolonctl::Stolonctl;
use crate::store::{FailoverLock, StoreClient, StoreError};
use crate::stream::{self, StreamOptions};

const SLEEP_INTERVAL_PATH: &[&str] = &["cluster", "spec", "sleepInterval"];

/// While stolon recovers we consume the clusterdata key at the same cadence
/// the original sentinel publishes it.
const RECOVERY_POLL_INTERVAL: Duration = Duration::from_secs(5);
const RECOVERY_GET_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Debug, Clone)]
pub struct FailoverOptions {
    pub clusterdata_key: String,
    pub health_check_timeout: Duration,
    pub lock_timeout: Duration,
    pub pause_timeout: Duration,
    pub pause_expiry: Duration,
    pub resume_timeout: Duration,
    pub stolonctl_timeout: Duration,
}

pub struct Failover {
    store: StoreClient,
    clients: HashMap<String, pauser::Client>,
    stolonctl: Stolonctl,
    opt: FailoverOptions,
    lock: tokio::sync::Mutex<FailoverLock>,
    // Raw sleepInterval bytes cached by shorten_sleep_interval so its
    // deferred cleanup can splice them back verbatim.
    sleep_interval: std::sync::Mutex<Option<String>>,
}

impl Failover {
    pub fn new(
        store: StoreClient,
        clients: HashMap<String, pauser::Client>,
        stolonctl: Stolonctl,
        opt: FailoverOptions,
    ) -> Failover {
        let lock = store.failover_lock(&opt.clusterdata_key);
        Failover {
            store,
            clients,
            stolonctl,
            opt,
            lock: tokio::sync::Mutex::new(lock),
            sleep_interval: std::sync::Mutex::new(None),
        }
    }

    /// Triggers the failover. The operator can cancel `ctx` at any point;
    /// `defer_ctx` must stay live a while longer so cleanups complete.
    pub async fn run(
        &self,
        ctx: &CancellationToken,
        defer_ctx: &CancellationToken,
    ) -> anyhow::Result<()> {
        pipeline::run(
            vec![
                Step::new("check_cluster_healthy", || self.check_cluster_healthy()),
                Step::new("health_check_clients", || self.health_check_clients()),
                Step::new("acquire_lock", || self.acquire_lock())
                    .defer("release_lock", || self.release_lock()),
                Step::new("shorten_sleep_interval", || self.shorten_sleep_interval())
                    .defer("restore_sleep_interval", || self.restore_sleep_interval()),
                Step::new("pause", || self.pause()).defer("resume", || self.resume()),
                Step::new("fail_keeper", || self.fail_keeper()),
            ],
            ctx,
            defer_ctx,
        )
        .await
    }

    async fn get_clusterdata(&self) -> anyhow::Result<Clusterdata> {
        let event = self
            .store
            .get(&self.opt.clusterdata_key)
            .await
            .context("failed to get clusterdata")?;
        Clusterdata::parse(&event.value).context("failed to parse clusterdata")
    }

    async fn check_cluster_healthy(&self) -> anyhow::Result<()> {
        info!("checking health of cluster");
        let clusterdata = self.get_clusterdata().await?;
        clusterdata
            .check_healthy(1)
            .context("cluster is not healthy enough to fail over")
    }

    /// Fan-out health check requiring HEALTHY from every pauser. Anything
    /// else, including transport failures and UNKNOWN components, fails the
    /// preflight.
    pub async fn health_check_clients(&self) -> anyhow::Result<()> {
        info!("health checking all pausers");
        self.each_client(
            "health_check",
            self.opt.health_check_timeout,
            |_, mut client| async move {
                let response = client
                    .health_check(proto::Empty {})
                    .await
                    .map_err(|status| anyhow!("health check failed: {status}"))?
                    .into_inner();

                if response.status() != HealthStatus::Healthy {
                    let mut detail = String::new();
                    for component in &response.components {
                        let _ = write!(detail, "{}: {}; ", component.name, component.error);
                    }
                    bail!("received non-healthy response: {detail}");
                }

                Ok(())
            },
        )
        .await
    }

    async fn acquire_lock(&self) -> anyhow::Result<()> {
        info!("acquiring failover lock in the store");
        let mut lock = self.lock.lock().await;
        tokio::time::timeout(self.opt.lock_timeout, lock.lock())
            .await
            .map_err(|_| anyhow!("timed out acquiring failover lock, is another failover running?"))?
            .context("failed to acquire failover lock")
    }

    async fn release_lock(&self) -> anyhow::Result<()> {
        info!("releasing failover lock");
        let mut lock = self.lock.lock().await;
        tokio::time::timeout(self.opt.lock_timeout, lock.unlock())
            .await
            .map_err(|_| anyhow!("timed out releasing failover lock"))?
            .context("failed to release failover lock")
    }

    /// Temporarily applies a short sleep interval so stolon components react
    /// to the failover quickly. The original raw value is cached so the
    /// deferred cleanup can return the document to exactly how it was.
    async fn shorten_sleep_interval(&self) -> anyhow::Result<()> {
        info!("applying short sleep interval, caching the original for replacement after failover");
        let previous = self.patch_sleep_interval("1s").await?;
        let original = humantime::parse_duration(&previous)
            .with_context(|| format!("failed to parse sleepInterval {previous:?}"))?;
        *self.sleep_interval.lock().unwrap() = Some(previous);

        info!(
            interval = %humantime::format_duration(original),
            "waiting twice the old sleep interval to ensure stolon components have reloaded"
        );
        tokio::time::sleep(original * 2).await;

        Ok(())
    }

    async fn restore_sleep_interval(&self) -> anyhow::Result<()> {
        let Some(original) = self.sleep_interval.lock().unwrap().take() else {
            return Ok(());
        };

        info!(interval = %original, "restoring original sleep interval now failover is complete");
        self.patch_sleep_interval(&original).await.map(drop)
    }

    /// Splices `new_value` into the sleepInterval of the stored document and
    /// writes it back, returning the raw value it replaced. A document that
    /// already carries `new_value` is left untouched so the key's revision
    /// only moves when the content does; a concurrent writer landing between
    /// read and write is retried against the fresh document.
    async fn patch_sleep_interval(&self, new_value: &str) -> anyhow::Result<String> {
        loop {
            let event = self
                .store
                .get(&self.opt.clusterdata_key)
                .await
                .context("failed to get clusterdata")?;
            let (patched, previous) =
                cluster::patch_string_field(&event.value, SLEEP_INTERVAL_PATH, new_value)?;

            match self
                .store
                .compare_and_put(&self.opt.clusterdata_key, patched)
                .await
            {
                Ok(_) => return Ok(previous),
                Err(StoreError::Conflict(_)) => {
                    warn!("clusterdata changed while patching sleep interval, retrying");
                }
                Err(err) => {
                    return Err(err).context("failed to write patched sleep interval");
                }
            }
        }
    }

    async fn pause(&self) -> anyhow::Result<()> {
        info!("requesting all pgbouncers pause");
        let request = proto::PauseRequest {
            timeout: Some(proto_duration(self.opt.pause_timeout)),
            expiry: Some(proto_duration(self.opt.pause_expiry)),
        };

        // Allow an extra second for the network round-trip; the server
        // enforces the tighter pause timeout itself.
        let deadline = self.opt.pause_expiry + Duration::from_secs(1);
        self.each_client("pause", deadline, move |_, mut client| {
            let request = request.clone();
            async move {
                client
                    .pause(request)
                    .await
                    .map_err(|status| anyhow!("{status}"))?;
                Ok(())
            }
        })
        .await
        .context("failed to pause pgbouncers")
    }

    async fn resume(&self) -> anyhow::Result<()> {
        info!("requesting all pgbouncers resume");
        self.each_client(
            "resume",
            self.opt.resume_timeout,
            |_, mut client| async move {
                client
                    .resume(proto::Empty {})
                    .await
                    .map_err(|status| anyhow!("{status}"))?;
                Ok(())
            },
        )
        .await
        .context("failed to resume pgbouncers")
    }

    /// Performs an action against every pauser in parallel. For operations
    /// with a penalty for extended running time, like pause, the requests
    /// must not be serialised. The whole set fails if any call fails.
    async fn each_client<F, Fut>(
        &self,
        what: &'static str,
        deadline: Duration,
        action: F,
    ) -> anyhow::Result<()>
    where
        F: Fn(String, pauser::Client) -> Fut,
        Fut: Future<Output = anyhow::Result<()>> + Send,
    {
        let calls = self.clients.iter().map(|(keeper, client)| {
            let keeper = keeper.clone();
            let call = action(keeper.clone(), client.clone());
            async move {
                let begin = Instant::now();
                let result = tokio::time::timeout(deadline, call)
                    .await
                    .map_err(|_| anyhow!("deadline exceeded"))
                    .and_then(|result| result);

                let elapsed = begin.elapsed();
                match &result {
                    Ok(()) => info!(%keeper, ?elapsed, "{what} succeeded"),
                    Err(err) => warn!(%keeper, ?elapsed, "{what} failed: {err:#}"),
                }
                result.with_context(|| format!("pauser {keeper}"))
            }
        });

        join_all(calls).await.into_iter().collect()
    }

    /// Uses stolonctl to mark the current primary keeper as failed, then
    /// watches clusterdata until stolon reports a new healthy primary with
    /// enough synchronous standbys to accept writes.
    async fn fail_keeper(&self) -> anyhow::Result<()> {
        let clusterdata = self.get_clusterdata().await?;
        let master = clusterdata
            .master()
            .context("could not identify master keeper")?;
        let master_keeper = master.spec.keeper_uid.clone();
        if master_keeper.is_empty() {
            bail!("could not identify master keeper");
        }

        info!(master = %master, "marking master keeper as failed");
        let mut command = self.stolonctl.command(&["failkeeper", &master_keeper]);
        command.stdout(Stdio::inherit()).stderr(Stdio::inherit());

        let status = tokio::time::timeout(self.opt.stolonctl_timeout, command.status())
            .await
            .map_err(|_| anyhow!("stolonctl failkeeper timed out"))?
            .context("failed to run stolonctl failkeeper")?;
        if !status.success() {
            bail!("stolonctl failkeeper exited with {status}");
        }

        self.wait_for_recovery(&master_keeper).await
    }

    async fn wait_for_recovery(&self, old_master_keeper: &str) -> anyhow::Result<()> {
        info!(
            key = %self.opt.clusterdata_key,
            "waiting for stolon to report master change"
        );

        let cancel = CancellationToken::new();
        let events = stream::spawn(
            self.store.clone(),
            cancel.clone(),
            StreamOptions {
                keys: vec![self.opt.clusterdata_key.clone()],
                poll_interval: RECOVERY_POLL_INTERVAL,
                get_timeout: RECOVERY_GET_TIMEOUT,
            },
        );
        let mut events = stream::revision_filter(events);

        let observed = tokio::time::timeout(self.opt.pause_expiry, async {
            while let Some(event) = events.recv().await {
                if event.key != self.opt.clusterdata_key {
                    continue;
                }

                let clusterdata = match Clusterdata::parse(&event.value) {
                    Ok(clusterdata) => clusterdata,
                    Err(err) => {
                        warn!("failed to parse clusterdata update: {err}");
                        continue;
                    }
                };

                if let Some(master) = recovered_master(&clusterdata, old_master_keeper) {
                    info!(master = %master, "cluster successfully recovered, master is available for writes");
                    return Ok(());
                }
            }
            bail!("clusterdata stream ended before recovery was observed")
        })
        .await;
        cancel.cancel();

        observed.map_err(|_| anyhow!("timed out waiting for successful recovery"))?
    }
}

/// The new master the cluster recovered onto, if this view shows one: a
/// healthy master on a different keeper, with enough healthy synchronous
/// standbys to accept writes.
///
/// The keepers may not have caught up with the new master state before the
/// proxy was updated, so the standby count is checked against the cluster
/// specification; a view where the new master has not yet gained its standbys
/// is ignored rather than trusted.
fn recovered_master<'a>(clusterdata: &'a Clusterdata, old_master_keeper: &str) -> Option<&'a Db> {
    let master = clusterdata.master()?;

    if master.spec.keeper_uid == old_master_keeper {
        debug!(master = %master, "master has not changed nodes");
        return None;
    }

    if !master.status.healthy {
        info!(master = %master, "new master is unhealthy");
        return None;
    }

    let healthy_standbys = clusterdata
        .synchronous_standbys()
        .iter()
        .filter(|db| db.status.healthy)
        .count();
    let minimum = clusterdata.cluster.spec.min_synchronous_standbys as usize;
    if healthy_standbys < minimum {
        info!(
            healthy = healthy_standbys,
            minimum, "not enough healthy standbys to satisfy minSynchronousStandbys"
        );
        return None;
    }

    Some(master)
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use crate::cluster::{Cluster, ClusterSpec, Db, DbSpec, DbStatus, Proxy, ProxySpec};

    use super::*;

    fn keeper(uid: &str, healthy: bool, synchronous_standbys: &[&str]) -> Db {
        Db {
            spec: DbSpec {
                keeper_uid: uid.to_string(),
                external_synchronous_standbys: Vec::new(),
            },
            status: DbStatus {
                healthy,
                listen_address: "10.0.0.1".to_string(),
                port: "5432".to_string(),
                synchronous_standbys: synchronous_standbys
                    .iter()
                    .map(|s| s.to_string())
                    .collect(),
            },
        }
    }

    fn view(master_uid: &str, min_synchronous_standbys: u32, dbs: Vec<(&str, Db)>) -> Clusterdata {
        Clusterdata {
            cluster: Cluster {
                spec: ClusterSpec {
                    synchronous_replication: true,
                    min_synchronous_standbys,
                    sleep_interval: "5s".to_string(),
                },
            },
            proxy: Proxy {
                spec: ProxySpec {
                    master_db_uid: master_uid.to_string(),
                },
            },
            dbs: dbs
                .into_iter()
                .map(|(uid, db)| (uid.to_string(), db))
                .collect::<HashMap<_, _>>(),
        }
    }

    #[test]
    fn recovery_requires_master_to_move() {
        let clusterdata = view(
            "db0",
            1,
            vec![
                ("db0", keeper("keeper0", true, &["db1"])),
                ("db1", keeper("keeper1", true, &[])),
            ],
        );
        assert!(recovered_master(&clusterdata, "keeper0").is_none());
        assert!(recovered_master(&clusterdata, "keeper1").is_some());
    }

    #[test]
    fn recovery_requires_healthy_master() {
        let clusterdata = view(
            "db0",
            1,
            vec![
                ("db0", keeper("keeper0", false, &["db1"])),
                ("db1", keeper("keeper1", true, &[])),
            ],
        );
        assert!(recovered_master(&clusterdata, "old_keeper").is_none());
    }

    #[test]
    fn recovery_requires_minimum_healthy_standbys() {
        let degraded = view(
            "db0",
            1,
            vec![
                ("db0", keeper("keeper0", true, &["db1"])),
                ("db1", keeper("keeper1", false, &[])),
            ],
        );
        assert!(recovered_master(&degraded, "old_keeper").is_none());

        // The same view with no synchronous requirement recovers fine.
        let relaxed = view(
            "db0",
            0,
            vec![
                ("db0", keeper("keeper0", true, &[])),
                ("db1", keeper("keeper1", false, &[])),
            ],
        );
        let master = recovered_master(&relaxed, "old_keeper").unwrap();
        assert_eq!(master.spec.keeper_uid, "keeper0");
    }

    #[test]
    fn recovery_ignores_view_without_master() {
        let clusterdata = view("", 1, vec![("db0", keeper("keeper0", true, &[]))]);
        assert!(recovered_master(&clusterdata, "old_keeper").is_none());
    }
}
