//! Supervision of the local PgBouncer. The child starts against a sentinel
//! host so it can come up before the primary is known, then follows the
//! clusterdata stream: each primary change renders a fresh config and
//! reloads the pooler. Shutdown drains client connections before the child
//! is terminated so no query is cut mid-flight.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{anyhow, Context};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::cluster::Clusterdata;
use crate::metrics;
use crate::pgbouncer::PgBouncer;
use crate::store::{StoreClient, StoreEvent};
use crate::stream::{self, RetryFoldOptions, StreamOptions};

/// Host rendered into the config before the first clusterdata event arrives.
const SENTINEL_HOST: &str = "0.0.0.0";

#[derive(Debug, Clone)]
pub struct SuperviseOptions {
    pub clusterdata_key: String,
    pub poll_interval: Duration,
    pub store_timeout: Duration,
    pub pgbouncer_timeout: Duration,
    pub pgbouncer_retry_interval: Duration,
    pub termination_grace_period: Duration,
    pub termination_poll_interval: Duration,
}

/// Runs until PgBouncer dies, the store stream breaks down, or `shutdown`
/// fires. Only the last is a clean exit.
pub async fn run(
    store: StoreClient,
    bouncer: Arc<PgBouncer>,
    opt: SuperviseOptions,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    bouncer
        .generate_config(SENTINEL_HOST)
        .context("failed to generate initial PgBouncer config")?;

    info!(config = %bouncer.config_file, "starting PgBouncer");
    let mut child = Command::new("pgbouncer")
        .arg(bouncer.config_file.as_str())
        .kill_on_drop(true)
        .spawn()
        .context("failed to start PgBouncer")?;

    let stream_cancel = CancellationToken::new();
    let events = stream::spawn(
        store,
        stream_cancel.clone(),
        StreamOptions {
            keys: vec![opt.clusterdata_key.clone()],
            poll_interval: opt.poll_interval,
            get_timeout: opt.store_timeout,
        },
    );
    let events = stream::revision_filter(events);

    // etcd provides events out of order and potentially duplicated; the
    // revision filter above ensures we fold them in their logical order.
    let last_reloaded: Mutex<Option<String>> = Mutex::new(None);
    let fold = stream::retry_fold(
        events,
        RetryFoldOptions {
            interval: opt.pgbouncer_retry_interval,
            timeout: opt.pgbouncer_timeout,
        },
        |event| handle_clusterdata(&bouncer, &last_reloaded, event),
    );
    tokio::pin!(fold);

    tokio::select! {
        status = child.wait() => {
            stream_cancel.cancel();
            let status = status.context("failed to wait on PgBouncer")?;
            Err(anyhow!("PgBouncer exited unexpectedly with {status}"))
        }
        _ = &mut fold => {
            stream_cancel.cancel();
            Err(anyhow!("clusterdata stream ended unexpectedly"))
        }
        _ = shutdown.cancelled() => {
            stream_cancel.cancel();
            drain(&bouncer, &opt).await;

            info!("terminating PgBouncer");
            child.start_kill().context("failed to terminate PgBouncer")?;
            let status = child.wait().await.context("failed to wait on PgBouncer")?;
            debug!(%status, "PgBouncer terminated");
            Ok(())
        }
    }
}

/// Waits for every outstanding connection to finish before the child goes
/// away. The grace period comes first so upstream load balancers notice the
/// node is going and stop sending it new traffic.
async fn drain(bouncer: &PgBouncer, opt: &SuperviseOptions) {
    info!(
        grace = ?opt.termination_grace_period,
        "waiting grace period before rejecting new connections"
    );
    tokio::time::sleep(opt.termination_grace_period).await;

    info!("disabling new PgBouncer connections");
    match tokio::time::timeout(opt.pgbouncer_timeout, bouncer.disable(&[])).await {
        Err(_) => {
            warn!("timed out disabling PgBouncer, terminating anyway");
            return;
        }
        Ok(Err(err)) => {
            warn!("failed to disable PgBouncer, terminating anyway: {err:#}");
            return;
        }
        Ok(Ok(())) => {}
    }

    loop {
        match tokio::time::timeout(opt.pgbouncer_timeout, bouncer.show_databases()).await {
            Err(_) => warn!("timed out listing PgBouncer databases"),
            Ok(Err(err)) => warn!("could not contact PgBouncer: {err:#}"),
            Ok(Ok(databases)) => {
                let mut outstanding = 0;
                for database in &databases {
                    if database.name == bouncer.admin.database {
                        continue;
                    }
                    if database.current_connections > 0 {
                        info!(
                            database = %database.name,
                            count = database.current_connections,
                            "database has outstanding connections"
                        );
                    }
                    outstanding += database.current_connections;
                }
                metrics::OUTSTANDING_CONNECTIONS.set(outstanding as f64);

                if outstanding == 0 {
                    info!("no more connections in PgBouncer, shutting down");
                    return;
                }
                info!(
                    total = outstanding,
                    "waiting for outstanding connections to complete before terminating PgBouncer"
                );
            }
        }

        tokio::time::sleep(opt.termination_poll_interval).await;
    }
}

/// Folds one clusterdata update into the local PgBouncer: render the config
/// for the current primary and reload. Reloads are skipped while the primary
/// address is unknown or unchanged.
async fn handle_clusterdata(
    bouncer: &PgBouncer,
    last_reloaded: &Mutex<Option<String>>,
    event: StoreEvent,
) -> anyhow::Result<()> {
    metrics::STORE_LAST_UPDATE_SECONDS.set(metrics::unix_now());

    let clusterdata =
        Clusterdata::parse(&event.value).context("failed to parse clusterdata update")?;
    for db in clusterdata.databases() {
        metrics::LAST_KEEPER_SECONDS
            .with_label_values(&[&db.spec.keeper_uid])
            .set(metrics::unix_now());
    }

    let Some(master) = clusterdata.master() else {
        info!("no master found, not reloading PgBouncer");
        return Ok(());
    };
    let address = master.status.listen_address.clone();
    if address.is_empty() {
        info!(master = %master, "master has no listen address, not reloading PgBouncer");
        return Ok(());
    }

    if last_reloaded.lock().unwrap().as_deref() == Some(address.as_str()) {
        debug!(master = %master, "master address unchanged, not reloading PgBouncer");
        return Ok(());
    }

    info!(master = %master, "generating configuration");
    bouncer.generate_config(&address)?;

    info!("reloading PgBouncer");
    bouncer.reload().await?;

    *last_reloaded.lock().unwrap() = Some(address.clone());

    // These drive alerts, so they only move once the reload has succeeded.
    metrics::HOST_HASH.set(metrics::md5_float(&address));
    metrics::LAST_RELOAD_SECONDS
        .with_label_values(&[&master.spec.keeper_uid])
        .set(metrics::unix_now());

    Ok(())
}
