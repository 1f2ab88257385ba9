//! `bouncer_ctl` manages PgBouncer in front of a stolon Postgres cluster:
//! it supervises the local pooler (`supervise`), serves the pause API used
//! during failovers (`pauser`), orchestrates a zero-downtime primary switch
//! (`failover`), and reports on cluster and pauser health (`status`).

use std::collections::HashMap;
use std::net::SocketAddr;
use std::process::exit;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use camino::Utf8PathBuf;
use clap::{Args, Parser, Subcommand};
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use bouncer_tools::cluster::{Clusterdata, Db};
use bouncer_tools::failover::{Failover, FailoverOptions};
use bouncer_tools::metrics;
use bouncer_tools::pauser::{self, proto};
use bouncer_tools::pgbouncer::{AdminOptions, PgBouncer};
use bouncer_tools::stolonctl::Stolonctl;
use bouncer_tools::store::{clusterdata_key, StoreClient, StoreOptions};
use bouncer_tools::supervisor::{self, SuperviseOptions};
use utils::logging::{self, LogFormat};
use utils::signals;

const ABOUT: &str = "Tooling to manage PgBouncer with a stolon Postgres cluster";

#[derive(Parser)]
#[command(name = "bouncer_ctl", about = ABOUT, version)]
struct Cli {
    /// Format for logging, either 'plain' or 'json'.
    #[arg(long, global = true, default_value = "plain")]
    log_format: String,
    /// Address to bind the HTTP metrics listener.
    #[arg(long, global = true, default_value = "127.0.0.1")]
    metrics_address: String,
    /// Port to bind the HTTP metrics listener.
    #[arg(long, global = true, default_value_t = 9446)]
    metrics_port: u16,

    #[command(subcommand)]
    command: Command,
}

#[derive(Args)]
struct StoreArgs {
    /// Name of the stolon cluster.
    #[arg(long, env = "STOLONCTL_CLUSTER_NAME")]
    cluster_name: String,
    /// Store backend provider.
    #[arg(long, env = "STOLONCTL_STORE_BACKEND", default_value = "etcdv3")]
    store_backend: String,
    /// Store prefix.
    #[arg(long, env = "STOLONCTL_STORE_PREFIX", default_value = "stolon/cluster")]
    store_prefix: String,
    /// Comma delimited list of store endpoints.
    #[arg(
        long,
        env = "STOLONCTL_STORE_ENDPOINTS",
        default_value = "http://127.0.0.1:2379"
    )]
    store_endpoints: String,
    /// Timeout for store operations.
    #[arg(long, value_parser = humantime::parse_duration, default_value = "3s")]
    store_timeout: Duration,
    /// Timeout when connecting to the store.
    #[arg(long, value_parser = humantime::parse_duration, default_value = "3s")]
    store_dial_timeout: Duration,
    /// Time after which the client pings the store to check the transport.
    #[arg(long, value_parser = humantime::parse_duration, default_value = "30s")]
    store_keepalive_time: Duration,
    /// Timeout for the store keepalive probe.
    #[arg(long, value_parser = humantime::parse_duration, default_value = "5s")]
    store_keepalive_timeout: Duration,
}

impl StoreArgs {
    fn clusterdata_key(&self) -> String {
        clusterdata_key(&self.store_prefix, &self.cluster_name)
    }

    fn stolonctl(&self) -> Stolonctl {
        Stolonctl {
            cluster_name: self.cluster_name.clone(),
            backend: self.store_backend.clone(),
            prefix: self.store_prefix.clone(),
            endpoints: self.store_endpoints.clone(),
        }
    }

    async fn connect(&self) -> anyhow::Result<StoreClient> {
        if self.store_backend != "etcdv3" {
            bail!("unsupported store backend: {}", self.store_backend);
        }

        StoreClient::connect(StoreOptions {
            endpoints: self
                .store_endpoints
                .split(',')
                .map(str::to_string)
                .collect(),
            timeout: self.store_timeout,
            dial_timeout: self.store_dial_timeout,
            keepalive_time: self.store_keepalive_time,
            keepalive_timeout: self.store_keepalive_timeout,
        })
        .await
        .context("failed to connect to store")
    }
}

#[derive(Args)]
struct PgBouncerArgs {
    /// Admin user of PgBouncer.
    #[arg(long, default_value = "pgbouncer")]
    pgbouncer_user: String,
    /// Password for the admin user.
    #[arg(long, default_value = "")]
    pgbouncer_password: String,
    /// PgBouncer special database (inadvisable to change).
    #[arg(long, default_value = "pgbouncer")]
    pgbouncer_database: String,
    /// Directory in which the unix socket resides.
    #[arg(long, default_value = "/var/run/postgresql")]
    pgbouncer_socket_dir: Utf8PathBuf,
    /// Port PgBouncer listens on.
    #[arg(long, default_value_t = 6432)]
    pgbouncer_port: u16,
    /// Path to the PgBouncer config file.
    #[arg(long, default_value = "/etc/pgbouncer/pgbouncer.ini")]
    pgbouncer_config_file: Utf8PathBuf,
    /// Path to the PgBouncer config template file.
    #[arg(long, default_value = "/etc/pgbouncer/pgbouncer.ini.template")]
    pgbouncer_config_template_file: Utf8PathBuf,
}

impl PgBouncerArgs {
    fn pgbouncer(&self) -> PgBouncer {
        PgBouncer {
            config_file: self.pgbouncer_config_file.clone(),
            config_template_file: self.pgbouncer_config_template_file.clone(),
            admin: AdminOptions {
                user: self.pgbouncer_user.clone(),
                password: self.pgbouncer_password.clone(),
                database: self.pgbouncer_database.clone(),
                socket_dir: self.pgbouncer_socket_dir.clone(),
                port: self.pgbouncer_port,
            },
        }
    }
}

#[derive(Subcommand)]
enum Command {
    /// Manage the local PgBouncer, following the cluster primary.
    Supervise {
        #[command(flatten)]
        store: StoreArgs,
        #[command(flatten)]
        pgbouncer: PgBouncerArgs,
        /// Store poll interval.
        #[arg(long, value_parser = humantime::parse_duration, default_value = "1m")]
        poll_interval: Duration,
        /// Timeout for PgBouncer operations.
        #[arg(long, value_parser = humantime::parse_duration, default_value = "5s")]
        pgbouncer_timeout: Duration,
        /// Retry failed PgBouncer operations at this interval.
        #[arg(long, value_parser = humantime::parse_duration, default_value = "5s")]
        pgbouncer_retry_timeout: Duration,
        /// Pause before rejecting new PgBouncer connections (on shutdown).
        #[arg(long, value_parser = humantime::parse_duration, default_value = "5s")]
        termination_grace_period: Duration,
        /// Poll PgBouncer for outstanding connections at this rate.
        #[arg(long, value_parser = humantime::parse_duration, default_value = "10s")]
        termination_poll_interval: Duration,
    },
    /// Serve the PgBouncer pause API.
    Pauser {
        #[command(flatten)]
        pgbouncer: PgBouncerArgs,
        /// Listen address for the pause API.
        #[arg(long, default_value = "0.0.0.0:8080")]
        bind_address: SocketAddr,
        /// Shared token callers must present.
        #[arg(long, default_value = "")]
        token: String,
    },
    /// Run a zero-downtime failover of the Postgres primary.
    Failover {
        #[command(flatten)]
        store: StoreArgs,
        /// Port on which the pauser APIs are listening.
        #[arg(long, default_value_t = 8080)]
        pauser_port: u16,
        /// Shared token presented to the pausers.
        #[arg(long, default_value = "")]
        token: String,
        /// Only health check the pausers, then exit.
        #[arg(long)]
        health_check_only: bool,
        /// Timeout for health checking each pauser.
        #[arg(long, value_parser = humantime::parse_duration, default_value = "2s")]
        health_check_timeout: Duration,
        /// Timeout for running deferred cleanup operations after an abort.
        #[arg(long, value_parser = humantime::parse_duration, default_value = "10s")]
        cleanup_timeout: Duration,
        /// Timeout for acquiring the failover lock.
        #[arg(long, value_parser = humantime::parse_duration, default_value = "5s")]
        lock_timeout: Duration,
        /// Timeout for pausing PgBouncer.
        #[arg(long, value_parser = humantime::parse_duration, default_value = "5s")]
        pause_timeout: Duration,
        /// Time to wait before resuming PgBouncer after pause.
        #[arg(long, value_parser = humantime::parse_duration, default_value = "25s")]
        pause_expiry: Duration,
        /// Timeout for issuing PgBouncer resumes.
        #[arg(long, value_parser = humantime::parse_duration, default_value = "5s")]
        resume_timeout: Duration,
        /// Timeout for executing stolonctl commands.
        #[arg(long, value_parser = humantime::parse_duration, default_value = "5s")]
        stolonctl_timeout: Duration,
    },
    /// Print a JSON summary of cluster and pauser health.
    Status {
        #[command(flatten)]
        store: StoreArgs,
        /// Port on which the pauser APIs are listening.
        #[arg(long, default_value_t = 8080)]
        pauser_port: u16,
        /// Shared token presented to the pausers.
        #[arg(long, default_value = "")]
        token: String,
        /// Timeout for health checking each pauser.
        #[arg(long, value_parser = humantime::parse_duration, default_value = "2s")]
        health_check_timeout: Duration,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    logging::init(LogFormat::from_config(&cli.log_format)?)?;

    let shutdown = CancellationToken::new();
    tokio::spawn(signals::signal_handler(shutdown.clone()));
    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            shutdown.cancelled().await;
            metrics::SHUTDOWN_SECONDS.set(metrics::unix_now());
        });
    }

    let metrics_address: SocketAddr = format!("{}:{}", cli.metrics_address, cli.metrics_port)
        .parse()
        .context("invalid metrics address")?;
    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if let Err(err) = metrics::serve(metrics_address, shutdown).await {
                warn!("metrics listener failed: {err:#}");
            }
        });
    }

    let result = match cli.command {
        Command::Supervise {
            store,
            pgbouncer,
            poll_interval,
            pgbouncer_timeout,
            pgbouncer_retry_timeout,
            termination_grace_period,
            termination_poll_interval,
        } => {
            run_supervise(
                store,
                pgbouncer,
                poll_interval,
                pgbouncer_timeout,
                pgbouncer_retry_timeout,
                termination_grace_period,
                termination_poll_interval,
                shutdown,
            )
            .await
        }
        Command::Pauser {
            pgbouncer,
            bind_address,
            token,
        } => pauser::serve(Arc::new(pgbouncer.pgbouncer()), bind_address, token, shutdown).await,
        Command::Failover {
            store,
            pauser_port,
            token,
            health_check_only,
            health_check_timeout,
            cleanup_timeout,
            lock_timeout,
            pause_timeout,
            pause_expiry,
            resume_timeout,
            stolonctl_timeout,
        } => {
            let opt = FailoverOptions {
                clusterdata_key: store.clusterdata_key(),
                health_check_timeout,
                lock_timeout,
                pause_timeout,
                pause_expiry,
                resume_timeout,
                stolonctl_timeout,
            };
            run_failover(
                store,
                pauser_port,
                token,
                health_check_only,
                opt,
                cleanup_timeout,
                shutdown,
            )
            .await
        }
        Command::Status {
            store,
            pauser_port,
            token,
            health_check_timeout,
        } => run_status(store, pauser_port, token, health_check_timeout).await,
    };

    match result {
        Ok(()) => {
            info!("shutdown");
            Ok(())
        }
        Err(err) => {
            error!("exiting with error: {err:#}");
            exit(1);
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn run_supervise(
    store_args: StoreArgs,
    pgbouncer_args: PgBouncerArgs,
    poll_interval: Duration,
    pgbouncer_timeout: Duration,
    pgbouncer_retry_timeout: Duration,
    termination_grace_period: Duration,
    termination_poll_interval: Duration,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    let store = store_args.connect().await?;
    let bouncer = Arc::new(pgbouncer_args.pgbouncer());

    metrics::CLUSTER_IDENTIFIER
        .with_label_values(&[&store_args.store_prefix, &store_args.cluster_name])
        .set(metrics::md5_float(&format!(
            "{}{}",
            store_args.store_prefix, store_args.cluster_name
        )));
    metrics::STORE_POLL_INTERVAL.set(poll_interval.as_secs_f64());

    supervisor::run(
        store,
        bouncer,
        SuperviseOptions {
            clusterdata_key: store_args.clusterdata_key(),
            poll_interval,
            store_timeout: store_args.store_timeout,
            pgbouncer_timeout,
            pgbouncer_retry_interval: pgbouncer_retry_timeout,
            termination_grace_period,
            termination_poll_interval,
        },
        shutdown,
    )
    .await
}

async fn run_failover(
    store_args: StoreArgs,
    pauser_port: u16,
    token: String,
    health_check_only: bool,
    opt: FailoverOptions,
    cleanup_timeout: Duration,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    let store = store_args.connect().await?;

    let event = store
        .get(&opt.clusterdata_key)
        .await
        .context("failed to get clusterdata")?;
    let clusterdata =
        Clusterdata::parse(&event.value).context("failed to parse clusterdata")?;

    let mut clients = HashMap::new();
    for db in clusterdata.databases() {
        info!(client = %db, "connecting to pauser");
        let endpoint = format!("http://{}:{}", db.status.listen_address, pauser_port);
        clients.insert(db.spec.keeper_uid.clone(), pauser::connect(endpoint, &token)?);
    }

    let failover = Failover::new(store, clients, store_args.stolonctl(), opt);

    if health_check_only {
        return failover.health_check_clients().await;
    }

    // Once the operator aborts, deferred cleanups get cleanup_timeout more
    // before their context goes away too. A second signal kills the process.
    let defer_ctx = CancellationToken::new();
    {
        let shutdown = shutdown.clone();
        let defer_ctx = defer_ctx.clone();
        tokio::spawn(async move {
            shutdown.cancelled().await;
            tokio::time::sleep(cleanup_timeout).await;
            defer_ctx.cancel();
        });
    }

    failover.run(&shutdown, &defer_ctx).await
}

async fn run_status(
    store_args: StoreArgs,
    pauser_port: u16,
    token: String,
    health_check_timeout: Duration,
) -> anyhow::Result<()> {
    let store = store_args.connect().await?;
    let key = store_args.clusterdata_key();

    let event = store.get(&key).await.context("failed to get clusterdata")?;
    let clusterdata =
        Clusterdata::parse(&event.value).context("failed to parse clusterdata")?;

    let mut pausers = serde_json::Map::new();
    for db in clusterdata.databases() {
        let endpoint = format!("http://{}:{}", db.status.listen_address, pauser_port);
        pausers.insert(
            db.spec.keeper_uid.clone(),
            pauser_status(endpoint, &token, health_check_timeout).await,
        );
    }

    let summary = json!({
        "master": clusterdata.master().map(db_summary),
        "synchronous_standbys": clusterdata
            .synchronous_standbys()
            .iter()
            .map(|db| db_summary(db))
            .collect::<Vec<_>>(),
        "asynchronous_standbys": clusterdata
            .asynchronous_standbys()
            .iter()
            .map(|db| db_summary(db))
            .collect::<Vec<_>>(),
        "pausers": pausers,
    });
    println!("{}", serde_json::to_string_pretty(&summary)?);

    Ok(())
}

async fn pauser_status(
    endpoint: String,
    token: &str,
    timeout: Duration,
) -> serde_json::Value {
    let mut client = match pauser::connect(endpoint, token) {
        Ok(client) => client,
        Err(err) => return json!({"status": "UNKNOWN", "error": format!("{err:#}")}),
    };

    match tokio::time::timeout(timeout, client.health_check(proto::Empty {})).await {
        Err(_) => json!({"status": "UNKNOWN", "error": "deadline exceeded"}),
        Ok(Err(status)) => json!({"status": "UNKNOWN", "error": status.to_string()}),
        Ok(Ok(response)) => {
            let response = response.into_inner();
            json!({
                "status": response.status().as_str_name(),
                "components": response
                    .components
                    .iter()
                    .map(|component| json!({
                        "name": component.name,
                        "status": component.status().as_str_name(),
                        "error": component.error,
                    }))
                    .collect::<Vec<_>>(),
            })
        }
    }
}

fn db_summary(db: &Db) -> serde_json::Value {
    json!({
        "keeper_uid": db.spec.keeper_uid,
        "listen_address": db.status.listen_address,
        "port": db.status.port,
        "healthy": db.status.healthy,
    })
}
