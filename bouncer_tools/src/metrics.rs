//! Process-global prometheus metrics, registered against the default
//! registry at first use and exported over HTTP. Values that power alerts
//! (host hash, reload times) are only set once the corresponding operation
//! has actually succeeded.

use std::net::SocketAddr;
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::Context;
use axum::http::header;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use once_cell::sync::Lazy;
use prometheus::{
    register_gauge, register_gauge_vec, Encoder, Gauge, GaugeVec, TextEncoder,
};
use tokio_util::sync::CancellationToken;
use tracing::info;

pub static CLUSTER_IDENTIFIER: Lazy<GaugeVec> = Lazy::new(|| {
    register_gauge_vec!(
        "bouncer_cluster_identifier",
        "MD5 hash of the cluster name and store prefix",
        &["store_prefix", "cluster_name"]
    )
    .expect("failed to register bouncer_cluster_identifier")
});

pub static SHUTDOWN_SECONDS: Lazy<Gauge> = Lazy::new(|| {
    register_gauge!(
        "bouncer_shutdown_seconds",
        "Shutdown time (received termination signal) since unix epoch in seconds"
    )
    .expect("failed to register bouncer_shutdown_seconds")
});

pub static OUTSTANDING_CONNECTIONS: Lazy<Gauge> = Lazy::new(|| {
    register_gauge!(
        "bouncer_outstanding_connections",
        "Number of outstanding connections in PgBouncer during shutdown"
    )
    .expect("failed to register bouncer_outstanding_connections")
});

pub static HOST_HASH: Lazy<Gauge> = Lazy::new(|| {
    register_gauge!(
        "bouncer_host_hash",
        "MD5 hash of the last successfully reloaded host value"
    )
    .expect("failed to register bouncer_host_hash")
});

pub static STORE_POLL_INTERVAL: Lazy<Gauge> = Lazy::new(|| {
    register_gauge!(
        "bouncer_store_poll_interval",
        "Seconds between each store poll attempt"
    )
    .expect("failed to register bouncer_store_poll_interval")
});

pub static STORE_LAST_UPDATE_SECONDS: Lazy<Gauge> = Lazy::new(|| {
    register_gauge!(
        "bouncer_store_last_update_seconds",
        "Most recent clusterdata update since unix epoch in seconds"
    )
    .expect("failed to register bouncer_store_last_update_seconds")
});

pub static LAST_KEEPER_SECONDS: Lazy<GaugeVec> = Lazy::new(|| {
    register_gauge_vec!(
        "bouncer_last_keeper_seconds",
        "Most recent time each keeper was seen in clusterdata, since unix epoch in seconds",
        &["keeper"]
    )
    .expect("failed to register bouncer_last_keeper_seconds")
});

pub static LAST_RELOAD_SECONDS: Lazy<GaugeVec> = Lazy::new(|| {
    register_gauge_vec!(
        "bouncer_last_reload_seconds",
        "Most recent PgBouncer reload time since unix epoch in seconds",
        &["keeper"]
    )
    .expect("failed to register bouncer_last_reload_seconds")
});

/// Generates a float64 from the md5 hash of the given value, for exposing
/// distinct string identities through prometheus. Only the first 48 bits of
/// the hash are used as the float64 mantissa holds 53.
pub fn md5_float(content: &str) -> f64 {
    let digest = md5::compute(content);
    let mut bytes = [0u8; 8];
    bytes[..6].copy_from_slice(&digest[..6]);
    u64::from_le_bytes(bytes) as f64
}

pub fn unix_now() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64()
}

/// Serves `/metrics` until the token fires.
pub async fn serve(address: SocketAddr, cancel: CancellationToken) -> anyhow::Result<()> {
    let app = Router::new().route("/metrics", get(render));
    let listener = tokio::net::TcpListener::bind(address)
        .await
        .with_context(|| format!("failed to bind metrics listener on {address}"))?;

    info!(%address, "serving prometheus metrics");
    axum::serve(listener, app)
        .with_graceful_shutdown(cancel.cancelled_owned())
        .await
        .context("metrics listener failed")
}

async fn render() -> impl IntoResponse {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    if let Err(err) = encoder.encode(&prometheus::gather(), &mut buffer) {
        return (
            axum::http::StatusCode::INTERNAL_SERVER_ERROR,
            [(header::CONTENT_TYPE, "text/plain".to_string())],
            err.to_string().into_bytes(),
        );
    }

    (
        axum::http::StatusCode::OK,
        [(header::CONTENT_TYPE, encoder.format_type().to_string())],
        buffer,
    )
}
