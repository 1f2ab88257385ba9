//! The pause API. Every node fronting a keeper runs this service; the
//! failover orchestrator fans out to all of them to buffer client traffic
//! while the primary moves. All RPCs carry a shared token in request
//! metadata.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use anyhow::Context;
use prost_types::Timestamp;
use subtle::ConstantTimeEq;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tonic::metadata::{AsciiMetadataValue, MetadataMap};
use tonic::service::interceptor::InterceptedService;
use tonic::service::Interceptor;
use tonic::transport::{Channel, Endpoint, Server};
use tonic::{Request, Response, Status};
use tracing::{info, warn};

use crate::pgbouncer::PgBouncer;

pub mod proto {
    tonic::include_proto!("pauser");
}

use proto::health_check_response::{Component, Status as HealthStatus};
use proto::pauser_client::PauserClient;
use proto::pauser_server::{Pauser, PauserServer};
use proto::{Empty, HealthCheckResponse, PauseRequest, PauseResponse, ResumeResponse};

const AUTHORIZATION_METADATA_KEY: &str = "authorization";

pub struct PauserService {
    bouncer: Arc<PgBouncer>,
}

#[tonic::async_trait]
impl Pauser for PauserService {
    async fn health_check(
        &self,
        _request: Request<Empty>,
    ) -> Result<Response<HealthCheckResponse>, Status> {
        info!("handling health check");

        let mut components = Vec::new();
        let mut healthy = true;

        let connect = self.bouncer.connect().await;
        healthy &= connect.is_ok();
        components.push(component("pgbouncer", connect));

        let databases = self.bouncer.show_databases().await.map(drop);
        healthy &= databases.is_ok();
        components.push(component("databases", databases));

        let status = if healthy {
            HealthStatus::Healthy
        } else {
            HealthStatus::Unhealthy
        };

        Ok(Response::new(HealthCheckResponse {
            status: status as i32,
            components,
        }))
    }

    async fn pause(
        &self,
        request: Request<PauseRequest>,
    ) -> Result<Response<PauseResponse>, Status> {
        let created_at = SystemTime::now();
        let request = request.into_inner();

        let timeout = request
            .timeout
            .as_ref()
            .and_then(std_duration)
            .ok_or_else(|| Status::invalid_argument("missing or negative pause timeout"))?;
        let expiry = match &request.expiry {
            None => Duration::ZERO,
            Some(expiry) => std_duration(expiry)
                .ok_or_else(|| Status::invalid_argument("negative pause expiry"))?,
        };

        info!(?timeout, ?expiry, "handling pause request");
        match tokio::time::timeout(timeout, self.bouncer.pause()).await {
            Err(_) => return Err(Status::deadline_exceeded("exceeded pause timeout")),
            Ok(Err(err)) => return Err(Status::unknown(format!("{err:#}"))),
            Ok(Ok(())) => {}
        }

        // The pause must clear `expiry` after the moment the request was
        // received, even if no client ever asks for a resume. A failover that
        // goes wrong cannot be allowed to leave PgBouncer paused.
        let expires_at = created_at + expiry;
        let bouncer = self.bouncer.clone();
        schedule_resume(expiry, timeout, move || async move { bouncer.resume().await });

        Ok(Response::new(PauseResponse {
            created_at: Some(Timestamp::from(created_at)),
            expires_at: Some(Timestamp::from(expires_at)),
        }))
    }

    async fn resume(&self, _request: Request<Empty>) -> Result<Response<ResumeResponse>, Status> {
        info!("handling resume request");
        self.bouncer
            .resume()
            .await
            .map_err(|err| Status::unknown(format!("failed to resume pgbouncer: {err:#}")))?;

        Ok(Response::new(ResumeResponse {
            created_at: Some(Timestamp::from(SystemTime::now())),
        }))
    }
}

/// Schedules a detached task that runs `resume` once `expiry` has elapsed,
/// bounded by the same `timeout` the pause was given. A zero expiry disables
/// the self-resume and schedules nothing. Resume failures are logged, never
/// surfaced; the caller has long since been answered.
fn schedule_resume<F, Fut>(expiry: Duration, timeout: Duration, resume: F) -> Option<JoinHandle<()>>
where
    F: FnOnce() -> Fut + Send + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    if expiry.is_zero() {
        return None;
    }

    Some(tokio::spawn(async move {
        info!(delay = ?expiry, "scheduling PgBouncer resume");
        tokio::time::sleep(expiry).await;

        info!("executing scheduled resume");
        match tokio::time::timeout(timeout, resume()).await {
            Err(_) => warn!("scheduled resume timed out"),
            Ok(Err(err)) => warn!("scheduled resume failed: {err:#}"),
            Ok(Ok(())) => {}
        }
    }))
}

fn component<T>(name: &str, result: anyhow::Result<T>) -> Component {
    match result {
        Ok(_) => Component {
            name: name.to_string(),
            status: HealthStatus::Healthy as i32,
            error: String::new(),
        },
        Err(err) => Component {
            name: name.to_string(),
            status: HealthStatus::Unhealthy as i32,
            error: format!("{err:#}"),
        },
    }
}

/// Serves the pause API until `shutdown` fires, then stops accepting
/// requests and drains the in-flight ones.
pub async fn serve(
    bouncer: Arc<PgBouncer>,
    bind_address: SocketAddr,
    token: String,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    // A previous pauser may have crashed with the pool paused and its
    // self-resume undelivered. Resuming at boot recovers that state; resuming
    // an unpaused pool is a no-op.
    if let Err(err) = bouncer.resume().await {
        warn!("boot-time resume failed: {err:#}");
    }

    info!(%bind_address, "listening for pause API requests");
    Server::builder()
        .add_service(PauserServer::with_interceptor(
            PauserService { bouncer },
            TokenAuth::new(token),
        ))
        .serve_with_shutdown(bind_address, shutdown.cancelled())
        .await
        .context("pause API server failed")
}

/// Server-side auth: every inbound RPC must carry the shared token. An empty
/// configured token disables the check.
#[derive(Clone)]
pub struct TokenAuth {
    token: String,
}

impl TokenAuth {
    pub fn new(token: String) -> Self {
        TokenAuth { token }
    }

    fn check(&self, metadata: &MetadataMap) -> Result<(), Status> {
        if self.token.is_empty() {
            return Ok(());
        }

        let provided = metadata
            .get(AUTHORIZATION_METADATA_KEY)
            .and_then(|value| value.to_str().ok())
            .ok_or_else(|| Status::unauthenticated("missing authorization token"))?;

        if verify_token(provided, &self.token) {
            Ok(())
        } else {
            Err(Status::unauthenticated("invalid authorization token"))
        }
    }
}

impl Interceptor for TokenAuth {
    fn call(&mut self, request: Request<()>) -> Result<Request<()>, Status> {
        self.check(request.metadata())?;
        Ok(request)
    }
}

/// Compared in constant time so the check leaks nothing about the expected
/// token through timing. The token itself must never be logged.
fn verify_token(provided: &str, expected: &str) -> bool {
    provided.as_bytes().ct_eq(expected.as_bytes()).into()
}

/// A pauser client with the shared token attached to every outbound request.
pub type Client = PauserClient<InterceptedService<Channel, AttachToken>>;

#[derive(Clone)]
pub struct AttachToken {
    header: Option<AsciiMetadataValue>,
}

impl Interceptor for AttachToken {
    fn call(&mut self, mut request: Request<()>) -> Result<Request<()>, Status> {
        if let Some(header) = &self.header {
            request
                .metadata_mut()
                .insert(AUTHORIZATION_METADATA_KEY, header.clone());
        }
        Ok(request)
    }
}

/// Builds a client for one pauser endpoint. The connection is established
/// lazily so an unreachable node surfaces as a transport error on the call
/// that needs it, not here.
pub fn connect(endpoint: String, token: &str) -> anyhow::Result<Client> {
    let channel = Endpoint::from_shared(endpoint.clone())
        .with_context(|| format!("invalid pauser endpoint {endpoint}"))?
        .connect_lazy();

    let header = if token.is_empty() {
        None
    } else {
        Some(
            token
                .parse()
                .context("token is not valid request metadata")?,
        )
    };

    Ok(PauserClient::with_interceptor(
        channel,
        AttachToken { header },
    ))
}

pub fn proto_duration(duration: Duration) -> prost_types::Duration {
    prost_types::Duration {
        seconds: duration.as_secs() as i64,
        nanos: duration.subsec_nanos() as i32,
    }
}

fn std_duration(duration: &prost_types::Duration) -> Option<Duration> {
    if duration.seconds < 0 || duration.nanos < 0 {
        return None;
    }
    Some(Duration::new(duration.seconds as u64, duration.nanos as u32))
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    #[tokio::test(start_paused = true)]
    async fn scheduled_resume_fires_once_expiry_elapses() {
        let resumes = Arc::new(AtomicUsize::new(0));

        let counter = resumes.clone();
        let handle = schedule_resume(
            Duration::from_secs(20),
            Duration::from_secs(5),
            move || async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            },
        )
        .expect("a positive expiry schedules a resume");

        // Let the task register its timer before the clock moves.
        tokio::task::yield_now().await;
        tokio::time::sleep(Duration::from_secs(19)).await;
        assert_eq!(
            resumes.load(Ordering::SeqCst),
            0,
            "resume must not fire before the expiry elapses"
        );

        handle.await.unwrap();
        assert_eq!(resumes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn zero_expiry_schedules_no_resume() {
        let handle = schedule_resume(Duration::ZERO, Duration::from_secs(5), || async {
            panic!("resume must not be scheduled for a zero expiry")
        });
        assert!(handle.is_none());
    }

    #[test]
    fn verify_token_matches_exactly() {
        assert!(verify_token("secret", "secret"));
        assert!(!verify_token("Secret", "secret"));
        assert!(!verify_token("secret ", "secret"));
        assert!(!verify_token("", "secret"));
    }

    #[test]
    fn token_auth_rejects_missing_and_wrong_tokens() {
        let auth = TokenAuth::new("secret".to_string());

        let missing = MetadataMap::new();
        assert_eq!(
            auth.check(&missing).unwrap_err().code(),
            tonic::Code::Unauthenticated
        );

        let mut wrong = MetadataMap::new();
        wrong.insert(AUTHORIZATION_METADATA_KEY, "other".parse().unwrap());
        assert_eq!(
            auth.check(&wrong).unwrap_err().code(),
            tonic::Code::Unauthenticated
        );

        let mut right = MetadataMap::new();
        right.insert(AUTHORIZATION_METADATA_KEY, "secret".parse().unwrap());
        assert!(auth.check(&right).is_ok());
    }

    #[test]
    fn token_auth_disabled_with_empty_token() {
        let auth = TokenAuth::new(String::new());
        assert!(auth.check(&MetadataMap::new()).is_ok());
    }

    #[test]
    fn duration_round_trip() {
        let duration = Duration::from_millis(25_500);
        assert_eq!(
            std_duration(&proto_duration(duration)),
            Some(duration)
        );
        assert_eq!(
            std_duration(&prost_types::Duration {
                seconds: -1,
                nanos: 0
            }),
            None
        );
    }
}
