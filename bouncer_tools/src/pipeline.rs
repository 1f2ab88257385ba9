//! Step-by-step processes with deferred cleanup actions. Cleanups are held on
//! an explicit LIFO stack rather than hidden in scope-exit so they can run
//! under their own cancellation context: an operator abort cancels forward
//! progress immediately while cleanups get a bounded extra period to restore
//! the world.

use std::future::Future;

use anyhow::{anyhow, Context};
use futures::future::BoxFuture;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

type StepFn<'a> = Box<dyn FnOnce() -> BoxFuture<'a, anyhow::Result<()>> + Send + 'a>;

pub struct Step<'a> {
    name: &'static str,
    action: StepFn<'a>,
    deferred: Vec<(&'static str, StepFn<'a>)>,
}

impl<'a> Step<'a> {
    pub fn new<F, Fut>(name: &'static str, action: F) -> Self
    where
        F: FnOnce() -> Fut + Send + 'a,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'a,
    {
        Step {
            name,
            action: Box::new(move || Box::pin(action())),
            deferred: Vec::new(),
        }
    }

    /// Registers a cleanup that runs once this step has been entered,
    /// regardless of whether the step or any later step fails.
    pub fn defer<F, Fut>(mut self, name: &'static str, cleanup: F) -> Self
    where
        F: FnOnce() -> Fut + Send + 'a,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'a,
    {
        self.deferred.push((name, Box::new(move || Box::pin(cleanup()))));
        self
    }
}

/// Runs `steps` in order, stopping at the first failure, then runs every
/// registered cleanup in reverse registration order. Cleanups are registered
/// when their step is entered, before its action runs, so a failing action
/// still gets its own cleanup. Cleanup failures are logged, never propagated;
/// the caller sees the first action error.
pub async fn run(
    steps: Vec<Step<'_>>,
    ctx: &CancellationToken,
    defer_ctx: &CancellationToken,
) -> anyhow::Result<()> {
    let mut deferred: Vec<(&'static str, StepFn<'_>)> = Vec::new();
    let mut result = Ok(());

    for step in steps {
        deferred.extend(step.deferred);

        info!(step = step.name, "running step");
        result = bounded(step.action, ctx)
            .await
            .with_context(|| format!("step {} failed", step.name));
        if result.is_err() {
            break;
        }
    }

    for (name, cleanup) in deferred.into_iter().rev() {
        info!(step = name, "running deferred cleanup");
        if let Err(err) = bounded(cleanup, defer_ctx).await {
            warn!(step = name, "deferred cleanup failed: {err:#}");
        }
    }

    result
}

async fn bounded(f: StepFn<'_>, token: &CancellationToken) -> anyhow::Result<()> {
    tokio::select! {
        _ = token.cancelled() => Err(anyhow!("cancelled")),
        result = f() => result,
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use anyhow::bail;

    use super::*;

    type Log = Arc<Mutex<Vec<&'static str>>>;

    fn record(log: &Log, name: &'static str) -> impl Future<Output = anyhow::Result<()>> {
        let log = log.clone();
        async move {
            log.lock().unwrap().push(name);
            Ok(())
        }
    }

    fn record_err(log: &Log, name: &'static str) -> impl Future<Output = anyhow::Result<()>> {
        let log = log.clone();
        async move {
            log.lock().unwrap().push(name);
            bail!("sample")
        }
    }

    #[tokio::test]
    async fn runs_entire_pipeline_including_deferred() {
        let log: Log = Default::default();
        let ctx = CancellationToken::new();

        let steps = vec![
            Step::new("a", || record(&log, "a")).defer("a_defer", || record(&log, "a_defer")),
            Step::new("b", || record(&log, "b")),
        ];
        run(steps, &ctx, &ctx).await.unwrap();

        assert_eq!(*log.lock().unwrap(), vec!["a", "b", "a_defer"]);
    }

    #[tokio::test]
    async fn failed_step_runs_its_own_deferred_but_no_more_steps() {
        let log: Log = Default::default();
        let ctx = CancellationToken::new();

        let steps = vec![
            Step::new("a", || record_err(&log, "a")).defer("a_defer", || record(&log, "a_defer")),
            Step::new("b", || record(&log, "b")),
        ];
        let err = run(steps, &ctx, &ctx).await.unwrap_err();

        assert!(err.to_string().contains("step a failed"));
        assert_eq!(*log.lock().unwrap(), vec!["a", "a_defer"]);
    }

    #[tokio::test]
    async fn deferred_run_in_lifo_order() {
        let log: Log = Default::default();
        let ctx = CancellationToken::new();

        let steps = vec![
            Step::new("a", || record(&log, "a"))
                .defer("a_defer1", || record(&log, "a_defer1"))
                .defer("a_defer2", || record(&log, "a_defer2")),
            Step::new("b", || record(&log, "b")).defer("b_defer", || record(&log, "b_defer")),
        ];
        run(steps, &ctx, &ctx).await.unwrap();

        assert_eq!(
            *log.lock().unwrap(),
            vec!["a", "b", "b_defer", "a_defer2", "a_defer1"]
        );
    }

    #[tokio::test]
    async fn cleanup_failure_does_not_mask_success() {
        let log: Log = Default::default();
        let ctx = CancellationToken::new();

        let steps = vec![
            Step::new("a", || record(&log, "a")).defer("a_defer", || record_err(&log, "a_defer"))
        ];
        run(steps, &ctx, &ctx).await.unwrap();

        assert_eq!(*log.lock().unwrap(), vec!["a", "a_defer"]);
    }

    #[tokio::test]
    async fn cancelled_forward_context_still_runs_deferred() {
        let log: Log = Default::default();
        let ctx = CancellationToken::new();
        let defer_ctx = CancellationToken::new();
        ctx.cancel();

        let steps = vec![
            Step::new("a", || std::future::pending()).defer("a_defer", || record(&log, "a_defer")),
            Step::new("b", || record(&log, "b")),
        ];
        let err = run(steps, &ctx, &defer_ctx).await.unwrap_err();

        assert!(err.to_string().contains("step a failed"));
        assert_eq!(*log.lock().unwrap(), vec!["a_defer"]);
    }
}
