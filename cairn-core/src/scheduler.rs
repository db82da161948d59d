//! Lease-gated periodic jobs.
//!
//! Every node runs the same set of jobs on its own timer. Before a run the
//! node tries to take the job's cluster lease with a TTL equal to the job
//! period, so across the fleet a job runs at most once per period. After a
//! successful run the lease is left to expire; it is only released early when
//! the run fails.

use crate::config::ClusterConfig;
use crate::context::NodeContext;
use crate::error::{CairnError, Result};
use crate::lease::LeaseGuard;
use async_trait::async_trait;
use rand::Rng;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// How often a job blocked on another job's running marker re-checks it.
pub const RUNNING_POLL: Duration = Duration::from_secs(5);

#[async_trait]
pub trait PeriodicJob: Send + Sync {
    /// Cluster-wide task name, used for the lease and running marker keys.
    fn name(&self) -> &'static str;

    /// Zero disables the job.
    fn period(&self, config: &ClusterConfig) -> Duration;

    async fn run(
        &self,
        ctx: &Arc<NodeContext>,
        lease: &LeaseGuard,
        cancel: &CancellationToken,
    ) -> Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobRun {
    Disabled,
    NotAcquired,
    Completed,
    Failed,
}

/// Random delay before the first run of each job.
#[derive(Debug, Clone, Copy)]
pub struct StartupJitter {
    pub base: Duration,
    pub spread: Duration,
}

impl Default for StartupJitter {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(5),
            spread: Duration::from_secs(60),
        }
    }
}

impl StartupJitter {
    pub fn none() -> Self {
        Self {
            base: Duration::ZERO,
            spread: Duration::ZERO,
        }
    }

    fn sample(&self) -> Duration {
        if self.spread.is_zero() {
            return self.base;
        }
        let millis = rand::thread_rng().gen_range(0..self.spread.as_millis() as u64);
        self.base + Duration::from_millis(millis)
    }
}

pub struct JobScheduler {
    ctx: Arc<NodeContext>,
    jobs: Vec<Arc<dyn PeriodicJob>>,
    jitter: StartupJitter,
}

impl JobScheduler {
    pub fn new(ctx: Arc<NodeContext>) -> Self {
        Self {
            ctx,
            jobs: Vec::new(),
            jitter: StartupJitter::default(),
        }
    }

    pub fn with_job(mut self, job: impl PeriodicJob + 'static) -> Self {
        self.jobs.push(Arc::new(job));
        self
    }

    pub fn with_jitter(mut self, jitter: StartupJitter) -> Self {
        self.jitter = jitter;
        self
    }

    pub fn job_names(&self) -> Vec<&'static str> {
        self.jobs.iter().map(|job| job.name()).collect()
    }

    /// One loop per job, all stopping on `cancel`.
    pub fn spawn(self, cancel: CancellationToken) -> Vec<JoinHandle<()>> {
        self.jobs
            .into_iter()
            .map(|job| {
                let ctx = self.ctx.clone();
                let cancel = cancel.clone();
                let delay = self.jitter.sample();
                tokio::spawn(async move { job_loop(ctx, job, delay, cancel).await })
            })
            .collect()
    }
}

async fn job_loop(
    ctx: Arc<NodeContext>,
    job: Arc<dyn PeriodicJob>,
    delay: Duration,
    cancel: CancellationToken,
) {
    tracing::debug!("scheduling job={} first_run_in={:?}", job.name(), delay);
    tokio::select! {
        _ = cancel.cancelled() => return,
        _ = tokio::time::sleep(delay) => {}
    }

    let mut warned_disabled = false;
    loop {
        let config = ctx.cluster_config();
        let period = job.period(&config);
        let wait = if period.is_zero() {
            if !warned_disabled {
                tracing::warn!("periodic job disabled, zero frequency job={}", job.name());
                warned_disabled = true;
            }
            config.config_refresh_freq.max(Duration::from_secs(1))
        } else {
            warned_disabled = false;
            run_job_once(&ctx, job.as_ref(), &cancel).await;
            // Just past the lease TTL so the next attempt can take it.
            period + Duration::from_secs(1)
        };

        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(wait) => {}
        }
    }
    tracing::debug!("job loop stopped job={}", job.name());
}

/// Try to take the job's lease and run it once.
pub async fn run_job_once(
    ctx: &Arc<NodeContext>,
    job: &dyn PeriodicJob,
    cancel: &CancellationToken,
) -> JobRun {
    let name = job.name();
    let period = job.period(&ctx.cluster_config());
    if period.is_zero() {
        return JobRun::Disabled;
    }

    match ctx.lease.try_acquire(name, period).await {
        Ok(true) => {}
        Ok(false) => {
            tracing::debug!("job lease held elsewhere job={}", name);
            return JobRun::NotAcquired;
        }
        Err(error) => {
            tracing::warn!("failed to acquire job lease job={} error={}", name, error);
            return JobRun::NotAcquired;
        }
    }

    let guard = ctx.lease.guard(name, period);
    tracing::info!("running periodic job job={} node={}", name, ctx.node_id());
    match job.run(ctx, &guard, cancel).await {
        Ok(()) => {
            tracing::info!("periodic job finished job={}", name);
            JobRun::Completed
        }
        Err(CairnError::LeaseLost(task)) => {
            tracing::warn!("periodic job aborted, lease lost job={}", task);
            JobRun::Failed
        }
        Err(error) => {
            tracing::error!("periodic job failed job={} error={}", name, error);
            if let Err(error) = ctx.lease.release(name).await {
                tracing::warn!("failed to release job lease job={} error={}", name, error);
            }
            JobRun::Failed
        }
    }
}

/// Run `work` with this node's running marker for `task` set, clearing the
/// marker afterwards whatever the outcome.
pub async fn with_running_marker<T, F>(ctx: &NodeContext, task: &str, work: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    ctx.lease.mark_running(task).await?;
    let outcome = work.await;
    if let Err(error) = ctx.lease.clear_running(task).await {
        tracing::warn!("failed to clear running marker task={} error={}", task, error);
    }
    outcome
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::TestCluster;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingJob {
        runs: Arc<AtomicUsize>,
        period: Duration,
        fail: bool,
    }

    #[async_trait]
    impl PeriodicJob for CountingJob {
        fn name(&self) -> &'static str {
            "counting"
        }

        fn period(&self, _config: &ClusterConfig) -> Duration {
            self.period
        }

        async fn run(
            &self,
            _ctx: &Arc<NodeContext>,
            lease: &LeaseGuard,
            _cancel: &CancellationToken,
        ) -> Result<()> {
            lease.ensure_held().await?;
            self.runs.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(CairnError::Internal("boom".to_string()));
            }
            Ok(())
        }
    }

    fn job(period: Duration, fail: bool) -> (CountingJob, Arc<AtomicUsize>) {
        let runs = Arc::new(AtomicUsize::new(0));
        (
            CountingJob {
                runs: runs.clone(),
                period,
                fail,
            },
            runs,
        )
    }

    #[tokio::test]
    async fn test_job_runs_once_per_period_across_nodes() {
        let cluster = TestCluster::new(2).await;
        let (job, runs) = job(Duration::from_secs(60), false);
        let cancel = CancellationToken::new();

        assert_eq!(
            run_job_once(cluster.node(0), &job, &cancel).await,
            JobRun::Completed
        );
        assert_eq!(
            run_job_once(cluster.node(1), &job, &cancel).await,
            JobRun::NotAcquired
        );
        assert_eq!(
            run_job_once(cluster.node(0), &job, &cancel).await,
            JobRun::NotAcquired
        );
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_failed_job_releases_lease() {
        let cluster = TestCluster::new(2).await;
        let (job, runs) = job(Duration::from_secs(60), true);
        let cancel = CancellationToken::new();

        assert_eq!(run_job_once(cluster.node(0), &job, &cancel).await, JobRun::Failed);
        assert_eq!(run_job_once(cluster.node(1), &job, &cancel).await, JobRun::Failed);
        assert_eq!(runs.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_zero_period_disables_job() {
        let cluster = TestCluster::new(1).await;
        let (job, runs) = job(Duration::ZERO, false);
        let cancel = CancellationToken::new();

        assert_eq!(
            run_job_once(cluster.node(0), &job, &cancel).await,
            JobRun::Disabled
        );
        assert_eq!(runs.load(Ordering::SeqCst), 0);
        assert!(cluster.node(0).lease.holder("counting").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_running_marker_cleared_after_error() {
        let cluster = TestCluster::new(1).await;
        let ctx = cluster.node(0);

        let outcome: Result<()> = with_running_marker(ctx, "marked", async {
            assert!(ctx.lease.is_running("marked").await.unwrap());
            Err(CairnError::Internal("failed".to_string()))
        })
        .await;

        assert!(outcome.is_err());
        assert!(!ctx.lease.is_running("marked").await.unwrap());
    }

    #[tokio::test]
    async fn test_spawned_loop_runs_and_stops() {
        let cluster = TestCluster::new(1).await;
        let (job, runs) = job(Duration::from_secs(3600), false);
        let cancel = CancellationToken::new();

        let handles = JobScheduler::new(cluster.node(0).clone())
            .with_job(job)
            .with_jitter(StartupJitter::none())
            .spawn(cancel.clone());

        for _ in 0..100 {
            if runs.load(Ordering::SeqCst) > 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        cancel.cancel();
        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }
}
