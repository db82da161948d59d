//! The cluster-wide periodic jobs every node schedules.

use crate::config::ClusterConfig;
use crate::context::NodeContext;
use crate::error::Result;
use crate::lease::LeaseGuard;
use crate::operations::{
    CheckStaleNodesOperation, EnsureMinReplicasOperation, EnsureMinReplicasOperationRequest,
    GarbageCollectOperation, GarbageCollectOperationRequest, PruneReplicasOperation,
    PruneReplicasOperationRequest,
};
use crate::scheduler::{JobScheduler, PeriodicJob, RUNNING_POLL, with_running_marker};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

pub const CHECK_STALE_NODES: &str = "check_stale_nodes";
pub const GARBAGE_COLLECT: &str = "garbage_collect";
pub const ENSURE_MIN_REPLICAS: &str = "ensure_min_replicas";
pub const PRUNE_REPLICAS: &str = "prune_replicas";

pub struct CheckStaleNodesJob;

#[async_trait]
impl PeriodicJob for CheckStaleNodesJob {
    fn name(&self) -> &'static str {
        CHECK_STALE_NODES
    }

    fn period(&self, config: &ClusterConfig) -> Duration {
        config.stale_node_check_freq
    }

    async fn run(
        &self,
        ctx: &Arc<NodeContext>,
        _lease: &LeaseGuard,
        _cancel: &CancellationToken,
    ) -> Result<()> {
        let result = CheckStaleNodesOperation::new(ctx.clone()).run().await?;
        for error in &result.errors {
            tracing::warn!("stale node check error: {}", error);
        }
        Ok(())
    }
}

/// Waits out the under-replication pass, then collects.
pub struct GarbageCollectJob;

#[async_trait]
impl PeriodicJob for GarbageCollectJob {
    fn name(&self) -> &'static str {
        GARBAGE_COLLECT
    }

    fn period(&self, config: &ClusterConfig) -> Duration {
        config.gc_freq
    }

    async fn run(
        &self,
        ctx: &Arc<NodeContext>,
        lease: &LeaseGuard,
        cancel: &CancellationToken,
    ) -> Result<()> {
        ctx.lease
            .wait_while_running(ENSURE_MIN_REPLICAS, RUNNING_POLL, cancel)
            .await?;
        lease.ensure_held().await?;

        let config = ctx.cluster_config();
        let request = GarbageCollectOperationRequest {
            page_size: config.gc_limit,
            grace: config.gc_grace,
        };
        let result = with_running_marker(
            ctx,
            GARBAGE_COLLECT,
            GarbageCollectOperation::new(ctx.clone()).run(request, Some(lease), cancel),
        )
        .await?;
        for error in &result.errors {
            tracing::warn!("garbage collection error: {}", error);
        }
        Ok(())
    }
}

pub struct EnsureMinReplicasJob;

#[async_trait]
impl PeriodicJob for EnsureMinReplicasJob {
    fn name(&self) -> &'static str {
        ENSURE_MIN_REPLICAS
    }

    fn period(&self, config: &ClusterConfig) -> Duration {
        config.under_replica_check_freq
    }

    async fn run(
        &self,
        ctx: &Arc<NodeContext>,
        _lease: &LeaseGuard,
        _cancel: &CancellationToken,
    ) -> Result<()> {
        let request = EnsureMinReplicasOperationRequest {
            limit: ctx.cluster_config().replication_check_limit,
        };
        let result = with_running_marker(
            ctx,
            ENSURE_MIN_REPLICAS,
            EnsureMinReplicasOperation::new(ctx.clone()).run(request),
        )
        .await?;
        for error in &result.errors {
            tracing::warn!("replication check error: {}", error);
        }
        Ok(())
    }
}

pub struct PruneReplicasJob;

#[async_trait]
impl PeriodicJob for PruneReplicasJob {
    fn name(&self) -> &'static str {
        PRUNE_REPLICAS
    }

    fn period(&self, config: &ClusterConfig) -> Duration {
        config.over_replica_check_freq
    }

    async fn run(
        &self,
        ctx: &Arc<NodeContext>,
        _lease: &LeaseGuard,
        _cancel: &CancellationToken,
    ) -> Result<()> {
        let request = PruneReplicasOperationRequest {
            limit: ctx.cluster_config().replication_check_limit,
        };
        let result = PruneReplicasOperation::new(ctx.clone()).run(request).await?;
        for error in &result.errors {
            tracing::warn!("replica pruning error: {}", error);
        }
        Ok(())
    }
}

/// A scheduler carrying every cluster job.
pub fn cluster_scheduler(ctx: Arc<NodeContext>) -> JobScheduler {
    JobScheduler::new(ctx)
        .with_job(CheckStaleNodesJob)
        .with_job(GarbageCollectJob)
        .with_job(EnsureMinReplicasJob)
        .with_job(PruneReplicasJob)
}
