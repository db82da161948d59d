use crate::context::NodeContext;
use crate::error::Result;
use crate::keys;
use crate::ledger::RemoveOutcome;
use crate::nodes::NodeView;
use crate::tasks::InternodeTask;
use futures_util::StreamExt;
use std::sync::Arc;

/// Evictions in flight at once.
pub const PRUNE_WORKERS: usize = 4;

#[derive(Clone)]
pub struct PruneReplicasOperation {
    ctx: Arc<NodeContext>,
}

#[derive(Debug, Clone)]
pub struct PruneReplicasOperationRequest {
    pub limit: usize,
}

#[derive(Debug, Clone, Default)]
pub struct PruneReplicasOperationResult {
    pub examined: usize,
    pub evicted: usize,
    pub repaired: usize,
    pub errors: Vec<String>,
}

struct Eviction {
    oid: String,
    node_id: String,
}

impl PruneReplicasOperation {
    pub fn new(ctx: Arc<NodeContext>) -> Self {
        Self { ctx }
    }

    pub async fn run(
        &self,
        request: PruneReplicasOperationRequest,
    ) -> Result<PruneReplicasOperationResult> {
        let PruneReplicasOperationRequest { limit } = request;
        let config = self.ctx.cluster_config();
        let max = config.max_replicas;

        let mut result = PruneReplicasOperationResult::default();
        let rows = self
            .ctx
            .store
            .scan(&keys::repl_at_least(max + 1).with_limit(limit))
            .await?;

        let mut evictions = Vec::new();
        for (key, _) in rows {
            let Some((indexed, oid)) = keys::parse_repl(&key) else {
                continue;
            };
            result.examined += 1;

            let record = match self.ctx.ledger.get(&oid).await {
                Ok(record) => record,
                Err(error) => {
                    result.errors.push(format!("{}: {}", oid, error));
                    continue;
                }
            };
            let record = match record {
                Some(record) if record.replica_count() == indexed => record,
                _ => {
                    if let Err(error) = self.ctx.ledger.repair_indexes(&oid, Some(&key)).await {
                        result.errors.push(format!("{}: {}", oid, error));
                    }
                    result.repaired += 1;
                    continue;
                }
            };
            if record.replica_count() <= max {
                continue;
            }

            let excess = record.replica_count() - max;
            tracing::info!(
                "over-replicated blob oid={} replicas={} max={}",
                oid,
                record.replica_count(),
                max
            );
            evictions.extend(
                record
                    .owners_oldest_first()
                    .into_iter()
                    .take(excess)
                    .map(|node_id| Eviction {
                        oid: oid.clone(),
                        node_id,
                    }),
            );
        }

        if evictions.is_empty() {
            return Ok(result);
        }

        let view = self.ctx.node_view().await?;
        let outcomes: Vec<std::result::Result<bool, String>> =
            futures_util::stream::iter(evictions)
                .map(|eviction| self.evict(eviction, max, &view))
                .buffer_unordered(PRUNE_WORKERS)
                .collect()
                .await;

        for outcome in outcomes {
            match outcome {
                Ok(true) => result.evicted += 1,
                Ok(false) => {}
                Err(error) => result.errors.push(error),
            }
        }
        Ok(result)
    }

    /// Drop one owner, never going below `max` owners, then delete its copy.
    async fn evict(
        &self,
        eviction: Eviction,
        max: usize,
        view: &NodeView,
    ) -> std::result::Result<bool, String> {
        let Eviction { oid, node_id } = eviction;
        let outcome = self
            .ctx
            .ledger
            .remove_ownership_keeping(&oid, &node_id, max)
            .await
            .map_err(|error| format!("{} on {}: {}", oid, node_id, error))?;

        match outcome {
            RemoveOutcome::Removed { remaining } => {
                tracing::info!(
                    "evicted replica oid={} node={} remaining={}",
                    oid,
                    node_id,
                    remaining
                );
                if let Some(node) = view.get(&node_id) {
                    self.ctx
                        .tasks
                        .enqueue(InternodeTask::Remove {
                            oid: oid.clone(),
                            node: node.clone(),
                        })
                        .await
                        .map_err(|error| format!("{} on {}: {}", oid, node_id, error))?;
                }
                Ok(true)
            }
            RemoveOutcome::Refused { remaining } => {
                tracing::debug!(
                    "eviction would drop below max oid={} node={} remaining={}",
                    oid,
                    node_id,
                    remaining
                );
                Ok(false)
            }
            RemoveOutcome::Unknown => Ok(false),
        }
    }
}
