use crate::context::NodeContext;
use crate::error::Result;
use crate::keys;
use crate::nodes::NodeView;
use crate::store::KeyRange;
use crate::tasks::{describe_removal, salvage_blob};
use std::sync::Arc;

#[derive(Clone)]
pub struct CheckStaleNodesOperation {
    ctx: Arc<NodeContext>,
}

#[derive(Debug, Clone, Default)]
pub struct CheckStaleNodesOperationResult {
    pub stale_nodes: Vec<String>,
    /// Nodes whose record expired while they still owned blobs.
    pub orphaned_nodes: Vec<String>,
    pub cleaned: Vec<CleanupNodeResult>,
    pub errors: Vec<String>,
}

#[derive(Debug, Clone, Default)]
pub struct CleanupNodeResult {
    pub node_id: String,
    pub examined: usize,
    pub dropped: usize,
    pub salvaged: usize,
    pub lost: usize,
    pub repaired: usize,
    /// The node came back while being reaped.
    pub revived: bool,
    pub node_removed: bool,
    pub queue_full: bool,
}

impl CheckStaleNodesOperation {
    pub fn new(ctx: Arc<NodeContext>) -> Self {
        Self { ctx }
    }

    /// Reap every stale node other than this one.
    pub async fn run(&self) -> Result<CheckStaleNodesOperationResult> {
        let view = self.ctx.node_view().await?;
        let mut result = CheckStaleNodesOperationResult::default();

        for node in view.stale() {
            if node.node_id == self.ctx.node_id() {
                tracing::warn!("own node record is stale node={}", node.node_id);
                continue;
            }
            tracing::info!(
                "node is stale node={} last_heartbeat={}",
                node.node_id,
                node.last_heartbeat
            );
            result.stale_nodes.push(node.node_id.clone());
            self.cleanup_into(&node.node_id, &view, &mut result).await;
        }

        for node_id in self.orphaned_owners(&view).await? {
            tracing::info!("draining owner entries of unregistered node node={}", node_id);
            result.orphaned_nodes.push(node_id.clone());
            self.cleanup_into(&node_id, &view, &mut result).await;
        }
        Ok(result)
    }

    async fn cleanup_into(
        &self,
        node_id: &str,
        view: &NodeView,
        result: &mut CheckStaleNodesOperationResult,
    ) {
        match self.cleanup_node(node_id, view).await {
            Ok(cleaned) => result.cleaned.push(cleaned),
            Err(error) => {
                tracing::warn!("node cleanup failed node={} error={}", node_id, error);
                result.errors.push(format!("{}: {}", node_id, error));
            }
        }
    }

    /// Nodes that still have owner index entries but no registry record,
    /// typically because the record expired before the drain finished.
    async fn orphaned_owners(&self, view: &NodeView) -> Result<Vec<String>> {
        let mut orphaned = Vec::new();
        let mut after: Option<String> = None;
        loop {
            let rows = self
                .ctx
                .store
                .scan(&keys::next_owner_node(after.as_deref()))
                .await?;
            let Some(node_id) = rows
                .first()
                .and_then(|(key, _)| keys::parse_owner_node(key))
                .map(str::to_string)
            else {
                break;
            };
            if node_id != self.ctx.node_id() && view.get(&node_id).is_none() {
                orphaned.push(node_id.clone());
            }
            after = Some(node_id);
        }
        Ok(orphaned)
    }

    /// Drain one batch of the dead node's ownership entries, re-replicating
    /// blobs that would fall under the minimum, and delete the node record
    /// once nothing is left.
    pub async fn cleanup_node(&self, node_id: &str, view: &NodeView) -> Result<CleanupNodeResult> {
        let config = self.ctx.cluster_config();
        let mut result = CleanupNodeResult {
            node_id: node_id.to_string(),
            ..CleanupNodeResult::default()
        };

        if config.node_clean_count == 0 {
            tracing::warn!("node cleanup disabled, node_clean_count is zero");
            return Ok(result);
        }

        // The version read here is what the final delete is conditioned on.
        let current = self.ctx.registry.get(node_id).await?;
        if let Some((node, _)) = &current {
            if !node.is_stale(chrono::Utc::now(), config.stale_node_limit) {
                tracing::info!("node came back, skipping cleanup node={}", node_id);
                result.revived = true;
                return Ok(result);
            }
        }

        let range = KeyRange::prefix(&keys::owner_index_prefix(node_id))
            .with_limit(config.node_clean_count);
        let rows = self.ctx.store.scan(&range).await?;
        let live = view.live(config.heartbeat_freq);
        let target = config.min_replicas.min(live.len());

        for (key, _) in &rows {
            let Some(oid) = keys::parse_owner(key, node_id) else {
                continue;
            };
            result.examined += 1;

            let record = match self.ctx.ledger.get(oid).await? {
                Some(record) if record.is_owned_by(node_id) => record,
                _ => {
                    self.ctx.store.delete(key).await?;
                    result.repaired += 1;
                    continue;
                }
            };

            let remaining = record
                .nodes
                .keys()
                .filter(|owner| owner.as_str() != node_id && view.is_live(owner))
                .count();
            if remaining == 0 {
                tracing::error!("last replica was on a dead node oid={} node={}", oid, node_id);
                result.lost += 1;
            } else if remaining < target {
                if !salvage_blob(&self.ctx, &record, Some(node_id), target - remaining, &live) {
                    tracing::info!("task queue full, ending node cleanup early node={}", node_id);
                    result.queue_full = true;
                    break;
                }
                result.salvaged += 1;
            }

            let outcome = self.ctx.ledger.remove_ownership(oid, node_id).await?;
            tracing::debug!(
                "dropped dead owner oid={} node={} outcome={}",
                oid,
                node_id,
                describe_removal(outcome)
            );
            result.dropped += 1;
        }

        if rows.is_empty() {
            match current {
                Some((_, version)) => {
                    result.node_removed = self.ctx.registry.remove_if_unchanged(node_id, version).await?;
                    if result.node_removed {
                        tracing::info!("removed dead node record node={}", node_id);
                    } else {
                        tracing::info!("node record changed during cleanup node={}", node_id);
                    }
                }
                None => {
                    self.ctx.store.delete(&keys::node_stat(node_id)).await?;
                }
            }
        }
        Ok(result)
    }
}
