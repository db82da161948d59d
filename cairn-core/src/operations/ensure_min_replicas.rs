use crate::context::NodeContext;
use crate::error::Result;
use crate::keys;
use crate::tasks::salvage_blob;
use std::sync::Arc;

#[derive(Clone)]
pub struct EnsureMinReplicasOperation {
    ctx: Arc<NodeContext>,
}

#[derive(Debug, Clone)]
pub struct EnsureMinReplicasOperationRequest {
    /// Index rows examined per pass.
    pub limit: usize,
}

#[derive(Debug, Clone, Default)]
pub struct EnsureMinReplicasOperationResult {
    pub examined: usize,
    pub scheduled: usize,
    pub repaired: usize,
    pub queue_full: bool,
    pub errors: Vec<String>,
}

impl EnsureMinReplicasOperation {
    pub fn new(ctx: Arc<NodeContext>) -> Self {
        Self { ctx }
    }

    pub async fn run(
        &self,
        request: EnsureMinReplicasOperationRequest,
    ) -> Result<EnsureMinReplicasOperationResult> {
        let EnsureMinReplicasOperationRequest { limit } = request;
        let config = self.ctx.cluster_config();
        let view = self.ctx.node_view().await?;
        let live = view.live(config.heartbeat_freq);
        let target = config.min_replicas.min(live.len());

        let mut result = EnsureMinReplicasOperationResult::default();
        if target < 2 {
            tracing::debug!(
                "replication not possible live_nodes={} min_replicas={}",
                live.len(),
                config.min_replicas
            );
            return Ok(result);
        }

        let range = keys::repl_range(1, target - 1).with_limit(limit);
        let rows = self.ctx.store.scan(&range).await?;
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
                    // The row is stale; rebuild from the record and look again next pass.
                    if let Err(error) = self.ctx.ledger.repair_indexes(&oid, Some(&key)).await {
                        result.errors.push(format!("{}: {}", oid, error));
                    }
                    result.repaired += 1;
                    continue;
                }
            };

            let have = record
                .nodes
                .keys()
                .filter(|node_id| view.is_live(node_id))
                .count();
            if have >= target {
                continue;
            }
            if have == 0 {
                tracing::warn!("no live replica to copy from oid={}", oid);
                continue;
            }

            tracing::info!(
                "under-replicated blob oid={} live_replicas={} target={}",
                oid,
                have,
                target
            );
            if !salvage_blob(&self.ctx, &record, None, target - have, &live) {
                tracing::info!("task queue full, ending replication pass early");
                result.queue_full = true;
                break;
            }
            result.scheduled += 1;
        }

        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ClusterConfig;
    use crate::ledger::resolve_owner_nodes;
    use crate::testing::TestCluster;
    use bytes::Bytes;

    fn request() -> EnsureMinReplicasOperationRequest {
        EnsureMinReplicasOperationRequest { limit: 100 }
    }

    #[tokio::test]
    async fn test_single_owner_reaches_three_replicas() {
        let cluster = TestCluster::new(3).await;
        let a = cluster.node(0);
        let oid = a.store_local_blob_bytes(Bytes::from("hello")).await.unwrap();

        let result = EnsureMinReplicasOperation::new(a.clone())
            .run(request())
            .await
            .unwrap();
        assert_eq!(result.scheduled, 1);
        assert_eq!(a.tasks.pending(), 2);

        cluster.settle().await;
        let record = a.ledger.get(&oid).await.unwrap().unwrap();
        let view = a.node_view().await.unwrap();
        let owners = resolve_owner_nodes(&record, &view, None);
        assert_eq!(owners.len(), 3);
        for node in cluster.nodes() {
            assert!(node.blobs.exists(&oid));
        }
    }

    #[tokio::test]
    async fn test_target_capped_by_live_nodes() {
        let cluster = TestCluster::new(2).await;
        let a = cluster.node(0);
        let oid = a.store_local_blob_bytes(Bytes::from("two")).await.unwrap();

        EnsureMinReplicasOperation::new(a.clone())
            .run(request())
            .await
            .unwrap();
        cluster.settle().await;
        assert_eq!(a.ledger.get(&oid).await.unwrap().unwrap().replica_count(), 2);

        let second = EnsureMinReplicasOperation::new(a.clone())
            .run(request())
            .await
            .unwrap();
        assert_eq!(second.examined, 0);
        assert_eq!(second.scheduled, 0);
    }

    #[tokio::test]
    async fn test_satisfied_blob_is_not_targeted() {
        let config = ClusterConfig {
            min_replicas: 2,
            ..ClusterConfig::default()
        };
        let cluster = TestCluster::with_config(3, config).await;
        let (a, b) = (cluster.node(0), cluster.node(1));
        let oid = a.store_local_blob_bytes(Bytes::from("enough")).await.unwrap();
        b.store_local_blob(&oid, Bytes::from("enough")).await.unwrap();

        let result = EnsureMinReplicasOperation::new(a.clone())
            .run(request())
            .await
            .unwrap();
        assert_eq!(result.scheduled, 0);
        assert_eq!(a.tasks.pending(), 0);
    }

    #[tokio::test]
    async fn test_stale_index_row_is_repaired() {
        let cluster = TestCluster::new(3).await;
        let a = cluster.node(0);
        cluster
            .store
            .set(&keys::repl_index(1, "deadbeef"), b"1".to_vec(), None)
            .await
            .unwrap();

        let result = EnsureMinReplicasOperation::new(a.clone())
            .run(request())
            .await
            .unwrap();
        assert_eq!(result.repaired, 1);
        assert!(
            cluster
                .store
                .get(&keys::repl_index(1, "deadbeef"))
                .await
                .unwrap()
                .is_none()
        );
    }

    #[tokio::test]
    async fn test_full_queue_stops_pass() {
        let cluster = TestCluster::new(3).await;
        let a = cluster.node(0);
        for i in 0..40 {
            a.store_local_blob_bytes(Bytes::from(format!("blob {}", i)))
                .await
                .unwrap();
        }

        let result = EnsureMinReplicasOperation::new(a.clone())
            .run(request())
            .await
            .unwrap();
        assert!(result.queue_full);
        assert!(result.scheduled < 40);
    }
}
