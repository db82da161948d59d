use crate::context::NodeContext;
use crate::error::Result;
use crate::keys;
use std::sync::Arc;

/// Pull thinly replicated blobs onto a freshly started node.
#[derive(Clone)]
pub struct GrabSomeDataOperation {
    ctx: Arc<NodeContext>,
}

#[derive(Debug, Clone)]
pub struct GrabSomeDataOperationRequest {
    pub max_objects: usize,
    /// Only blobs with fewer replicas than this are grabbed.
    pub max_replicas: usize,
}

#[derive(Debug, Clone, Default)]
pub struct GrabSomeDataOperationResult {
    pub examined: usize,
    pub queued: usize,
    pub queue_full: bool,
}

impl GrabSomeDataOperation {
    pub fn new(ctx: Arc<NodeContext>) -> Self {
        Self { ctx }
    }

    pub async fn run(
        &self,
        request: GrabSomeDataOperationRequest,
    ) -> Result<GrabSomeDataOperationResult> {
        let GrabSomeDataOperationRequest {
            max_objects,
            max_replicas,
        } = request;
        let mut result = GrabSomeDataOperationResult::default();
        if max_objects == 0 || max_replicas < 2 {
            return Ok(result);
        }

        let node_id = self.ctx.node_id();
        let mut range = keys::repl_range(1, max_replicas - 1).with_limit(max_objects);
        'pages: while result.queued < max_objects {
            let rows = self.ctx.store.scan(&range).await?;
            for (key, _) in &rows {
                let Some((_, oid)) = keys::parse_repl(key) else {
                    continue;
                };
                result.examined += 1;
                if self.ctx.store.get(&keys::owner_index(node_id, &oid)).await?.is_some() {
                    continue;
                }
                if !self.ctx.accept_fetch(&oid, None) {
                    result.queue_full = true;
                    break 'pages;
                }
                result.queued += 1;
                if result.queued >= max_objects {
                    break 'pages;
                }
            }
            match rows.last() {
                Some((last, _)) if rows.len() == max_objects => range = range.resume_after(last),
                _ => break,
            }
        }

        tracing::info!(
            "startup grab queued={} examined={} node={}",
            result.queued,
            result.examined,
            node_id
        );
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::TestCluster;
    use bytes::Bytes;

    #[tokio::test]
    async fn test_grabs_thin_blobs_not_owned_locally() {
        let cluster = TestCluster::new(3).await;
        let (a, b, c) = (cluster.node(0), cluster.node(1), cluster.node(2));
        let thin = a.store_local_blob_bytes(Bytes::from("thin")).await.unwrap();
        let mine = c.store_local_blob_bytes(Bytes::from("mine")).await.unwrap();
        let wide = a.store_local_blob_bytes(Bytes::from("wide")).await.unwrap();
        b.store_local_blob(&wide, Bytes::from("wide")).await.unwrap();
        c.store_local_blob(&wide, Bytes::from("wide")).await.unwrap();

        let result = GrabSomeDataOperation::new(c.clone())
            .run(GrabSomeDataOperationRequest {
                max_objects: 10,
                max_replicas: 3,
            })
            .await
            .unwrap();
        assert_eq!(result.queued, 1);

        cluster.settle().await;
        assert!(c.blobs.exists(&thin));
        assert!(c.blobs.exists(&mine));
        assert_eq!(a.ledger.get(&thin).await.unwrap().unwrap().replica_count(), 2);
    }

    #[tokio::test]
    async fn test_respects_object_limit() {
        let cluster = TestCluster::new(2).await;
        let (a, b) = (cluster.node(0), cluster.node(1));
        for i in 0..5 {
            a.store_local_blob_bytes(Bytes::from(format!("blob {}", i)))
                .await
                .unwrap();
        }

        let result = GrabSomeDataOperation::new(b.clone())
            .run(GrabSomeDataOperationRequest {
                max_objects: 3,
                max_replicas: 3,
            })
            .await
            .unwrap();
        assert_eq!(result.queued, 3);
        assert_eq!(b.tasks.pending(), 3);
    }
}
