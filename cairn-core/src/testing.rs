//! In-process cluster used by tests: one shared memory store, several nodes
//! with their own blob directories, and a transport that routes calls
//! straight to the target node's context.

use crate::blob_store::BlobStore;
use crate::config::{ClusterConfig, ConfigHandle};
use crate::context::{NodeContext, NodeSettings};
use crate::error::{CairnError, Result};
use crate::keys;
use crate::nodes::StorageNode;
use crate::store::{MemoryStore, MetaStore, put_record};
use crate::transfer::{BlobStream, BlobTransport};
use async_trait::async_trait;
use futures_util::StreamExt;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, Weak};
use tempfile::TempDir;

#[derive(Default)]
pub struct FakeTransport {
    nodes: Mutex<HashMap<String, Weak<NodeContext>>>,
    unreachable: Mutex<HashSet<String>>,
}

impl FakeTransport {
    fn register(&self, ctx: &Arc<NodeContext>) {
        self.nodes
            .lock()
            .unwrap()
            .insert(ctx.node_id().to_string(), Arc::downgrade(ctx));
    }

    fn target(&self, node: &StorageNode) -> Result<Arc<NodeContext>> {
        if self.unreachable.lock().unwrap().contains(&node.node_id) {
            return Err(CairnError::Http(format!(
                "connection refused: {}",
                node.node_id
            )));
        }
        self.nodes
            .lock()
            .unwrap()
            .get(&node.node_id)
            .and_then(Weak::upgrade)
            .ok_or_else(|| CairnError::Http(format!("no route to {}", node.node_id)))
    }
}

#[async_trait]
impl BlobTransport for FakeTransport {
    async fn open_blob(&self, node: &StorageNode, oid: &str) -> Result<BlobStream> {
        let target = self.target(node)?;
        let data = target.blobs.get(oid).await?;
        Ok(futures_util::stream::iter([Ok(data)]).boxed())
    }

    async fn delete_blob(&self, node: &StorageNode, oid: &str) -> Result<()> {
        let target = self.target(node)?;
        target.delete_local_blob(oid).await?;
        Ok(())
    }

    async fn request_fetch(
        &self,
        node: &StorageNode,
        oid: &str,
        prev: Option<&str>,
    ) -> Result<()> {
        let target = self.target(node)?;
        if target.accept_fetch(oid, prev.map(str::to_string)) {
            Ok(())
        } else {
            Err(CairnError::Http("503 Service Unavailable".to_string()))
        }
    }
}

pub struct TestCluster {
    pub store: Arc<dyn MetaStore>,
    pub transport: Arc<FakeTransport>,
    nodes: Vec<Arc<NodeContext>>,
    _dirs: Vec<TempDir>,
}

impl TestCluster {
    pub async fn new(size: usize) -> Self {
        Self::with_config(size, ClusterConfig::default()).await
    }

    pub async fn with_config(size: usize, config: ClusterConfig) -> Self {
        let store: Arc<dyn MetaStore> = Arc::new(MemoryStore::new());
        put_record(store.as_ref(), keys::CLUSTER_CONFIG, &config, None)
            .await
            .unwrap();
        let transport = Arc::new(FakeTransport::default());

        let mut nodes = Vec::with_capacity(size);
        let mut dirs = Vec::with_capacity(size);
        for i in 0..size {
            let dir = tempfile::tempdir().unwrap();
            let settings = NodeSettings {
                node_id: format!("node-{}", i),
                addr: "127.0.0.1".to_string(),
                bind_addr: format!(":{}", 8480 + i),
                capacity_bytes: 1 << 30,
                task_queue_size: 64,
                task_workers: 2,
                verify_workers: 2,
            };
            let ctx = Arc::new(NodeContext::new(
                settings,
                store.clone(),
                ConfigHandle::new(config.clone()),
                BlobStore::new(dir.path().to_path_buf()).unwrap(),
                transport.clone(),
            ));
            transport.register(&ctx);
            ctx.heartbeat().await.unwrap();
            nodes.push(ctx);
            dirs.push(dir);
        }

        Self {
            store,
            transport,
            nodes,
            _dirs: dirs,
        }
    }

    pub fn node(&self, index: usize) -> &Arc<NodeContext> {
        &self.nodes[index]
    }

    pub fn nodes(&self) -> &[Arc<NodeContext>] {
        &self.nodes
    }

    /// Run every queued task on every node until all queues stay empty.
    pub async fn settle(&self) {
        loop {
            let mut ran = 0;
            for node in &self.nodes {
                ran += node.tasks.drain(node).await;
            }
            if ran == 0 {
                break;
            }
        }
    }

    pub fn unreachable(&self, node_id: &str) {
        self.transport
            .unreachable
            .lock()
            .unwrap()
            .insert(node_id.to_string());
    }

    /// Push a node's last heartbeat into the past.
    pub async fn age_node(&self, node_id: &str, by: chrono::Duration) {
        let (mut node, _) = self
            .nodes[0]
            .registry
            .get(node_id)
            .await
            .unwrap()
            .unwrap();
        node.last_heartbeat -= by;
        put_record(self.store.as_ref(), &keys::node(node_id), &node, None)
            .await
            .unwrap();
    }
}
