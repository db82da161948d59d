use crate::blob_store::BlobStore;
use crate::config::{ClusterConfig, ConfigHandle};
use crate::error::Result;
use crate::ledger::OwnershipLedger;
use crate::lease::LeaseLock;
use crate::named_lock::NamedLock;
use crate::nodes::{NodeRegistry, NodeView, StorageNode};
use crate::store::MetaStore;
use crate::tasks::{InternodeTask, TaskQueue};
use crate::transfer::BlobStream;
use crate::transfer::BlobTransport;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use std::sync::Arc;

/// Process-local settings of one storage node.
#[derive(Debug, Clone)]
pub struct NodeSettings {
    pub node_id: String,
    /// Host peers should reach this node at.
    pub addr: String,
    pub bind_addr: String,
    pub capacity_bytes: u64,
    pub task_queue_size: usize,
    pub task_workers: usize,
    pub verify_workers: usize,
}

/// Everything a node's background loops and handlers share.
pub struct NodeContext {
    pub settings: NodeSettings,
    pub started_at: DateTime<Utc>,
    pub store: Arc<dyn MetaStore>,
    pub config: ConfigHandle,
    pub ledger: OwnershipLedger,
    pub registry: NodeRegistry,
    pub lease: LeaseLock,
    pub blobs: BlobStore,
    pub transport: Arc<dyn BlobTransport>,
    pub tasks: TaskQueue,
    pub fetches: NamedLock,
}

impl NodeContext {
    pub fn new(
        settings: NodeSettings,
        store: Arc<dyn MetaStore>,
        config: ConfigHandle,
        blobs: BlobStore,
        transport: Arc<dyn BlobTransport>,
    ) -> Self {
        Self {
            ledger: OwnershipLedger::new(store.clone()),
            registry: NodeRegistry::new(store.clone()),
            lease: LeaseLock::new(store.clone(), settings.node_id.clone()),
            tasks: TaskQueue::new(settings.task_queue_size),
            fetches: NamedLock::new(),
            started_at: Utc::now(),
            settings,
            store,
            config,
            blobs,
            transport,
        }
    }

    pub fn node_id(&self) -> &str {
        &self.settings.node_id
    }

    pub fn cluster_config(&self) -> Arc<ClusterConfig> {
        self.config.current()
    }

    /// This node as it would appear in the registry right now.
    pub async fn local_node(&self) -> Result<StorageNode> {
        let used = self.blobs.used_bytes().await?;
        Ok(StorageNode {
            node_id: self.settings.node_id.clone(),
            addr: self.settings.addr.clone(),
            bind_addr: self.settings.bind_addr.clone(),
            started_at: self.started_at,
            last_heartbeat: Utc::now(),
            used_bytes: used,
            free_bytes: self.settings.capacity_bytes.saturating_sub(used),
            total_bytes: self.settings.capacity_bytes,
        })
    }

    pub async fn heartbeat(&self) -> Result<StorageNode> {
        let config = self.cluster_config();
        let node = self.local_node().await?;
        self.registry.heartbeat(&node, config.node_record_ttl()).await
    }

    pub async fn node_view(&self) -> Result<NodeView> {
        let config = self.cluster_config();
        self.registry.view(config.stale_node_limit).await
    }

    /// Store bytes under their own hash and record ownership.
    pub async fn store_local_blob_bytes(&self, data: Bytes) -> Result<String> {
        let length = data.len() as u64;
        let oid = self.blobs.put(data).await?;
        self.ledger
            .record_ownership(&oid, length, self.node_id())
            .await?;
        Ok(oid)
    }

    /// Store bytes that must hash to `oid` and record ownership.
    pub async fn store_local_blob(&self, oid: &str, data: Bytes) -> Result<u64> {
        let length = self.blobs.put_verified(oid, data).await?;
        self.ledger
            .record_ownership(oid, length, self.node_id())
            .await?;
        Ok(length)
    }

    pub async fn store_local_stream(&self, oid: &str, stream: BlobStream) -> Result<u64> {
        let (_, length) = self.blobs.write_stream(Some(oid), stream).await?;
        self.ledger
            .record_ownership(oid, length, self.node_id())
            .await?;
        Ok(length)
    }

    /// Drop the local copy and this node's ownership entry. Returns whether a
    /// copy was on disk.
    pub async fn delete_local_blob(&self, oid: &str) -> Result<bool> {
        let removed = self.blobs.remove(oid).await?;
        self.ledger.remove_ownership(oid, self.node_id()).await?;
        if removed {
            tracing::info!("deleted local blob oid={}", oid);
        }
        Ok(removed)
    }

    /// Queue a fetch of `oid` for this node. False when the queue is full.
    pub fn accept_fetch(&self, oid: &str, prev: Option<String>) -> bool {
        self.tasks.try_enqueue(InternodeTask::Fetch {
            oid: oid.to_string(),
            prev,
        })
    }
}
