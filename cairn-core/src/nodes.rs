use crate::error::{CairnError, Result};
use crate::keys;
use crate::store::{
    KeyRange, MetaStore, Mutation, Precondition, Version, WriteOp, WriteOutcome, get_versioned,
    transact,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use ulid::Ulid;

/// Heartbeat record of one storage node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StorageNode {
    pub node_id: String,
    /// Host the node was seen at.
    pub addr: String,
    /// Listen address; a leading `:` means "port on `addr`".
    pub bind_addr: String,
    pub started_at: DateTime<Utc>,
    pub last_heartbeat: DateTime<Utc>,
    pub used_bytes: u64,
    pub free_bytes: u64,
    pub total_bytes: u64,
}

impl StorageNode {
    pub fn address(&self) -> String {
        if self.bind_addr.starts_with(':') {
            format!("{}{}", self.addr, self.bind_addr)
        } else {
            self.bind_addr.clone()
        }
    }

    pub fn blob_url(&self, oid: &str) -> String {
        format!("http://{}/.cairn/blob/{}", self.address(), oid)
    }

    pub fn fetch_url(&self, oid: &str) -> String {
        format!("http://{}/.cairn/fetch/{}", self.address(), oid)
    }

    pub fn age(&self, now: DateTime<Utc>) -> Duration {
        (now - self.last_heartbeat).to_std().unwrap_or_default()
    }

    pub fn is_stale(&self, now: DateTime<Utc>, limit: Duration) -> bool {
        self.age(now) > limit
    }
}

/// Sort freshest first. Heartbeats landing in the same heartbeat-sized window
/// count as equally fresh; among those the emptier node wins.
pub fn sort_nodes(nodes: &mut [StorageNode], heartbeat: Duration) {
    let window = heartbeat.as_millis().max(1) as i64;
    nodes.sort_by(|a, b| {
        let a_bucket = a.last_heartbeat.timestamp_millis().div_euclid(window);
        let b_bucket = b.last_heartbeat.timestamp_millis().div_euclid(window);
        b_bucket
            .cmp(&a_bucket)
            .then_with(|| b.free_bytes.cmp(&a.free_bytes))
            .then_with(|| a.node_id.cmp(&b.node_id))
    });
}

/// Nodes that could take a new copy of a blob of `length` bytes.
pub fn candidates_for<'a>(
    nodes: &'a [StorageNode],
    owners: &BTreeMap<String, DateTime<Utc>>,
    length: u64,
) -> Vec<&'a StorageNode> {
    nodes
        .iter()
        .filter(|node| !owners.contains_key(&node.node_id))
        .filter(|node| node.free_bytes > length)
        .collect()
}

/// Snapshot of the node registry taken at one instant.
#[derive(Debug, Clone, Default)]
pub struct NodeView {
    pub nodes: HashMap<String, StorageNode>,
    pub taken_at: DateTime<Utc>,
    pub stale_limit: Duration,
}

impl NodeView {
    pub fn get(&self, node_id: &str) -> Option<&StorageNode> {
        self.nodes.get(node_id)
    }

    pub fn is_live(&self, node_id: &str) -> bool {
        self.nodes
            .get(node_id)
            .map(|node| !node.is_stale(self.taken_at, self.stale_limit))
            .unwrap_or(false)
    }

    /// Live nodes, freshest first.
    pub fn live(&self, heartbeat: Duration) -> Vec<StorageNode> {
        let mut live: Vec<_> = self
            .nodes
            .values()
            .filter(|node| !node.is_stale(self.taken_at, self.stale_limit))
            .cloned()
            .collect();
        sort_nodes(&mut live, heartbeat);
        live
    }

    pub fn stale(&self) -> Vec<StorageNode> {
        let mut stale: Vec<_> = self
            .nodes
            .values()
            .filter(|node| node.is_stale(self.taken_at, self.stale_limit))
            .cloned()
            .collect();
        stale.sort_by(|a, b| a.node_id.cmp(&b.node_id));
        stale
    }
}

/// Per-node access counter, bumped whenever the node serves a blob.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NodeStat {
    pub blobs_served: u64,
    pub last_served: Option<DateTime<Utc>>,
}

pub struct NodeRegistry {
    store: Arc<dyn MetaStore>,
}

impl NodeRegistry {
    pub fn new(store: Arc<dyn MetaStore>) -> Self {
        Self { store }
    }

    /// Write this node's heartbeat. `started_at` survives from the previous record.
    pub async fn heartbeat(&self, node: &StorageNode, ttl: Duration) -> Result<StorageNode> {
        let outcome = transact(
            self.store.as_ref(),
            &keys::node(&node.node_id),
            |current: Option<StorageNode>| {
                let mut next = node.clone();
                if let Some(previous) = current {
                    if previous.started_at < next.started_at && previous.addr == next.addr {
                        next.started_at = previous.started_at;
                    }
                }
                Mutation::PutWithTtl(next, ttl)
            },
        )
        .await?;

        outcome
            .written()
            .ok_or_else(|| CairnError::Internal("heartbeat was not written".to_string()))
    }

    pub async fn get(&self, node_id: &str) -> Result<Option<(StorageNode, Version)>> {
        get_versioned(self.store.as_ref(), &keys::node(node_id)).await
    }

    pub async fn find_all_nodes(&self) -> Result<Vec<StorageNode>> {
        let rows = self.store.scan(&KeyRange::prefix(keys::NODE_PREFIX)).await?;
        let mut nodes = Vec::with_capacity(rows.len());
        for (key, value) in rows {
            match serde_json::from_slice::<StorageNode>(&value) {
                Ok(node) => nodes.push(node),
                Err(error) => tracing::warn!("skipping bad node record key={} error={}", key, error),
            }
        }
        Ok(nodes)
    }

    pub async fn view(&self, stale_limit: Duration) -> Result<NodeView> {
        let nodes = self
            .find_all_nodes()
            .await?
            .into_iter()
            .map(|node| (node.node_id.clone(), node))
            .collect();
        Ok(NodeView {
            nodes,
            taken_at: Utc::now(),
            stale_limit,
        })
    }

    /// Delete a node record only if it has not been rewritten since `version`.
    pub async fn remove_if_unchanged(&self, node_id: &str, version: Version) -> Result<bool> {
        let outcome = self
            .store
            .write_if(
                &keys::node(node_id),
                Precondition::Version(version),
                WriteOp::Delete,
            )
            .await?;
        if outcome == WriteOutcome::Applied {
            self.store.delete(&keys::node_stat(node_id)).await?;
            return Ok(true);
        }
        Ok(false)
    }

    pub async fn record_served(&self, node_id: &str) -> Result<()> {
        transact(
            self.store.as_ref(),
            &keys::node_stat(node_id),
            |current: Option<NodeStat>| {
                let mut stat = current.unwrap_or_default();
                stat.blobs_served += 1;
                stat.last_served = Some(Utc::now());
                Mutation::Put(stat)
            },
        )
        .await?;
        Ok(())
    }
}

/// Load the node id from `<data_dir>/guid`, generating and saving one if absent.
pub fn load_or_create_server_id(data_dir: &Path) -> Result<String> {
    let guid_path = data_dir.join("guid");
    match std::fs::read_to_string(&guid_path) {
        Ok(existing) => {
            let existing = existing.trim();
            if !existing.is_empty() {
                return Ok(existing.to_string());
            }
        }
        Err(error) if error.kind() == std::io::ErrorKind::NotFound => {}
        Err(error) => return Err(error.into()),
    }

    std::fs::create_dir_all(data_dir)?;
    let generated = Ulid::new().to_string().to_lowercase();
    std::fs::write(&guid_path, format!("{}\n", generated))?;
    tracing::info!("Generated node id {}", generated);
    Ok(generated)
}

#[cfg(test)]
pub(crate) fn test_node(node_id: &str, last_heartbeat: DateTime<Utc>, free_bytes: u64) -> StorageNode {
    StorageNode {
        node_id: node_id.to_string(),
        addr: "127.0.0.1".to_string(),
        bind_addr: ":8484".to_string(),
        started_at: last_heartbeat,
        last_heartbeat,
        used_bytes: 0,
        free_bytes,
        total_bytes: free_bytes,
    }
}
