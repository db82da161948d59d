//! Ownership ledger
//!
//! One `blob/<oid>` record per blob lists the nodes holding a copy and when
//! each last confirmed it. Every mutation is an optimistic read-modify-write;
//! after a write lands, the derived index entries (`idx/owner`, `idx/repl`,
//! `idx/ref/<oid>/blob`) are brought in line with the new record. Index
//! maintenance is best effort: readers re-check the primary record and call
//! [`OwnershipLedger::repair_indexes`] when an entry turns out stale.

use crate::error::Result;
use crate::keys;
use crate::nodes::{NodeView, StorageNode};
use crate::store::{MetaStore, Mutation, TransactOutcome, get_record, get_records, transact};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlobOwnership {
    pub oid: String,
    pub length: u64,
    /// node id -> last confirmed
    pub nodes: BTreeMap<String, DateTime<Utc>>,
}

impl BlobOwnership {
    pub fn replica_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_owned_by(&self, node_id: &str) -> bool {
        self.nodes.contains_key(node_id)
    }

    pub fn latest_confirmation(&self) -> Option<DateTime<Utc>> {
        self.nodes.values().max().copied()
    }

    /// Owners ordered oldest confirmation first, ties by node id.
    pub fn owners_oldest_first(&self) -> Vec<String> {
        let mut owners: Vec<_> = self.nodes.iter().collect();
        owners.sort_by(|a, b| a.1.cmp(b.1).then_with(|| a.0.cmp(b.0)));
        owners.into_iter().map(|(node, _)| node.clone()).collect()
    }
}

/// Recency marker the collector's grace check reads.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccessMarker {
    pub count: u64,
    pub last_access: DateTime<Utc>,
}

/// Result of dropping one node's ownership entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoveOutcome {
    /// No record, or the node was not an owner.
    Unknown,
    /// Entry removed; `remaining` owners are left (0 means the record is gone).
    Removed { remaining: usize },
    /// Removal would leave fewer than the requested floor.
    Refused { remaining: usize },
}

impl RemoveOutcome {
    pub fn remaining(&self) -> Option<usize> {
        match self {
            RemoveOutcome::Removed { remaining } => Some(*remaining),
            _ => None,
        }
    }
}

#[derive(Clone)]
pub struct OwnershipLedger {
    store: Arc<dyn MetaStore>,
}

impl OwnershipLedger {
    pub fn new(store: Arc<dyn MetaStore>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<dyn MetaStore> {
        &self.store
    }

    pub async fn get(&self, oid: &str) -> Result<Option<BlobOwnership>> {
        get_record(self.store.as_ref(), &keys::blob(oid)).await
    }

    /// Bulk read keyed by oid.
    pub async fn get_many(&self, oids: &[String]) -> Result<HashMap<String, BlobOwnership>> {
        let keys: Vec<String> = oids.iter().map(|oid| keys::blob(oid)).collect();
        let records = get_records::<BlobOwnership>(self.store.as_ref(), &keys).await?;
        Ok(records
            .into_values()
            .map(|record| (record.oid.clone(), record))
            .collect())
    }

    /// Mark `node_id` as holding `oid`, creating the record if needed.
    pub async fn record_ownership(
        &self,
        oid: &str,
        length: u64,
        node_id: &str,
    ) -> Result<BlobOwnership> {
        let mut before = None;
        let outcome = transact(
            self.store.as_ref(),
            &keys::blob(oid),
            |current: Option<BlobOwnership>| {
                before = current.clone();
                let mut record = current.unwrap_or_else(|| BlobOwnership {
                    oid: oid.to_string(),
                    length,
                    nodes: BTreeMap::new(),
                });
                record.oid = oid.to_string();
                record.length = length;
                record.nodes.insert(node_id.to_string(), Utc::now());
                Mutation::Put(record)
            },
        )
        .await?;

        match outcome {
            TransactOutcome::Written(record) => {
                self.sync_indexes(oid, before.as_ref(), Some(&record)).await;
                Ok(record)
            }
            _ => Err(crate::error::CairnError::Internal(format!(
                "ownership of {} was not recorded",
                oid
            ))),
        }
    }

    /// Drop `node_id` from the owners of `oid`.
    pub async fn remove_ownership(&self, oid: &str, node_id: &str) -> Result<RemoveOutcome> {
        self.remove_ownership_keeping(oid, node_id, 0).await
    }

    /// Drop `node_id` only if at least `floor` owners remain afterwards.
    pub async fn remove_ownership_keeping(
        &self,
        oid: &str,
        node_id: &str,
        floor: usize,
    ) -> Result<RemoveOutcome> {
        let mut before = None;
        let mut result = RemoveOutcome::Unknown;
        let outcome = transact(
            self.store.as_ref(),
            &keys::blob(oid),
            |current: Option<BlobOwnership>| {
                before = current.clone();
                let Some(mut record) = current else {
                    result = RemoveOutcome::Unknown;
                    return Mutation::Abort;
                };
                if !record.is_owned_by(node_id) {
                    result = RemoveOutcome::Unknown;
                    return Mutation::Abort;
                }
                let remaining = record.replica_count() - 1;
                if remaining < floor {
                    result = RemoveOutcome::Refused { remaining };
                    return Mutation::Abort;
                }
                record.nodes.remove(node_id);
                result = RemoveOutcome::Removed { remaining };
                if record.nodes.is_empty() {
                    Mutation::Delete
                } else {
                    Mutation::Put(record)
                }
            },
        )
        .await?;

        match outcome {
            TransactOutcome::Written(record) => {
                self.sync_indexes(oid, before.as_ref(), Some(&record)).await;
            }
            TransactOutcome::Deleted => {
                self.sync_indexes(oid, before.as_ref(), None).await;
                if let Err(error) = self.store.delete(&keys::access(oid)).await {
                    tracing::warn!("failed to drop access marker oid={} error={}", oid, error);
                }
            }
            TransactOutcome::Aborted => {}
        }
        Ok(result)
    }

    /// Bump the access marker of `oid` and the serving node's counter.
    pub async fn record_access(&self, oid: &str, node_id: &str) -> Result<()> {
        self.touch_access(oid).await?;
        crate::nodes::NodeRegistry::new(self.store.clone())
            .record_served(node_id)
            .await
    }

    /// Refresh the access marker when a new file starts pointing at `oid`.
    /// Returns false when the blob is not known to the ledger.
    pub async fn reference_blob(&self, oid: &str) -> Result<bool> {
        if self.get(oid).await?.is_none() {
            return Ok(false);
        }
        self.touch_access(oid).await?;
        Ok(true)
    }

    pub async fn access_marker(&self, oid: &str) -> Result<Option<AccessMarker>> {
        get_record(self.store.as_ref(), &keys::access(oid)).await
    }

    pub async fn access_markers(&self, oids: &[String]) -> Result<HashMap<String, AccessMarker>> {
        let keys: Vec<String> = oids.iter().map(|oid| keys::access(oid)).collect();
        let markers = get_records::<AccessMarker>(self.store.as_ref(), &keys).await?;
        Ok(markers
            .into_iter()
            .filter_map(|(key, marker)| {
                key.strip_prefix("access/")
                    .map(|oid| (oid.to_string(), marker))
            })
            .collect())
    }

    async fn touch_access(&self, oid: &str) -> Result<()> {
        transact(
            self.store.as_ref(),
            &keys::access(oid),
            |current: Option<AccessMarker>| {
                let count = current.map(|marker| marker.count).unwrap_or(0) + 1;
                Mutation::Put(AccessMarker {
                    count,
                    last_access: Utc::now(),
                })
            },
        )
        .await?;
        Ok(())
    }

    /// Rewrite the index entries of `oid` from its current record, dropping
    /// the entry `stale_key` that led the caller here.
    pub async fn repair_indexes(
        &self,
        oid: &str,
        stale_key: Option<&str>,
    ) -> Result<Option<BlobOwnership>> {
        let current = self.get(oid).await?;
        if let Some(stale_key) = stale_key {
            self.store.delete(stale_key).await?;
        }
        if let Some(record) = &current {
            self.write_index_entries(record).await?;
        }
        Ok(current)
    }

    async fn sync_indexes(
        &self,
        oid: &str,
        before: Option<&BlobOwnership>,
        after: Option<&BlobOwnership>,
    ) {
        if let Err(error) = self.apply_index_changes(oid, before, after).await {
            tracing::warn!("index update failed oid={} error={}", oid, error);
        }
    }

    async fn apply_index_changes(
        &self,
        oid: &str,
        before: Option<&BlobOwnership>,
        after: Option<&BlobOwnership>,
    ) -> Result<()> {
        let before_count = before.map(|r| r.replica_count()).unwrap_or(0);
        let after_count = after.map(|r| r.replica_count()).unwrap_or(0);

        if let Some(before) = before {
            for node_id in before.nodes.keys() {
                let still_owner = after.map(|r| r.is_owned_by(node_id)).unwrap_or(false);
                if !still_owner {
                    self.store.delete(&keys::owner_index(node_id, oid)).await?;
                    self.store.delete(&keys::ref_blob(oid, node_id)).await?;
                }
            }
            if before_count != after_count {
                self.store
                    .delete(&keys::repl_index(before_count, oid))
                    .await?;
            }
        }

        if let Some(after) = after {
            self.write_index_entries(after).await?;
        }
        Ok(())
    }

    async fn write_index_entries(&self, record: &BlobOwnership) -> Result<()> {
        let value = serde_json::to_vec(&record.length)?;
        for node_id in record.nodes.keys() {
            self.store
                .set(&keys::owner_index(node_id, &record.oid), value.clone(), None)
                .await?;
            self.store
                .set(&keys::ref_blob(&record.oid, node_id), value.clone(), None)
                .await?;
        }
        if record.replica_count() > 0 {
            self.store
                .set(
                    &keys::repl_index(record.replica_count(), &record.oid),
                    value,
                    None,
                )
                .await?;
        }
        Ok(())
    }
}

/// Live owners of `record`, most recently confirmed first.
///
/// Owners missing from the registry or past the stale limit are left out, as
/// is `exclude` (usually the local node when looking for remote peers).
pub fn resolve_owner_nodes(
    record: &BlobOwnership,
    view: &NodeView,
    exclude: Option<&str>,
) -> Vec<StorageNode> {
    let mut owners: Vec<(&DateTime<Utc>, &StorageNode)> = record
        .nodes
        .iter()
        .filter(|(node_id, _)| Some(node_id.as_str()) != exclude)
        .filter(|(node_id, _)| view.is_live(node_id))
        .filter_map(|(node_id, confirmed)| view.get(node_id).map(|node| (confirmed, node)))
        .collect();
    owners.sort_by(|a, b| {
        b.0.cmp(a.0)
            .then_with(|| b.1.last_heartbeat.cmp(&a.1.last_heartbeat))
            .then_with(|| a.1.node_id.cmp(&b.1.node_id))
    });
    owners.into_iter().map(|(_, node)| node.clone()).collect()
}
