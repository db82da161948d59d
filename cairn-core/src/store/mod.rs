//! Shared metadata store
//!
//! Every record the engine coordinates through (blob ownership, node
//! heartbeats, task leases, running markers, cluster config and the derived
//! indexes) lives in one ordered key-value store with per-key versions.
//! Backends only have to provide the handful of primitives below; all
//! read-modify-write logic is built on top of them in [`occ`].

#[cfg(test)]
pub(crate) mod conformance;
pub mod etcd;
pub mod factory;
pub mod memory;
pub mod occ;
pub mod redis;
pub mod sqlite;

use crate::error::Result;
use async_trait::async_trait;
use serde::{Serialize, de::DeserializeOwned};
use std::collections::HashMap;
use std::time::Duration;

pub use factory::StoreBuilder;
pub use memory::MemoryStore;
pub use occ::{DEFAULT_ATTEMPTS, Mutation, TransactOutcome, transact, transact_with_budget};

/// Opaque per-key version, only ever compared for equality.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Version(pub u64);

#[derive(Debug, Clone)]
pub struct Versioned {
    pub value: Vec<u8>,
    pub version: Version,
}

/// Condition a conditional write is checked against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Precondition {
    /// The key must not exist (or must have expired).
    Absent,
    /// The key must still be at this version.
    Version(Version),
}

#[derive(Debug, Clone)]
pub enum WriteOp {
    Put {
        value: Vec<u8>,
        ttl: Option<Duration>,
    },
    Delete,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    Applied,
    Conflict,
}

/// Ordered range over the key space. `start` is inclusive, `end` exclusive.
#[derive(Debug, Clone)]
pub struct KeyRange {
    pub start: Option<String>,
    pub end: Option<String>,
    pub limit: usize,
    pub descending: bool,
}

impl KeyRange {
    /// All keys sharing `prefix`, ascending.
    pub fn prefix(prefix: &str) -> Self {
        Self {
            start: Some(prefix.to_string()),
            end: prefix_end(prefix),
            limit: usize::MAX,
            descending: false,
        }
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = limit;
        self
    }

    pub fn descending(mut self) -> Self {
        self.descending = true;
        self
    }

    /// Continue an ascending walk strictly after `key`.
    pub fn resume_after(mut self, key: &str) -> Self {
        self.start = Some(format!("{}\u{0}", key));
        self
    }

    /// Continue a descending walk strictly before `key`.
    pub fn resume_before(mut self, key: &str) -> Self {
        self.end = Some(key.to_string());
        self
    }

    /// True when `start` is at or past `end`, so no key can match.
    pub fn is_empty(&self) -> bool {
        matches!((&self.start, &self.end), (Some(start), Some(end)) if start >= end)
    }

    pub fn contains(&self, key: &str) -> bool {
        let above_start = self
            .start
            .as_deref()
            .map(|start| key >= start)
            .unwrap_or(true);
        let below_end = self.end.as_deref().map(|end| key < end).unwrap_or(true);
        above_start && below_end
    }
}

/// Smallest key greater than every key starting with `prefix`.
pub fn prefix_end(prefix: &str) -> Option<String> {
    let mut bytes = prefix.as_bytes().to_vec();
    while let Some(last) = bytes.pop() {
        if last < 0x7f {
            bytes.push(last + 1);
            return String::from_utf8(bytes).ok();
        }
    }
    None
}

/// Trait for shared metadata store implementations
#[async_trait]
pub trait MetaStore: Send + Sync {
    /// Read a key together with its current version
    async fn get(&self, key: &str) -> Result<Option<Versioned>>;

    /// Read many keys at once; missing keys are simply absent from the map
    async fn get_many(&self, keys: &[String]) -> Result<HashMap<String, Versioned>>;

    /// Unconditional write
    async fn set(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>) -> Result<()>;

    /// Unconditional delete, returns whether something was removed
    async fn delete(&self, key: &str) -> Result<bool>;

    /// Conditional create / update / delete
    async fn write_if(
        &self,
        key: &str,
        precondition: Precondition,
        op: WriteOp,
    ) -> Result<WriteOutcome>;

    /// Ordered range query
    async fn scan(&self, range: &KeyRange) -> Result<Vec<(String, Vec<u8>)>>;
}

pub async fn get_record<T: DeserializeOwned>(
    store: &dyn MetaStore,
    key: &str,
) -> Result<Option<T>> {
    match store.get(key).await? {
        Some(found) => Ok(Some(serde_json::from_slice(&found.value)?)),
        None => Ok(None),
    }
}

pub async fn get_versioned<T: DeserializeOwned>(
    store: &dyn MetaStore,
    key: &str,
) -> Result<Option<(T, Version)>> {
    match store.get(key).await? {
        Some(found) => Ok(Some((serde_json::from_slice(&found.value)?, found.version))),
        None => Ok(None),
    }
}

/// Bulk read of typed records. Undecodable entries are logged and skipped.
pub async fn get_records<T: DeserializeOwned>(
    store: &dyn MetaStore,
    keys: &[String],
) -> Result<HashMap<String, T>> {
    let raw = store.get_many(keys).await?;
    let mut records = HashMap::with_capacity(raw.len());
    for (key, found) in raw {
        match serde_json::from_slice::<T>(&found.value) {
            Ok(record) => {
                records.insert(key, record);
            }
            Err(error) => {
                tracing::warn!("skipping undecodable record key={} error={}", key, error);
            }
        }
    }
    Ok(records)
}

pub async fn put_record<T: Serialize>(
    store: &dyn MetaStore,
    key: &str,
    record: &T,
    ttl: Option<Duration>,
) -> Result<()> {
    let value = serde_json::to_vec(record)?;
    store.set(key, value, ttl).await
}
