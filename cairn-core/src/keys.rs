//! Key layout of the shared metadata store.
//!
//! Primary records live under a kind prefix (`blob/`, `node/`, ...). The
//! `idx/` keys are derived entries maintained next to the primary records so
//! that the reaper, the reconciler and the collector can drive their batch
//! queries with plain ordered range scans.

use crate::store::{KeyRange, prefix_end};

pub const BLOB_PREFIX: &str = "blob/";
pub const NODE_PREFIX: &str = "node/";
pub const FILE_PREFIX: &str = "file/";
pub const REF_PREFIX: &str = "idx/ref/";
pub const REPL_PREFIX: &str = "idx/repl/";
pub const CLUSTER_CONFIG: &str = "config/cluster";

const OWNER_PREFIX: &str = "idx/owner/";

pub fn blob(oid: &str) -> String {
    format!("{}{}", BLOB_PREFIX, oid)
}

pub fn access(oid: &str) -> String {
    format!("access/{}", oid)
}

pub fn node(node_id: &str) -> String {
    format!("{}{}", NODE_PREFIX, node_id)
}

pub fn node_stat(node_id: &str) -> String {
    format!("nodestat/{}", node_id)
}

pub fn lease(task: &str) -> String {
    format!("lease/{}", task)
}

pub fn running(task: &str) -> String {
    format!("running/{}", task)
}

pub fn file(path: &str) -> String {
    format!("{}{}", FILE_PREFIX, path)
}

pub fn owner_index(node_id: &str, oid: &str) -> String {
    format!("{}{}/{}", OWNER_PREFIX, node_id, oid)
}

pub fn owner_index_prefix(node_id: &str) -> String {
    format!("{}{}/", OWNER_PREFIX, node_id)
}

pub fn repl_index(count: usize, oid: &str) -> String {
    format!("{}{:06}/{}", REPL_PREFIX, count, oid)
}

/// Replica-count index entries with `low <= count <= high`.
pub fn repl_range(low: usize, high: usize) -> KeyRange {
    KeyRange {
        start: Some(format!("{}{:06}/", REPL_PREFIX, low)),
        end: Some(format!("{}{:06}/", REPL_PREFIX, high.saturating_add(1))),
        limit: usize::MAX,
        descending: false,
    }
}

/// Replica-count index entries with `count >= low`.
pub fn repl_at_least(low: usize) -> KeyRange {
    KeyRange {
        start: Some(format!("{}{:06}/", REPL_PREFIX, low)),
        end: prefix_end(REPL_PREFIX),
        limit: usize::MAX,
        descending: false,
    }
}

pub fn ref_blob(oid: &str, node_id: &str) -> String {
    format!("{}{}/blob/{}", REF_PREFIX, oid, node_id)
}

pub fn ref_file(oid: &str, path: &str) -> String {
    format!("{}{}/file/{}", REF_PREFIX, oid, path)
}

/// One row of the GC merge series.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RefEntry {
    File { oid: String, path: String },
    Blob { oid: String, node_id: String },
}

impl RefEntry {
    pub fn oid(&self) -> &str {
        match self {
            RefEntry::File { oid, .. } | RefEntry::Blob { oid, .. } => oid,
        }
    }
}

pub fn parse_ref(key: &str) -> Option<RefEntry> {
    let rest = key.strip_prefix(REF_PREFIX)?;
    let (oid, rest) = rest.split_once('/')?;
    let (kind, name) = rest.split_once('/')?;
    if oid.is_empty() || name.is_empty() {
        return None;
    }
    match kind {
        "file" => Some(RefEntry::File {
            oid: oid.to_string(),
            path: name.to_string(),
        }),
        "blob" => Some(RefEntry::Blob {
            oid: oid.to_string(),
            node_id: name.to_string(),
        }),
        _ => None,
    }
}

/// `(count, oid)` of a replica-count index key.
pub fn parse_repl(key: &str) -> Option<(usize, String)> {
    let rest = key.strip_prefix(REPL_PREFIX)?;
    let (count, oid) = rest.split_once('/')?;
    let count = count.parse().ok()?;
    if oid.is_empty() {
        return None;
    }
    Some((count, oid.to_string()))
}

/// Oid of an owner index key under `node_id`.
pub fn parse_owner<'a>(key: &'a str, node_id: &str) -> Option<&'a str> {
    let rest = key.strip_prefix(OWNER_PREFIX)?;
    let oid = rest.strip_prefix(node_id)?.strip_prefix('/')?;
    (!oid.is_empty()).then_some(oid)
}

/// Node id of an owner index key.
pub fn parse_owner_node(key: &str) -> Option<&str> {
    let (node_id, _) = key.strip_prefix(OWNER_PREFIX)?.split_once('/')?;
    (!node_id.is_empty()).then_some(node_id)
}

/// The first owner index entry of the node sorting after `after`, or of the
/// first node when `after` is `None`. Stepping through it lists every node
/// with owner entries, one scan per node.
pub fn next_owner_node(after: Option<&str>) -> KeyRange {
    let start = match after {
        Some(node_id) => prefix_end(&owner_index_prefix(node_id)),
        None => Some(OWNER_PREFIX.to_string()),
    };
    KeyRange {
        start,
        end: prefix_end(OWNER_PREFIX),
        limit: 1,
        descending: false,
    }
}
