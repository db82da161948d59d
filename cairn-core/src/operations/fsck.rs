use crate::error::{CairnError, Result};
use crate::files::FileCatalog;
use crate::ledger::OwnershipLedger;
use crate::walker::PathWalker;
use serde::Serialize;
use tokio_util::sync::CancellationToken;

/// Checks every file under a prefix against the ownership ledger.
#[derive(Clone)]
pub struct FsckOperation {
    catalog: FileCatalog,
    walker: PathWalker,
    ledger: OwnershipLedger,
}

#[derive(Debug, Clone)]
pub struct FsckOperationRequest {
    pub prefix: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FsckEntry {
    pub path: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub oid: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub replicas: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct FsckOperationResult {
    pub entries: Vec<FsckEntry>,
    pub healthy: usize,
    pub broken: usize,
    /// File-reference entries that were missing and have been rewritten.
    pub refs_restored: usize,
}

impl FsckOperation {
    pub fn new(catalog: FileCatalog, ledger: OwnershipLedger) -> Self {
        Self {
            walker: PathWalker::new(catalog.clone()),
            catalog,
            ledger,
        }
    }

    pub async fn run(
        &self,
        request: FsckOperationRequest,
        cancel: &CancellationToken,
    ) -> Result<FsckOperationResult> {
        let FsckOperationRequest { prefix } = request;
        let mut items = self.walker.walk(&prefix, None, cancel.child_token());
        let mut result = FsckOperationResult::default();

        while let Some(item) = items.recv().await {
            let item = item?;
            if item.meta.is_ok() {
                match self.catalog.repair_refs(&item.path).await {
                    Ok(restored) => result.refs_restored += restored,
                    Err(error) => {
                        tracing::warn!("fsck ref repair failed path={} error={}", item.path, error)
                    }
                }
            }
            let entry = match item.meta {
                Err(error) => FsckEntry {
                    path: item.path,
                    oid: None,
                    replicas: None,
                    error: Some(error.to_string()),
                },
                Ok(meta) => match self.ledger.get(&meta.oid).await {
                    Ok(Some(record)) => FsckEntry {
                        path: item.path,
                        oid: Some(meta.oid),
                        replicas: Some(record.replica_count()),
                        error: None,
                    },
                    Ok(None) => FsckEntry {
                        path: item.path,
                        oid: Some(meta.oid),
                        replicas: Some(0),
                        error: Some("no ownership record".to_string()),
                    },
                    Err(error) => FsckEntry {
                        path: item.path,
                        oid: Some(meta.oid),
                        replicas: None,
                        error: Some(error.to_string()),
                    },
                },
            };
            if entry.error.is_some() {
                tracing::warn!("fsck problem path={} error={:?}", entry.path, entry.error);
                result.broken += 1;
            } else {
                result.healthy += 1;
            }
            result.entries.push(entry);
        }

        if cancel.is_cancelled() {
            return Err(CairnError::Cancelled);
        }
        result.entries.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(result)
    }
}
