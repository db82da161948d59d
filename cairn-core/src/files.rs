use crate::error::{CairnError, Result};
use crate::keys;
use crate::ledger::OwnershipLedger;
use crate::store::{KeyRange, MetaStore, Mutation, TransactOutcome, get_record, transact};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::Arc;

/// Number of replaced versions a file keeps by default.
pub const DEFAULT_REVISIONS: usize = 0;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileRevision {
    pub oid: String,
    pub length: u64,
    pub modified: DateTime<Utc>,
}

/// A named file pointing at one blob, plus the versions it replaced.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileMeta {
    pub oid: String,
    pub length: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,
    pub modified: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub previous: Vec<FileRevision>,
}

impl FileMeta {
    pub fn new(oid: impl Into<String>, length: u64) -> Self {
        Self {
            oid: oid.into(),
            length,
            content_type: None,
            modified: Utc::now(),
            previous: Vec::new(),
        }
    }

    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }

    /// Every oid this file keeps alive.
    pub fn referenced_oids(&self) -> BTreeSet<String> {
        std::iter::once(self.oid.clone())
            .chain(self.previous.iter().map(|revision| revision.oid.clone()))
            .collect()
    }
}

/// File records and the file-reference entries the collector walks.
#[derive(Clone)]
pub struct FileCatalog {
    store: Arc<dyn MetaStore>,
    ledger: OwnershipLedger,
    revisions: usize,
}

impl FileCatalog {
    pub fn new(store: Arc<dyn MetaStore>) -> Self {
        Self {
            ledger: OwnershipLedger::new(store.clone()),
            store,
            revisions: DEFAULT_REVISIONS,
        }
    }

    pub fn with_revisions(mut self, revisions: usize) -> Self {
        self.revisions = revisions;
        self
    }

    pub async fn get(&self, path: &str) -> Result<Option<FileMeta>> {
        get_record(self.store.as_ref(), &keys::file(path)).await
    }

    /// Point `path` at `meta.oid`, pushing the replaced version into history.
    ///
    /// The new oid's file-reference entry is written before the record, so the
    /// collector never sees the record without it.
    pub async fn link(&self, path: &str, meta: FileMeta) -> Result<FileMeta> {
        validate_path(path)?;
        let new_ref = keys::ref_file(&meta.oid, path);
        self.store.set(&new_ref, Vec::new(), None).await?;

        let revisions = self.revisions;
        let mut before: Option<FileMeta> = None;
        let committed = transact(
            self.store.as_ref(),
            &keys::file(path),
            |current: Option<FileMeta>| {
                before = current.clone();
                let mut next = meta.clone();
                if let Some(current) = current {
                    let mut history = current.previous.clone();
                    if current.oid != next.oid {
                        history.insert(
                            0,
                            FileRevision {
                                oid: current.oid,
                                length: current.length,
                                modified: current.modified,
                            },
                        );
                    }
                    history.truncate(revisions);
                    next.previous = history;
                }
                Mutation::Put(next)
            },
        )
        .await;

        let linked = match committed.map(TransactOutcome::written) {
            Ok(Some(linked)) => linked,
            Ok(None) => {
                self.release_refs(path, [meta.oid.clone()]).await?;
                return Err(CairnError::Internal(format!("file {} was not linked", path)));
            }
            Err(error) => {
                if let Err(cleanup) = self.release_refs(path, [meta.oid.clone()]).await {
                    tracing::warn!("failed to drop file ref path={} error={}", path, cleanup);
                }
                return Err(error);
            }
        };

        let keep = linked.referenced_oids();
        for oid in &keep {
            self.store
                .set(&keys::ref_file(oid, path), Vec::new(), None)
                .await?;
        }
        if let Some(before) = before {
            let dropped: Vec<String> = before.referenced_oids().difference(&keep).cloned().collect();
            self.release_refs(path, dropped).await?;
        }
        if !self.ledger.reference_blob(&linked.oid).await? {
            tracing::warn!("linked file to unknown blob path={} oid={}", path, linked.oid);
        }

        tracing::debug!("linked file path={} oid={}", path, linked.oid);
        Ok(linked)
    }

    /// Remove `path` and its file-reference entries.
    pub async fn unlink(&self, path: &str) -> Result<Option<FileMeta>> {
        let mut before: Option<FileMeta> = None;
        let outcome = transact(
            self.store.as_ref(),
            &keys::file(path),
            |current: Option<FileMeta>| {
                before = current;
                Mutation::Delete
            },
        )
        .await?;

        if outcome != TransactOutcome::Deleted {
            return Ok(None);
        }
        if let Some(meta) = &before {
            self.release_refs(path, meta.referenced_oids()).await?;
            tracing::debug!("unlinked file path={} oid={}", path, meta.oid);
        }
        Ok(before)
    }

    /// Drop the file-reference entries of `oids` for `path`, unless the record
    /// as it stands now still references them. A concurrent relink may have
    /// pointed the path back at one of them.
    async fn release_refs(
        &self,
        path: &str,
        oids: impl IntoIterator<Item = String>,
    ) -> Result<()> {
        let current = self
            .get(path)
            .await?
            .map(|meta| meta.referenced_oids())
            .unwrap_or_default();
        let mut released = false;
        for oid in oids {
            if current.contains(&oid) {
                continue;
            }
            self.store.delete(&keys::ref_file(&oid, path)).await?;
            released = true;
        }
        if released {
            // The record may have moved between the read above and the deletes.
            self.repair_refs(path).await?;
        }
        Ok(())
    }

    /// Rewrite any missing file-reference entry of the record at `path`.
    /// Returns how many were restored.
    pub async fn repair_refs(&self, path: &str) -> Result<usize> {
        let Some(meta) = self.get(path).await? else {
            return Ok(0);
        };
        let mut restored = 0;
        for oid in meta.referenced_oids() {
            let key = keys::ref_file(&oid, path);
            if self.store.get(&key).await?.is_none() {
                self.store.set(&key, Vec::new(), None).await?;
                tracing::warn!("restored missing file ref path={} oid={}", path, oid);
                restored += 1;
            }
        }
        Ok(restored)
    }

    /// Up to `limit` paths under `prefix`, sorted, after `start_after`.
    pub async fn list_paths(
        &self,
        prefix: &str,
        start_after: Option<&str>,
        limit: usize,
    ) -> Result<Vec<String>> {
        let mut range = KeyRange::prefix(&keys::file(prefix)).with_limit(limit);
        if let Some(after) = start_after {
            range = range.resume_after(&keys::file(after));
        }
        Ok(self
            .store
            .scan(&range)
            .await?
            .into_iter()
            .filter_map(|(key, _)| key.strip_prefix(keys::FILE_PREFIX).map(str::to_string))
            .collect())
    }
}

fn validate_path(path: &str) -> Result<()> {
    if path.is_empty() || path.starts_with('/') {
        return Err(CairnError::InvalidRequest(format!("invalid path: {:?}", path)));
    }
    Ok(())
}
