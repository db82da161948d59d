//! Collection of blobs no file points at.
//!
//! `idx/ref/` holds, per oid, one `file` entry for every referencing path and
//! one `blob` entry for every owning node. Walked in descending key order the
//! `file` entries of an oid come before its `blob` entries, so a `blob` entry
//! whose oid differs from the last oid seen with a `file` entry has no
//! reference.

use crate::context::NodeContext;
use crate::error::{CairnError, Result};
use crate::keys::{self, RefEntry};
use crate::lease::LeaseGuard;
use crate::store::KeyRange;
use crate::tasks::InternodeTask;
use chrono::{DateTime, Utc};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

#[derive(Clone)]
pub struct GarbageCollectOperation {
    ctx: Arc<NodeContext>,
}

#[derive(Debug, Clone)]
pub struct GarbageCollectOperationRequest {
    pub page_size: usize,
    /// Blobs touched more recently than this are left alone.
    pub grace: Duration,
}

#[derive(Debug, Clone, Default)]
pub struct GarbageCollectOperationResult {
    pub pages: usize,
    pub scanned: usize,
    pub candidates: usize,
    pub queued: usize,
    pub dropped_unknown_owner: usize,
    pub skipped_recent: usize,
    pub repaired: usize,
    pub errors: Vec<String>,
}

/// Unreferenced `(oid, node)` pairs of one page, in walk order.
pub fn unreferenced_entries(
    rows: &[(String, Vec<u8>)],
    last_referenced: &mut Option<String>,
) -> Vec<(String, String)> {
    let mut candidates = Vec::new();
    for (key, _) in rows {
        match keys::parse_ref(key) {
            Some(RefEntry::File { oid, .. }) => *last_referenced = Some(oid),
            Some(RefEntry::Blob { oid, node_id }) => {
                if last_referenced.as_deref() != Some(oid.as_str()) {
                    candidates.push((oid, node_id));
                }
            }
            None => tracing::debug!("ignoring malformed reference key={}", key),
        }
    }
    candidates
}

impl GarbageCollectOperation {
    pub fn new(ctx: Arc<NodeContext>) -> Self {
        Self { ctx }
    }

    /// Walk the whole reference index once. With a lease, every page boundary
    /// re-checks it and the walk aborts with `LeaseLost` once it is gone.
    pub async fn run(
        &self,
        request: GarbageCollectOperationRequest,
        lease: Option<&LeaseGuard>,
        cancel: &CancellationToken,
    ) -> Result<GarbageCollectOperationResult> {
        let GarbageCollectOperationRequest { page_size, grace } = request;
        let page_size = page_size.max(1);
        let grace = chrono::Duration::from_std(grace)
            .map_err(|error| CairnError::Config(format!("invalid gc grace: {}", error)))?;

        let view = self.ctx.node_view().await?;
        let mut result = GarbageCollectOperationResult::default();
        let mut last_referenced: Option<String> = None;
        let mut range = KeyRange::prefix(keys::REF_PREFIX)
            .descending()
            .with_limit(page_size);

        loop {
            if cancel.is_cancelled() {
                return Err(CairnError::Cancelled);
            }
            let rows = self.ctx.store.scan(&range).await?;
            let Some((last_key, _)) = rows.last() else {
                break;
            };
            let last_key = last_key.clone();
            result.pages += 1;
            result.scanned += rows.len();

            let candidates = unreferenced_entries(&rows, &mut last_referenced);
            result.candidates += candidates.len();
            if !candidates.is_empty() {
                self.collect_page(candidates, grace, &view, &mut result)
                    .await?;
            }

            if rows.len() < page_size {
                break;
            }
            range = range.resume_before(&last_key);
            if let Some(lease) = lease {
                lease.ensure_held().await?;
            }
        }

        tracing::info!(
            "garbage collection pass done pages={} candidates={} queued={} skipped_recent={}",
            result.pages,
            result.candidates,
            result.queued,
            result.skipped_recent
        );
        Ok(result)
    }

    async fn collect_page(
        &self,
        candidates: Vec<(String, String)>,
        grace: chrono::Duration,
        view: &crate::nodes::NodeView,
        result: &mut GarbageCollectOperationResult,
    ) -> Result<()> {
        let oids: Vec<String> = candidates
            .iter()
            .map(|(oid, _)| oid.clone())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        let records = self.ctx.ledger.get_many(&oids).await?;
        let markers = self.ctx.ledger.access_markers(&oids).await?;
        let now = Utc::now();

        for (oid, node_id) in candidates {
            let Some(record) = records.get(&oid).filter(|record| record.is_owned_by(&node_id))
            else {
                if let Err(error) = self.ctx.store.delete(&keys::ref_blob(&oid, &node_id)).await {
                    result.errors.push(format!("{}: {}", oid, error));
                }
                result.repaired += 1;
                continue;
            };

            let last_activity: Option<DateTime<Utc>> = [
                markers.get(&oid).map(|marker| marker.last_access),
                record.latest_confirmation(),
            ]
            .into_iter()
            .flatten()
            .max();
            if last_activity.is_some_and(|at| now - at < grace) {
                result.skipped_recent += 1;
                continue;
            }

            match view.get(&node_id) {
                Some(node) => {
                    tracing::info!("collecting blob oid={} node={}", oid, node_id);
                    self.ctx
                        .tasks
                        .enqueue(InternodeTask::Remove {
                            oid: oid.clone(),
                            node: node.clone(),
                        })
                        .await?;
                    result.queued += 1;
                }
                None => match self.ctx.ledger.remove_ownership(&oid, &node_id).await {
                    Ok(_) => {
                        tracing::info!(
                            "dropped ownership of unknown node oid={} node={}",
                            oid,
                            node_id
                        );
                        result.dropped_unknown_owner += 1;
                    }
                    Err(error) => result.errors.push(format!("{}: {}", oid, error)),
                },
            }
        }
        Ok(())
    }
}
