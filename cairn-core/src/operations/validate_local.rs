use crate::context::NodeContext;
use crate::error::{CairnError, Result};
use crate::keys;
use crate::store::KeyRange;
use futures_util::StreamExt;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Temp files older than this are abandoned uploads or fetches.
pub const TMP_MAX_AGE: Duration = Duration::from_secs(60 * 60);

const OWNER_PAGE: usize = 1000;

#[derive(Clone)]
pub struct ValidateLocalOperation {
    ctx: Arc<NodeContext>,
}

#[derive(Debug, Clone)]
pub struct ValidateLocalOperationRequest {
    pub verify_workers: usize,
}

#[derive(Debug, Clone, Default)]
pub struct ValidateLocalOperationResult {
    pub verified: usize,
    pub corrupt: usize,
    pub missing: usize,
    pub tmp_removed: usize,
    pub errors: Vec<String>,
}

enum Verdict {
    Good,
    Corrupt,
    Failed(String),
}

impl ValidateLocalOperation {
    pub fn new(ctx: Arc<NodeContext>) -> Self {
        Self { ctx }
    }

    /// Reconcile this node's disk with its ownership entries.
    pub async fn run(
        &self,
        request: ValidateLocalOperationRequest,
        cancel: &CancellationToken,
    ) -> Result<ValidateLocalOperationResult> {
        let ValidateLocalOperationRequest { verify_workers } = request;
        let mut result = ValidateLocalOperationResult::default();

        match self.ctx.blobs.cleanup_tmp(TMP_MAX_AGE).await {
            Ok(removed) => result.tmp_removed = removed,
            Err(error) => result.errors.push(format!("tmp cleanup: {}", error)),
        }

        let oids = self.ctx.blobs.list().await?;
        let verdicts: Vec<(String, Verdict)> = futures_util::stream::iter(oids)
            .take_until(cancel.cancelled())
            .map(|oid| async move {
                let verdict = self.verify_one(&oid).await;
                (oid, verdict)
            })
            .buffer_unordered(verify_workers.max(1))
            .collect()
            .await;
        if cancel.is_cancelled() {
            return Err(CairnError::Cancelled);
        }

        for (oid, verdict) in verdicts {
            match verdict {
                Verdict::Good => result.verified += 1,
                Verdict::Corrupt => result.corrupt += 1,
                Verdict::Failed(error) => result.errors.push(format!("{}: {}", oid, error)),
            }
        }

        result.missing = self.drop_missing(cancel).await?;
        tracing::info!(
            "local validation done verified={} corrupt={} missing={} tmp_removed={}",
            result.verified,
            result.corrupt,
            result.missing,
            result.tmp_removed
        );
        Ok(result)
    }

    async fn verify_one(&self, oid: &str) -> Verdict {
        match self.ctx.blobs.verify(oid).await {
            Ok(length) => match self
                .ctx
                .ledger
                .record_ownership(oid, length, self.ctx.node_id())
                .await
            {
                Ok(_) => Verdict::Good,
                Err(error) => Verdict::Failed(error.to_string()),
            },
            Err(CairnError::HashMismatch { actual, .. }) => {
                tracing::warn!("corrupt local blob oid={} actual={}", oid, actual);
                match self.ctx.delete_local_blob(oid).await {
                    Ok(_) => Verdict::Corrupt,
                    Err(error) => Verdict::Failed(error.to_string()),
                }
            }
            Err(error) => Verdict::Failed(error.to_string()),
        }
    }

    /// Remove this node's ownership of blobs that are not on disk.
    async fn drop_missing(&self, cancel: &CancellationToken) -> Result<usize> {
        let node_id = self.ctx.node_id();
        let mut range = KeyRange::prefix(&keys::owner_index_prefix(node_id)).with_limit(OWNER_PAGE);
        let mut missing = 0;
        loop {
            if cancel.is_cancelled() {
                return Err(CairnError::Cancelled);
            }
            let rows = self.ctx.store.scan(&range).await?;
            for (key, _) in &rows {
                let Some(oid) = keys::parse_owner(key, node_id) else {
                    continue;
                };
                if self.ctx.blobs.exists(oid) {
                    continue;
                }
                tracing::info!("owned blob missing from disk oid={}", oid);
                self.ctx.ledger.remove_ownership(oid, node_id).await?;
                // Entries left by a lost index update.
                self.ctx.store.delete(key).await?;
                missing += 1;
            }
            match rows.last() {
                Some((last, _)) if rows.len() == OWNER_PAGE => range = range.resume_after(last),
                _ => return Ok(missing),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::TestCluster;
    use bytes::Bytes;

    fn request() -> ValidateLocalOperationRequest {
        ValidateLocalOperationRequest { verify_workers: 2 }
    }

    #[tokio::test]
    async fn test_records_ownership_of_unknown_local_blob() {
        let cluster = TestCluster::new(1).await;
        let a = cluster.node(0);
        let oid = a.blobs.put(Bytes::from("on disk only")).await.unwrap();
        assert!(a.ledger.get(&oid).await.unwrap().is_none());

        let result = ValidateLocalOperation::new(a.clone())
            .run(request(), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(result.verified, 1);
        assert!(a.ledger.get(&oid).await.unwrap().unwrap().is_owned_by(a.node_id()));
    }

    #[tokio::test]
    async fn test_corrupt_blob_is_deleted_and_disowned() {
        let cluster = TestCluster::new(1).await;
        let a = cluster.node(0);
        let oid = a.store_local_blob_bytes(Bytes::from("original")).await.unwrap();
        let path = a
            .blobs
            .base_path()
            .join("blobs")
            .join(&oid[..2])
            .join(&oid);
        tokio::fs::write(&path, b"tampered").await.unwrap();

        let result = ValidateLocalOperation::new(a.clone())
            .run(request(), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(result.corrupt, 1);
        assert!(!a.blobs.exists(&oid));
        assert!(a.ledger.get(&oid).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_missing_blob_is_disowned() {
        let cluster = TestCluster::new(2).await;
        let (a, b) = (cluster.node(0), cluster.node(1));
        let oid = a.store_local_blob_bytes(Bytes::from("shared")).await.unwrap();
        b.ledger.record_ownership(&oid, 6, b.node_id()).await.unwrap();

        let result = ValidateLocalOperation::new(b.clone())
            .run(request(), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(result.missing, 1);
        let record = a.ledger.get(&oid).await.unwrap().unwrap();
        assert!(!record.is_owned_by(b.node_id()));
        assert!(record.is_owned_by(a.node_id()));
    }
}
