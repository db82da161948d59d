use crate::error::{CairnError, Result};
use crate::keys;
use crate::store::{
    MetaStore, Mutation, Precondition, TransactOutcome, WriteOp, WriteOutcome, get_record,
    put_record, transact,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// How long a running marker outlives a crashed job.
pub const RUNNING_MARKER_TTL: Duration = Duration::from_secs(60 * 60);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskLease {
    pub owner_node: String,
    pub started_at: DateTime<Utc>,
    pub ttl_seconds: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunningMarker {
    pub node: String,
    pub started_at: DateTime<Utc>,
}

/// Cluster-wide, time-boxed mutex keyed by task name.
#[derive(Clone)]
pub struct LeaseLock {
    store: Arc<dyn MetaStore>,
    node_id: String,
}

impl LeaseLock {
    pub fn new(store: Arc<dyn MetaStore>, node_id: impl Into<String>) -> Self {
        Self {
            store,
            node_id: node_id.into(),
        }
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    /// Atomically create the lease if nobody holds it.
    pub async fn try_acquire(&self, task: &str, ttl: Duration) -> Result<bool> {
        if ttl < Duration::from_secs(1) {
            tracing::warn!(
                "refusing lease with sub-second ttl task={} ttl={:?}",
                task,
                ttl
            );
            return Ok(false);
        }

        let lease = TaskLease {
            owner_node: self.node_id.clone(),
            started_at: Utc::now(),
            ttl_seconds: ttl.as_secs(),
        };
        let outcome = self
            .store
            .write_if(
                &keys::lease(task),
                Precondition::Absent,
                WriteOp::Put {
                    value: serde_json::to_vec(&lease)?,
                    ttl: Some(ttl),
                },
            )
            .await?;

        Ok(outcome == WriteOutcome::Applied)
    }

    /// Extend the lease, provided this node still owns it.
    pub async fn renew(&self, task: &str, ttl: Duration) -> Result<bool> {
        let outcome = transact(
            self.store.as_ref(),
            &keys::lease(task),
            |current: Option<TaskLease>| match current {
                Some(lease) if lease.owner_node == self.node_id => Mutation::PutWithTtl(
                    TaskLease {
                        owner_node: lease.owner_node,
                        started_at: Utc::now(),
                        ttl_seconds: ttl.as_secs(),
                    },
                    ttl,
                ),
                _ => Mutation::Abort,
            },
        )
        .await?;

        let renewed = matches!(outcome, TransactOutcome::Written(_));
        if !renewed {
            tracing::warn!("lease lost task={} node={}", task, self.node_id);
        }
        Ok(renewed)
    }

    pub async fn release(&self, task: &str) -> Result<()> {
        self.store.delete(&keys::lease(task)).await?;
        Ok(())
    }

    pub async fn holder(&self, task: &str) -> Result<Option<TaskLease>> {
        get_record(self.store.as_ref(), &keys::lease(task)).await
    }

    pub async fn mark_running(&self, task: &str) -> Result<()> {
        let marker = RunningMarker {
            node: self.node_id.clone(),
            started_at: Utc::now(),
        };
        put_record(
            self.store.as_ref(),
            &keys::running(task),
            &marker,
            Some(RUNNING_MARKER_TTL),
        )
        .await
    }

    pub async fn clear_running(&self, task: &str) -> Result<()> {
        self.store.delete(&keys::running(task)).await?;
        Ok(())
    }

    pub async fn is_running(&self, task: &str) -> Result<bool> {
        Ok(self.store.get(&keys::running(task)).await?.is_some())
    }

    /// Block while `task` has a running marker, polling every `poll`.
    pub async fn wait_while_running(
        &self,
        task: &str,
        poll: Duration,
        cancel: &CancellationToken,
    ) -> Result<()> {
        while self.is_running(task).await? {
            tracing::debug!("waiting for task={} to finish", task);
            tokio::select! {
                _ = cancel.cancelled() => return Err(CairnError::Cancelled),
                _ = tokio::time::sleep(poll) => {}
            }
        }
        Ok(())
    }

    pub fn guard(&self, task: impl Into<String>, ttl: Duration) -> LeaseGuard {
        LeaseGuard {
            lock: self.clone(),
            task: task.into(),
            ttl,
        }
    }
}

/// Authority for one acquired lease, handed to the job running under it.
#[derive(Clone)]
pub struct LeaseGuard {
    lock: LeaseLock,
    task: String,
    ttl: Duration,
}

impl LeaseGuard {
    pub fn task(&self) -> &str {
        &self.task
    }

    /// Renew or fail with `LeaseLost`.
    pub async fn ensure_held(&self) -> Result<()> {
        if self.lock.renew(&self.task, self.ttl).await? {
            Ok(())
        } else {
            Err(CairnError::LeaseLost(self.task.clone()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn pair() -> (LeaseLock, LeaseLock) {
        let store: Arc<dyn MetaStore> = Arc::new(MemoryStore::new());
        (
            LeaseLock::new(store.clone(), "node-a"),
            LeaseLock::new(store, "node-b"),
        )
    }

    #[tokio::test]
    async fn test_mutual_exclusion() {
        let (a, b) = pair();
        let ttl = Duration::from_secs(30);
        assert!(a.try_acquire("gc", ttl).await.unwrap());
        assert!(!b.try_acquire("gc", ttl).await.unwrap());
        assert!(!a.try_acquire("gc", ttl).await.unwrap());
        assert!(b.try_acquire("prune", ttl).await.unwrap());

        a.release("gc").await.unwrap();
        assert!(b.try_acquire("gc", ttl).await.unwrap());
        assert_eq!(b.holder("gc").await.unwrap().unwrap().owner_node, "node-b");
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_lease_is_acquirable() {
        let (a, b) = pair();
        assert!(a.try_acquire("gc", Duration::from_secs(5)).await.unwrap());
        tokio::time::advance(Duration::from_secs(6)).await;
        assert!(b.try_acquire("gc", Duration::from_secs(5)).await.unwrap());
        assert!(!a.renew("gc", Duration::from_secs(5)).await.unwrap());
    }

    #[tokio::test]
    async fn test_renew_requires_ownership() {
        let (a, b) = pair();
        let ttl = Duration::from_secs(30);
        assert!(!a.renew("gc", ttl).await.unwrap());
        assert!(a.try_acquire("gc", ttl).await.unwrap());
        assert!(a.renew("gc", ttl).await.unwrap());
        assert!(!b.renew("gc", ttl).await.unwrap());

        let guard = b.guard("gc", ttl);
        assert!(matches!(
            guard.ensure_held().await,
            Err(CairnError::LeaseLost(task)) if task == "gc"
        ));
        assert!(a.guard("gc", ttl).ensure_held().await.is_ok());
    }

    #[tokio::test]
    async fn test_sub_second_ttl_is_refused() {
        let (a, _) = pair();
        assert!(!a.try_acquire("gc", Duration::from_millis(500)).await.unwrap());
        assert!(a.holder("gc").await.unwrap().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_while_running() {
        let (a, b) = pair();
        a.mark_running("repl").await.unwrap();
        assert!(b.is_running("repl").await.unwrap());

        let waiter = {
            let b = b.clone();
            tokio::spawn(async move {
                let cancel = CancellationToken::new();
                b.wait_while_running("repl", Duration::from_secs(5), &cancel)
                    .await
            })
        };
        tokio::time::sleep(Duration::from_secs(12)).await;
        assert!(!waiter.is_finished());

        a.clear_running("repl").await.unwrap();
        waiter.await.unwrap().unwrap();

        a.mark_running("repl").await.unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel();
        assert!(matches!(
            b.wait_while_running("repl", Duration::from_secs(5), &cancel)
                .await,
            Err(CairnError::Cancelled)
        ));
    }
}
