//! Internode task queue
//!
//! Replication, pruning, collection and reaping never move bytes themselves;
//! they queue `Remove`, `Acquire` and `Fetch` tasks here and a small pool of
//! workers carries them out against peers.

use crate::context::NodeContext;
use crate::error::{CairnError, Result};
use crate::ledger::{BlobOwnership, RemoveOutcome, resolve_owner_nodes};
use crate::nodes::{StorageNode, candidates_for};
use std::sync::Arc;
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone)]
pub enum InternodeTask {
    /// Delete `oid` from `node`.
    Remove { oid: String, node: StorageNode },
    /// Ask `target` to fetch `oid`, dropping the copy on `prev` afterwards.
    Acquire {
        oid: String,
        target: StorageNode,
        prev: Option<String>,
    },
    /// Fetch `oid` onto this node.
    Fetch { oid: String, prev: Option<String> },
}

impl InternodeTask {
    pub fn oid(&self) -> &str {
        match self {
            InternodeTask::Remove { oid, .. }
            | InternodeTask::Acquire { oid, .. }
            | InternodeTask::Fetch { oid, .. } => oid,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchOutcome {
    Fetched { from: String },
    AlreadyLocal,
    InProgress,
}

/// Bounded queue feeding the task workers.
pub struct TaskQueue {
    sender: mpsc::Sender<InternodeTask>,
    receiver: Mutex<mpsc::Receiver<InternodeTask>>,
}

impl TaskQueue {
    pub fn new(capacity: usize) -> Self {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        Self {
            sender,
            receiver: Mutex::new(receiver),
        }
    }

    /// Queue a task, waiting for room.
    pub async fn enqueue(&self, task: InternodeTask) -> Result<()> {
        self.sender
            .send(task)
            .await
            .map_err(|_| CairnError::Internal("task queue closed".to_string()))
    }

    /// Queue a task if there is room right now.
    pub fn try_enqueue(&self, task: InternodeTask) -> bool {
        match self.sender.try_send(task) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(task)) => {
                tracing::debug!("task queue full, dropped task oid={}", task.oid());
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }

    pub fn pending(&self) -> usize {
        self.sender.max_capacity() - self.sender.capacity()
    }

    async fn next(&self, cancel: &CancellationToken) -> Option<InternodeTask> {
        let mut receiver = self.receiver.lock().await;
        tokio::select! {
            _ = cancel.cancelled() => None,
            task = receiver.recv() => task,
        }
    }

    /// Run queued tasks inline until the queue is empty. Returns how many ran.
    pub async fn drain(&self, ctx: &NodeContext) -> usize {
        let mut ran = 0;
        loop {
            let task = {
                let mut receiver = self.receiver.lock().await;
                match receiver.try_recv() {
                    Ok(task) => task,
                    Err(_) => break,
                }
            };
            run_logged(ctx, task).await;
            ran += 1;
        }
        ran
    }
}

pub fn spawn_task_workers(
    ctx: Arc<NodeContext>,
    workers: usize,
    cancel: CancellationToken,
) -> Vec<JoinHandle<()>> {
    (0..workers.max(1))
        .map(|worker| {
            let ctx = ctx.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                tracing::debug!("task worker {} started", worker);
                while let Some(task) = ctx.tasks.next(&cancel).await {
                    run_logged(&ctx, task).await;
                }
                tracing::debug!("task worker {} stopped", worker);
            })
        })
        .collect()
}

async fn run_logged(ctx: &NodeContext, task: InternodeTask) {
    let description = format!("{:?}", task);
    if let Err(error) = execute(ctx, task).await {
        tracing::warn!("internode task failed task={} error={}", description, error);
    }
}

pub async fn execute(ctx: &NodeContext, task: InternodeTask) -> Result<()> {
    match task {
        InternodeTask::Remove { oid, node } => remove_blob_from_node(ctx, &oid, &node).await,
        InternodeTask::Acquire { oid, target, prev } => {
            if target.node_id == ctx.node_id() {
                if !ctx.accept_fetch(&oid, prev) {
                    return Err(CairnError::Internal("local task queue full".to_string()));
                }
                return Ok(());
            }
            ctx.transport
                .request_fetch(&target, &oid, prev.as_deref())
                .await
        }
        InternodeTask::Fetch { oid, prev } => {
            perform_fetch(ctx, &oid, prev.as_deref()).await?;
            Ok(())
        }
    }
}

/// Delete `oid` from `node`. A failed delete against a dead node drops its
/// ownership entry directly.
pub async fn remove_blob_from_node(ctx: &NodeContext, oid: &str, node: &StorageNode) -> Result<()> {
    if node.node_id == ctx.node_id() {
        ctx.delete_local_blob(oid).await?;
        return Ok(());
    }

    match ctx.transport.delete_blob(node, oid).await {
        Ok(()) => {
            tracing::debug!("removed blob oid={} node={}", oid, node.node_id);
            Ok(())
        }
        Err(error) => {
            let view = ctx.node_view().await?;
            if !view.is_live(&node.node_id) {
                tracing::info!(
                    "node is dead, dropping ownership oid={} node={}",
                    oid,
                    node.node_id
                );
                ctx.ledger.remove_ownership(oid, &node.node_id).await?;
            }
            Err(error)
        }
    }
}

/// Pull a copy of `oid` onto this node from its live owners.
pub async fn perform_fetch(ctx: &NodeContext, oid: &str, prev: Option<&str>) -> Result<FetchOutcome> {
    if ctx.blobs.exists(oid) {
        let length = ctx.blobs.verify(oid).await?;
        ctx.ledger
            .record_ownership(oid, length, ctx.node_id())
            .await?;
        return Ok(FetchOutcome::AlreadyLocal);
    }

    let Some(_guard) = ctx.fetches.try_lock(oid) else {
        tracing::debug!("fetch already in progress oid={}", oid);
        return Ok(FetchOutcome::InProgress);
    };

    let record = ctx
        .ledger
        .get(oid)
        .await?
        .ok_or_else(|| CairnError::BlobNotFound(oid.to_string()))?;
    let view = ctx.node_view().await?;
    let owners = resolve_owner_nodes(&record, &view, Some(ctx.node_id()));
    if owners.is_empty() {
        return Err(CairnError::InsufficientReplicas {
            required: 1,
            found: 0,
        });
    }

    let mut last_error = None;
    for owner in &owners {
        let stream = match ctx.transport.open_blob(owner, oid).await {
            Ok(stream) => stream,
            Err(error) => {
                tracing::warn!(
                    "fetch attempt failed oid={} node={} error={}",
                    oid,
                    owner.node_id,
                    error
                );
                last_error = Some(error);
                continue;
            }
        };
        match ctx.store_local_stream(oid, stream).await {
            Ok(_) => {
                tracing::info!("fetched blob oid={} from={}", oid, owner.node_id);
                if let Some(prev) = prev.filter(|prev| *prev != ctx.node_id()) {
                    hand_over(ctx, oid, prev, &view).await?;
                }
                return Ok(FetchOutcome::Fetched {
                    from: owner.node_id.clone(),
                });
            }
            Err(error) => {
                tracing::warn!(
                    "fetched copy rejected oid={} node={} error={}",
                    oid,
                    owner.node_id,
                    error
                );
                last_error = Some(error);
            }
        }
    }

    Err(last_error.unwrap_or_else(|| CairnError::BlobNotFound(oid.to_string())))
}

async fn hand_over(
    ctx: &NodeContext,
    oid: &str,
    prev: &str,
    view: &crate::nodes::NodeView,
) -> Result<()> {
    match view.get(prev) {
        Some(node) => {
            tracing::info!("requesting post-move removal oid={} from={}", oid, prev);
            let queued = ctx.tasks.try_enqueue(InternodeTask::Remove {
                oid: oid.to_string(),
                node: node.clone(),
            });
            if !queued {
                tracing::warn!("could not queue post-move removal oid={} from={}", oid, prev);
            }
        }
        None => {
            tracing::info!("previous owner unknown, dropping ownership oid={} node={}", oid, prev);
            ctx.ledger.remove_ownership(oid, prev).await?;
        }
    }
    Ok(())
}

/// Queue up to `todo` acquisitions of `record` on nodes that lack it.
/// Returns false once the task queue is full.
pub fn salvage_blob(
    ctx: &NodeContext,
    record: &BlobOwnership,
    prev: Option<&str>,
    todo: usize,
    nodes: &[StorageNode],
) -> bool {
    let candidates: Vec<_> = candidates_for(nodes, &record.nodes, record.length)
        .into_iter()
        .filter(|node| Some(node.node_id.as_str()) != prev)
        .take(todo)
        .collect();

    if candidates.is_empty() {
        tracing::warn!("no replication candidate oid={}", record.oid);
        return true;
    }

    for node in candidates {
        let queued = ctx.tasks.try_enqueue(InternodeTask::Acquire {
            oid: record.oid.clone(),
            target: node.clone(),
            prev: prev.map(str::to_string),
        });
        tracing::info!(
            "recommending copy oid={} target={} queued={}",
            record.oid,
            node.node_id,
            queued
        );
        if !queued {
            return false;
        }
    }
    true
}

/// Ownership outcome for logging after a forced removal.
pub fn describe_removal(outcome: RemoveOutcome) -> &'static str {
    match outcome {
        RemoveOutcome::Unknown => "unknown",
        RemoveOutcome::Removed { remaining: 0 } => "last owner removed",
        RemoveOutcome::Removed { .. } => "removed",
        RemoveOutcome::Refused { .. } => "refused",
    }
}
