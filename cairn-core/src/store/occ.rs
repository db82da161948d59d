use super::{MetaStore, Precondition, WriteOp, WriteOutcome};
use crate::error::{CairnError, Result};
use serde::{Serialize, de::DeserializeOwned};
use std::time::Duration;

/// Attempts a read-modify-write makes before reporting a conflict.
pub const DEFAULT_ATTEMPTS: usize = 16;

/// What a transaction callback wants done with the record it was shown.
#[derive(Debug)]
pub enum Mutation<T> {
    Put(T),
    PutWithTtl(T, Duration),
    Delete,
    Abort,
}

#[derive(Debug, PartialEq)]
pub enum TransactOutcome<T> {
    Written(T),
    Deleted,
    Aborted,
}

impl<T> TransactOutcome<T> {
    pub fn written(self) -> Option<T> {
        match self {
            TransactOutcome::Written(value) => Some(value),
            _ => None,
        }
    }
}

/// Optimistic read-modify-write of a single record.
///
/// `mutate` is called with the current decoded value (or `None`) and may be
/// invoked several times when concurrent writers race; it must not have side
/// effects beyond computing the next value.
pub async fn transact<T, F>(store: &dyn MetaStore, key: &str, mutate: F) -> Result<TransactOutcome<T>>
where
    T: Serialize + DeserializeOwned + Send,
    F: FnMut(Option<T>) -> Mutation<T> + Send,
{
    transact_with_budget(store, key, DEFAULT_ATTEMPTS, mutate).await
}

pub async fn transact_with_budget<T, F>(
    store: &dyn MetaStore,
    key: &str,
    budget: usize,
    mut mutate: F,
) -> Result<TransactOutcome<T>>
where
    T: Serialize + DeserializeOwned + Send,
    F: FnMut(Option<T>) -> Mutation<T> + Send,
{
    let budget = budget.max(1);
    for attempt in 1..=budget {
        let current = match store.get(key).await {
            Ok(current) => current,
            Err(error) if error.is_transient() && attempt < budget => {
                tracing::warn!(
                    "transient read failure key={} attempt={} error={}",
                    key,
                    attempt,
                    error
                );
                backoff(attempt).await;
                continue;
            }
            Err(error) => return Err(error),
        };

        let (value, precondition) = match current {
            Some(found) => (
                Some(serde_json::from_slice::<T>(&found.value)?),
                Precondition::Version(found.version),
            ),
            None => (None, Precondition::Absent),
        };
        let existed = value.is_some();

        let (op, outcome) = match mutate(value) {
            Mutation::Abort => return Ok(TransactOutcome::Aborted),
            Mutation::Delete if !existed => return Ok(TransactOutcome::Deleted),
            Mutation::Delete => (WriteOp::Delete, TransactOutcome::Deleted),
            Mutation::Put(next) => (
                WriteOp::Put {
                    value: serde_json::to_vec(&next)?,
                    ttl: None,
                },
                TransactOutcome::Written(next),
            ),
            Mutation::PutWithTtl(next, ttl) => (
                WriteOp::Put {
                    value: serde_json::to_vec(&next)?,
                    ttl: Some(ttl),
                },
                TransactOutcome::Written(next),
            ),
        };

        match store.write_if(key, precondition, op).await {
            Ok(WriteOutcome::Applied) => return Ok(outcome),
            Ok(WriteOutcome::Conflict) => {
                tracing::debug!("version conflict key={} attempt={}", key, attempt);
            }
            Err(error) if error.is_transient() && attempt < budget => {
                tracing::warn!(
                    "transient write failure key={} attempt={} error={}",
                    key,
                    attempt,
                    error
                );
            }
            Err(error) => return Err(error),
        }
        backoff(attempt).await;
    }

    Err(CairnError::Conflict {
        key: key.to_string(),
        attempts: budget,
    })
}

async fn backoff(attempt: usize) {
    let millis = (1u64 << attempt.min(7)).min(100);
    tokio::time::sleep(Duration::from_millis(millis)).await;
}
