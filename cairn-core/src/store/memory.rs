use super::{KeyRange, MetaStore, Precondition, Version, Versioned, WriteOp, WriteOutcome};
use crate::error::Result;
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::ops::Bound;
use std::sync::Mutex;
use std::time::Duration;
use tokio::time::Instant;

struct Entry {
    value: Vec<u8>,
    version: u64,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.map(|at| at > now).unwrap_or(true)
    }
}

#[derive(Default)]
struct Inner {
    entries: BTreeMap<String, Entry>,
    next_version: u64,
}

impl Inner {
    fn live(&self, key: &str, now: Instant) -> Option<&Entry> {
        self.entries.get(key).filter(|entry| entry.is_live(now))
    }

    fn put(&mut self, key: &str, value: Vec<u8>, ttl: Option<Duration>, now: Instant) {
        self.next_version += 1;
        self.entries.insert(
            key.to_string(),
            Entry {
                value,
                version: self.next_version,
                expires_at: ttl.map(|ttl| now + ttl),
            },
        );
    }
}

/// In-process store used for single-node deployments and tests.
///
/// Expiry follows the tokio clock so paused-time tests can age leases.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

#[async_trait]
impl MetaStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<Versioned>> {
        let inner = self.lock();
        Ok(inner.live(key, Instant::now()).map(|entry| Versioned {
            value: entry.value.clone(),
            version: Version(entry.version),
        }))
    }

    async fn get_many(&self, keys: &[String]) -> Result<HashMap<String, Versioned>> {
        let inner = self.lock();
        let now = Instant::now();
        Ok(keys
            .iter()
            .filter_map(|key| {
                inner.live(key, now).map(|entry| {
                    (
                        key.clone(),
                        Versioned {
                            value: entry.value.clone(),
                            version: Version(entry.version),
                        },
                    )
                })
            })
            .collect())
    }

    async fn set(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>) -> Result<()> {
        let mut inner = self.lock();
        inner.put(key, value, ttl, Instant::now());
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        let mut inner = self.lock();
        let now = Instant::now();
        Ok(inner
            .entries
            .remove(key)
            .map(|entry| entry.is_live(now))
            .unwrap_or(false))
    }

    async fn write_if(
        &self,
        key: &str,
        precondition: Precondition,
        op: WriteOp,
    ) -> Result<WriteOutcome> {
        let mut inner = self.lock();
        let now = Instant::now();
        let current = inner.live(key, now).map(|entry| entry.version);

        let matches = match (precondition, current) {
            (Precondition::Absent, None) => true,
            (Precondition::Version(expected), Some(actual)) => expected.0 == actual,
            _ => false,
        };
        if !matches {
            return Ok(WriteOutcome::Conflict);
        }

        match op {
            WriteOp::Put { value, ttl } => inner.put(key, value, ttl, now),
            WriteOp::Delete => {
                inner.entries.remove(key);
            }
        }
        Ok(WriteOutcome::Applied)
    }

    async fn scan(&self, range: &KeyRange) -> Result<Vec<(String, Vec<u8>)>> {
        if range.is_empty() {
            return Ok(Vec::new());
        }
        let lower = range.start.as_deref().map_or(Bound::Unbounded, Bound::Included);
        let upper = range.end.as_deref().map_or(Bound::Unbounded, Bound::Excluded);

        let mut inner = self.lock();
        let now = Instant::now();
        let mut expired = Vec::new();
        let rows = {
            let span = inner.entries.range::<str, _>((lower, upper));
            if range.descending {
                take_live(span.rev(), range.limit, now, &mut expired)
            } else {
                take_live(span, range.limit, now, &mut expired)
            }
        };
        for key in expired {
            inner.entries.remove(&key);
        }
        Ok(rows)
    }
}

/// Collect up to `limit` live rows, noting the expired keys passed on the way.
fn take_live<'a>(
    entries: impl Iterator<Item = (&'a String, &'a Entry)>,
    limit: usize,
    now: Instant,
    expired: &mut Vec<String>,
) -> Vec<(String, Vec<u8>)> {
    let mut rows = Vec::new();
    for (key, entry) in entries {
        if rows.len() >= limit {
            break;
        }
        if entry.is_live(now) {
            rows.push((key.clone(), entry.value.clone()));
        } else {
            expired.push(key.clone());
        }
    }
    rows
}
