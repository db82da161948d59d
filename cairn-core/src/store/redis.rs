use super::{KeyRange, MetaStore, Precondition, Version, Versioned, WriteOp, WriteOutcome};
use crate::error::{CairnError, Result};
use async_trait::async_trait;
use redis::{AsyncCommands, Client, Script};
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::Mutex;

// KEYS[1] record hash, KEYS[2] version sequence.
// ARGV: mode (any|absent|version), expected version, op (put|delete), data, ttl millis.
const WRITE_IF_SCRIPT: &str = r#"
local current = redis.call('HGET', KEYS[1], 'v')
if ARGV[1] == 'absent' then
  if current then return 0 end
elseif ARGV[1] == 'version' then
  if (not current) or current ~= ARGV[2] then return 0 end
end
if ARGV[3] == 'delete' then
  return redis.call('DEL', KEYS[1])
end
local version = redis.call('INCR', KEYS[2])
redis.call('DEL', KEYS[1])
redis.call('HSET', KEYS[1], 'v', version, 'd', ARGV[4])
if tonumber(ARGV[5]) > 0 then
  redis.call('PEXPIRE', KEYS[1], ARGV[5])
end
return 1
"#;

/// Redis-based metadata store
///
/// Each record is a hash holding its version (`v`) and payload (`d`);
/// conditional writes run as a Lua script so the check and the write are atomic.
pub struct RedisStore {
    conn: Mutex<redis::aio::MultiplexedConnection>,
    prefix: String,
    script: Script,
}

impl RedisStore {
    /// Create a new Redis store client
    pub async fn new(url: &str, namespace: &str) -> Result<Self> {
        let client = Client::open(url)
            .map_err(|e| CairnError::Config(format!("Failed to connect to Redis: {}", e)))?;

        let mut conn = client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| CairnError::Config(format!("Failed to connect to Redis: {}", e)))?;

        let _: String = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(|e| CairnError::Config(format!("Redis ping failed: {}", e)))?;

        Ok(Self {
            conn: Mutex::new(conn),
            prefix: format!("cairn:{}:", namespace),
            script: Script::new(WRITE_IF_SCRIPT),
        })
    }

    fn record_key(&self, key: &str) -> String {
        format!("{}{}", self.prefix, key)
    }

    fn sequence_key(&self) -> String {
        format!("{}__sequence", self.prefix)
    }

    /// Glob pattern matching every record whose key shares the common prefix of the range.
    fn scan_pattern(&self, range: &KeyRange) -> String {
        let start = range.start.as_deref().unwrap_or("");
        let end = range.end.as_deref().unwrap_or("");
        let common: String = start
            .chars()
            .zip(end.chars())
            .take_while(|(a, b)| a == b)
            .map(|(a, _)| a)
            .collect();

        let mut pattern = String::with_capacity(self.prefix.len() + common.len() + 1);
        for c in self.prefix.chars().chain(common.chars()) {
            if matches!(c, '*' | '?' | '[' | ']' | '\\') {
                pattern.push('\\');
            }
            pattern.push(c);
        }
        pattern.push('*');
        pattern
    }

    async fn run_script(
        &self,
        key: &str,
        mode: &str,
        expected: u64,
        op: &str,
        data: &[u8],
        ttl: Option<Duration>,
    ) -> Result<bool> {
        let ttl_millis = ttl.map(|ttl| ttl.as_millis().max(1) as u64).unwrap_or(0);
        let mut conn = self.conn.lock().await;
        let applied: i64 = self
            .script
            .key(self.record_key(key))
            .key(self.sequence_key())
            .arg(mode)
            .arg(expected)
            .arg(op)
            .arg(data)
            .arg(ttl_millis)
            .invoke_async(&mut *conn)
            .await
            .map_err(|e| CairnError::Redis(format!("Conditional write failed: {}", e)))?;
        Ok(applied > 0)
    }

    async fn read_many(&self, keys: &[String]) -> Result<Vec<Option<Versioned>>> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }
        let mut pipe = redis::pipe();
        for key in keys {
            pipe.cmd("HMGET").arg(self.record_key(key)).arg("v").arg("d");
        }

        let mut conn = self.conn.lock().await;
        let rows: Vec<(Option<u64>, Option<Vec<u8>>)> = pipe
            .query_async(&mut *conn)
            .await
            .map_err(|e| CairnError::Redis(format!("Failed to read records: {}", e)))?;

        Ok(rows
            .into_iter()
            .map(|row| match row {
                (Some(version), Some(value)) => Some(Versioned {
                    value,
                    version: Version(version),
                }),
                _ => None,
            })
            .collect())
    }
}

#[async_trait]
impl MetaStore for RedisStore {
    async fn get(&self, key: &str) -> Result<Option<Versioned>> {
        let mut rows = self.read_many(&[key.to_string()]).await?;
        Ok(rows.pop().flatten())
    }

    async fn get_many(&self, keys: &[String]) -> Result<HashMap<String, Versioned>> {
        let rows = self.read_many(keys).await?;
        Ok(keys
            .iter()
            .zip(rows)
            .filter_map(|(key, row)| row.map(|row| (key.clone(), row)))
            .collect())
    }

    async fn set(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>) -> Result<()> {
        self.run_script(key, "any", 0, "put", &value, ttl).await?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        let mut conn = self.conn.lock().await;
        let removed: i64 = conn
            .del(self.record_key(key))
            .await
            .map_err(|e| CairnError::Redis(format!("Failed to delete record: {}", e)))?;
        Ok(removed > 0)
    }

    async fn write_if(
        &self,
        key: &str,
        precondition: Precondition,
        op: WriteOp,
    ) -> Result<WriteOutcome> {
        let (mode, expected) = match precondition {
            Precondition::Absent => ("absent", 0),
            Precondition::Version(version) => ("version", version.0),
        };
        let applied = match op {
            WriteOp::Put { value, ttl } => {
                self.run_script(key, mode, expected, "put", &value, ttl)
                    .await?
            }
            WriteOp::Delete => {
                self.run_script(key, mode, expected, "delete", &[], None)
                    .await?
            }
        };

        if applied {
            Ok(WriteOutcome::Applied)
        } else {
            Ok(WriteOutcome::Conflict)
        }
    }

    async fn scan(&self, range: &KeyRange) -> Result<Vec<(String, Vec<u8>)>> {
        let pattern = self.scan_pattern(range);
        let full_keys: Vec<String> = {
            let mut conn = self.conn.lock().await;
            conn.keys(&pattern)
                .await
                .map_err(|e| CairnError::Redis(format!("Failed to list records: {}", e)))?
        };

        let sequence_key = self.sequence_key();
        let mut keys: Vec<String> = full_keys
            .iter()
            .filter(|full| **full != sequence_key)
            .filter_map(|full| full.strip_prefix(self.prefix.as_str()))
            .filter(|key| range.contains(key))
            .map(str::to_string)
            .collect();
        keys.sort();
        if range.descending {
            keys.reverse();
        }
        keys.truncate(range.limit);

        let rows = self.read_many(&keys).await?;
        Ok(keys
            .into_iter()
            .zip(rows)
            .filter_map(|(key, row)| row.map(|row| (key, row.value)))
            .collect())
    }
}
