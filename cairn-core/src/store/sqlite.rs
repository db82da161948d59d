use super::{KeyRange, MetaStore, Precondition, Version, Versioned, WriteOp, WriteOutcome};
use crate::error::Result;
use async_trait::async_trait;
use rusqlite::{Connection, OptionalExtension, TransactionBehavior, params};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Metadata store backed by a SQLite file.
///
/// Several nodes on one host may share the same database; writers serialize
/// through `BEGIN IMMEDIATE`. Versions come from a single sequence row so a
/// deleted and recreated key never reuses an old version.
pub struct SqliteStore {
    db_path: PathBuf,
    namespace: String,
}

impl SqliteStore {
    pub fn new(db_path: impl AsRef<Path>, namespace: &str) -> Result<Self> {
        let store = Self {
            db_path: db_path.as_ref().to_path_buf(),
            namespace: namespace.to_string(),
        };
        store.init_schema()?;
        Ok(store)
    }

    fn get_conn(&self) -> Result<Connection> {
        let conn = Connection::open(&self.db_path)?;
        conn.busy_timeout(Duration::from_secs(5))?;
        Ok(conn)
    }

    fn init_schema(&self) -> Result<()> {
        let conn = self.get_conn()?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS kv (
                namespace TEXT NOT NULL,
                key TEXT NOT NULL,
                value BLOB NOT NULL,
                version INTEGER NOT NULL,
                expires_at INTEGER,
                PRIMARY KEY (namespace, key)
            )",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS kv_sequence (
                id INTEGER PRIMARY KEY CHECK (id = 0),
                next_version INTEGER NOT NULL
            )",
            [],
        )?;

        conn.execute(
            "INSERT OR IGNORE INTO kv_sequence (id, next_version) VALUES (0, 1)",
            [],
        )?;

        Ok(())
    }

    fn now_millis() -> i64 {
        chrono::Utc::now().timestamp_millis()
    }

    fn expiry(ttl: Option<Duration>) -> Option<i64> {
        ttl.map(|ttl| Self::now_millis() + ttl.as_millis() as i64)
    }

    fn next_version(conn: &Connection) -> Result<i64> {
        let version: i64 = conn.query_row(
            "UPDATE kv_sequence SET next_version = next_version + 1 WHERE id = 0
             RETURNING next_version - 1",
            [],
            |row| row.get(0),
        )?;
        Ok(version)
    }

    fn read_live(&self, conn: &Connection, key: &str) -> Result<Option<Versioned>> {
        let row = conn
            .query_row(
                "SELECT value, version FROM kv
                 WHERE namespace = ?1 AND key = ?2
                   AND (expires_at IS NULL OR expires_at > ?3)",
                params![self.namespace, key, Self::now_millis()],
                |row| {
                    let value: Vec<u8> = row.get(0)?;
                    let version: i64 = row.get(1)?;
                    Ok(Versioned {
                        value,
                        version: Version(version as u64),
                    })
                },
            )
            .optional()?;
        Ok(row)
    }

    fn upsert(
        &self,
        conn: &Connection,
        key: &str,
        value: &[u8],
        ttl: Option<Duration>,
    ) -> Result<()> {
        let version = Self::next_version(conn)?;
        conn.execute(
            "INSERT INTO kv (namespace, key, value, version, expires_at)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT (namespace, key) DO UPDATE SET
                value = excluded.value,
                version = excluded.version,
                expires_at = excluded.expires_at",
            params![self.namespace, key, value, version, Self::expiry(ttl)],
        )?;
        Ok(())
    }
}

#[async_trait]
impl MetaStore for SqliteStore {
    async fn get(&self, key: &str) -> Result<Option<Versioned>> {
        let conn = self.get_conn()?;
        self.read_live(&conn, key)
    }

    async fn get_many(&self, keys: &[String]) -> Result<HashMap<String, Versioned>> {
        let conn = self.get_conn()?;
        let mut found = HashMap::with_capacity(keys.len());
        for key in keys {
            if let Some(row) = self.read_live(&conn, key)? {
                found.insert(key.clone(), row);
            }
        }
        Ok(found)
    }

    async fn set(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>) -> Result<()> {
        let mut conn = self.get_conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        self.upsert(&tx, key, &value, ttl)?;
        tx.commit()?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        let mut conn = self.get_conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let existed = self.read_live(&tx, key)?.is_some();
        tx.execute(
            "DELETE FROM kv WHERE namespace = ?1 AND key = ?2",
            params![self.namespace, key],
        )?;
        tx.commit()?;
        Ok(existed)
    }

    async fn write_if(
        &self,
        key: &str,
        precondition: Precondition,
        op: WriteOp,
    ) -> Result<WriteOutcome> {
        let mut conn = self.get_conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let current = self.read_live(&tx, key)?.map(|row| row.version);

        let matches = match (precondition, current) {
            (Precondition::Absent, None) => true,
            (Precondition::Version(expected), Some(actual)) => expected == actual,
            _ => false,
        };
        if !matches {
            return Ok(WriteOutcome::Conflict);
        }

        match op {
            WriteOp::Put { value, ttl } => self.upsert(&tx, key, &value, ttl)?,
            WriteOp::Delete => {
                tx.execute(
                    "DELETE FROM kv WHERE namespace = ?1 AND key = ?2",
                    params![self.namespace, key],
                )?;
            }
        }
        tx.commit()?;
        Ok(WriteOutcome::Applied)
    }

    async fn scan(&self, range: &KeyRange) -> Result<Vec<(String, Vec<u8>)>> {
        let conn = self.get_conn()?;
        let order = if range.descending { "DESC" } else { "ASC" };
        let sql = format!(
            "SELECT key, value FROM kv
             WHERE namespace = ?1
               AND (?2 IS NULL OR key >= ?2)
               AND (?3 IS NULL OR key < ?3)
               AND (expires_at IS NULL OR expires_at > ?4)
             ORDER BY key {}
             LIMIT ?5",
            order
        );
        let limit = i64::try_from(range.limit).unwrap_or(i64::MAX);

        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(
            params![
                self.namespace,
                range.start,
                range.end,
                Self::now_millis(),
                limit
            ],
            |row| {
                let key: String = row.get(0)?;
                let value: Vec<u8> = row.get(1)?;
                Ok((key, value))
            },
        )?;

        let mut result = Vec::new();
        for row in rows {
            result.push(row?);
        }
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::conformance;
    use tempfile::TempDir;

    fn open(temp_dir: &TempDir) -> SqliteStore {
        SqliteStore::new(temp_dir.path().join("meta.db"), "test").unwrap()
    }

    #[tokio::test]
    async fn test_sqlite_store_conformance() {
        let temp_dir = TempDir::new().unwrap();
        let store = open(&temp_dir);
        conformance::run_all(&store, Duration::from_millis(100)).await;
    }

    #[tokio::test]
    async fn test_sqlite_reopen_keeps_records_and_versions() {
        let temp_dir = TempDir::new().unwrap();
        let version = {
            let store = open(&temp_dir);
            store.set("blob/aa", b"{}".to_vec(), None).await.unwrap();
            store.get("blob/aa").await.unwrap().unwrap().version
        };

        let store = open(&temp_dir);
        assert_eq!(store.get("blob/aa").await.unwrap().unwrap().version, version);
        store.set("blob/bb", b"{}".to_vec(), None).await.unwrap();
        assert!(store.get("blob/bb").await.unwrap().unwrap().version > version);
    }

    #[tokio::test]
    async fn test_sqlite_conditional_writes() {
        let temp_dir = TempDir::new().unwrap();
        let store = open(&temp_dir);

        let outcome = store
            .write_if(
                "blob/aa",
                Precondition::Absent,
                WriteOp::Put {
                    value: b"{}".to_vec(),
                    ttl: None,
                },
            )
            .await
            .unwrap();
        assert_eq!(outcome, WriteOutcome::Applied);

        let current = store.get("blob/aa").await.unwrap().unwrap();
        store.set("blob/aa", b"{\"x\":1}".to_vec(), None).await.unwrap();

        let outcome = store
            .write_if("blob/aa", Precondition::Version(current.version), WriteOp::Delete)
            .await
            .unwrap();
        assert_eq!(outcome, WriteOutcome::Conflict);
        assert!(store.delete("blob/aa").await.unwrap());
        assert!(!store.delete("blob/aa").await.unwrap());
    }

    #[tokio::test]
    async fn test_sqlite_namespaces_are_isolated() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("meta.db");
        let one = SqliteStore::new(&path, "one").unwrap();
        let two = SqliteStore::new(&path, "two").unwrap();

        one.set("node/a", b"1".to_vec(), None).await.unwrap();
        assert!(two.get("node/a").await.unwrap().is_none());
        assert_eq!(one.scan(&KeyRange::prefix("node/")).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_sqlite_scan_descending() {
        let temp_dir = TempDir::new().unwrap();
        let store = open(&temp_dir);
        for key in ["idx/a", "idx/b", "idx/c", "other"] {
            store.set(key, key.as_bytes().to_vec(), None).await.unwrap();
        }

        let rows = store
            .scan(&KeyRange::prefix("idx/").descending().with_limit(2))
            .await
            .unwrap();
        let keys: Vec<_> = rows.iter().map(|(k, _)| k.as_str()).collect();
        assert_eq!(keys, vec!["idx/c", "idx/b"]);
    }

    #[tokio::test]
    async fn test_sqlite_expired_rows_are_absent() {
        let temp_dir = TempDir::new().unwrap();
        let store = open(&temp_dir);
        store
            .set("lease/gc", b"a".to_vec(), Some(Duration::from_millis(1)))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(store.get("lease/gc").await.unwrap().is_none());

        let outcome = store
            .write_if(
                "lease/gc",
                Precondition::Absent,
                WriteOp::Put {
                    value: b"b".to_vec(),
                    ttl: None,
                },
            )
            .await
            .unwrap();
        assert_eq!(outcome, WriteOutcome::Applied);
    }
}
