use super::{KeyRange, MetaStore, Precondition, Version, Versioned, WriteOp, WriteOutcome};
use crate::error::Result;
use async_trait::async_trait;
use etcd_client::{
    Client, Compare, CompareOp, GetOptions, PutOptions, SortOrder, SortTarget, Txn, TxnOp,
};
use std::collections::HashMap;
use std::time::Duration;

/// Metadata store backed by etcd.
///
/// Versions are etcd mod revisions; expiring keys are attached to a lease
/// granted per write.
pub struct EtcdStore {
    client: Client,
    prefix: String,
}

impl EtcdStore {
    pub async fn new(endpoints: &[String], namespace: &str) -> Result<Self> {
        let client = Client::connect(endpoints, None).await?;
        let prefix = format!("/cairn/{}/", namespace);

        Ok(Self { client, prefix })
    }

    fn full_key(&self, key: &str) -> String {
        format!("{}{}", self.prefix, key)
    }

    fn strip<'a>(&self, full: &'a str) -> &'a str {
        full.strip_prefix(self.prefix.as_str()).unwrap_or(full)
    }

    async fn put_options(&self, ttl: Option<Duration>) -> Result<Option<PutOptions>> {
        let Some(ttl) = ttl else {
            return Ok(None);
        };
        let seconds = ttl.as_secs().max(1) as i64;
        let mut client = self.client.clone();
        let lease = client.lease_grant(seconds, None).await?;
        Ok(Some(PutOptions::new().with_lease(lease.id())))
    }
}

#[async_trait]
impl MetaStore for EtcdStore {
    async fn get(&self, key: &str) -> Result<Option<Versioned>> {
        let mut client = self.client.clone();
        let resp = client.get(self.full_key(key), None).await?;

        Ok(resp.kvs().first().map(|kv| Versioned {
            value: kv.value().to_vec(),
            version: Version(kv.mod_revision() as u64),
        }))
    }

    async fn get_many(&self, keys: &[String]) -> Result<HashMap<String, Versioned>> {
        let mut found = HashMap::with_capacity(keys.len());
        for key in keys {
            if let Some(row) = self.get(key).await? {
                found.insert(key.clone(), row);
            }
        }
        Ok(found)
    }

    async fn set(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>) -> Result<()> {
        let options = self.put_options(ttl).await?;
        let mut client = self.client.clone();
        client.put(self.full_key(key), value, options).await?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        let mut client = self.client.clone();
        let resp = client.delete(self.full_key(key), None).await?;
        Ok(resp.deleted() > 0)
    }

    async fn write_if(
        &self,
        key: &str,
        precondition: Precondition,
        op: WriteOp,
    ) -> Result<WriteOutcome> {
        let full_key = self.full_key(key);
        let compare = match precondition {
            Precondition::Absent => Compare::create_revision(full_key.clone(), CompareOp::Equal, 0),
            Precondition::Version(version) => {
                Compare::mod_revision(full_key.clone(), CompareOp::Equal, version.0 as i64)
            }
        };
        let action = match op {
            WriteOp::Put { value, ttl } => {
                let options = self.put_options(ttl).await?;
                TxnOp::put(full_key, value, options)
            }
            WriteOp::Delete => TxnOp::delete(full_key, None),
        };

        let txn = Txn::new().when(vec![compare]).and_then(vec![action]);
        let mut client = self.client.clone();
        let resp = client.txn(txn).await?;

        if resp.succeeded() {
            Ok(WriteOutcome::Applied)
        } else {
            Ok(WriteOutcome::Conflict)
        }
    }

    async fn scan(&self, range: &KeyRange) -> Result<Vec<(String, Vec<u8>)>> {
        // etcd reads a zero limit as unlimited.
        if range.limit == 0 || range.is_empty() {
            return Ok(Vec::new());
        }
        let start = self.full_key(range.start.as_deref().unwrap_or(""));
        let end = match range.end.as_deref() {
            Some(end) => self.full_key(end),
            None => super::prefix_end(&self.prefix).unwrap_or_default(),
        };

        let order = if range.descending {
            SortOrder::Descend
        } else {
            SortOrder::Ascend
        };
        let mut options = GetOptions::new()
            .with_range(end)
            .with_sort(SortTarget::Key, order);
        if range.limit != usize::MAX {
            options = options.with_limit(range.limit as i64);
        }

        let mut client = self.client.clone();
        let resp = client.get(start, Some(options)).await?;

        let mut rows = Vec::with_capacity(resp.kvs().len());
        for kv in resp.kvs() {
            let key = kv.key_str()?;
            rows.push((self.strip(key).to_string(), kv.value().to_vec()));
        }
        Ok(rows)
    }
}
