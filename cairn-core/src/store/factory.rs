use super::{
    MetaStore, etcd::EtcdStore, memory::MemoryStore, redis::RedisStore, sqlite::SqliteStore,
};
use crate::error::{CairnError, Result};
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Debug, Clone, Default)]
pub struct StoreBuilder {
    backend: Option<String>,
    namespace: Option<String>,
    etcd_endpoints: Option<Vec<String>>,
    redis_url: Option<String>,
    sqlite_path: Option<PathBuf>,
}

impl StoreBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn backend(mut self, backend: impl Into<String>) -> Self {
        self.backend = Some(backend.into());
        self
    }

    pub fn namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = Some(namespace.into());
        self
    }

    pub fn etcd_endpoints(mut self, endpoints: Vec<String>) -> Self {
        self.etcd_endpoints = Some(endpoints);
        self
    }

    pub fn redis_url(mut self, url: impl Into<String>) -> Self {
        self.redis_url = Some(url.into());
        self
    }

    pub fn sqlite_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.sqlite_path = Some(path.into());
        self
    }

    fn resolve_namespace(&self) -> Result<String> {
        let namespace = self
            .namespace
            .as_deref()
            .unwrap_or_default()
            .trim()
            .to_string();
        if namespace.is_empty() {
            return Err(CairnError::Config(
                "store namespace cannot be empty".to_string(),
            ));
        }

        Ok(namespace)
    }

    fn resolve_backend(&self) -> Result<String> {
        let backend = self
            .backend
            .as_deref()
            .unwrap_or_default()
            .trim()
            .to_ascii_lowercase();

        if backend.is_empty() {
            return Err(CairnError::Config("store backend cannot be empty".to_string()));
        }

        Ok(backend)
    }

    pub async fn build(&self) -> Result<Arc<dyn MetaStore>> {
        let namespace = self.resolve_namespace()?;
        let backend = self.resolve_backend()?;

        match backend.as_str() {
            "memory" => Ok(Arc::new(MemoryStore::new())),
            "sqlite" => {
                let path = self.sqlite_path.clone().ok_or_else(|| {
                    CairnError::Config("sqlite path is required for sqlite backend".to_string())
                })?;
                if let Some(parent) = path.parent() {
                    std::fs::create_dir_all(parent)?;
                }

                let store = SqliteStore::new(&path, &namespace)?;
                Ok(Arc::new(store))
            }
            "etcd" => {
                let endpoints = self.etcd_endpoints.clone().ok_or_else(|| {
                    CairnError::Config("etcd endpoints are required for etcd backend".to_string())
                })?;

                if endpoints.is_empty() {
                    return Err(CairnError::Config(
                        "etcd endpoints cannot be empty for etcd backend".to_string(),
                    ));
                }

                let store = EtcdStore::new(&endpoints, &namespace).await?;
                Ok(Arc::new(store))
            }
            "redis" => {
                let url = self.redis_url.as_deref().unwrap_or_default().trim();
                if url.is_empty() {
                    return Err(CairnError::Config(
                        "redis url is required for redis backend".to_string(),
                    ));
                }

                let store = RedisStore::new(url, &namespace).await?;
                Ok(Arc::new(store))
            }
            other => Err(CairnError::Config(format!(
                "unsupported store backend: {}",
                other
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_builder_rejects_missing_fields() {
        let err = StoreBuilder::new().backend("memory").build().await.err();
        assert!(matches!(err, Some(CairnError::Config(_))));

        let err = StoreBuilder::new().namespace("default").build().await.err();
        assert!(matches!(err, Some(CairnError::Config(_))));

        let err = StoreBuilder::new()
            .backend("etcd")
            .namespace("default")
            .build()
            .await
            .err();
        assert!(matches!(err, Some(CairnError::Config(_))));

        let err = StoreBuilder::new()
            .backend("zookeeper")
            .namespace("default")
            .build()
            .await
            .err();
        assert!(matches!(err, Some(CairnError::Config(_))));
    }

    #[tokio::test]
    async fn test_builder_opens_sqlite() {
        let temp_dir = TempDir::new().unwrap();
        let store = StoreBuilder::new()
            .backend("SQLite")
            .namespace("default")
            .sqlite_path(temp_dir.path().join("nested/meta.db"))
            .build()
            .await
            .unwrap();

        store.set("k", b"v".to_vec(), None).await.unwrap();
        assert_eq!(store.get("k").await.unwrap().unwrap().value, b"v".to_vec());
    }
}
