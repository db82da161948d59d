use cairn_core::{CairnError, NodeSettings, Result, StoreBuilder, load_or_create_server_id};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Node-local configuration. Cluster-wide settings live in the metadata store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub data_dir: PathBuf,
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,
    /// Address peers use to reach this node, `host:port`.
    #[serde(default)]
    pub advertise_addr: Option<String>,
    /// Overrides the id persisted in `<data_dir>/guid`.
    #[serde(default)]
    pub node_id: Option<String>,
    #[serde(default = "default_capacity_bytes")]
    pub capacity_bytes: u64,
    #[serde(default = "default_task_workers")]
    pub task_workers: usize,
    #[serde(default = "default_task_queue_size")]
    pub task_queue_size: usize,
    #[serde(default = "default_verify_workers")]
    pub verify_workers: usize,
    #[serde(default = "default_peer_timeout_secs")]
    pub peer_timeout_secs: u64,
    pub store: StoreConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    pub backend: StoreBackend,
    #[serde(default)]
    pub namespace: Option<String>,
    #[serde(default)]
    pub sqlite_path: Option<PathBuf>,
    pub etcd: Option<EtcdConfig>,
    pub redis: Option<RedisConfig>,
}

impl StoreConfig {
    pub fn namespace_or_default(&self) -> &str {
        self.namespace
            .as_deref()
            .filter(|value| !value.trim().is_empty())
            .unwrap_or("default")
    }

    pub fn builder(&self, data_dir: &Path) -> StoreBuilder {
        let mut builder = StoreBuilder::new()
            .backend(self.backend.as_str())
            .namespace(self.namespace_or_default());
        builder = builder.sqlite_path(
            self.sqlite_path
                .clone()
                .unwrap_or_else(|| data_dir.join("meta.db")),
        );
        if let Some(etcd) = &self.etcd {
            builder = builder.etcd_endpoints(etcd.endpoints.clone());
        }
        if let Some(redis) = &self.redis {
            builder = builder.redis_url(redis.url.clone());
        }
        builder
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    Memory,
    Sqlite,
    Etcd,
    Redis,
}

impl StoreBackend {
    pub fn as_str(&self) -> &'static str {
        match self {
            StoreBackend::Memory => "memory",
            StoreBackend::Sqlite => "sqlite",
            StoreBackend::Etcd => "etcd",
            StoreBackend::Redis => "redis",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EtcdConfig {
    pub endpoints: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedisConfig {
    pub url: String,
}

fn default_bind_addr() -> String {
    "0.0.0.0:8484".to_string()
}

fn default_capacity_bytes() -> u64 {
    100 * 1024 * 1024 * 1024
}

fn default_task_workers() -> usize {
    4
}

fn default_task_queue_size() -> usize {
    1000
}

fn default_verify_workers() -> usize {
    4
}

fn default_peer_timeout_secs() -> u64 {
    10
}

impl Config {
    pub fn from_file(path: &str) -> Result<Self> {
        let settings = ::config::Config::builder()
            .add_source(::config::File::with_name(path))
            .add_source(::config::Environment::with_prefix("CAIRN").separator("__"))
            .build()
            .map_err(|e| CairnError::Config(e.to_string()))?;

        let config: Config = settings
            .try_deserialize()
            .map_err(|e| CairnError::Config(e.to_string()))?;

        Ok(config)
    }

    pub fn resolve_node_id(&self) -> Result<String> {
        match self.node_id.as_deref().map(str::trim) {
            Some(node_id) if !node_id.is_empty() => Ok(node_id.to_string()),
            _ => {
                std::fs::create_dir_all(&self.data_dir)?;
                load_or_create_server_id(&self.data_dir)
            }
        }
    }

    /// Address to listen on. A bare `:port` listens on every interface.
    pub fn listen_addr(&self) -> String {
        if self.bind_addr.starts_with(':') {
            format!("0.0.0.0{}", self.bind_addr)
        } else {
            self.bind_addr.clone()
        }
    }

    pub fn node_settings(&self, node_id: String) -> NodeSettings {
        let advertised = self
            .advertise_addr
            .clone()
            .unwrap_or_else(|| self.bind_addr.clone());
        let host = match advertised.rsplit_once(':') {
            Some((host, _)) if !host.is_empty() => host.to_string(),
            _ => "127.0.0.1".to_string(),
        };

        NodeSettings {
            node_id,
            addr: host,
            bind_addr: advertised,
            capacity_bytes: self.capacity_bytes,
            task_queue_size: self.task_queue_size,
            task_workers: self.task_workers,
            verify_workers: self.verify_workers,
        }
    }
}
