use crate::error::{CairnError, Result};
use crate::keys;
use crate::store::{MetaStore, Mutation, Precondition, WriteOp, get_record, transact};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

/// Cluster-wide tunables, shared by every node through `config/cluster`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterConfig {
    #[serde(with = "duration_secs")]
    pub gc_freq: Duration,
    pub gc_limit: usize,
    #[serde(with = "duration_secs")]
    pub gc_grace: Duration,
    #[serde(with = "duration_secs")]
    pub heartbeat_freq: Duration,
    pub min_replicas: usize,
    pub max_replicas: usize,
    pub node_clean_count: usize,
    #[serde(with = "duration_secs")]
    pub reconcile_freq: Duration,
    #[serde(with = "duration_secs")]
    pub stale_node_check_freq: Duration,
    #[serde(with = "duration_secs")]
    pub stale_node_limit: Duration,
    #[serde(with = "duration_secs")]
    pub under_replica_check_freq: Duration,
    #[serde(with = "duration_secs")]
    pub over_replica_check_freq: Duration,
    pub replication_check_limit: usize,
    #[serde(with = "duration_secs")]
    pub config_refresh_freq: Duration,
    pub max_startup_objects: usize,
    pub max_startup_repls: usize,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            gc_freq: Duration::from_secs(5 * 60),
            gc_limit: 5000,
            gc_grace: Duration::from_secs(60 * 60),
            heartbeat_freq: Duration::from_secs(5),
            min_replicas: 3,
            max_replicas: 5,
            node_clean_count: 1000,
            reconcile_freq: Duration::from_secs(24 * 60 * 60),
            stale_node_check_freq: Duration::from_secs(60),
            stale_node_limit: Duration::from_secs(10 * 60),
            under_replica_check_freq: Duration::from_secs(5 * 60),
            over_replica_check_freq: Duration::from_secs(10 * 60),
            replication_check_limit: 10_000,
            config_refresh_freq: Duration::from_secs(60),
            max_startup_objects: 1000,
            max_startup_repls: 3,
        }
    }
}

impl ClusterConfig {
    pub fn validate(&self) -> Result<()> {
        if self.min_replicas == 0 {
            return Err(CairnError::Config(
                "min_replicas must be at least 1".to_string(),
            ));
        }
        if self.max_replicas < self.min_replicas {
            return Err(CairnError::Config(format!(
                "max_replicas ({}) cannot be below min_replicas ({})",
                self.max_replicas, self.min_replicas
            )));
        }
        for (name, value) in [
            ("heartbeat_freq", self.heartbeat_freq),
            ("config_refresh_freq", self.config_refresh_freq),
        ] {
            if value.is_zero() {
                return Err(CairnError::Config(format!("{} must be positive", name)));
            }
        }
        Ok(())
    }

    /// TTL for a node record: several stale periods, rounded up to whole heartbeats.
    pub fn node_record_ttl(&self) -> Duration {
        let beat = self.heartbeat_freq.as_secs().max(1);
        let floor = self.stale_node_limit.as_secs().saturating_mul(3).max(beat);
        Duration::from_secs(floor.div_ceil(beat) * beat)
    }

    /// Set one parameter by name, parsing `value` for its type.
    pub fn set_parameter(&mut self, name: &str, value: &str) -> Result<()> {
        let name = name.trim().to_ascii_lowercase().replace('-', "_");
        match name.as_str() {
            "gc_freq" => self.gc_freq = parse_duration(value)?,
            "gc_limit" => self.gc_limit = parse_count(value)?,
            "gc_grace" => self.gc_grace = parse_duration(value)?,
            "heartbeat_freq" => self.heartbeat_freq = parse_duration(value)?,
            "min_replicas" => self.min_replicas = parse_count(value)?,
            "max_replicas" => self.max_replicas = parse_count(value)?,
            "node_clean_count" => self.node_clean_count = parse_count(value)?,
            "reconcile_freq" => self.reconcile_freq = parse_duration(value)?,
            "stale_node_check_freq" => self.stale_node_check_freq = parse_duration(value)?,
            "stale_node_limit" => self.stale_node_limit = parse_duration(value)?,
            "under_replica_check_freq" => self.under_replica_check_freq = parse_duration(value)?,
            "over_replica_check_freq" => self.over_replica_check_freq = parse_duration(value)?,
            "replication_check_limit" => self.replication_check_limit = parse_count(value)?,
            "config_refresh_freq" => self.config_refresh_freq = parse_duration(value)?,
            "max_startup_objects" => self.max_startup_objects = parse_count(value)?,
            "max_startup_repls" => self.max_startup_repls = parse_count(value)?,
            other => {
                return Err(CairnError::InvalidRequest(format!(
                    "unknown cluster parameter: {}",
                    other
                )));
            }
        }
        self.validate()
    }
}

/// Read the shared config, falling back to defaults when none was stored.
pub async fn load_cluster_config(store: &dyn MetaStore) -> Result<ClusterConfig> {
    let config = get_record::<ClusterConfig>(store, keys::CLUSTER_CONFIG)
        .await?
        .unwrap_or_default();
    Ok(config)
}

/// Store the default config unless one already exists. Returns whether it wrote.
pub async fn init_cluster_config(store: &dyn MetaStore) -> Result<bool> {
    let value = serde_json::to_vec(&ClusterConfig::default())?;
    let outcome = store
        .write_if(
            keys::CLUSTER_CONFIG,
            Precondition::Absent,
            WriteOp::Put { value, ttl: None },
        )
        .await?;
    Ok(outcome == crate::store::WriteOutcome::Applied)
}

/// Change one parameter of the shared config.
pub async fn update_cluster_parameter(
    store: &dyn MetaStore,
    name: &str,
    value: &str,
) -> Result<ClusterConfig> {
    let mut failure = None;
    let outcome = transact(store, keys::CLUSTER_CONFIG, |current: Option<ClusterConfig>| {
        let mut config = current.unwrap_or_default();
        match config.set_parameter(name, value) {
            Ok(()) => Mutation::Put(config),
            Err(error) => {
                failure = Some(error);
                Mutation::Abort
            }
        }
    })
    .await?;

    if let Some(error) = failure {
        return Err(error);
    }
    outcome
        .written()
        .ok_or_else(|| CairnError::Internal("cluster config update was not written".to_string()))
}

/// Read-mostly handle on the current cluster config.
///
/// Refreshes swap the whole snapshot; readers keep whatever `Arc` they took.
#[derive(Clone)]
pub struct ConfigHandle {
    sender: Arc<watch::Sender<Arc<ClusterConfig>>>,
    receiver: watch::Receiver<Arc<ClusterConfig>>,
}

impl ConfigHandle {
    pub fn new(config: ClusterConfig) -> Self {
        let (sender, receiver) = watch::channel(Arc::new(config));
        Self {
            sender: Arc::new(sender),
            receiver,
        }
    }

    pub fn current(&self) -> Arc<ClusterConfig> {
        self.receiver.borrow().clone()
    }

    /// Receiver that wakes on the next published snapshot.
    pub fn changes(&self) -> watch::Receiver<Arc<ClusterConfig>> {
        self.sender.subscribe()
    }

    /// Publish `config` if it differs from the current snapshot.
    pub fn replace(&self, config: ClusterConfig) -> bool {
        self.sender.send_if_modified(|current| {
            if **current == config {
                false
            } else {
                *current = Arc::new(config);
                true
            }
        })
    }

    pub async fn refresh(&self, store: &dyn MetaStore) -> Result<bool> {
        let config = load_cluster_config(store).await?;
        if let Err(error) = config.validate() {
            tracing::warn!("ignoring invalid cluster config: {}", error);
            return Ok(false);
        }
        let changed = self.replace(config);
        if changed {
            tracing::info!("cluster config updated");
        }
        Ok(changed)
    }
}

/// Accepts plain seconds or a number with an `s`, `m`, `h` or `d` suffix.
pub fn parse_duration(value: &str) -> Result<Duration> {
    let value = value.trim();
    let (digits, unit) = match value.char_indices().find(|(_, c)| !c.is_ascii_digit()) {
        Some((idx, _)) => value.split_at(idx),
        None => (value, ""),
    };
    let amount: u64 = digits
        .parse()
        .map_err(|_| CairnError::InvalidRequest(format!("invalid duration: {}", value)))?;
    let multiplier = match unit {
        "" | "s" => 1,
        "m" => 60,
        "h" => 60 * 60,
        "d" => 24 * 60 * 60,
        _ => {
            return Err(CairnError::InvalidRequest(format!(
                "invalid duration unit: {}",
                value
            )));
        }
    };
    Ok(Duration::from_secs(amount.saturating_mul(multiplier)))
}

fn parse_count(value: &str) -> Result<usize> {
    value
        .trim()
        .parse()
        .map_err(|_| CairnError::InvalidRequest(format!("invalid count: {}", value)))
}

mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_secs(u64::deserialize(deserializer)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    #[test]
    fn test_durations_serialize_as_seconds() {
        let json = serde_json::to_value(ClusterConfig::default()).unwrap();
        assert_eq!(json["gc_freq"], 300);
        assert_eq!(json["stale_node_limit"], 600);

        let partial: ClusterConfig =
            serde_json::from_str(r#"{"min_replicas": 2, "gc_grace": 10}"#).unwrap();
        assert_eq!(partial.min_replicas, 2);
        assert_eq!(partial.gc_grace, Duration::from_secs(10));
        assert_eq!(partial.max_replicas, 5);
    }

    #[test]
    fn test_set_parameter() {
        let mut config = ClusterConfig::default();
        config.set_parameter("gc-freq", "10m").unwrap();
        assert_eq!(config.gc_freq, Duration::from_secs(600));
        config.set_parameter("max_replicas", "7").unwrap();
        assert_eq!(config.max_replicas, 7);

        assert!(config.set_parameter("bogus", "1").is_err());
        assert!(config.set_parameter("gc_freq", "10x").is_err());
        assert!(config.set_parameter("min_replicas", "9").is_err());
    }

    #[test]
    fn test_zero_loop_frequencies() {
        let mut config = ClusterConfig::default();
        assert!(config.set_parameter("heartbeat_freq", "0").is_err());
        assert!(config.set_parameter("config_refresh_freq", "0s").is_err());
        // Zero disables reconciliation.
        config.set_parameter("reconcile_freq", "0").unwrap();
        assert!(config.reconcile_freq.is_zero());
    }

    #[tokio::test]
    async fn test_changes_wake_on_replace_only() {
        let handle = ConfigHandle::new(ClusterConfig::default());
        let mut changes = handle.changes();
        assert!(!changes.has_changed().unwrap());

        assert!(!handle.replace(ClusterConfig::default()));
        assert!(!changes.has_changed().unwrap());

        let mut config = ClusterConfig::default();
        config.reconcile_freq = Duration::from_secs(5);
        assert!(handle.replace(config));
        changes.changed().await.unwrap();
        assert_eq!(changes.borrow_and_update().reconcile_freq, Duration::from_secs(5));
    }

    #[test]
    fn test_node_record_ttl_is_multiple_of_heartbeat() {
        let mut config = ClusterConfig::default();
        config.heartbeat_freq = Duration::from_secs(7);
        let ttl = config.node_record_ttl();
        assert!(ttl >= config.stale_node_limit * 3);
        assert_eq!(ttl.as_secs() % 7, 0);
    }

    #[tokio::test]
    async fn test_update_and_refresh() {
        let store = MemoryStore::new();
        assert!(init_cluster_config(&store).await.unwrap());
        assert!(!init_cluster_config(&store).await.unwrap());

        let handle = ConfigHandle::new(load_cluster_config(&store).await.unwrap());
        let before = handle.current();

        update_cluster_parameter(&store, "min_replicas", "2")
            .await
            .unwrap();
        assert!(update_cluster_parameter(&store, "min_replicas", "abc")
            .await
            .is_err());

        assert!(handle.refresh(&store).await.unwrap());
        assert_eq!(handle.current().min_replicas, 2);
        assert_eq!(before.min_replicas, 3);
        assert!(!handle.refresh(&store).await.unwrap());
    }
}
