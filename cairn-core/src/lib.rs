//! Cairn Core - replication and garbage collection engine for a
//! content-addressed blob store
//!
//! Every node runs the same leaderless control loop:
//! - an ownership ledger of which nodes hold which blobs, updated with OCC
//! - heartbeats into a node registry, with stale nodes reaped and salvaged
//! - lease-gated periodic jobs for replication, pruning and collection
//! - a shared metadata store (memory, SQLite, etcd or Redis) as the only
//!   coordination point

pub mod blob_store;
pub mod config;
pub mod context;
pub mod error;
pub mod files;
pub mod jobs;
pub mod keys;
pub mod lease;
pub mod ledger;
pub mod named_lock;
pub mod nodes;
pub mod operations;
pub mod scheduler;
pub mod store;
pub mod tasks;
pub mod transfer;
pub mod walker;

#[cfg(test)]
mod testing;

pub use blob_store::{BlobStore, compute_hash, is_valid_oid, verify_hash};
pub use config::{
    ClusterConfig, ConfigHandle, init_cluster_config, load_cluster_config, parse_duration,
    update_cluster_parameter,
};
pub use context::{NodeContext, NodeSettings};
pub use error::{CairnError, Result};
pub use files::{FileCatalog, FileMeta, FileRevision};
pub use jobs::cluster_scheduler;
pub use lease::{LeaseGuard, LeaseLock, TaskLease};
pub use ledger::{AccessMarker, BlobOwnership, OwnershipLedger, RemoveOutcome, resolve_owner_nodes};
pub use nodes::{NodeRegistry, NodeView, StorageNode, load_or_create_server_id};
pub use scheduler::{JobRun, JobScheduler, PeriodicJob, StartupJitter, run_job_once};
pub use store::{MetaStore, StoreBuilder};
pub use tasks::{InternodeTask, TaskQueue, spawn_task_workers};
pub use transfer::{BlobStream, BlobTransport, HttpTransport, PREV_NODE_HEADER};
pub use walker::{PathWalker, WalkItem};
