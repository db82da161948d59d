pub mod check_stale_nodes;
pub mod ensure_min_replicas;
pub mod fsck;
pub mod garbage_collect;
pub mod grab_some_data;
pub mod prune_replicas;
pub mod validate_local;

pub use check_stale_nodes::{
    CheckStaleNodesOperation, CheckStaleNodesOperationResult, CleanupNodeResult,
};
pub use ensure_min_replicas::{
    EnsureMinReplicasOperation, EnsureMinReplicasOperationRequest,
    EnsureMinReplicasOperationResult,
};
pub use fsck::{FsckEntry, FsckOperation, FsckOperationRequest, FsckOperationResult};
pub use garbage_collect::{
    GarbageCollectOperation, GarbageCollectOperationRequest, GarbageCollectOperationResult,
};
pub use grab_some_data::{
    GrabSomeDataOperation, GrabSomeDataOperationRequest, GrabSomeDataOperationResult,
};
pub use prune_replicas::{
    PruneReplicasOperation, PruneReplicasOperationRequest, PruneReplicasOperationResult,
};
pub use validate_local::{
    ValidateLocalOperation, ValidateLocalOperationRequest, ValidateLocalOperationResult,
};
