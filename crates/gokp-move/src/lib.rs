//! Cluster API object move for the bootstrap-to-target pivot
//!
//! Moves the lifecycle-management objects of one cluster between two API
//! servers using ownership-aware topological ordering and UID remapping.
//! Both kubeconfigs are local, so the mover talks to source and destination
//! directly.
//!
//! ## Flow
//!
//! ```text
//! Source (bootstrap)                      Destination (target)
//! ──────────────────                      ────────────────────
//! 1. Pause Cluster/ClusterClass   [Paused]
//! 2. Discover CRDs, build graph,
//!    filter by cluster, topo sort
//! 3. For each group (in order): [DualExistence]
//!    ├─ Strip transient fields ────────►  Ensure namespace
//!    │                                    Rebuild ownerRefs (new UIDs)
//!    │                                    Create object (409 = reuse only
//!    │                                    if an earlier move created it)
//! 4.                                      Unpause, wait for controllers
//!                                         to report the captured status
//! 5. Delete objects in reverse   [SourceClearing]
//!    ├─ delete-for-move annotation
//!    ├─ Clear finalizers
//!    └─ Delete                   [SourceCleared]
//! ```
//!
//! Any failure before step 5 re-pauses the destination and unpauses the
//! source, which stays authoritative.

mod api;
mod error;
pub mod export;
mod graph;
mod mover;
mod pause;
mod phase;
mod sequence;
mod target;

pub use api::{CreateOutcome, KubeMoveApi, MoveClusterApi};
pub use error::MoveError;
pub use export::{export_cluster_definitions, ExportedFile};
pub use graph::{GraphNode, ObjectGraph, ObjectIdentity};
pub use mover::{ClusterMover, ClusterStatusSnapshot, MoveResult, MoverConfig};
pub use phase::{PhaseRecorder, PivotPhase};
pub use sequence::MoveSequence;
pub use target::{strip_transient_fields, TargetWriter};

/// Label indicating a CRD should be included in move operations.
/// All upstream CAPI provider CRDs carry `cluster.x-k8s.io/provider: <name>`.
pub const MOVE_LABEL: &str = "cluster.x-k8s.io/provider";

/// Annotation recording the source UID on every object created on the destination
pub const SOURCE_UID_ANNOTATION: &str = "gokp.io/source-uid";

/// Annotation CAPI controllers honour to skip infrastructure teardown on delete
pub const DELETE_FOR_MOVE_ANNOTATION: &str = "clusterctl.cluster.x-k8s.io/delete-for-move";

/// Cluster API core group version used for Cluster and ClusterClass
pub const CAPI_API_VERSION: &str = "cluster.x-k8s.io/v1beta1";

/// Result type for move operations
pub type Result<T> = std::result::Result<T, MoveError>;
