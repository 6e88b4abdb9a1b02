//! Error types for cluster move operations

use std::path::PathBuf;

use thiserror::Error;

/// Errors from move operations
#[derive(Debug, Error)]
pub enum MoveError {
    /// CRD or object discovery failed
    #[error("discovery failed: {0}")]
    Discovery(String),

    /// Creating a group of objects on the destination failed
    #[error("group {index} failed: {message}")]
    BatchFailed {
        /// Group index that failed
        index: u32,
        /// Error message
        message: String,
    },

    /// Cycle detected in ownership graph
    #[error("cycle detected in ownership graph: {0}")]
    CycleDetected(String),

    /// UID mapping not found (owner not yet created)
    #[error("uid mapping not found for {source_uid}")]
    UidMappingNotFound {
        /// Source UID that was not found in mapping
        source_uid: String,
    },

    /// Destination already holds an object the move did not create
    #[error("{object} already exists on the destination: {message}")]
    ForeignObject {
        /// Object that exists
        object: String,
        /// Why it cannot be reused
        message: String,
    },

    /// Namespace creation failed
    #[error("failed to create namespace {namespace}: {message}")]
    NamespaceCreation {
        /// Namespace that failed to create
        namespace: String,
        /// Error message
        message: String,
    },

    /// Pause/unpause operation failed
    #[error("pause operation failed: {0}")]
    PauseFailed(String),

    /// Destination controllers never reported the captured status
    #[error("destination did not adopt the cluster: {0}")]
    NotAdopted(String),

    /// Source deletion failed after the destination was confirmed
    #[error("source deletion failed: {0}")]
    DeletionFailed(String),

    /// Pivot phase could not be persisted
    #[error("failed to record pivot phase: {0}")]
    PhaseRecord(String),

    /// Exported definitions could not be written
    #[error("failed to export {}: {message}", path.display())]
    Export {
        /// File or directory being written
        path: PathBuf,
        /// Error message
        message: String,
    },

    /// Adoption wait timed out
    #[error("move operation timed out after {seconds}s")]
    Timeout {
        /// Timeout in seconds
        seconds: u64,
    },

    /// Kubernetes API error
    #[error("kube error: {0}")]
    Kube(#[from] kube::Error),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Move was cancelled
    #[error("move was cancelled")]
    Cancelled,
}

impl MoveError {
    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            MoveError::Kube(_) | MoveError::Timeout { .. } | MoveError::BatchFailed { .. }
        )
    }

    /// Whether the source may have lost objects, so it can no longer be
    /// treated as authoritative
    pub fn source_touched(&self) -> bool {
        matches!(self, MoveError::DeletionFailed(_))
    }

    /// Map into the workflow error taxonomy for the given cluster.
    ///
    /// Failures before source deletion become pivot errors; failures during
    /// deletion become inconsistency errors.
    pub fn into_error(self, cluster: &str) -> gokp_common::Error {
        match self {
            MoveError::DeletionFailed(msg) => gokp_common::Error::inconsistency(cluster, msg),
            MoveError::Timeout { seconds } => gokp_common::Error::Timeout {
                what: format!("cluster {} to be adopted on the destination", cluster),
                seconds,
            },
            MoveError::Cancelled => gokp_common::Error::cancelled("pivot"),
            MoveError::Export { path, message } => gokp_common::Error::resource(path, message),
            MoveError::ForeignObject { object, message } => {
                gokp_common::Error::conflict(object, message)
            }
            other => gokp_common::Error::pivot(cluster, other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gokp_common::ErrorKind;

    #[test]
    fn test_error_display() {
        let err = MoveError::BatchFailed {
            index: 3,
            message: "connection refused".to_string(),
        };
        assert_eq!(err.to_string(), "group 3 failed: connection refused");

        let err = MoveError::Timeout { seconds: 300 };
        assert_eq!(err.to_string(), "move operation timed out after 300s");
    }

    #[test]
    fn test_is_retryable() {
        assert!(MoveError::Timeout { seconds: 30 }.is_retryable());
        assert!(MoveError::BatchFailed {
            index: 1,
            message: "error".to_string()
        }
        .is_retryable());

        assert!(!MoveError::Cancelled.is_retryable());
        assert!(!MoveError::CycleDetected("test".to_string()).is_retryable());
    }

    #[test]
    fn failures_before_deletion_keep_the_source_authoritative() {
        let err = MoveError::BatchFailed {
            index: 0,
            message: "webhook unavailable".to_string(),
        };
        assert!(!err.source_touched());
        assert_eq!(err.into_error("demo1").kind(), ErrorKind::Pivot);

        let err = MoveError::NotAdopted("phase mismatch".to_string());
        assert_eq!(err.into_error("demo1").kind(), ErrorKind::Pivot);
    }

    #[test]
    fn deletion_failure_is_an_inconsistency() {
        let err = MoveError::DeletionFailed("AWSCluster/default/demo1: forbidden".to_string());
        assert!(err.source_touched());

        let mapped = err.into_error("demo1");
        assert_eq!(mapped.kind(), ErrorKind::Inconsistency);
        assert!(mapped.to_string().contains("AWSCluster/default/demo1"));
    }

    #[test]
    fn timeout_and_cancel_keep_their_categories() {
        assert_eq!(
            MoveError::Timeout { seconds: 600 }.into_error("demo1").kind(),
            ErrorKind::Timeout
        );
        assert_eq!(
            MoveError::Cancelled.into_error("demo1").kind(),
            ErrorKind::Cancelled
        );
    }

    #[test]
    fn foreign_destination_object_is_a_conflict() {
        let err = MoveError::ForeignObject {
            object: "Machine/default/m1".to_string(),
            message: "has no gokp.io/source-uid annotation".to_string(),
        };
        assert!(!err.source_touched());
        assert_eq!(err.into_error("demo1").kind(), ErrorKind::Conflict);
    }
}
