//! Error types for gokp
//!
//! Errors are structured with fields so an aborted run reports exactly which
//! resource, document or remote service failed. Every variant maps to an
//! [`ErrorKind`], which is what the orchestrator and any future retry tooling
//! reason about.

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Category of a failure, preserved from the failing component up to the CLI
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    /// Local filesystem or workspace problem
    Resource,
    /// Local runtime, external tool or cloud provisioning failure
    Infrastructure,
    /// Credentials rejected by a remote API
    Auth,
    /// Naming collision (repository, archive, bootstrap cluster)
    Conflict,
    /// Malformed overlay or unparsable document
    Render,
    /// A single manifest failed to apply
    Apply,
    /// Network, API or push rejection
    Transport,
    /// A bounded wait ran out of time
    Timeout,
    /// Pivot failed before the source was touched; the source is still authoritative
    Pivot,
    /// Pivot was confirmed but cleanup or a later step failed
    Inconsistency,
    /// Invalid user input
    Validation,
    /// The operator interrupted the run
    Cancelled,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorKind::Resource => "ResourceError",
            ErrorKind::Infrastructure => "InfrastructureError",
            ErrorKind::Auth => "AuthError",
            ErrorKind::Conflict => "ConflictError",
            ErrorKind::Render => "RenderError",
            ErrorKind::Apply => "ApplyError",
            ErrorKind::Transport => "TransportError",
            ErrorKind::Timeout => "TimeoutError",
            ErrorKind::Pivot => "PivotError",
            ErrorKind::Inconsistency => "InconsistencyError",
            ErrorKind::Validation => "ValidationError",
            ErrorKind::Cancelled => "Cancelled",
        };
        f.write_str(name)
    }
}

/// Main error type for gokp operations
#[derive(Debug, Error)]
pub enum Error {
    /// Workspace or local filesystem error
    #[error("workspace error at {}: {message}", path.display())]
    Resource {
        /// Path that could not be used
        path: PathBuf,
        /// Description of what failed
        message: String,
    },

    /// Local runtime or external tool unavailable or failing
    #[error("infrastructure error [{context}]: {message}")]
    Infrastructure {
        /// Tool or subsystem (e.g., "kind", "clusterctl")
        context: String,
        /// Description of what failed
        message: String,
    },

    /// Cloud provisioning reached a terminal failure and will never become ready
    #[error("provisioning of {cluster} failed: {message}")]
    ProvisionFailed {
        /// Cluster being provisioned
        cluster: String,
        /// Failure reported by the provider
        message: String,
    },

    /// Remote API rejected our credentials
    #[error("authentication failed for {service}: {message}")]
    Auth {
        /// Remote service (e.g., "github")
        service: String,
        /// Description of what failed
        message: String,
    },

    /// Naming collision
    #[error("{resource} already exists: {message}")]
    Conflict {
        /// The colliding resource
        resource: String,
        /// Description of the collision
        message: String,
    },

    /// Overlay could not be rendered or a document could not be parsed
    #[error("render error for {}: {message}", overlay.display())]
    Render {
        /// Overlay directory or file being rendered
        overlay: PathBuf,
        /// Description of what failed
        message: String,
    },

    /// One manifest document failed to apply
    #[error("failed to apply {document}: {cause}")]
    Apply {
        /// Document file name
        document: String,
        /// Underlying failure
        cause: String,
    },

    /// Network, API or push failure
    #[error("transport error [{context}]: {message}")]
    Transport {
        /// Where the failure happened (e.g., "git push", "github")
        context: String,
        /// Description of what failed
        message: String,
    },

    /// A bounded wait exceeded its limit
    #[error("timed out after {seconds}s waiting for {what}")]
    Timeout {
        /// What was being waited on
        what: String,
        /// Configured limit in seconds
        seconds: u64,
    },

    /// Pivot failed while the source was still authoritative
    #[error("pivot of {cluster} failed before source cleanup: {message}")]
    Pivot {
        /// Cluster being pivoted
        cluster: String,
        /// Description of what failed
        message: String,
    },

    /// Pivot confirmed on the destination but a later step failed
    #[error("inconsistent state for {cluster}, manual reconciliation required: {message}")]
    Inconsistency {
        /// Cluster affected
        cluster: String,
        /// Description of what failed
        message: String,
    },

    /// Invalid user input
    #[error("validation error: {message}")]
    Validation {
        /// Description of what's invalid
        message: String,
    },

    /// The run was cancelled
    #[error("cancelled during {state}")]
    Cancelled {
        /// Workflow state that observed the cancellation
        state: String,
    },

    /// Kubernetes API error
    #[error("kubernetes error: {source}")]
    Kube {
        /// The underlying kube-rs error
        #[from]
        source: kube::Error,
    },

    /// Filesystem error without a more specific context
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON (de)serialization error
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// YAML (de)serialization error
    #[error("yaml error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

impl Error {
    /// Create a workspace error for a path
    pub fn resource(path: impl Into<PathBuf>, msg: impl Into<String>) -> Self {
        Self::Resource {
            path: path.into(),
            message: msg.into(),
        }
    }

    /// Create an infrastructure error with tool context
    pub fn infrastructure(context: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Infrastructure {
            context: context.into(),
            message: msg.into(),
        }
    }

    /// Create a terminal provisioning failure
    pub fn provision_failed(cluster: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::ProvisionFailed {
            cluster: cluster.into(),
            message: msg.into(),
        }
    }

    /// Create an authentication error for a remote service
    pub fn auth(service: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Auth {
            service: service.into(),
            message: msg.into(),
        }
    }

    /// Create a naming conflict error
    pub fn conflict(resource: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Conflict {
            resource: resource.into(),
            message: msg.into(),
        }
    }

    /// Create a render error for an overlay
    pub fn render(overlay: impl Into<PathBuf>, msg: impl Into<String>) -> Self {
        Self::Render {
            overlay: overlay.into(),
            message: msg.into(),
        }
    }

    /// Create an apply error for one document
    pub fn apply(document: impl Into<String>, cause: impl fmt::Display) -> Self {
        Self::Apply {
            document: document.into(),
            cause: cause.to_string(),
        }
    }

    /// Create a transport error with context
    pub fn transport(context: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Transport {
            context: context.into(),
            message: msg.into(),
        }
    }

    /// Create a timeout error from the configured limit
    pub fn timeout(what: impl Into<String>, limit: Duration) -> Self {
        Self::Timeout {
            what: what.into(),
            seconds: limit.as_secs(),
        }
    }

    /// Create a recoverable pivot error
    pub fn pivot(cluster: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Pivot {
            cluster: cluster.into(),
            message: msg.into(),
        }
    }

    /// Create an inconsistency error that needs operator attention
    pub fn inconsistency(cluster: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Inconsistency {
            cluster: cluster.into(),
            message: msg.into(),
        }
    }

    /// Create a validation error
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation {
            message: msg.into(),
        }
    }

    /// Create a cancellation error for the given workflow state
    pub fn cancelled(state: impl Into<String>) -> Self {
        Self::Cancelled {
            state: state.into(),
        }
    }

    /// The category this error belongs to
    ///
    /// Kubernetes errors are classified by status code: 401/403 are auth
    /// failures, 409 is a conflict, everything else is transport.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Resource { .. } | Error::Io(_) | Error::Json(_) => ErrorKind::Resource,
            Error::Infrastructure { .. } | Error::ProvisionFailed { .. } => {
                ErrorKind::Infrastructure
            }
            Error::Auth { .. } => ErrorKind::Auth,
            Error::Conflict { .. } => ErrorKind::Conflict,
            Error::Render { .. } | Error::Yaml(_) => ErrorKind::Render,
            Error::Apply { .. } => ErrorKind::Apply,
            Error::Transport { .. } => ErrorKind::Transport,
            Error::Timeout { .. } => ErrorKind::Timeout,
            Error::Pivot { .. } => ErrorKind::Pivot,
            Error::Inconsistency { .. } => ErrorKind::Inconsistency,
            Error::Validation { .. } => ErrorKind::Validation,
            Error::Cancelled { .. } => ErrorKind::Cancelled,
            Error::Kube { source } => match source {
                kube::Error::Api(ae) if ae.code == 401 || ae.code == 403 => ErrorKind::Auth,
                kube::Error::Api(ae) if ae.code == 409 => ErrorKind::Conflict,
                _ => ErrorKind::Transport,
            },
        }
    }

    /// Whether a later attempt could plausibly succeed without operator action
    ///
    /// The workflow itself never retries; this only classifies.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::Transport | ErrorKind::Timeout | ErrorKind::Pivot
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // ==========================================================================
    // Story Tests: Error categories survive propagation
    // ==========================================================================

    /// Story: a collision on the archive directory is reported as a conflict
    /// before any cluster is created
    #[test]
    fn story_archive_collision_is_a_conflict() {
        let err = Error::conflict("archive ~/.gokp/demo1", "a previous install exists");
        assert_eq!(err.kind(), ErrorKind::Conflict);
        assert!(err.to_string().contains("demo1"));
        assert!(!err.is_retryable());
    }

    /// Story: apply failures name the document that broke
    #[test]
    fn story_apply_error_names_the_document() {
        let err = Error::apply("07.argocd-install.yaml", "webhook denied the request");
        assert_eq!(err.kind(), ErrorKind::Apply);
        assert_eq!(
            err.to_string(),
            "failed to apply 07.argocd-install.yaml: webhook denied the request"
        );
    }

    /// Story: still-provisioning and will-never-be-ready are different kinds
    #[test]
    fn story_timeout_and_provision_failure_are_distinct() {
        let timeout = Error::timeout("cluster demo1 to become ready", Duration::from_secs(2400));
        let failed = Error::provision_failed("demo1", "VPC quota exceeded");

        assert_eq!(timeout.kind(), ErrorKind::Timeout);
        assert_eq!(failed.kind(), ErrorKind::Infrastructure);
        assert!(timeout.to_string().contains("2400s"));
        assert!(timeout.is_retryable());
        assert!(!failed.is_retryable());
    }

    /// Story: transient categories are retryable, unrecoverable ones are not
    #[test]
    fn story_retryable_classification() {
        assert!(Error::transport("git push", "connection reset").is_retryable());
        assert!(Error::pivot("demo1", "batch 2 failed").is_retryable());
        assert!(!Error::inconsistency("demo1", "source delete failed").is_retryable());
        assert!(!Error::auth("github", "bad credentials").is_retryable());
        assert!(!Error::validation("bad name").is_retryable());
    }

    #[test]
    fn kube_status_codes_map_to_categories() {
        let api_err = |code: u16| {
            Error::from(kube::Error::Api(kube::error::ErrorResponse {
                status: "Failure".to_string(),
                message: "nope".to_string(),
                reason: "Test".to_string(),
                code,
            }))
        };

        assert_eq!(api_err(401).kind(), ErrorKind::Auth);
        assert_eq!(api_err(403).kind(), ErrorKind::Auth);
        assert_eq!(api_err(409).kind(), ErrorKind::Conflict);
        assert_eq!(api_err(500).kind(), ErrorKind::Transport);
    }

    #[test]
    fn io_errors_are_resource_errors() {
        let err = Error::from(std::io::Error::new(
            std::io::ErrorKind::PermissionDenied,
            "read-only",
        ));
        assert_eq!(err.kind(), ErrorKind::Resource);
    }

    #[test]
    fn kind_display_uses_taxonomy_names() {
        assert_eq!(ErrorKind::Inconsistency.to_string(), "InconsistencyError");
        assert_eq!(ErrorKind::Transport.to_string(), "TransportError");
    }
}
