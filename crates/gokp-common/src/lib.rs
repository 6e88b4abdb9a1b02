//! Common types for gokp: errors, Kubernetes helpers, YAML parsing and retry

#![deny(missing_docs)]

pub mod error;
pub mod kube_utils;
pub mod retry;
pub mod yaml;

pub use error::{Error, ErrorKind};

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Field manager recorded on every server-side apply
pub const FIELD_MANAGER: &str = "gokp";

/// Directory under `$HOME` that holds run workspaces and cluster archives
pub const GOKP_DIR_NAME: &str = ".gokp";
