//! CLI commands

pub mod create_cluster;
pub mod status;
