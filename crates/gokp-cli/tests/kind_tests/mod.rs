//! Live cluster stories
//!
//! - `apply`: server-side apply of split manifests, CRDs first
//! - `bootstrap`: creating and deleting the kind bootstrap cluster

mod apply;
mod bootstrap;
