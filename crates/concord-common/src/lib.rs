//! # Concord Common
//!
//! Shared types, errors, and constants used across Concord components.
//!
//! ## Modules
//! - `types` - Cluster data model (NodeRecord, MasterElectionRecord, LockEntry, etc.)
//! - `error` - The coordination-layer error taxonomy
//! - `constants` - Defaults and store key names

pub mod constants;
pub mod error;
pub mod types;

pub use error::{ClusterError, Result};
pub use types::*;
