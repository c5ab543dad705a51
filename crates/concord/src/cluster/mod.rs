//! Cluster coordination modules.
//!
//! Implements:
//! - Node identity and registry (heartbeat, removal)
//! - Master election over the shared master row
//! - Multicast group address derivation and the group channel

pub mod election;
pub mod gossip;
pub mod identity;
pub mod multicast;
pub mod registry;

pub use election::MasterElector;
pub use gossip::{GroupChannel, GroupConfig, GroupMessage, MemberHealth};
pub use identity::{IdSource, NodeIdentity};
pub use multicast::derive_multicast_address;
pub use registry::{ClusterRegistry, read_load_average};
