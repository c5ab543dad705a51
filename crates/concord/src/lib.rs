//! # Concord - gateway cluster coordination
//!
//! Node identity and registry, master election, cluster-wide replay
//! protection, cached cluster properties, and a best-effort distributed lock,
//! all built on one shared durable store.
//!
//! ## Architecture
//! ```text
//!  ClusterContext ── Scheduler (heartbeat, election, replay flush/gc)
//!       │
//!       ├── ClusterRegistry / MasterElector ─┐
//!       ├── PropertyCache ← InvalidationBus  ├── ClusterStore (Redis | memory)
//!       └── ReplayCache → DistributedMap ────┘
//!                          (group | redis | local)
//! ```

pub mod cluster;
pub mod config;
pub mod context;
pub mod properties;
pub mod replay;
pub mod routes;
pub mod scheduler;
pub mod store;

pub use context::ClusterContext;
