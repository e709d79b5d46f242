//! GridFlow Metadata Layer
//!
//! PostgreSQL-backed models and queries for the rule store, replica
//! inventory, quotas, and the storage-element topology, plus the per-pass
//! `TopologyView` used by the rule injector.
//!
//! The topology view is deliberately rebuilt from the database at the start
//! of every evaluation pass; distances, quotas, and availability are
//! changed by external actors, so no cache survives across passes.

pub mod models;
pub mod postgres;
pub mod topology;

pub use models::*;
pub use postgres::{Database, DbConfig, DbError};
pub use topology::{Distance, TopologyElement, TopologyView};
