//! Append-only SQLite persistence for the agentflow engine
//!
//! The [`EventStore`] facade is the only process-wide mutable state in the
//! system: everything else borrows a cloneable handle to it. It enforces the
//! storage contracts — per-run total ordering of events, run-scoped node
//! identity, acyclic persisted graphs, lifecycle-gated run transitions and
//! the single display-filter policy.

pub mod connection;
pub mod filter;
pub mod models;
pub mod repositories;
pub mod store;

pub use connection::{DatabaseConnection, DatabasePool};
pub use store::{EventFilter, EventStore, FileRecord, Page};
