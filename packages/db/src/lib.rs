//! SurrealDB-backed trigger store for the job scheduler.
//!
//! This crate provides backend selection, idempotent schema bootstrap and
//! the [`TriggerStore`] that owns job definitions, triggers and fired-trigger
//! bookkeeping.
//!
//! # Features
//!
//! - `memory` (default): Use in-memory storage for testing
//! - `rocksdb`: Use RocksDB for persistent file-based storage
//! - `surrealkv`: Use SurrealKV for persistent file-based storage
//! - `remote`: Connect to a SurrealDB server over websocket

mod connection;
mod lock;
mod retry;
mod schema;
mod store;
pub mod repositories;

pub use connection::{Backend, Database, DbError, StoreConfig, connect_db};
pub use lock::SchedulerLock;
pub use repositories::StoredTrigger;
pub use retry::RetryPolicy;
pub use schema::{SCHEMA_VERSION, init_schema};
pub use store::{
    AcquiredTrigger, CompletionOutcome, FiredTrigger, RecoveryReport, StoreOptions, TriggerStore,
};
