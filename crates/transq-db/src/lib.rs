//! transq-db: durable job table backed by SQLite.
//!
//! This crate provides connection pooling, embedded migrations, the job
//! query module, and [`JobStore`], the handle the scheduler mirrors job
//! state into.

pub mod migrations;
pub mod pool;
pub mod queries;
pub mod store;

pub use store::JobStore;
