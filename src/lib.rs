//! transq - resource-aware video conversion job queue
//!
//! This library crate exposes the scheduler and its collaborators for the
//! binary and for integration testing.

pub mod config;
pub mod converter;
pub mod events;
pub mod monitor;
pub mod scheduler;
pub mod service;

pub use scheduler::{QueueStatus, Scheduler, SchedulerConfig};
