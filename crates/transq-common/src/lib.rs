//! Common types shared across the transq crates.
//!
//! This crate provides:
//! - [`JobId`]: the identifier carried by every conversion job
//! - [`Job`], [`JobStatus`] and [`ConversionParams`]: the job model and its
//!   lifecycle transitions
//! - [`SubmitRequest`] / [`SubmitResponse`]: the submission surface
//! - [`Error`] / [`Result`]: the error type used by the library crates

pub mod error;
pub mod ids;
pub mod job;

pub use error::{Error, Result};
pub use ids::JobId;
pub use job::{
    now, ConversionParams, Job, JobDefaults, JobStatus, SubmitRequest, SubmitResponse,
};
