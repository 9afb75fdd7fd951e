//! Query modules, one per table. Functions take a `&Connection` so callers
//! control pooling and transactions.

pub mod jobs;
