//! [`JobStore`]: the durable mirror of scheduler state.
//!
//! Every call checks out a pooled connection for the duration of one
//! operation. The store never decides anything about a job; it records what
//! the scheduler tells it.

use chrono::TimeDelta;
use std::collections::HashMap;
use std::path::Path;
use transq_common::{Job, JobId, JobStatus, Result};

use crate::pool::{self, DbPool};
use crate::queries::jobs;

/// Message written to jobs that were in flight when the process stopped.
pub const INTERRUPTED_MESSAGE: &str = "interrupted by restart";

/// Handle to the job table. Cheap to clone.
#[derive(Clone)]
pub struct JobStore {
    pool: DbPool,
}

impl JobStore {
    /// Open (creating and migrating if needed) the database at `path`.
    pub fn open(path: &Path) -> Result<Self> {
        Ok(Self {
            pool: pool::init_pool(path)?,
        })
    }

    /// A private in-memory database.
    pub fn in_memory() -> Result<Self> {
        Ok(Self {
            pool: pool::init_memory_pool()?,
        })
    }

    pub fn from_pool(pool: DbPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &DbPool {
        &self.pool
    }

    /// Insert or fully overwrite the row for `job.id`.
    pub fn upsert(&self, job: &Job) -> Result<()> {
        let conn = pool::get_conn(&self.pool)?;
        jobs::upsert_job(&conn, job)
    }

    pub fn get(&self, id: &JobId) -> Result<Option<Job>> {
        let conn = pool::get_conn(&self.pool)?;
        jobs::get_job(&conn, id)
    }

    /// Every stored job, newest first.
    pub fn list_all(&self) -> Result<Vec<Job>> {
        let conn = pool::get_conn(&self.pool)?;
        jobs::list_jobs(&conn)
    }

    pub fn list_by_status(&self, status: JobStatus, limit: u32) -> Result<Vec<Job>> {
        let conn = pool::get_conn(&self.pool)?;
        jobs::list_jobs_by_status(&conn, status, limit)
    }

    pub fn count_by_status(&self) -> Result<HashMap<JobStatus, u64>> {
        let conn = pool::get_conn(&self.pool)?;
        jobs::count_by_status(&conn)
    }

    /// Delete finished jobs that completed more than `older_than_days` ago.
    ///
    /// An age reaching past the earliest representable time matches nothing.
    pub fn prune_finished(&self, older_than_days: u32) -> Result<usize> {
        let Some(cutoff) = TimeDelta::try_days(i64::from(older_than_days))
            .and_then(|age| transq_common::now().checked_sub_signed(age))
        else {
            tracing::debug!(older_than_days, "Prune cutoff out of range, nothing to remove");
            return Ok(0);
        };
        let conn = pool::get_conn(&self.pool)?;
        let removed = jobs::delete_finished_before(&conn, &cutoff)?;
        if removed > 0 {
            tracing::info!(removed, older_than_days, "Pruned finished jobs");
        }
        Ok(removed)
    }

    /// Fail every job left pending, running or retrying by a previous
    /// process and return those jobs as they were last recorded.
    pub fn reconcile_interrupted(&self) -> Result<Vec<Job>> {
        let conn = pool::get_conn(&self.pool)?;
        let interrupted = jobs::fail_in_flight(&conn, INTERRUPTED_MESSAGE)?;
        if !interrupted.is_empty() {
            tracing::warn!(
                count = interrupted.len(),
                "Found jobs interrupted by a previous shutdown"
            );
        }
        Ok(interrupted)
    }
}
