//! Job table operations.

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, Row};
use std::collections::HashMap;
use transq_common::{ConversionParams, Error, Job, JobId, JobStatus, Result};

const COLS: &str = "id, input_path, output_path, quality, resolution, video_bitrate,
    audio_bitrate, status, progress, error_message, retry_count, max_retries,
    created_at, started_at, completed_at";

/// Statuses of jobs that were still in flight when the process stopped.
const IN_FLIGHT: &str = "('pending', 'running', 'retrying')";

/// Statuses of finished jobs.
const TERMINAL: &str = "('completed', 'failed', 'cancelled')";

/// Canonical text form of a stored timestamp.
///
/// Fixed-width UTC RFC 3339 so that text ordering matches time ordering.
pub fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_timestamp(idx: usize, value: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn parse_optional_timestamp(
    idx: usize,
    value: Option<String>,
) -> rusqlite::Result<Option<DateTime<Utc>>> {
    value.map(|v| parse_timestamp(idx, &v)).transpose()
}

/// Map a row selected with [`COLS`] into a [`Job`].
fn job_from_row(row: &Row<'_>) -> rusqlite::Result<Job> {
    let status: String = row.get(7)?;
    let status = status
        .parse::<JobStatus>()
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(7, Type::Text, Box::new(e)))?;
    let created_at: String = row.get(12)?;

    Ok(Job {
        id: JobId::new(row.get::<_, String>(0)?),
        params: ConversionParams {
            input_path: row.get(1)?,
            output_path: row.get(2)?,
            quality: row.get(3)?,
            resolution: row.get(4)?,
            video_bitrate: row.get(5)?,
            audio_bitrate: row.get(6)?,
        },
        status,
        progress: row.get(8)?,
        error_message: row.get(9)?,
        retry_count: row.get(10)?,
        max_retries: row.get(11)?,
        created_at: parse_timestamp(12, &created_at)?,
        started_at: parse_optional_timestamp(13, row.get(13)?)?,
        completed_at: parse_optional_timestamp(14, row.get(14)?)?,
    })
}

fn collect_jobs(
    conn: &Connection,
    sql: &str,
    params: impl rusqlite::Params,
) -> Result<Vec<Job>> {
    let mut stmt = conn.prepare(sql).map_err(|e| Error::database(e.to_string()))?;
    let rows = stmt
        .query_map(params, job_from_row)
        .map_err(|e| Error::database(e.to_string()))?
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| Error::database(e.to_string()))?;
    Ok(rows)
}

/// Insert the job, or overwrite every column of the existing row.
pub fn upsert_job(conn: &Connection, job: &Job) -> Result<()> {
    conn.execute(
        &format!(
            "INSERT INTO jobs ({COLS})
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)
             ON CONFLICT(id) DO UPDATE SET
                input_path = excluded.input_path,
                output_path = excluded.output_path,
                quality = excluded.quality,
                resolution = excluded.resolution,
                video_bitrate = excluded.video_bitrate,
                audio_bitrate = excluded.audio_bitrate,
                status = excluded.status,
                progress = excluded.progress,
                error_message = excluded.error_message,
                retry_count = excluded.retry_count,
                max_retries = excluded.max_retries,
                created_at = excluded.created_at,
                started_at = excluded.started_at,
                completed_at = excluded.completed_at"
        ),
        params![
            job.id.as_str(),
            job.params.input_path,
            job.params.output_path,
            job.params.quality,
            job.params.resolution,
            job.params.video_bitrate,
            job.params.audio_bitrate,
            job.status.as_str(),
            job.progress,
            job.error_message,
            job.retry_count,
            job.max_retries,
            format_timestamp(&job.created_at),
            job.started_at.as_ref().map(format_timestamp),
            job.completed_at.as_ref().map(format_timestamp),
        ],
    )
    .map_err(|e| Error::database(e.to_string()))?;
    Ok(())
}

/// Get a job by ID.
pub fn get_job(conn: &Connection, id: &JobId) -> Result<Option<Job>> {
    let q = format!("SELECT {COLS} FROM jobs WHERE id = ?1");
    match conn.query_row(&q, [id.as_str()], job_from_row) {
        Ok(job) => Ok(Some(job)),
        Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
        Err(e) => Err(Error::database(e.to_string())),
    }
}

/// All jobs, newest first.
pub fn list_jobs(conn: &Connection) -> Result<Vec<Job>> {
    let q = format!("SELECT {COLS} FROM jobs ORDER BY created_at DESC, id DESC");
    collect_jobs(conn, &q, [])
}

/// Jobs in `status`, newest first, at most `limit` rows.
pub fn list_jobs_by_status(conn: &Connection, status: JobStatus, limit: u32) -> Result<Vec<Job>> {
    let q = format!(
        "SELECT {COLS} FROM jobs WHERE status = ?1
         ORDER BY created_at DESC, id DESC LIMIT ?2"
    );
    collect_jobs(conn, &q, params![status.as_str(), limit])
}

/// Number of stored jobs per status. Statuses with no rows are omitted.
pub fn count_by_status(conn: &Connection) -> Result<HashMap<JobStatus, u64>> {
    let mut stmt = conn
        .prepare("SELECT status, COUNT(*) FROM jobs GROUP BY status")
        .map_err(|e| Error::database(e.to_string()))?;
    let rows = stmt
        .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))
        .map_err(|e| Error::database(e.to_string()))?;

    let mut counts = HashMap::new();
    for row in rows {
        let (status, count) = row.map_err(|e| Error::database(e.to_string()))?;
        counts.insert(status.parse::<JobStatus>()?, count.max(0) as u64);
    }
    Ok(counts)
}

/// Delete finished jobs whose `completed_at` is before `cutoff`.
pub fn delete_finished_before(conn: &Connection, cutoff: &DateTime<Utc>) -> Result<usize> {
    conn.execute(
        &format!(
            "DELETE FROM jobs WHERE status IN {TERMINAL}
             AND completed_at IS NOT NULL AND completed_at < ?1"
        ),
        [format_timestamp(cutoff)],
    )
    .map_err(|e| Error::database(e.to_string()))
}

/// Mark every in-flight row as failed with `message` and return the rows as
/// they were before the update.
pub fn fail_in_flight(conn: &Connection, message: &str) -> Result<Vec<Job>> {
    let tx = conn
        .unchecked_transaction()
        .map_err(|e| Error::database(e.to_string()))?;

    let q = format!(
        "SELECT {COLS} FROM jobs WHERE status IN {IN_FLIGHT} ORDER BY created_at ASC, id ASC"
    );
    let interrupted = collect_jobs(&tx, &q, [])?;

    tx.execute(
        &format!(
            "UPDATE jobs SET status = 'failed', error_message = ?1, completed_at = ?2
             WHERE status IN {IN_FLIGHT}"
        ),
        params![message, format_timestamp(&transq_common::now())],
    )
    .map_err(|e| Error::database(e.to_string()))?;

    tx.commit().map_err(|e| Error::database(e.to_string()))?;
    Ok(interrupted)
}
