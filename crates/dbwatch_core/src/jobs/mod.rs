//! Scheduled-job execution: the periodic counterpart to the monitor loop.
//! Jobs are plain SQL statements run on an interval, every run logged to
//! `job_runs`. Failures are recorded, never propagated out of the loop;
//! the `restart_failed_job` remediation leaves a `pending_retry` marker
//! this runner consumes on its next pass.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use rusqlite::{params, Row};
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use crate::error::AppError;
use crate::store::{now_utc, Store};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct JobConfig {
    pub name: String,
    /// Interval spec: "30s", "5m", "1h", or a bare number of seconds.
    pub every: String,
    /// Non-query maintenance statement. A statement that returns rows is
    /// recorded as a failed run, not silently discarded.
    pub sql: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub description: String,
}

fn default_enabled() -> bool {
    true
}

/// Parse an interval spec into a duration. Not a cron language.
pub fn parse_every(spec: &str) -> Result<Duration, AppError> {
    let spec = spec.trim();
    let invalid = || {
        AppError::new(
            "JOB_SCHEDULE_INVALID",
            format!("Invalid interval spec: {spec}"),
        )
    };

    let (digits, unit) = match spec.chars().last() {
        Some(c) if c.is_ascii_digit() => (spec, 1u64),
        Some('s') => (&spec[..spec.len() - 1], 1),
        Some('m') => (&spec[..spec.len() - 1], 60),
        Some('h') => (&spec[..spec.len() - 1], 3600),
        _ => return Err(invalid()),
    };
    let n: u64 = digits.parse().map_err(|_| invalid())?;
    if n == 0 {
        return Err(invalid());
    }
    Ok(Duration::from_secs(n * unit))
}

/// One persisted job run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JobRun {
    pub id: i64,
    pub job_name: String,
    pub status: String,
    pub started_at: String,
    pub completed_at: Option<String>,
    pub duration_ms: Option<i64>,
    pub rows_affected: Option<i64>,
    pub error_message: Option<String>,
}

fn job_run_from_row(row: &Row<'_>) -> rusqlite::Result<JobRun> {
    Ok(JobRun {
        id: row.get(0)?,
        job_name: row.get(1)?,
        status: row.get(2)?,
        started_at: row.get(3)?,
        completed_at: row.get(4)?,
        duration_ms: row.get(5)?,
        rows_affected: row.get(6)?,
        error_message: row.get(7)?,
    })
}

const JOB_RUN_COLUMNS: &str =
    "id, job_name, status, started_at, completed_at, duration_ms, rows_affected, error_message";

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct JobRunReport {
    pub job_name: String,
    pub success: bool,
    pub rows_affected: usize,
    pub duration_ms: i64,
    pub error: Option<String>,
}

pub struct JobRunner {
    store: Arc<Store>,
    jobs: Vec<JobConfig>,
    last_run: Mutex<HashMap<String, Instant>>,
}

impl JobRunner {
    /// Disabled jobs and jobs with unparseable intervals are dropped at
    /// construction with a warning; a bad schedule should not take the
    /// whole runner down.
    pub fn new(store: Arc<Store>, jobs: Vec<JobConfig>) -> Self {
        let jobs = jobs
            .into_iter()
            .filter(|j| {
                if !j.enabled {
                    return false;
                }
                match parse_every(&j.every) {
                    Ok(_) => true,
                    Err(e) => {
                        warn!(job = %j.name, error = %e, "dropping job with invalid schedule");
                        false
                    }
                }
            })
            .collect();
        Self {
            store,
            jobs,
            last_run: Mutex::new(HashMap::new()),
        }
    }

    pub fn jobs(&self) -> &[JobConfig] {
        &self.jobs
    }

    /// Manually trigger a job by name.
    pub fn run_job(&self, name: &str) -> Result<JobRunReport, AppError> {
        let job = self
            .jobs
            .iter()
            .find(|j| j.name == name)
            .ok_or_else(|| AppError::new("JOB_UNKNOWN", format!("Job not found: {name}")))?;
        Ok(self.execute_job(job))
    }

    /// Run every job whose interval has elapsed, then pick up any
    /// `pending_retry` markers left behind by remediation.
    pub fn run_due(&self) -> Result<Vec<JobRunReport>, AppError> {
        let mut reports = Vec::new();
        let now = Instant::now();

        for job in &self.jobs {
            let interval = parse_every(&job.every)?;
            let due = {
                let last_run = self.last_run.lock().unwrap();
                match last_run.get(&job.name) {
                    Some(last) => now.duration_since(*last) >= interval,
                    None => true,
                }
            };
            if due {
                reports.push(self.execute_job(job));
            }
        }

        reports.extend(self.run_pending_retries()?);
        Ok(reports)
    }

    pub fn history(&self, job_name: Option<&str>, limit: i64) -> Result<Vec<JobRun>, AppError> {
        self.store.with_conn(|conn| match job_name {
            Some(name) => query_runs(
                conn,
                &format!(
                    "SELECT {JOB_RUN_COLUMNS} FROM job_runs WHERE job_name = ?1 \
                     ORDER BY started_at DESC, id DESC LIMIT ?2"
                ),
                params![name, limit],
            ),
            None => query_runs(
                conn,
                &format!(
                    "SELECT {JOB_RUN_COLUMNS} FROM job_runs \
                     ORDER BY started_at DESC, id DESC LIMIT ?1"
                ),
                params![limit],
            ),
        })
    }

    fn execute_job(&self, job: &JobConfig) -> JobRunReport {
        let started = Instant::now();
        let run_id = self.log_start(&job.name);

        let outcome = self.store.execute(&job.sql, &[]);
        let duration_ms = started.elapsed().as_millis() as i64;

        let report = match outcome {
            Ok(rows_affected) => {
                self.log_complete(run_id, "success", duration_ms, rows_affected as i64, None);
                info!(job = %job.name, rows_affected, duration_ms, "job completed");
                JobRunReport {
                    job_name: job.name.clone(),
                    success: true,
                    rows_affected,
                    duration_ms,
                    error: None,
                }
            }
            Err(e) => {
                // Keep the underlying SQLite cause; Display carries only the code.
                let message = match &e.details {
                    Some(details) => format!("{e}: {details}"),
                    None => e.to_string(),
                };
                self.log_complete(run_id, "failed", duration_ms, 0, Some(&message));
                error!(job = %job.name, error = %message, "job failed");
                JobRunReport {
                    job_name: job.name.clone(),
                    success: false,
                    rows_affected: 0,
                    duration_ms,
                    error: Some(message),
                }
            }
        };

        let mut last_run = self.last_run.lock().unwrap();
        last_run.insert(job.name.clone(), Instant::now());
        report
    }

    /// Consume pending_retry markers: re-run the named job when it is
    /// still configured, and mark the marker row either way so a retry
    /// fires once.
    fn run_pending_retries(&self) -> Result<Vec<JobRunReport>, AppError> {
        let pending: Vec<(i64, String)> = self.store.with_conn(|conn| {
            let mut stmt = sql_prepare(
                conn,
                "SELECT id, job_name FROM job_runs WHERE status = 'pending_retry' ORDER BY id ASC",
            )?;
            let rows = stmt
                .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))
                .map_err(|e| AppError::sql("DB_QUERY_FAILED", "Failed to query pending retries", e))?;
            let mut out = Vec::new();
            for r in rows {
                out.push(r.map_err(|e| {
                    AppError::sql("DB_QUERY_FAILED", "Failed to decode pending retry row", e)
                })?);
            }
            Ok(out)
        })?;

        let mut reports = Vec::new();
        for (marker_id, job_name) in pending {
            self.store.execute(
                "UPDATE job_runs SET status = 'retried' WHERE id = ?1",
                &[&marker_id],
            )?;
            match self.jobs.iter().find(|j| j.name == job_name) {
                Some(job) => {
                    info!(job = %job_name, "re-running job from pending_retry marker");
                    reports.push(self.execute_job(job));
                }
                None => {
                    warn!(job = %job_name, "pending_retry for unconfigured job, dropping");
                }
            }
        }
        Ok(reports)
    }

    fn log_start(&self, job_name: &str) -> Option<i64> {
        let inserted = self.store.with_conn(|conn| {
            conn.execute(
                "INSERT INTO job_runs (job_name, status) VALUES (?1, 'running')",
                params![job_name],
            )
            .map_err(|e| AppError::sql("DB_EXEC_FAILED", "Failed to log job start", e))?;
            Ok(conn.last_insert_rowid())
        });
        match inserted {
            Ok(id) => Some(id),
            Err(e) => {
                warn!(job = %job_name, error = %e, "failed to log job start");
                None
            }
        }
    }

    fn log_complete(
        &self,
        run_id: Option<i64>,
        status: &str,
        duration_ms: i64,
        rows_affected: i64,
        error: Option<&str>,
    ) {
        let Some(run_id) = run_id else { return };
        let completed_at = match now_utc() {
            Ok(ts) => ts,
            Err(e) => {
                warn!(error = %e, "failed to format completion time");
                return;
            }
        };
        if let Err(e) = self.store.execute(
            "UPDATE job_runs SET completed_at = ?1, status = ?2, duration_ms = ?3, \
             rows_affected = ?4, error_message = ?5 WHERE id = ?6",
            &[&completed_at, &status, &duration_ms, &rows_affected, &error, &run_id],
        ) {
            warn!(run_id, error = %e, "failed to log job completion");
        }
    }
}

fn query_runs(
    conn: &rusqlite::Connection,
    sql: &str,
    params: impl rusqlite::Params,
) -> Result<Vec<JobRun>, AppError> {
    let mut stmt = sql_prepare(conn, sql)?;
    let rows = stmt
        .query_map(params, job_run_from_row)
        .map_err(|e| AppError::sql("DB_QUERY_FAILED", "Failed to query job runs", e))?;

    let mut out = Vec::new();
    for r in rows {
        out.push(
            r.map_err(|e| AppError::sql("DB_QUERY_FAILED", "Failed to decode job run row", e))?,
        );
    }
    Ok(out)
}

fn sql_prepare<'a>(
    conn: &'a rusqlite::Connection,
    sql: &str,
) -> Result<rusqlite::Statement<'a>, AppError> {
    conn.prepare(sql)
        .map_err(|e| AppError::sql("DB_QUERY_FAILED", "Failed to prepare statement", e))
}
