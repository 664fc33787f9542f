//! Registered store procedures: the remediation primitives and the health
//! snapshot capture. Each runs in one round trip against the monitored
//! schema. SQL targeting specific tables lives only here.

use rusqlite::params;
use serde_json::Value;

use crate::error::AppError;
use crate::store::Store;

pub type ProcParams = serde_json::Map<String, Value>;

/// Result of a procedure call: how many rows it touched, plus a short
/// human-readable note.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcOutcome {
    pub rows_affected: i64,
    pub detail: String,
}

pub fn call(store: &Store, name: &str, params: &ProcParams) -> Result<ProcOutcome, AppError> {
    match name {
        "cleanup_stale_sessions" => {
            cleanup_stale_sessions(store, param_i64(params, "idle_minutes").unwrap_or(60))
        }
        "kill_session" => kill_session(store, required_i64(params, "session_id")?),
        "restart_failed_job" => restart_failed_job(store, &required_str(params, "job_name")?),
        "quarantine_rows" => quarantine_rows(
            store,
            &required_str(params, "table")?,
            &required_str(params, "column")?,
            &required_str(params, "value")?,
        ),
        "capture_health_snapshot" => {
            capture_health_snapshot(store, param_i64(params, "long_query_seconds").unwrap_or(30))
        }
        other => Err(AppError::new(
            "PROC_UNKNOWN",
            format!("Unknown procedure: {other}"),
        )),
    }
}

fn param_i64(params: &ProcParams, key: &str) -> Option<i64> {
    params.get(key).and_then(Value::as_i64)
}

fn required_i64(params: &ProcParams, key: &str) -> Result<i64, AppError> {
    param_i64(params, key).ok_or_else(|| {
        AppError::new(
            "PROC_BAD_PARAMS",
            format!("Missing required integer parameter: {key}"),
        )
    })
}

fn required_str(params: &ProcParams, key: &str) -> Result<String, AppError> {
    params
        .get(key)
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| {
            AppError::new(
                "PROC_BAD_PARAMS",
                format!("Missing required string parameter: {key}"),
            )
        })
}

/// Delete sessions idle for more than `idle_minutes`.
fn cleanup_stale_sessions(store: &Store, idle_minutes: i64) -> Result<ProcOutcome, AppError> {
    let n = store.execute(
        "DELETE FROM sessions \
         WHERE CAST(strftime('%s','now') AS INTEGER) - CAST(strftime('%s', last_activity_at) AS INTEGER) > ?1 * 60",
        &[&idle_minutes],
    )?;
    Ok(ProcOutcome {
        rows_affected: n as i64,
        detail: format!("{n} stale sessions removed"),
    })
}

fn kill_session(store: &Store, session_id: i64) -> Result<ProcOutcome, AppError> {
    let n = store.execute("DELETE FROM sessions WHERE id = ?1", &[&session_id])?;
    Ok(ProcOutcome {
        rows_affected: n as i64,
        detail: if n == 0 {
            format!("session {session_id} not found")
        } else {
            format!("session {session_id} killed")
        },
    })
}

/// Mark the most recent failed run of a job for re-execution; the job
/// runner consumes `pending_retry` markers on its next cycle.
fn restart_failed_job(store: &Store, job_name: &str) -> Result<ProcOutcome, AppError> {
    let n = store.execute(
        "UPDATE job_runs SET status = 'pending_retry', \
         error_message = COALESCE(error_message, '') || ' | remediation: retry scheduled' \
         WHERE id = (SELECT id FROM job_runs WHERE job_name = ?1 AND status = 'failed' \
                     ORDER BY id DESC LIMIT 1)",
        &[&job_name],
    )?;
    Ok(ProcOutcome {
        rows_affected: n as i64,
        detail: if n == 0 {
            format!("no failed run of '{job_name}' to retry")
        } else {
            format!("job '{job_name}' marked for retry")
        },
    })
}

/// Move matching rows into the quarantine table. Table/column pairs are a
/// closed whitelist so identifiers never come from untrusted input.
fn quarantine_rows(
    store: &Store,
    table: &str,
    column: &str,
    value: &str,
) -> Result<ProcOutcome, AppError> {
    let (insert_sql, delete_sql) = match (table, column) {
        ("orders", "status") => (
            "INSERT INTO quarantine (source_table, source_id, payload, reason) \
             SELECT 'orders', id, \
                    json_object('customer_id', customer_id, 'total_amount', total_amount, 'status', status), \
                    'status=' || ?1 \
             FROM orders WHERE status = ?1",
            "DELETE FROM orders WHERE status = ?1",
        ),
        ("order_items", "product") => (
            "INSERT INTO quarantine (source_table, source_id, payload, reason) \
             SELECT 'order_items', id, \
                    json_object('order_id', order_id, 'product', product, 'quantity', quantity, 'unit_price', unit_price), \
                    'product=' || ?1 \
             FROM order_items WHERE product = ?1",
            "DELETE FROM order_items WHERE product = ?1",
        ),
        ("sessions", "status") => (
            "INSERT INTO quarantine (source_table, source_id, payload, reason) \
             SELECT 'sessions', id, \
                    json_object('login_name', login_name, 'status', status), \
                    'status=' || ?1 \
             FROM sessions WHERE status = ?1",
            "DELETE FROM sessions WHERE status = ?1",
        ),
        _ => {
            return Err(AppError::new(
                "PROC_BAD_PARAMS",
                format!("Quarantine not supported for {table}.{column}"),
            ))
        }
    };

    let copied = store.execute(insert_sql, &[&value])?;
    store.execute(delete_sql, &[&value])?;
    Ok(ProcOutcome {
        rows_affected: copied as i64,
        detail: format!("{copied} rows quarantined from {table}"),
    })
}

/// Derive a health snapshot from the sessions table plus the latest
/// server_stats row, and persist it. Threshold evaluation happens in the
/// monitor, not here.
fn capture_health_snapshot(store: &Store, long_query_seconds: i64) -> Result<ProcOutcome, AppError> {
    store.with_conn(|conn| {
        conn.execute(
            "INSERT INTO health_snapshots \
             (cpu_percent, memory_used_mb, memory_total_mb, connection_count, blocking_count, long_query_count) \
             SELECT \
               (SELECT cpu_percent FROM server_stats ORDER BY id DESC LIMIT 1), \
               (SELECT memory_used_mb FROM server_stats ORDER BY id DESC LIMIT 1), \
               (SELECT memory_total_mb FROM server_stats ORDER BY id DESC LIMIT 1), \
               (SELECT COUNT(*) FROM sessions), \
               (SELECT COUNT(*) FROM sessions WHERE status = 'blocked'), \
               (SELECT COUNT(*) FROM sessions WHERE status = 'running' \
                  AND query_started_at IS NOT NULL \
                  AND CAST(strftime('%s','now') AS INTEGER) - CAST(strftime('%s', query_started_at) AS INTEGER) > ?1)",
            params![long_query_seconds],
        )
        .map_err(|e| AppError::sql("DB_EXEC_FAILED", "Failed to capture health snapshot", e))?;
        let id = conn.last_insert_rowid();
        Ok(ProcOutcome {
            rows_affected: 1,
            detail: format!("snapshot {id} captured"),
        })
    })
}
