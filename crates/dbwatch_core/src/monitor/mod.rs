//! Health collection: capture a snapshot of the monitored database,
//! evaluate it against configured thresholds, produce alerts.

use std::sync::Arc;

use rusqlite::{params, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::warn;

use crate::domain::{Alert, AlertLevel};
use crate::error::AppError;
use crate::store::{ProcParams, Store};

pub mod healthcare;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Thresholds {
    pub cpu_percent_warning: f64,
    pub cpu_percent_critical: f64,
    pub memory_percent_warning: f64,
    pub memory_percent_critical: f64,
    pub connection_count_warning: i64,
    pub connection_count_critical: i64,
    pub blocking_chain_warning: i64,
    pub blocking_chain_critical: i64,
    pub long_query_seconds: i64,
    pub claim_rejection_rate_warning: f64,
    pub claim_rejection_rate_critical: f64,
    /// Low generic dispensing is the problem: warn when the rate falls
    /// below this, not above.
    pub generic_dispensing_rate_warning: f64,
    /// CMS Star cutoff for average proportion-of-days-covered.
    pub pdc_adherence_warning: f64,
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            cpu_percent_warning: 70.0,
            cpu_percent_critical: 90.0,
            memory_percent_warning: 75.0,
            memory_percent_critical: 90.0,
            connection_count_warning: 80,
            connection_count_critical: 150,
            blocking_chain_warning: 2,
            blocking_chain_critical: 5,
            long_query_seconds: 30,
            claim_rejection_rate_warning: 5.0,
            claim_rejection_rate_critical: 15.0,
            generic_dispensing_rate_warning: 80.0,
            pdc_adherence_warning: 0.80,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HealthSnapshot {
    pub id: i64,
    pub captured_at: String,
    pub cpu_percent: Option<f64>,
    pub memory_used_mb: Option<f64>,
    pub memory_total_mb: Option<f64>,
    pub connection_count: Option<i64>,
    pub blocking_count: Option<i64>,
    pub long_query_count: Option<i64>,
    pub status: String,
    pub details: Option<String>,
}

fn snapshot_from_row(row: &Row<'_>) -> rusqlite::Result<HealthSnapshot> {
    Ok(HealthSnapshot {
        id: row.get(0)?,
        captured_at: row.get(1)?,
        cpu_percent: row.get(2)?,
        memory_used_mb: row.get(3)?,
        memory_total_mb: row.get(4)?,
        connection_count: row.get(5)?,
        blocking_count: row.get(6)?,
        long_query_count: row.get(7)?,
        status: row.get(8)?,
        details: row.get(9)?,
    })
}

const SNAPSHOT_COLUMNS: &str = "id, captured_at, cpu_percent, memory_used_mb, memory_total_mb, \
     connection_count, blocking_count, long_query_count, status, details";

fn banded_alert(metric: &str, value: f64, warning: f64, critical: f64) -> Option<Alert> {
    if value >= critical {
        Some(Alert {
            metric: metric.to_string(),
            level: AlertLevel::Critical,
            value,
            threshold: critical,
        })
    } else if value >= warning {
        Some(Alert {
            metric: metric.to_string(),
            level: AlertLevel::Warning,
            value,
            threshold: warning,
        })
    } else {
        None
    }
}

/// Pure threshold evaluation. Metrics the snapshot does not carry are
/// skipped, not alerted on.
pub fn evaluate_thresholds(snapshot: &HealthSnapshot, t: &Thresholds) -> Vec<Alert> {
    let mut alerts = Vec::new();

    if let Some(cpu) = snapshot.cpu_percent {
        alerts.extend(banded_alert("cpu", cpu, t.cpu_percent_warning, t.cpu_percent_critical));
    }

    if let (Some(used), Some(total)) = (snapshot.memory_used_mb, snapshot.memory_total_mb) {
        if total > 0.0 {
            let pct = (used / total) * 100.0;
            alerts.extend(banded_alert(
                "memory",
                (pct * 10.0).round() / 10.0,
                t.memory_percent_warning,
                t.memory_percent_critical,
            ));
        }
    }

    if let Some(conns) = snapshot.connection_count {
        alerts.extend(banded_alert(
            "connections",
            conns as f64,
            t.connection_count_warning as f64,
            t.connection_count_critical as f64,
        ));
    }

    if let Some(blocking) = snapshot.blocking_count {
        alerts.extend(banded_alert(
            "blocking",
            blocking as f64,
            t.blocking_chain_warning as f64,
            t.blocking_chain_critical as f64,
        ));
    }

    if let Some(long_q) = snapshot.long_query_count {
        if long_q > 0 {
            alerts.push(Alert {
                metric: "long_queries".to_string(),
                level: AlertLevel::Warning,
                value: long_q as f64,
                threshold: 0.0,
            });
        }
    }

    alerts
}

pub fn overall_status(alerts: &[Alert]) -> &'static str {
    if alerts.iter().any(|a| a.level == AlertLevel::Critical) {
        "critical"
    } else if alerts.iter().any(|a| a.level == AlertLevel::Warning) {
        "warning"
    } else {
        "healthy"
    }
}

pub struct HealthCollector {
    store: Arc<Store>,
    thresholds: Thresholds,
}

impl HealthCollector {
    pub fn new(store: Arc<Store>, thresholds: Thresholds) -> Self {
        Self { store, thresholds }
    }

    /// Capture a snapshot, evaluate thresholds, and stamp the computed
    /// status back onto the persisted row. Returns the snapshot plus the
    /// alerts it produced.
    pub fn collect_snapshot(&self) -> Result<(HealthSnapshot, Vec<Alert>), AppError> {
        let mut proc_params = ProcParams::new();
        proc_params.insert(
            "long_query_seconds".into(),
            json!(self.thresholds.long_query_seconds),
        );
        self.store
            .call_procedure("capture_health_snapshot", &proc_params)?;

        let mut snapshot = self
            .latest()?
            .ok_or_else(|| AppError::new("SNAPSHOT_MISSING", "Captured snapshot not found"))?;

        let alerts = evaluate_thresholds(&snapshot, &self.thresholds);
        let status = overall_status(&alerts);
        let details = serde_json::to_string(&alerts).map_err(|e| {
            AppError::new("SNAPSHOT_ENCODE_FAILED", "Failed to encode alerts")
                .with_details(e.to_string())
        })?;

        if let Err(e) = self.store.execute(
            "UPDATE health_snapshots SET status = ?1, details = ?2 WHERE id = ?3",
            &[&status, &details, &snapshot.id],
        ) {
            warn!(snapshot_id = snapshot.id, error = %e, "failed to update snapshot status");
        }
        snapshot.status = status.to_string();
        snapshot.details = Some(details);

        Ok((snapshot, alerts))
    }

    pub fn latest(&self) -> Result<Option<HealthSnapshot>, AppError> {
        self.store.with_conn(|conn| {
            conn.query_row(
                &format!("SELECT {SNAPSHOT_COLUMNS} FROM health_snapshots ORDER BY id DESC LIMIT 1"),
                [],
                snapshot_from_row,
            )
            .optional()
            .map_err(|e| AppError::sql("DB_QUERY_FAILED", "Failed to query latest snapshot", e))
        })
    }

    pub fn history(&self, hours: i64) -> Result<Vec<HealthSnapshot>, AppError> {
        self.store.with_conn(|conn| {
            let mut stmt = conn
                .prepare(&format!(
                    "SELECT {SNAPSHOT_COLUMNS} FROM health_snapshots \
                     WHERE captured_at >= strftime('%Y-%m-%dT%H:%M:%fZ','now', '-' || ?1 || ' hours') \
                     ORDER BY captured_at DESC, id DESC"
                ))
                .map_err(|e| {
                    AppError::sql("DB_QUERY_FAILED", "Failed to prepare history query", e)
                })?;
            let rows = stmt
                .query_map(params![hours], snapshot_from_row)
                .map_err(|e| AppError::sql("DB_QUERY_FAILED", "Failed to query history", e))?;

            let mut out = Vec::new();
            for r in rows {
                out.push(r.map_err(|e| {
                    AppError::sql("DB_QUERY_FAILED", "Failed to decode snapshot row", e)
                })?);
            }
            Ok(out)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn snapshot() -> HealthSnapshot {
        HealthSnapshot {
            id: 1,
            captured_at: "2026-08-28T00:00:00Z".to_string(),
            cpu_percent: None,
            memory_used_mb: None,
            memory_total_mb: None,
            connection_count: None,
            blocking_count: None,
            long_query_count: None,
            status: "unknown".to_string(),
            details: None,
        }
    }

    #[test]
    fn value_at_threshold_alerts() {
        let mut s = snapshot();
        s.cpu_percent = Some(70.0);
        let alerts = evaluate_thresholds(&s, &Thresholds::default());
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].level, AlertLevel::Warning);

        s.cpu_percent = Some(69.9);
        assert!(evaluate_thresholds(&s, &Thresholds::default()).is_empty());
    }

    #[test]
    fn critical_band_wins_over_warning() {
        let mut s = snapshot();
        s.cpu_percent = Some(95.0);
        let alerts = evaluate_thresholds(&s, &Thresholds::default());
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].level, AlertLevel::Critical);
        assert_eq!(alerts[0].threshold, 90.0);
    }

    #[test]
    fn memory_is_evaluated_as_a_percentage() {
        let mut s = snapshot();
        s.memory_used_mb = Some(920.0);
        s.memory_total_mb = Some(1000.0);
        let alerts = evaluate_thresholds(&s, &Thresholds::default());
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].metric, "memory");
        assert_eq!(alerts[0].level, AlertLevel::Critical);
    }

    #[test]
    fn absent_metrics_do_not_alert() {
        let alerts = evaluate_thresholds(&snapshot(), &Thresholds::default());
        assert!(alerts.is_empty());
        assert_eq!(overall_status(&alerts), "healthy");
    }

    #[test]
    fn any_long_query_warns() {
        let mut s = snapshot();
        s.long_query_count = Some(1);
        let alerts = evaluate_thresholds(&s, &Thresholds::default());
        assert_eq!(alerts[0].metric, "long_queries");
        assert_eq!(overall_status(&alerts), "warning");
    }
}
