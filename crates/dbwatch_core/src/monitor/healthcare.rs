//! Healthcare metric collection: pharmacy claims, generic dispensing,
//! and patient adherence, evaluated against the same alert contract as
//! the server health snapshot.

use std::sync::Arc;

use rusqlite::Row;
use serde::{Deserialize, Serialize};

use crate::domain::{Alert, AlertLevel};
use crate::error::AppError;
use crate::store::Store;

use super::{banded_alert, Thresholds};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HealthcareMetrics {
    pub claims_today: i64,
    pub rejected_count: i64,
    pub rejection_rate: f64,
    pub generic_count: i64,
    pub generic_rate: f64,
    pub avg_pdc: f64,
    pub non_adherent_count: i64,
    pub total_patients: i64,
}

fn claims_from_row(row: &Row<'_>) -> rusqlite::Result<(i64, i64, f64, i64, f64)> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
    ))
}

/// Pure threshold evaluation over a collected metrics set. Rejection rate
/// is banded warning/critical; generic dispensing and adherence warn when
/// the value falls *below* the configured floor, and only once there is
/// data to judge.
pub fn evaluate_healthcare(metrics: &HealthcareMetrics, t: &Thresholds) -> Vec<Alert> {
    let mut alerts = Vec::new();

    alerts.extend(banded_alert(
        "claim_rejection_rate",
        metrics.rejection_rate,
        t.claim_rejection_rate_warning,
        t.claim_rejection_rate_critical,
    ));

    if metrics.claims_today > 0 && metrics.generic_rate < t.generic_dispensing_rate_warning {
        alerts.push(Alert {
            metric: "generic_dispensing_rate".to_string(),
            level: AlertLevel::Warning,
            value: metrics.generic_rate,
            threshold: t.generic_dispensing_rate_warning,
        });
    }

    if metrics.total_patients > 0 && metrics.avg_pdc < t.pdc_adherence_warning {
        alerts.push(Alert {
            metric: "pdc_adherence".to_string(),
            level: AlertLevel::Warning,
            value: metrics.avg_pdc,
            threshold: t.pdc_adherence_warning,
        });
    }

    alerts
}

pub struct HealthcareCollector {
    store: Arc<Store>,
    thresholds: Thresholds,
}

impl HealthcareCollector {
    pub fn new(store: Arc<Store>, thresholds: Thresholds) -> Self {
        Self { store, thresholds }
    }

    /// Collect today's claim figures and the adherence aggregate, then
    /// evaluate them. Rates are rounded in SQL (one decimal for claim
    /// percentages, three for PDC) so the persisted and alerted values
    /// agree.
    pub fn collect(&self) -> Result<(HealthcareMetrics, Vec<Alert>), AppError> {
        let metrics = self.store.with_conn(|conn| {
            let (claims_today, rejected_count, rejection_rate, generic_count, generic_rate) = conn
                .query_row(
                    "SELECT \
                       COUNT(*), \
                       COALESCE(SUM(CASE WHEN pc.claim_status = 'rejected' THEN 1 ELSE 0 END), 0), \
                       CASE WHEN COUNT(*) > 0 \
                         THEN ROUND(100.0 * SUM(CASE WHEN pc.claim_status = 'rejected' THEN 1 ELSE 0 END) / COUNT(*), 1) \
                         ELSE 0.0 END, \
                       COALESCE(SUM(CASE WHEN m.drug_class = 'generic' THEN 1 ELSE 0 END), 0), \
                       CASE WHEN COUNT(*) > 0 \
                         THEN ROUND(100.0 * SUM(CASE WHEN m.drug_class = 'generic' THEN 1 ELSE 0 END) / COUNT(*), 1) \
                         ELSE 0.0 END \
                     FROM pharmacy_claims pc \
                     LEFT JOIN medications m ON pc.medication_id = m.id \
                     WHERE pc.service_date = date('now')",
                    [],
                    claims_from_row,
                )
                .map_err(|e| {
                    AppError::sql("DB_QUERY_FAILED", "Failed to collect claim metrics", e)
                })?;

            let (avg_pdc, non_adherent_count, total_patients): (f64, i64, i64) = conn
                .query_row(
                    "SELECT \
                       COALESCE(ROUND(AVG(pdc_ratio), 3), 0.0), \
                       COALESCE(SUM(CASE WHEN pdc_ratio < 0.80 THEN 1 ELSE 0 END), 0), \
                       COUNT(*) \
                     FROM patient_adherence",
                    [],
                    |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
                )
                .map_err(|e| {
                    AppError::sql("DB_QUERY_FAILED", "Failed to collect adherence metrics", e)
                })?;

            Ok(HealthcareMetrics {
                claims_today,
                rejected_count,
                rejection_rate,
                generic_count,
                generic_rate,
                avg_pdc,
                non_adherent_count,
                total_patients,
            })
        })?;

        let alerts = evaluate_healthcare(&metrics, &self.thresholds);
        Ok((metrics, alerts))
    }
}
