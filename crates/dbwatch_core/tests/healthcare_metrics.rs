//! Healthcare metric collection against a seeded claims and adherence
//! dataset, and the path from a critical claim-rejection alert into a
//! deduplicated incident.

use std::sync::Arc;

use pretty_assertions::assert_eq;

use dbwatch_core::domain::{AlertLevel, Severity};
use dbwatch_core::incidents::{CreateIncident, IncidentManager};
use dbwatch_core::monitor::healthcare::HealthcareCollector;
use dbwatch_core::monitor::Thresholds;
use dbwatch_core::store::Store;

fn seed_medication(store: &Store, name: &str, drug_class: &str) -> i64 {
    store
        .execute(
            "INSERT INTO medications (name, drug_class) VALUES (?1, ?2)",
            &[&name, &drug_class],
        )
        .expect("insert medication");
    store
        .with_conn(|conn| {
            conn.query_row("SELECT last_insert_rowid()", [], |row| row.get(0))
                .map_err(|e| dbwatch_core::error::AppError::sql("DB_QUERY_FAILED", "rowid", e))
        })
        .expect("rowid")
}

fn seed_claim(store: &Store, medication_id: i64, claim_status: &str) {
    store
        .execute(
            "INSERT INTO pharmacy_claims (medication_id, claim_status) VALUES (?1, ?2)",
            &[&medication_id, &claim_status],
        )
        .expect("insert claim");
}

fn seed_adherence(store: &Store, patient_ref: &str, pdc_ratio: f64) {
    store
        .execute(
            "INSERT INTO patient_adherence (patient_ref, pdc_ratio) VALUES (?1, ?2)",
            &[&patient_ref, &pdc_ratio],
        )
        .expect("insert adherence");
}

#[test]
fn empty_tables_collect_zeroes_and_no_alerts() {
    let store = Arc::new(Store::open_in_memory().expect("open"));
    let collector = HealthcareCollector::new(store, Thresholds::default());

    let (metrics, alerts) = collector.collect().expect("collect");
    assert_eq!(metrics.claims_today, 0);
    assert_eq!(metrics.rejection_rate, 0.0);
    assert_eq!(metrics.total_patients, 0);
    assert!(alerts.is_empty());
}

#[test]
fn claim_counts_and_rates_come_from_todays_claims() {
    let store = Arc::new(Store::open_in_memory().expect("open"));
    let generic = seed_medication(&store, "metformin", "generic");
    let brand = seed_medication(&store, "januvia", "brand");

    for _ in 0..7 {
        seed_claim(&store, generic, "paid");
    }
    seed_claim(&store, brand, "paid");
    seed_claim(&store, brand, "rejected");
    seed_claim(&store, brand, "rejected");

    let collector = HealthcareCollector::new(store, Thresholds::default());
    let (metrics, alerts) = collector.collect().expect("collect");

    assert_eq!(metrics.claims_today, 10);
    assert_eq!(metrics.rejected_count, 2);
    assert_eq!(metrics.rejection_rate, 20.0);
    assert_eq!(metrics.generic_count, 7);
    assert_eq!(metrics.generic_rate, 70.0);

    // 20% rejected is past the critical band; 70% generic is under the
    // 80% floor.
    assert_eq!(alerts.len(), 2);
    assert_eq!(alerts[0].metric, "claim_rejection_rate");
    assert_eq!(alerts[0].level, AlertLevel::Critical);
    assert_eq!(alerts[1].metric, "generic_dispensing_rate");
    assert_eq!(alerts[1].level, AlertLevel::Warning);
}

#[test]
fn adherence_average_is_rounded_and_gated_on_patients() {
    let store = Arc::new(Store::open_in_memory().expect("open"));
    seed_adherence(&store, "P-001", 0.9);
    seed_adherence(&store, "P-002", 0.7);
    seed_adherence(&store, "P-003", 0.5);

    let collector = HealthcareCollector::new(store, Thresholds::default());
    let (metrics, alerts) = collector.collect().expect("collect");

    assert_eq!(metrics.total_patients, 3);
    assert_eq!(metrics.avg_pdc, 0.7);
    assert_eq!(metrics.non_adherent_count, 2);

    assert_eq!(alerts.len(), 1);
    assert_eq!(alerts[0].metric, "pdc_adherence");
    assert_eq!(alerts[0].level, AlertLevel::Warning);
}

#[test]
fn unmapped_medication_counts_as_non_generic() {
    let store = Arc::new(Store::open_in_memory().expect("open"));
    store
        .execute(
            "INSERT INTO pharmacy_claims (medication_id, claim_status) VALUES (NULL, 'paid')",
            &[],
        )
        .expect("insert claim");

    let collector = HealthcareCollector::new(store, Thresholds::default());
    let (metrics, _) = collector.collect().expect("collect");
    assert_eq!(metrics.claims_today, 1);
    assert_eq!(metrics.generic_count, 0);
    assert_eq!(metrics.generic_rate, 0.0);
}

#[test]
fn critical_rejection_alert_opens_one_deduplicated_incident() {
    let store = Arc::new(Store::open_in_memory().expect("open"));
    let incidents = IncidentManager::new(store.clone());
    let brand = seed_medication(&store, "eliquis", "brand");
    seed_claim(&store, brand, "rejected");

    let collector = HealthcareCollector::new(store.clone(), Thresholds::default());

    // Two monitor passes over the same bad data must collapse onto one
    // open incident.
    for _ in 0..2 {
        let (_, alerts) = collector.collect().expect("collect");
        for alert in &alerts {
            if alert.level == AlertLevel::Critical {
                incidents
                    .create(
                        CreateIncident::new(
                            alert.metric.clone(),
                            format!("Critical: {} = {}", alert.metric, alert.value),
                            Severity::Critical,
                        )
                        .with_dedup_key(format!("healthcare_{}", alert.metric)),
                    )
                    .expect("create incident");
            }
        }
    }

    let open = incidents.list_open().expect("list");
    assert_eq!(open.len(), 1);
    assert_eq!(open[0].dedup_key.as_deref(), Some("healthcare_claim_rejection_rate"));
}
