use std::sync::Arc;

use pretty_assertions::assert_eq;
use serde_json::Value;

use dbwatch_core::domain::{IncidentStatus, Severity, TimelineEntry};
use dbwatch_core::incidents::{CreateIncident, IncidentManager};
use dbwatch_core::store::Store;

fn setup() -> (Arc<Store>, IncidentManager) {
    let store = Arc::new(Store::open_in_memory().expect("open"));
    let mgr = IncidentManager::new(store.clone());
    (store, mgr)
}

#[test]
fn resolving_generates_exactly_one_postmortem() {
    let (_store, mgr) = setup();
    let incident = mgr
        .create(
            CreateIncident::new("cpu", "CPU saturation", Severity::Critical)
                .with_description("runaway analytics query"),
        )
        .unwrap();
    mgr.update_status(incident.id, IncidentStatus::Resolved, Some("operator"))
        .unwrap();

    let pm = mgr.get_postmortem(incident.id).unwrap().expect("postmortem");
    assert_eq!(pm.incident_id, incident.id);
    assert_eq!(pm.root_cause, "runaway analytics query");
    assert!(pm.summary.contains("CPU saturation"));
    assert!(pm.summary.contains("operator"));
    assert_eq!(mgr.list_postmortems(10).unwrap().len(), 1);
}

#[test]
fn repeat_resolution_does_not_create_a_second_postmortem() {
    let (_store, mgr) = setup();
    let incident = mgr
        .create(CreateIncident::new("cpu", "CPU", Severity::Warning))
        .unwrap();
    mgr.update_status(incident.id, IncidentStatus::Resolved, Some("first"))
        .unwrap();
    mgr.update_status(incident.id, IncidentStatus::Detected, None)
        .unwrap();
    mgr.update_status(incident.id, IncidentStatus::Resolved, Some("second"))
        .unwrap();

    let pms = mgr.list_postmortems(10).unwrap();
    assert_eq!(pms.len(), 1);
    // The original record stands untouched.
    let pm = mgr.get_postmortem(incident.id).unwrap().unwrap();
    assert!(pm.summary.contains("first"));
}

#[test]
fn missing_description_defaults_the_root_cause() {
    let (_store, mgr) = setup();
    let incident = mgr
        .create(CreateIncident::new("memory", "Memory pressure", Severity::Warning))
        .unwrap();
    mgr.update_status(incident.id, IncidentStatus::Resolved, None)
        .unwrap();

    let pm = mgr.get_postmortem(incident.id).unwrap().unwrap();
    assert_eq!(pm.root_cause, "Investigation required");
}

#[test]
fn timeline_walks_the_incident_in_order() {
    let (store, mgr) = setup();
    let incident = mgr
        .create(CreateIncident::new("blocking", "Blocking chain", Severity::Critical))
        .unwrap();
    mgr.update_status(incident.id, IncidentStatus::Investigating, None)
        .unwrap();
    store
        .execute(
            "INSERT INTO remediation_log (incident_id, action_name, success, detail) \
             VALUES (?1, 'kill_blocking_session', 1, 'killed session 12')",
            &[&incident.id],
        )
        .unwrap();
    mgr.update_status(incident.id, IncidentStatus::Resolved, Some("auto"))
        .unwrap();

    let pm = mgr.get_postmortem(incident.id).unwrap().unwrap();
    let timeline: Vec<TimelineEntry> = serde_json::from_str(&pm.timeline).unwrap();
    let events: Vec<&str> = timeline.iter().map(|t| t.event.as_str()).collect();
    assert_eq!(
        events,
        vec![
            "Incident detected: Blocking chain",
            "Acknowledged",
            "Remediation 'kill_blocking_session' succeeded",
            "Resolved by auto",
        ]
    );

    let remediation: Value = serde_json::from_str(&pm.remediation).unwrap();
    assert_eq!(remediation[0]["action"], "kill_blocking_session");
    assert_eq!(remediation[0]["success"], true);
}

// Postmortem generation is best-effort: a broken postmortems table must not
// block the resolution itself.
#[test]
fn resolution_survives_postmortem_persistence_failure() {
    let (store, mgr) = setup();
    let incident = mgr
        .create(CreateIncident::new("cpu", "CPU", Severity::Critical))
        .unwrap();
    store.execute("DROP TABLE postmortems", &[]).unwrap();

    let updated = mgr
        .update_status(incident.id, IncidentStatus::Resolved, Some("operator"))
        .unwrap();
    assert_eq!(updated.status, IncidentStatus::Resolved);
    assert!(updated.resolved_at.is_some());
}

#[test]
fn escalation_does_not_generate_a_postmortem() {
    let (_store, mgr) = setup();
    let incident = mgr
        .create(CreateIncident::new("cpu", "CPU", Severity::Critical))
        .unwrap();
    mgr.update_status(incident.id, IncidentStatus::Escalated, None)
        .unwrap();
    assert!(mgr.get_postmortem(incident.id).unwrap().is_none());
}
