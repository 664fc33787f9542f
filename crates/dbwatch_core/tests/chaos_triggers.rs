use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use pretty_assertions::assert_eq;

use dbwatch_core::chaos::{ChaosEngine, ChaosScenario, ScenarioResult, TriggerOutcome};
use dbwatch_core::domain::{IncidentStatus, Severity};
use dbwatch_core::error::AppError;
use dbwatch_core::incidents::IncidentManager;
use dbwatch_core::store::Store;

fn setup(cooldown: Duration) -> (Arc<Store>, IncidentManager, ChaosEngine) {
    let store = Arc::new(Store::open_in_memory().expect("open"));
    let incidents = IncidentManager::new(store.clone());
    let engine = ChaosEngine::new(store.clone(), incidents.clone(), cooldown);
    (store, incidents, engine)
}

/// Scripted scenario for instrumenting the engine: counts executions and
/// returns a fixed outcome.
struct Scripted {
    name: &'static str,
    outcome: Result<bool, &'static str>,
    executions: Arc<AtomicUsize>,
}

impl ChaosScenario for Scripted {
    fn name(&self) -> &'static str {
        self.name
    }

    fn description(&self) -> &'static str {
        "scripted test scenario"
    }

    fn severity(&self) -> Severity {
        Severity::Warning
    }

    fn execute(&self, _store: &Store) -> Result<ScenarioResult, AppError> {
        self.executions.fetch_add(1, Ordering::SeqCst);
        match self.outcome {
            Ok(triggered) => Ok(ScenarioResult {
                triggered,
                detail: "scripted".into(),
            }),
            Err(code) => Err(AppError::new(code, "scripted failure").with_retryable(true)),
        }
    }
}

fn scripted(
    name: &'static str,
    outcome: Result<bool, &'static str>,
) -> (Box<dyn ChaosScenario>, Arc<AtomicUsize>) {
    let executions = Arc::new(AtomicUsize::new(0));
    (
        Box::new(Scripted {
            name,
            outcome,
            executions: executions.clone(),
        }),
        executions,
    )
}

#[test]
fn unknown_scenario_reports_the_catalog() {
    let (_store, _incidents, engine) = setup(Duration::from_secs(30));
    let outcome = engine.trigger("meteor_strike").unwrap();
    let TriggerOutcome::UnknownScenario { requested, available } = outcome else {
        panic!("expected UnknownScenario, got {outcome:?}");
    };
    assert_eq!(requested, "meteor_strike");
    assert_eq!(
        available,
        vec!["session_flood", "job_failure", "data_corruption", "orphaned_records"]
    );
}

#[test]
fn triggered_scenario_opens_a_deduped_incident() {
    let (_store, incidents, engine) = setup(Duration::ZERO);
    let outcome = engine.trigger("session_flood").unwrap();
    let TriggerOutcome::Fired {
        scenario,
        triggered,
        incident_id,
        ..
    } = outcome
    else {
        panic!("expected Fired, got {outcome:?}");
    };
    assert_eq!(scenario, "session_flood");
    assert!(triggered);
    let id = incident_id.expect("incident id");

    let incident = incidents.get(id).unwrap().unwrap();
    assert_eq!(incident.incident_type, "chaos:session_flood");
    assert_eq!(incident.severity, Severity::Critical);
    assert_eq!(incident.dedup_key.as_deref(), Some("chaos_session_flood"));

    // Zero cooldown: a second trigger runs, but dedup collapses the incident.
    let outcome = engine.trigger("session_flood").unwrap();
    let TriggerOutcome::Fired { incident_id, .. } = outcome else {
        panic!("expected Fired, got {outcome:?}");
    };
    assert_eq!(incident_id, Some(id));
    assert_eq!(incidents.list_open().unwrap().len(), 1);
}

#[test]
fn cooldown_refuses_a_second_trigger() {
    let (_store, _incidents, engine) = setup(Duration::from_secs(300));
    let (scenario, executions) = scripted("flaky_link", Ok(true));
    let engine = engine.with_scenarios(vec![scenario]);

    assert!(matches!(
        engine.trigger("flaky_link").unwrap(),
        TriggerOutcome::Fired { .. }
    ));
    let refused = engine.trigger("flaky_link").unwrap();
    let TriggerOutcome::OnCooldown { scenario, remaining_s } = refused else {
        panic!("expected OnCooldown, got {refused:?}");
    };
    assert_eq!(scenario, "flaky_link");
    assert!(remaining_s <= 300);
    assert_eq!(executions.load(Ordering::SeqCst), 1);
}

#[test]
fn cooldown_arms_even_when_the_scenario_errors() {
    let (_store, _incidents, engine) = setup(Duration::from_secs(300));
    let (scenario, _executions) = scripted("broken", Err("DB_EXEC_FAILED"));
    let engine = engine.with_scenarios(vec![scenario]);

    let err = engine.trigger("broken").unwrap_err();
    assert_eq!(err.code, "DB_EXEC_FAILED");

    // The failed run still started the clock.
    assert!(matches!(
        engine.trigger("broken").unwrap(),
        TriggerOutcome::OnCooldown { .. }
    ));
    let info = &engine.list_scenarios()[0];
    assert!(info.on_cooldown);
}

#[test]
fn untriggered_scenario_opens_no_incident() {
    let (_store, incidents, engine) = setup(Duration::ZERO);
    let (scenario, _executions) = scripted("noop", Ok(false));
    let engine = engine.with_scenarios(vec![scenario]);

    let outcome = engine.trigger("noop").unwrap();
    let TriggerOutcome::Fired { triggered, incident_id, .. } = outcome else {
        panic!("expected Fired, got {outcome:?}");
    };
    assert!(!triggered);
    assert_eq!(incident_id, None);
    assert!(incidents.list_open().unwrap().is_empty());
}

#[test]
fn random_trigger_picks_only_off_cooldown_scenarios() {
    let (_store, _incidents, engine) = setup(Duration::from_secs(300));
    let (a, a_runs) = scripted("alpha", Ok(false));
    let (b, b_runs) = scripted("beta", Ok(false));
    let engine = engine.with_scenarios(vec![a, b]);

    engine.trigger("alpha").unwrap();
    // Only beta is eligible now.
    let outcome = engine.trigger_random().unwrap();
    assert!(matches!(outcome, TriggerOutcome::Fired { ref scenario, .. } if scenario == "beta"));
    assert_eq!(a_runs.load(Ordering::SeqCst), 1);
    assert_eq!(b_runs.load(Ordering::SeqCst), 1);

    assert_eq!(engine.trigger_random().unwrap(), TriggerOutcome::AllUnavailable);
}

#[test]
fn builtin_scenarios_plant_observable_faults() {
    let (store, _incidents, engine) = setup(Duration::ZERO);

    engine.trigger("session_flood").unwrap();
    let stale: i64 = store
        .with_conn(|conn| {
            conn.query_row(
                "SELECT COUNT(*) FROM sessions WHERE login_name LIKE 'chaos_flood_%'",
                [],
                |row| row.get(0),
            )
            .map_err(|e| AppError::sql("DB_QUERY_FAILED", "count", e))
        })
        .unwrap();
    assert_eq!(stale, 20);

    engine.trigger("job_failure").unwrap();
    let failed: i64 = store
        .with_conn(|conn| {
            conn.query_row(
                "SELECT COUNT(*) FROM job_runs WHERE job_name = 'chaos_simulated_job' \
                 AND status = 'failed'",
                [],
                |row| row.get(0),
            )
            .map_err(|e| AppError::sql("DB_QUERY_FAILED", "count", e))
        })
        .unwrap();
    assert_eq!(failed, 1);
}

#[test]
fn chaos_incident_flows_through_the_normal_lifecycle() {
    let (_store, incidents, engine) = setup(Duration::ZERO);
    let outcome = engine.trigger("data_corruption").unwrap();
    let TriggerOutcome::Fired { incident_id: Some(id), .. } = outcome else {
        panic!("expected a fired incident, got {outcome:?}");
    };
    incidents
        .update_status(id, IncidentStatus::Resolved, Some("auto"))
        .unwrap();
    assert!(incidents.get_postmortem(id).unwrap().is_some());
}
