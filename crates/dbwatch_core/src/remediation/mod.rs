//! Remediation engine: match an open incident to a rule, run the action,
//! log the attempt, drive the incident's transition.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use crate::domain::{Incident, IncidentStatus};
use crate::error::AppError;
use crate::incidents::IncidentManager;
use crate::store::Store;

pub mod actions;

pub use actions::{ActionParams, ActionRegistry, ActionResult};

/// One ordered rule: a case-sensitive substring of the incident type,
/// the action to run, and its parameter map.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RemediationRule {
    pub pattern: String,
    pub action: String,
    #[serde(default)]
    pub params: ActionParams,
}

/// Ordered rule evaluator. Matching is deliberately plain substring
/// containment; first match wins. Alternative matchers can replace this
/// type without touching the engine's control flow.
#[derive(Debug, Clone)]
pub struct RuleSet {
    rules: Vec<RemediationRule>,
}

impl RuleSet {
    pub fn new(rules: Vec<RemediationRule>) -> Self {
        Self { rules }
    }

    pub fn first_match(&self, incident_type: &str) -> Option<&RemediationRule> {
        self.rules.iter().find(|r| incident_type.contains(&r.pattern))
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    pub fn default_rules() -> Self {
        fn rule(pattern: &str, action: &str, params: &[(&str, serde_json::Value)]) -> RemediationRule {
            let mut map = ActionParams::new();
            for (k, v) in params {
                map.insert((*k).to_string(), v.clone());
            }
            RemediationRule {
                pattern: pattern.to_string(),
                action: action.to_string(),
                params: map,
            }
        }
        use serde_json::json;
        Self::new(vec![
            rule("blocking", "cleanup_stale_sessions", &[("idle_minutes", json!(30))]),
            rule("long_queries", "cleanup_stale_sessions", &[("idle_minutes", json!(5))]),
            rule("chaos:session_flood", "cleanup_stale_sessions", &[("idle_minutes", json!(1))]),
            rule(
                "chaos:job_failure",
                "restart_failed_job",
                &[("job_name", json!("chaos_simulated_job"))],
            ),
            rule(
                "chaos:data_corruption",
                "quarantine_bad_data",
                &[
                    ("table", json!("orders")),
                    ("column", json!("status")),
                    ("value", json!("corrupted")),
                ],
            ),
            rule(
                "chaos:orphaned_records",
                "quarantine_bad_data",
                &[
                    ("table", json!("order_items")),
                    ("column", json!("product")),
                    ("value", json!("orphan_probe")),
                ],
            ),
        ])
    }
}

/// Outcome of one remediation attempt. `Failed` implies the incident was
/// escalated to a human.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum RemediationOutcome {
    NoMatch,
    UnknownAction { action: String },
    Succeeded { action: String, detail: String },
    Failed { action: String, detail: String },
}

/// One line of the batch report produced by `remediate_open_incidents`.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct AttemptReport {
    pub incident_id: i64,
    pub outcome: RemediationOutcome,
}

pub struct RemediationEngine {
    store: Arc<Store>,
    incidents: IncidentManager,
    rules: RuleSet,
    registry: ActionRegistry,
}

impl RemediationEngine {
    pub fn new(
        store: Arc<Store>,
        incidents: IncidentManager,
        rules: RuleSet,
        registry: ActionRegistry,
    ) -> Self {
        Self {
            store,
            incidents,
            rules,
            registry,
        }
    }

    pub fn with_defaults(store: Arc<Store>, incidents: IncidentManager) -> Self {
        Self::new(
            store,
            incidents,
            RuleSet::default_rules(),
            ActionRegistry::builtin(),
        )
    }

    /// Try to auto-remediate a single incident.
    ///
    /// The incident moves to `remediating` before the action runs so an
    /// observer sees work-in-progress even if the action stalls. The
    /// attempt is appended to the remediation log whatever the result. A
    /// connectivity-class error from the action propagates to the caller
    /// and leaves the incident in `remediating`; the escalation sweep is
    /// the recovery path for that case.
    pub fn attempt_remediation(&self, incident: &Incident) -> Result<RemediationOutcome, AppError> {
        let Some(rule) = self.rules.first_match(&incident.incident_type) else {
            info!(
                incident_id = incident.id,
                incident_type = %incident.incident_type,
                "no remediation pattern for incident type"
            );
            return Ok(RemediationOutcome::NoMatch);
        };

        let Some(action) = self.registry.get(&rule.action) else {
            error!(action = %rule.action, "unknown remediation action");
            return Ok(RemediationOutcome::UnknownAction {
                action: rule.action.clone(),
            });
        };

        self.incidents
            .update_status(incident.id, IncidentStatus::Remediating, None)?;

        info!(
            incident_id = incident.id,
            action = %rule.action,
            "executing remediation action"
        );
        let result = match action(&self.store, &rule.params) {
            Ok(r) => r,
            Err(e) => {
                self.log_attempt(incident.id, &rule.action, false, &format!("action error: {e}"));
                return Err(e);
            }
        };

        self.log_attempt(incident.id, &rule.action, result.success, &result.detail);

        if result.success {
            self.incidents
                .update_status(incident.id, IncidentStatus::Resolved, Some("auto"))?;
            Ok(RemediationOutcome::Succeeded {
                action: rule.action.clone(),
                detail: result.detail,
            })
        } else {
            self.incidents
                .update_status(incident.id, IncidentStatus::Escalated, None)?;
            Ok(RemediationOutcome::Failed {
                action: rule.action.clone(),
                detail: result.detail,
            })
        }
    }

    /// Attempt remediation for every open incident in `detected` or
    /// `investigating`. Incidents already `remediating` are skipped so an
    /// in-flight action is never double-dispatched. Each incident is
    /// handled in isolation: one erroring attempt does not abort the rest.
    pub fn remediate_open_incidents(&self) -> Result<Vec<AttemptReport>, AppError> {
        let open = self.incidents.list_open()?;
        let mut reports = Vec::new();
        for incident in open {
            if !matches!(
                incident.status,
                IncidentStatus::Detected | IncidentStatus::Investigating
            ) {
                continue;
            }
            match self.attempt_remediation(&incident) {
                Ok(outcome) => reports.push(AttemptReport {
                    incident_id: incident.id,
                    outcome,
                }),
                Err(e) => {
                    error!(incident_id = incident.id, error = %e, "remediation attempt errored");
                }
            }
        }
        Ok(reports)
    }

    fn log_attempt(&self, incident_id: i64, action_name: &str, success: bool, detail: &str) {
        let success_flag = i64::from(success);
        if let Err(e) = self.store.execute(
            "INSERT INTO remediation_log (incident_id, action_name, success, detail) \
             VALUES (?1, ?2, ?3, ?4)",
            &[&incident_id, &action_name, &success_flag, &detail],
        ) {
            warn!(incident_id, error = %e, "failed to log remediation attempt");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn first_match_wins_over_later_rules() {
        let rules = RuleSet::new(vec![
            RemediationRule {
                pattern: "blocking".into(),
                action: "first".into(),
                params: ActionParams::new(),
            },
            RemediationRule {
                pattern: "block".into(),
                action: "second".into(),
                params: ActionParams::new(),
            },
        ]);
        assert_eq!(rules.first_match("blocking_chain").unwrap().action, "first");
    }

    #[test]
    fn matching_is_case_sensitive_containment() {
        let rules = RuleSet::default_rules();
        assert!(rules.first_match("chaos:job_failure").is_some());
        assert!(rules.first_match("CHAOS:JOB_FAILURE").is_none());
        assert!(rules.first_match("cpu").is_none());
    }

    #[test]
    fn default_rules_reference_registered_actions() {
        let registry = ActionRegistry::builtin();
        for rule in &RuleSet::default_rules().rules {
            assert!(
                registry.get(&rule.action).is_some(),
                "unregistered action {}",
                rule.action
            );
        }
    }

    #[test]
    fn rules_deserialize_from_config_shape() {
        let rule: RemediationRule = toml::from_str(
            r#"
            pattern = "blocking"
            action = "cleanup_stale_sessions"
            [params]
            idle_minutes = 10
            "#,
        )
        .unwrap();
        assert_eq!(rule.params.get("idle_minutes"), Some(&json!(10)));
    }
}
