//! Fault-injection engine: cooldown-gated triggering of chaos scenarios,
//! feeding resulting faults into the incident pipeline through the same
//! dedup-aware creation path as every other alert source.

use std::sync::Arc;
use std::time::Duration;

use rand::seq::SliceRandom;
use serde::Serialize;
use serde_json::json;
use tracing::info;

use crate::error::AppError;
use crate::incidents::{CreateIncident, IncidentManager};
use crate::store::Store;

pub mod cooldown;
pub mod scenarios;

pub use cooldown::CooldownTracker;
pub use scenarios::{builtin_scenarios, ChaosScenario, ScenarioResult};

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ScenarioInfo {
    pub name: String,
    pub description: String,
    pub severity: crate::domain::Severity,
    pub on_cooldown: bool,
    pub cooldown_remaining_s: u64,
}

/// Outcome of a trigger request. `OnCooldown` is neither a fault nor an
/// incident, just a refusal with the time left.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum TriggerOutcome {
    UnknownScenario {
        requested: String,
        available: Vec<String>,
    },
    OnCooldown {
        scenario: String,
        remaining_s: u64,
    },
    AllUnavailable,
    Fired {
        scenario: String,
        triggered: bool,
        detail: String,
        incident_id: Option<i64>,
    },
}

pub struct ChaosEngine {
    store: Arc<Store>,
    incidents: IncidentManager,
    cooldowns: CooldownTracker,
    cooldown_window: Duration,
    scenarios: Vec<Box<dyn ChaosScenario>>,
}

impl ChaosEngine {
    pub fn new(store: Arc<Store>, incidents: IncidentManager, cooldown_window: Duration) -> Self {
        Self {
            store,
            incidents,
            cooldowns: CooldownTracker::new(),
            cooldown_window,
            scenarios: builtin_scenarios(),
        }
    }

    /// Replace the built-in scenario set (tests use this to inject
    /// instrumented scenarios).
    pub fn with_scenarios(mut self, scenarios: Vec<Box<dyn ChaosScenario>>) -> Self {
        self.scenarios = scenarios;
        self
    }

    pub fn list_scenarios(&self) -> Vec<ScenarioInfo> {
        self.scenarios
            .iter()
            .map(|s| {
                let remaining = self.cooldowns.remaining(s.name());
                ScenarioInfo {
                    name: s.name().to_string(),
                    description: s.description().to_string(),
                    severity: s.severity(),
                    on_cooldown: remaining.is_some(),
                    cooldown_remaining_s: remaining.map(|d| d.as_secs()).unwrap_or(0),
                }
            })
            .collect()
    }

    /// Trigger a scenario by name. The cooldown clock is reset after
    /// execution no matter what the scenario reported; an incident is
    /// opened only when it actually altered state.
    pub fn trigger(&self, name: &str) -> Result<TriggerOutcome, AppError> {
        let Some(scenario) = self.scenarios.iter().find(|s| s.name() == name) else {
            return Ok(TriggerOutcome::UnknownScenario {
                requested: name.to_string(),
                available: self.scenarios.iter().map(|s| s.name().to_string()).collect(),
            });
        };

        if let Some(remaining) = self.cooldowns.remaining(name) {
            return Ok(TriggerOutcome::OnCooldown {
                scenario: name.to_string(),
                remaining_s: remaining.as_secs(),
            });
        }

        info!(scenario = name, "triggering chaos scenario");
        let executed = scenario.execute(&self.store);
        self.cooldowns.arm(name, self.cooldown_window);
        let result = executed?;

        let incident_id = if result.triggered {
            let incident = self.incidents.create(
                CreateIncident::new(
                    format!("chaos:{name}"),
                    format!("Chaos: {name}"),
                    scenario.severity(),
                )
                .with_description(result.detail.clone())
                .with_dedup_key(format!("chaos_{name}"))
                .with_metadata(json!({"chaos_scenario": name, "detail": result.detail})),
            )?;
            Some(incident.id)
        } else {
            None
        };

        Ok(TriggerOutcome::Fired {
            scenario: name.to_string(),
            triggered: result.triggered,
            detail: result.detail,
            incident_id,
        })
    }

    /// Trigger one scenario drawn uniformly from those off cooldown.
    pub fn trigger_random(&self) -> Result<TriggerOutcome, AppError> {
        let eligible: Vec<&str> = self
            .scenarios
            .iter()
            .map(|s| s.name())
            .filter(|name| self.cooldowns.remaining(name).is_none())
            .collect();

        let Some(chosen) = eligible.choose(&mut rand::thread_rng()) else {
            return Ok(TriggerOutcome::AllUnavailable);
        };
        self.trigger(chosen)
    }
}
