//! Built-in fault-injection scenarios. Each one plants a concrete fault in
//! the monitored workload that the monitor or a remediation rule can then
//! observe and act on.

use crate::domain::Severity;
use crate::error::AppError;
use crate::store::Store;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScenarioResult {
    /// Whether the scenario actually altered state. Only a triggered
    /// scenario opens an incident.
    pub triggered: bool,
    pub detail: String,
}

pub trait ChaosScenario: Send + Sync {
    fn name(&self) -> &'static str;
    fn description(&self) -> &'static str;
    fn severity(&self) -> Severity;
    fn execute(&self, store: &Store) -> Result<ScenarioResult, AppError>;
}

pub fn builtin_scenarios() -> Vec<Box<dyn ChaosScenario>> {
    vec![
        Box::new(SessionFlood),
        Box::new(JobFailure),
        Box::new(DataCorruption),
        Box::new(OrphanedRecords),
    ]
}

/// Piles up idle sessions with stale activity timestamps, the condition
/// `cleanup_stale_sessions` exists to clear.
pub struct SessionFlood;

impl ChaosScenario for SessionFlood {
    fn name(&self) -> &'static str {
        "session_flood"
    }

    fn description(&self) -> &'static str {
        "Registers 20 idle sessions with hours-old activity timestamps"
    }

    fn severity(&self) -> Severity {
        Severity::Critical
    }

    fn execute(&self, store: &Store) -> Result<ScenarioResult, AppError> {
        let mut opened = 0;
        for i in 0..20 {
            opened += store.execute(
                "INSERT INTO sessions (login_name, status, last_activity_at) \
                 VALUES ('chaos_flood_' || ?1, 'idle', strftime('%Y-%m-%dT%H:%M:%fZ','now','-2 hours'))",
                &[&i],
            )?;
        }
        Ok(ScenarioResult {
            triggered: opened > 0,
            detail: format!("{opened} stale sessions registered"),
        })
    }
}

/// Inserts a fake failed run record so the restart_failed_job remediation
/// path has something to retry.
pub struct JobFailure;

impl ChaosScenario for JobFailure {
    fn name(&self) -> &'static str {
        "job_failure"
    }

    fn description(&self) -> &'static str {
        "Inserts a fake failed job run record"
    }

    fn severity(&self) -> Severity {
        Severity::Warning
    }

    fn execute(&self, store: &Store) -> Result<ScenarioResult, AppError> {
        store.execute(
            "INSERT INTO job_runs (job_name, status, error_message, completed_at, duration_ms) \
             VALUES ('chaos_simulated_job', 'failed', 'simulated job failure: disk I/O timeout', \
                     strftime('%Y-%m-%dT%H:%M:%fZ','now'), 15000)",
            &[],
        )?;
        Ok(ScenarioResult {
            triggered: true,
            detail: "failed run recorded for 'chaos_simulated_job'".to_string(),
        })
    }
}

/// Plants rows with invalid values in the order data.
pub struct DataCorruption;

impl ChaosScenario for DataCorruption {
    fn name(&self) -> &'static str {
        "data_corruption"
    }

    fn description(&self) -> &'static str {
        "Inserts order rows with negative totals and zero-quantity items"
    }

    fn severity(&self) -> Severity {
        Severity::Critical
    }

    fn execute(&self, store: &Store) -> Result<ScenarioResult, AppError> {
        let mut corruptions = Vec::new();

        store.execute(
            "INSERT INTO orders (customer_id, total_amount, status) VALUES (1, -999.99, 'corrupted')",
            &[],
        )?;
        corruptions.push("negative order total (-999.99)");

        store.execute(
            "INSERT INTO order_items (order_id, product, quantity, unit_price) \
             VALUES (99999, 'chaos_item', 0, -1.0)",
            &[],
        )?;
        corruptions.push("zero-quantity item with negative price");

        Ok(ScenarioResult {
            triggered: true,
            detail: format!("corruptions injected: {}", corruptions.join(", ")),
        })
    }
}

/// Creates order items pointing at an order id that does not exist.
pub struct OrphanedRecords;

impl ChaosScenario for OrphanedRecords {
    fn name(&self) -> &'static str {
        "orphaned_records"
    }

    fn description(&self) -> &'static str {
        "Creates order items referencing a non-existent order"
    }

    fn severity(&self) -> Severity {
        Severity::Warning
    }

    fn execute(&self, store: &Store) -> Result<ScenarioResult, AppError> {
        store.execute(
            "INSERT INTO order_items (order_id, product, quantity, unit_price) \
             VALUES (88888, 'orphan_probe', 1, 10.0)",
            &[],
        )?;
        Ok(ScenarioResult {
            triggered: true,
            detail: "orphaned order_item created (order_id=88888 does not exist)".to_string(),
        })
    }
}
