//! Built-in remediation actions and the registry that names them.
//!
//! An action is a callable of shape `(store, params) -> ActionResult`.
//! Expected operational failures come back as `success: false`; an `Err`
//! is reserved for connectivity-class trouble and configuration defects.

use std::collections::BTreeMap;

use serde_json::Value;
use tracing::warn;

use crate::error::AppError;
use crate::store::{ProcParams, Store};

pub type ActionParams = serde_json::Map<String, Value>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActionResult {
    pub success: bool,
    pub detail: String,
}

pub type ActionFn = Box<dyn Fn(&Store, &ActionParams) -> Result<ActionResult, AppError> + Send + Sync>;

/// Closed, inspectable name -> implementation table. The engine refuses to
/// execute any action name not present here.
pub struct ActionRegistry {
    actions: BTreeMap<String, ActionFn>,
}

impl ActionRegistry {
    pub fn empty() -> Self {
        Self {
            actions: BTreeMap::new(),
        }
    }

    /// The four built-in remediation primitives.
    pub fn builtin() -> Self {
        let mut registry = Self::empty();
        registry.register("kill_blocking_session", Box::new(kill_blocking_session));
        registry.register("cleanup_stale_sessions", Box::new(cleanup_stale_sessions));
        registry.register("restart_failed_job", Box::new(restart_failed_job));
        registry.register("quarantine_bad_data", Box::new(quarantine_bad_data));
        registry
    }

    pub fn register(&mut self, name: impl Into<String>, action: ActionFn) {
        let name = name.into();
        if self.actions.insert(name.clone(), action).is_some() {
            warn!(action = %name, "remediation action re-registered");
        }
    }

    pub fn get(&self, name: &str) -> Option<&ActionFn> {
        self.actions.get(name)
    }

    pub fn names(&self) -> Vec<&str> {
        self.actions.keys().map(String::as_str).collect()
    }
}

fn kill_blocking_session(store: &Store, params: &ActionParams) -> Result<ActionResult, AppError> {
    let session_id = params
        .get("session_id")
        .and_then(Value::as_i64)
        .ok_or_else(|| {
            AppError::new("ACTION_BAD_PARAMS", "kill_blocking_session requires session_id")
        })?;

    let mut call = ProcParams::new();
    call.insert("session_id".into(), Value::from(session_id));
    let out = store.call_procedure("kill_session", &call)?;
    Ok(ActionResult {
        success: out.rows_affected > 0,
        detail: out.detail,
    })
}

fn cleanup_stale_sessions(store: &Store, params: &ActionParams) -> Result<ActionResult, AppError> {
    let idle_minutes = params.get("idle_minutes").and_then(Value::as_i64).unwrap_or(60);

    let mut call = ProcParams::new();
    call.insert("idle_minutes".into(), Value::from(idle_minutes));
    let out = store.call_procedure("cleanup_stale_sessions", &call)?;
    // Zero stale sessions is still a clean outcome.
    Ok(ActionResult {
        success: true,
        detail: format!("Cleaned up {} stale sessions", out.rows_affected),
    })
}

fn restart_failed_job(store: &Store, params: &ActionParams) -> Result<ActionResult, AppError> {
    let job_name = params
        .get("job_name")
        .and_then(Value::as_str)
        .ok_or_else(|| AppError::new("ACTION_BAD_PARAMS", "restart_failed_job requires job_name"))?;

    let mut call = ProcParams::new();
    call.insert("job_name".into(), Value::from(job_name));
    let out = store.call_procedure("restart_failed_job", &call)?;
    Ok(ActionResult {
        success: out.rows_affected > 0,
        detail: out.detail,
    })
}

fn quarantine_bad_data(store: &Store, params: &ActionParams) -> Result<ActionResult, AppError> {
    for key in ["table", "column", "value"] {
        if params.get(key).and_then(Value::as_str).is_none() {
            return Err(AppError::new(
                "ACTION_BAD_PARAMS",
                format!("quarantine_bad_data requires {key}"),
            ));
        }
    }

    let out = store.call_procedure("quarantine_rows", params)?;
    Ok(ActionResult {
        success: true,
        detail: out.detail,
    })
}
