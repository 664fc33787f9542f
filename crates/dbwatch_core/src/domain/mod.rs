use std::fmt;

use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSqlOutput, ValueRef};
use rusqlite::ToSql;
use serde::{Deserialize, Serialize};

use crate::error::AppError;

/// Incident severity. Stored as lowercase TEXT.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Info,
    Warning,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Info => "info",
            Severity::Warning => "warning",
            Severity::Critical => "critical",
        }
    }

    pub fn parse(s: &str) -> Result<Self, AppError> {
        match s {
            "info" => Ok(Severity::Info),
            "warning" => Ok(Severity::Warning),
            "critical" => Ok(Severity::Critical),
            other => Err(AppError::new(
                "SEVERITY_INVALID",
                format!("Invalid severity: {other}"),
            )),
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl ToSql for Severity {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(self.as_str().into())
    }
}

impl FromSql for Severity {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        let s = value.as_str()?;
        Severity::parse(s).map_err(|e| FromSqlError::Other(Box::new(e)))
    }
}

/// Incident lifecycle state.
///
/// Intended flow is detected -> investigating -> remediating -> resolved or
/// escalated, but `update_status` deliberately accepts any recognized target
/// from any current state (reopening a resolved incident included). The
/// only gate is that the target parses as one of these five.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum IncidentStatus {
    Detected,
    Investigating,
    Remediating,
    Resolved,
    Escalated,
}

impl IncidentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            IncidentStatus::Detected => "detected",
            IncidentStatus::Investigating => "investigating",
            IncidentStatus::Remediating => "remediating",
            IncidentStatus::Resolved => "resolved",
            IncidentStatus::Escalated => "escalated",
        }
    }

    pub fn parse(s: &str) -> Result<Self, AppError> {
        match s {
            "detected" => Ok(IncidentStatus::Detected),
            "investigating" => Ok(IncidentStatus::Investigating),
            "remediating" => Ok(IncidentStatus::Remediating),
            "resolved" => Ok(IncidentStatus::Resolved),
            "escalated" => Ok(IncidentStatus::Escalated),
            other => Err(AppError::new(
                "STATUS_INVALID",
                format!("Invalid status: {other}"),
            )),
        }
    }

    /// Terminal in intended use: no longer counted as open.
    pub fn is_closed(&self) -> bool {
        matches!(self, IncidentStatus::Resolved | IncidentStatus::Escalated)
    }
}

impl fmt::Display for IncidentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl ToSql for IncidentStatus {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(self.as_str().into())
    }
}

impl FromSql for IncidentStatus {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        let s = value.as_str()?;
        IncidentStatus::parse(s).map_err(|e| FromSqlError::Other(Box::new(e)))
    }
}

/// Persisted record of a detected operational problem and its lifecycle.
/// Never deleted; mutated only through the incident manager.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Incident {
    pub id: i64,
    pub incident_type: String,
    pub severity: Severity,
    pub status: IncidentStatus,
    pub title: String,
    pub description: Option<String>,
    pub dedup_key: Option<String>,
    pub metadata: Option<String>,
    pub detected_at: String,
    pub acknowledged_at: Option<String>,
    pub resolved_at: Option<String>,
    pub resolved_by: Option<String>,
    pub version: i64,
}

/// Append-only record of one remediation attempt. Never mutated.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RemediationLogEntry {
    pub id: i64,
    pub incident_id: i64,
    pub action_name: String,
    pub success: bool,
    pub detail: String,
    pub executed_at: String,
}

/// Auto-generated audit summary, created once when an incident first
/// resolves. `timeline` and `remediation` are JSON columns.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Postmortem {
    pub id: i64,
    pub incident_id: i64,
    pub summary: String,
    pub root_cause: String,
    pub timeline: String,
    pub remediation: String,
    pub lessons_learned: String,
    pub generated_at: String,
}

/// Postmortem joined with its parent incident for display.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PostmortemListItem {
    pub postmortem: Postmortem,
    pub incident_title: String,
    pub incident_type: String,
    pub severity: Severity,
}

/// One entry of a postmortem's reconstructed timeline.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TimelineEntry {
    pub time: String,
    pub event: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AlertLevel {
    Warning,
    Critical,
}

/// Minimal tuple contract every alert source produces.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Alert {
    pub metric: String,
    pub level: AlertLevel,
    pub value: f64,
    pub threshold: f64,
}
