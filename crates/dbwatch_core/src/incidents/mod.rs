//! Incident lifecycle: dedup-aware creation, guarded status transitions,
//! escalation sweep, postmortem generation, read projections.

use std::sync::Arc;

use rusqlite::{params, Connection, OptionalExtension, Row};
use serde_json::json;
use tracing::{error, info, warn};

use crate::domain::{
    Incident, IncidentStatus, Postmortem, PostmortemListItem, RemediationLogEntry, Severity,
    TimelineEntry,
};
use crate::error::AppError;
use crate::store::{now_utc, Store};

/// Request payload for `IncidentManager::create`.
#[derive(Debug, Clone)]
pub struct CreateIncident {
    pub incident_type: String,
    pub title: String,
    pub severity: Severity,
    pub description: Option<String>,
    pub dedup_key: Option<String>,
    pub metadata: Option<serde_json::Value>,
}

impl CreateIncident {
    pub fn new(
        incident_type: impl Into<String>,
        title: impl Into<String>,
        severity: Severity,
    ) -> Self {
        Self {
            incident_type: incident_type.into(),
            title: title.into(),
            severity,
            description: None,
            dedup_key: None,
            metadata: None,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn with_dedup_key(mut self, key: impl Into<String>) -> Self {
        self.dedup_key = Some(key.into());
        self
    }

    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = Some(metadata);
        self
    }
}

const UPDATE_MAX_ATTEMPTS: usize = 3;

#[derive(Clone)]
pub struct IncidentManager {
    store: Arc<Store>,
}

fn incident_from_row(row: &Row<'_>) -> rusqlite::Result<Incident> {
    Ok(Incident {
        id: row.get(0)?,
        incident_type: row.get(1)?,
        severity: row.get(2)?,
        status: row.get(3)?,
        title: row.get(4)?,
        description: row.get(5)?,
        dedup_key: row.get(6)?,
        metadata: row.get(7)?,
        detected_at: row.get(8)?,
        acknowledged_at: row.get(9)?,
        resolved_at: row.get(10)?,
        resolved_by: row.get(11)?,
        version: row.get(12)?,
    })
}

const INCIDENT_COLUMNS: &str = "id, incident_type, severity, status, title, description, \
     dedup_key, metadata, detected_at, acknowledged_at, resolved_at, resolved_by, version";

impl IncidentManager {
    pub fn new(store: Arc<Store>) -> Self {
        Self { store }
    }

    /// Create a new incident, collapsing onto an existing open one when the
    /// dedup key already has an incident whose status is not closed. The
    /// dedup check and the insert run under one lock so an alert storm
    /// cannot slip two inserts through.
    pub fn create(&self, req: CreateIncident) -> Result<Incident, AppError> {
        let metadata = match &req.metadata {
            Some(v) => Some(serde_json::to_string(v).map_err(|e| {
                AppError::new("METADATA_ENCODE_FAILED", "Failed to encode incident metadata")
                    .with_details(e.to_string())
            })?),
            None => None,
        };

        self.store.with_conn(|conn| {
            if let Some(key) = &req.dedup_key {
                if let Some(existing) = find_open_by_dedup(conn, key)? {
                    info!(
                        dedup_key = %key,
                        incident_id = existing.id,
                        "dedup: incident already open for key"
                    );
                    return Ok(existing);
                }
            }

            conn.execute(
                "INSERT INTO incidents \
                 (incident_type, severity, title, description, dedup_key, metadata) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    req.incident_type,
                    req.severity,
                    req.title,
                    req.description,
                    req.dedup_key,
                    metadata,
                ],
            )
            .map_err(|e| AppError::sql("DB_EXEC_FAILED", "Failed to insert incident", e))?;

            let id = conn.last_insert_rowid();
            let incident = get_by_id(conn, id)?.ok_or_else(|| {
                AppError::new("INCIDENT_NOT_FOUND", "Inserted incident row missing")
            })?;
            info!(
                incident_id = incident.id,
                incident_type = %incident.incident_type,
                severity = %incident.severity,
                "incident created"
            );
            Ok(incident)
        })
    }

    /// Transition an incident to a new status.
    ///
    /// Any recognized target is accepted from any current status, reopening
    /// included. The write is guarded by the optimistic version column:
    /// after a few conflicting attempts it fails with `INCIDENT_CONFLICT`
    /// instead of clobbering a concurrent transition.
    ///
    /// Entering `investigating` stamps `acknowledged_at`; entering
    /// `resolved` or `escalated` stamps `resolved_at` (and `resolved_by`
    /// when given); entering `resolved` generates the postmortem, once.
    pub fn update_status(
        &self,
        id: i64,
        new_status: IncidentStatus,
        resolved_by: Option<&str>,
    ) -> Result<Incident, AppError> {
        for _ in 0..UPDATE_MAX_ATTEMPTS {
            let current = self
                .get(id)?
                .ok_or_else(|| AppError::new("INCIDENT_NOT_FOUND", format!("No incident {id}")))?;
            let now = now_utc()?;

            let changed = self.store.with_conn(|conn| {
                let n = match new_status {
                    IncidentStatus::Investigating => conn.execute(
                        "UPDATE incidents SET status = ?1, acknowledged_at = ?2, version = version + 1 \
                         WHERE id = ?3 AND version = ?4",
                        params![new_status, now, id, current.version],
                    ),
                    IncidentStatus::Resolved | IncidentStatus::Escalated => conn.execute(
                        "UPDATE incidents SET status = ?1, resolved_at = ?2, \
                         resolved_by = COALESCE(?3, resolved_by), version = version + 1 \
                         WHERE id = ?4 AND version = ?5",
                        params![new_status, now, resolved_by, id, current.version],
                    ),
                    IncidentStatus::Detected | IncidentStatus::Remediating => conn.execute(
                        "UPDATE incidents SET status = ?1, version = version + 1 \
                         WHERE id = ?2 AND version = ?3",
                        params![new_status, id, current.version],
                    ),
                }
                .map_err(|e| AppError::sql("DB_EXEC_FAILED", "Failed to update incident", e))?;
                Ok(n == 1)
            })?;

            if changed {
                if new_status == IncidentStatus::Resolved {
                    // Best-effort: resolution stands even if this fails.
                    self.generate_postmortem(id);
                }
                return self.get(id)?.ok_or_else(|| {
                    AppError::new("INCIDENT_NOT_FOUND", format!("No incident {id}"))
                });
            }
            warn!(incident_id = id, "incident version conflict, retrying update");
        }

        Err(AppError::new(
            "INCIDENT_CONFLICT",
            format!("Concurrent update conflict for incident {id}"),
        ))
    }

    pub fn get(&self, id: i64) -> Result<Option<Incident>, AppError> {
        self.store.with_conn(|conn| get_by_id(conn, id))
    }

    /// All incidents whose status is not closed, newest detected first.
    pub fn list_open(&self) -> Result<Vec<Incident>, AppError> {
        self.store.with_conn(|conn| {
            query_incidents(
                conn,
                &format!(
                    "SELECT {INCIDENT_COLUMNS} FROM incidents \
                     WHERE status NOT IN ('resolved', 'escalated') \
                     ORDER BY detected_at DESC, id DESC"
                ),
                params![],
            )
        })
    }

    /// Recent incidents regardless of status, newest first, bounded.
    pub fn list_recent(&self, limit: i64) -> Result<Vec<Incident>, AppError> {
        self.store.with_conn(|conn| {
            query_incidents(
                conn,
                &format!(
                    "SELECT {INCIDENT_COLUMNS} FROM incidents \
                     ORDER BY detected_at DESC, id DESC LIMIT ?1"
                ),
                params![limit],
            )
        })
    }

    /// Forcibly escalate open incidents older than `timeout_seconds`.
    /// Idempotent within a cycle: escalated incidents no longer match the
    /// status filter, so a re-run is a no-op.
    pub fn check_escalations(&self, timeout_seconds: i64) -> Result<Vec<Incident>, AppError> {
        let stale = self.store.with_conn(|conn| {
            query_incidents(
                conn,
                &format!(
                    "SELECT {INCIDENT_COLUMNS} FROM incidents \
                     WHERE status IN ('detected', 'investigating', 'remediating') \
                     AND CAST(strftime('%s','now') AS INTEGER) - CAST(strftime('%s', detected_at) AS INTEGER) > ?1 \
                     ORDER BY detected_at ASC, id ASC"
                ),
                params![timeout_seconds],
            )
        })?;

        let mut escalated = Vec::new();
        for incident in stale {
            match self.update_status(incident.id, IncidentStatus::Escalated, Some("escalation_policy")) {
                Ok(updated) => {
                    warn!(
                        incident_id = updated.id,
                        timeout_seconds, "incident escalated: exceeded timeout"
                    );
                    escalated.push(updated);
                }
                Err(e) => {
                    // A racing transition closed it first; the sweep moves on.
                    warn!(incident_id = incident.id, error = %e, "escalation skipped");
                }
            }
        }
        Ok(escalated)
    }

    pub fn get_postmortem(&self, incident_id: i64) -> Result<Option<Postmortem>, AppError> {
        self.store.with_conn(|conn| {
            conn.query_row(
                "SELECT id, incident_id, summary, root_cause, timeline, remediation, \
                 lessons_learned, generated_at FROM postmortems WHERE incident_id = ?1",
                params![incident_id],
                postmortem_from_row,
            )
            .optional()
            .map_err(|e| AppError::sql("DB_QUERY_FAILED", "Failed to query postmortem", e))
        })
    }

    /// Recent postmortems joined with the parent incident for display.
    pub fn list_postmortems(&self, limit: i64) -> Result<Vec<PostmortemListItem>, AppError> {
        self.store.with_conn(|conn| {
            let mut stmt = conn
                .prepare(
                    "SELECT p.id, p.incident_id, p.summary, p.root_cause, p.timeline, \
                     p.remediation, p.lessons_learned, p.generated_at, \
                     i.title, i.incident_type, i.severity \
                     FROM postmortems p JOIN incidents i ON p.incident_id = i.id \
                     ORDER BY p.generated_at DESC, p.id DESC LIMIT ?1",
                )
                .map_err(|e| {
                    AppError::sql("DB_QUERY_FAILED", "Failed to prepare postmortems query", e)
                })?;

            let rows = stmt
                .query_map(params![limit], |row| {
                    Ok(PostmortemListItem {
                        postmortem: postmortem_from_row(row)?,
                        incident_title: row.get(8)?,
                        incident_type: row.get(9)?,
                        severity: row.get(10)?,
                    })
                })
                .map_err(|e| AppError::sql("DB_QUERY_FAILED", "Failed to query postmortems", e))?;

            let mut out = Vec::new();
            for r in rows {
                out.push(r.map_err(|e| {
                    AppError::sql("DB_QUERY_FAILED", "Failed to decode postmortem row", e)
                })?);
            }
            Ok(out)
        })
    }

    pub fn remediation_log(&self, incident_id: i64) -> Result<Vec<RemediationLogEntry>, AppError> {
        self.store.with_conn(|conn| {
            let mut stmt = conn
                .prepare(
                    "SELECT id, incident_id, action_name, success, detail, executed_at \
                     FROM remediation_log WHERE incident_id = ?1 \
                     ORDER BY executed_at ASC, id ASC",
                )
                .map_err(|e| {
                    AppError::sql("DB_QUERY_FAILED", "Failed to prepare remediation log query", e)
                })?;

            let rows = stmt
                .query_map(params![incident_id], |row| {
                    Ok(RemediationLogEntry {
                        id: row.get(0)?,
                        incident_id: row.get(1)?,
                        action_name: row.get(2)?,
                        success: row.get::<_, i64>(3)? != 0,
                        detail: row.get(4)?,
                        executed_at: row.get(5)?,
                    })
                })
                .map_err(|e| {
                    AppError::sql("DB_QUERY_FAILED", "Failed to query remediation log", e)
                })?;

            let mut out = Vec::new();
            for r in rows {
                out.push(r.map_err(|e| {
                    AppError::sql("DB_QUERY_FAILED", "Failed to decode remediation log row", e)
                })?);
            }
            Ok(out)
        })
    }

    /// Build and insert the postmortem for a freshly resolved incident.
    /// Insert failures are logged and swallowed; the UNIQUE constraint plus
    /// DO NOTHING make repeated resolves a no-op here.
    fn generate_postmortem(&self, incident_id: i64) {
        let result = self.try_generate_postmortem(incident_id);
        match result {
            Ok(true) => info!(incident_id, "postmortem generated"),
            Ok(false) => {}
            Err(e) => error!(incident_id, error = %e, "failed to generate postmortem"),
        }
    }

    fn try_generate_postmortem(&self, incident_id: i64) -> Result<bool, AppError> {
        let Some(incident) = self.get(incident_id)? else {
            return Ok(false);
        };
        let remediations = self.remediation_log(incident_id)?;

        let detected = incident.detected_at.clone();
        let resolved = incident.resolved_at.clone().unwrap_or_else(|| "unknown".into());
        let resolved_by = incident.resolved_by.clone().unwrap_or_else(|| "unknown".into());

        let mut timeline = vec![TimelineEntry {
            time: detected.clone(),
            event: format!("Incident detected: {}", incident.title),
        }];
        if let Some(ack) = &incident.acknowledged_at {
            timeline.push(TimelineEntry {
                time: ack.clone(),
                event: "Acknowledged".to_string(),
            });
        }
        for r in &remediations {
            let status = if r.success { "succeeded" } else { "failed" };
            timeline.push(TimelineEntry {
                time: r.executed_at.clone(),
                event: format!("Remediation '{}' {status}", r.action_name),
            });
        }
        timeline.push(TimelineEntry {
            time: resolved.clone(),
            event: format!("Resolved by {resolved_by}"),
        });

        let summary = format!(
            "{} incident ({}) - {}. Detected at {detected}, resolved at {resolved} \
             by {resolved_by}. {} remediation action(s) taken.",
            incident.incident_type,
            incident.severity,
            incident.title,
            remediations.len(),
        );
        let root_cause = incident
            .description
            .clone()
            .unwrap_or_else(|| "Investigation required".to_string());
        let timeline_json = serde_json::to_string(&timeline).map_err(|e| {
            AppError::new("POSTMORTEM_ENCODE_FAILED", "Failed to encode timeline")
                .with_details(e.to_string())
        })?;
        let remediation_json = serde_json::to_string(
            &remediations
                .iter()
                .map(|r| json!({"action": r.action_name, "success": r.success}))
                .collect::<Vec<_>>(),
        )
        .map_err(|e| {
            AppError::new("POSTMORTEM_ENCODE_FAILED", "Failed to encode remediation snapshot")
                .with_details(e.to_string())
        })?;

        let n = self.store.execute(
            "INSERT INTO postmortems \
             (incident_id, summary, root_cause, timeline, remediation, lessons_learned) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6) \
             ON CONFLICT(incident_id) DO NOTHING",
            &[
                &incident_id,
                &summary,
                &root_cause,
                &timeline_json,
                &remediation_json,
                &"Auto-generated postmortem. Review and update root cause and lessons learned.",
            ],
        )?;
        Ok(n == 1)
    }
}

fn find_open_by_dedup(conn: &Connection, dedup_key: &str) -> Result<Option<Incident>, AppError> {
    conn.query_row(
        &format!(
            "SELECT {INCIDENT_COLUMNS} FROM incidents \
             WHERE dedup_key = ?1 AND status NOT IN ('resolved', 'escalated') \
             ORDER BY id DESC LIMIT 1"
        ),
        params![dedup_key],
        incident_from_row,
    )
    .optional()
    .map_err(|e| AppError::sql("DB_QUERY_FAILED", "Failed to query incident by dedup key", e))
}

fn get_by_id(conn: &Connection, id: i64) -> Result<Option<Incident>, AppError> {
    conn.query_row(
        &format!("SELECT {INCIDENT_COLUMNS} FROM incidents WHERE id = ?1"),
        params![id],
        incident_from_row,
    )
    .optional()
    .map_err(|e| AppError::sql("DB_QUERY_FAILED", "Failed to query incident", e))
}

fn query_incidents(
    conn: &Connection,
    sql: &str,
    params: impl rusqlite::Params,
) -> Result<Vec<Incident>, AppError> {
    let mut stmt = conn
        .prepare(sql)
        .map_err(|e| AppError::sql("DB_QUERY_FAILED", "Failed to prepare incidents query", e))?;
    let rows = stmt
        .query_map(params, incident_from_row)
        .map_err(|e| AppError::sql("DB_QUERY_FAILED", "Failed to query incidents", e))?;

    let mut out = Vec::new();
    for r in rows {
        out.push(
            r.map_err(|e| AppError::sql("DB_QUERY_FAILED", "Failed to decode incident row", e))?,
        );
    }
    Ok(out)
}

fn postmortem_from_row(row: &Row<'_>) -> rusqlite::Result<Postmortem> {
    Ok(Postmortem {
        id: row.get(0)?,
        incident_id: row.get(1)?,
        summary: row.get(2)?,
        root_cause: row.get(3)?,
        timeline: row.get(4)?,
        remediation: row.get(5)?,
        lessons_learned: row.get(6)?,
        generated_at: row.get(7)?,
    })
}
