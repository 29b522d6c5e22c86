//! SQL for decision requests and decisions.

use std::time::Duration;

use chrono::{DateTime, Utc};
use ratchet_common::{Actor, Checkpoint, Decision, DecisionKind, DecisionRequest, Task, TaskStatus};
use rusqlite::{OptionalExtension, Row, TransactionBehavior, params};

use crate::db::Database;
use crate::errors::{EscalationError, StoreError};
use crate::queue::StatusChange;
use crate::queue::store::{StatusUpdate, apply_transition, require_task, update_status};

const REQUEST_COLUMNS: &str =
    "id, task_id, reason, evidence, iteration, created_at, resolved_at, resolution";

const DECISION_COLUMNS: &str = "request_id, task_id, kind, actor, note, created_at";

impl Database {
    /// Block the task and persist its decision request, together with the
    /// ASK_HUMAN checkpoint, in one transaction.
    pub fn escalate(
        &mut self,
        owner: &str,
        checkpoint: &Checkpoint,
        reason: &str,
        evidence: &[String],
        lease: Duration,
    ) -> Result<(Task, DecisionRequest), EscalationError> {
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)?;
        let change = StatusChange::Block {
            reason: reason.to_string(),
        };
        let task = apply_transition(&tx, owner, checkpoint, &change, lease)?;

        let now = Utc::now();
        tx.execute(
            "INSERT INTO decision_requests (task_id, reason, evidence, iteration, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                task.id,
                reason,
                serde_json::to_string(evidence)?,
                checkpoint.iteration,
                now,
            ],
        )?;
        let request = DecisionRequest {
            id: tx.last_insert_rowid(),
            task_id: task.id.clone(),
            reason: reason.to_string(),
            evidence: evidence.to_vec(),
            iteration: checkpoint.iteration,
            created_at: now,
            resolved_at: None,
            resolution: None,
        };
        tx.commit()?;
        Ok((task, request))
    }

    /// Apply the single accepted resolution of `request_id`.
    ///
    /// The request is closed with a guarded `resolved_at IS NULL` update, so
    /// a racing second resolution sees zero rows and fails.
    pub fn resolve(
        &mut self,
        request_id: i64,
        kind: DecisionKind,
        actor: Actor,
        note: Option<&str>,
    ) -> Result<(DecisionRequest, Decision, Task), EscalationError> {
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)?;

        let mut request = query_request(&tx, request_id)?
            .ok_or(EscalationError::RequestNotFound { request_id })?;
        if !request.is_open() {
            return Err(EscalationError::AlreadyResolved { request_id });
        }

        let now = Utc::now();
        let changed = tx.execute(
            "UPDATE decision_requests SET resolved_at = ?1, resolution = ?2
             WHERE id = ?3 AND resolved_at IS NULL",
            params![now, kind.as_str(), request_id],
        )?;
        if changed == 0 {
            return Err(EscalationError::AlreadyResolved { request_id });
        }

        let task = require_task(&tx, &request.task_id)?;
        if task.status != TaskStatus::Blocked {
            return Err(EscalationError::NotBlocked {
                task_id: task.id,
                status: task.status,
            });
        }

        let status_reason = format!("{} ({})", kind.as_str().to_lowercase(), request.reason);
        let to = match kind {
            DecisionKind::Override => TaskStatus::InProgress,
            DecisionKind::Approve | DecisionKind::Abort => TaskStatus::Failed,
        };
        let reason = match kind {
            DecisionKind::Override => None,
            DecisionKind::Approve | DecisionKind::Abort => Some(status_reason.as_str()),
        };
        let update = StatusUpdate::new(&task.id, TaskStatus::Blocked, to).reason(reason);
        let task = update_status(&tx, &update)?;

        tx.execute(
            "INSERT INTO decisions (request_id, task_id, kind, actor, note, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![request_id, task.id, kind.as_str(), actor.as_str(), note, now],
        )?;
        tx.commit()?;

        request.resolved_at = Some(now);
        request.resolution = Some(kind);
        let decision = Decision {
            request_id,
            task_id: task.id.clone(),
            kind,
            actor,
            note: note.map(str::to_string),
            timestamp: now,
        };
        Ok((request, decision, task))
    }

    pub fn decision_request(&self, request_id: i64) -> Result<Option<DecisionRequest>, EscalationError> {
        query_request(&self.conn, request_id)
    }

    /// The unresolved request for a task, if any (at most one exists).
    pub fn open_request_for(&self, task_id: &str) -> Result<Option<DecisionRequest>, EscalationError> {
        let sql = format!(
            "SELECT {} FROM decision_requests WHERE task_id = ?1 AND resolved_at IS NULL",
            REQUEST_COLUMNS
        );
        let row = self
            .conn
            .query_row(&sql, params![task_id], read_request_row)
            .optional()?;
        Ok(row.map(RequestRow::into_request).transpose()?)
    }

    pub fn pending_requests(&self) -> Result<Vec<DecisionRequest>, EscalationError> {
        let sql = format!(
            "SELECT {} FROM decision_requests WHERE resolved_at IS NULL ORDER BY id",
            REQUEST_COLUMNS
        );
        self.collect_requests(&sql, params![])
    }

    pub fn requests_for(&self, task_id: &str) -> Result<Vec<DecisionRequest>, EscalationError> {
        let sql = format!(
            "SELECT {} FROM decision_requests WHERE task_id = ?1 ORDER BY id",
            REQUEST_COLUMNS
        );
        self.collect_requests(&sql, params![task_id])
    }

    fn collect_requests(
        &self,
        sql: &str,
        params: &[&dyn rusqlite::ToSql],
    ) -> Result<Vec<DecisionRequest>, EscalationError> {
        let mut stmt = self.conn.prepare(sql)?;
        let rows = stmt.query_map(params, read_request_row)?;
        let mut requests = Vec::new();
        for row in rows {
            requests.push(row?.into_request()?);
        }
        Ok(requests)
    }

    /// Decision trail for one task, or for every task when `task_id` is `None`.
    pub fn decisions(&self, task_id: Option<&str>) -> Result<Vec<Decision>, EscalationError> {
        let sql = format!(
            "SELECT {} FROM decisions WHERE (?1 IS NULL OR task_id = ?1) ORDER BY id",
            DECISION_COLUMNS
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(params![task_id], |row| {
            Ok(DecisionRow {
                request_id: row.get(0)?,
                task_id: row.get(1)?,
                kind: row.get(2)?,
                actor: row.get(3)?,
                note: row.get(4)?,
                created_at: row.get(5)?,
            })
        })?;
        let mut decisions = Vec::new();
        for row in rows {
            decisions.push(row?.into_decision()?);
        }
        Ok(decisions)
    }
}

fn query_request(
    conn: &rusqlite::Connection,
    request_id: i64,
) -> Result<Option<DecisionRequest>, EscalationError> {
    let sql = format!("SELECT {} FROM decision_requests WHERE id = ?1", REQUEST_COLUMNS);
    let row = conn
        .query_row(&sql, params![request_id], read_request_row)
        .optional()?;
    Ok(row.map(RequestRow::into_request).transpose()?)
}

struct RequestRow {
    id: i64,
    task_id: String,
    reason: String,
    evidence: String,
    iteration: u32,
    created_at: DateTime<Utc>,
    resolved_at: Option<DateTime<Utc>>,
    resolution: Option<String>,
}

fn read_request_row(row: &Row<'_>) -> rusqlite::Result<RequestRow> {
    Ok(RequestRow {
        id: row.get(0)?,
        task_id: row.get(1)?,
        reason: row.get(2)?,
        evidence: row.get(3)?,
        iteration: row.get(4)?,
        created_at: row.get(5)?,
        resolved_at: row.get(6)?,
        resolution: row.get(7)?,
    })
}

impl RequestRow {
    fn into_request(self) -> Result<DecisionRequest, StoreError> {
        let resolution = self
            .resolution
            .as_deref()
            .map(|s| s.parse::<DecisionKind>().map_err(StoreError::Corrupt))
            .transpose()?;
        Ok(DecisionRequest {
            id: self.id,
            task_id: self.task_id,
            reason: self.reason,
            evidence: serde_json::from_str(&self.evidence)?,
            iteration: self.iteration,
            created_at: self.created_at,
            resolved_at: self.resolved_at,
            resolution,
        })
    }
}

struct DecisionRow {
    request_id: i64,
    task_id: String,
    kind: String,
    actor: String,
    note: Option<String>,
    created_at: DateTime<Utc>,
}

impl DecisionRow {
    fn into_decision(self) -> Result<Decision, StoreError> {
        Ok(Decision {
            request_id: self.request_id,
            task_id: self.task_id,
            kind: self.kind.parse().map_err(StoreError::Corrupt)?,
            actor: self.actor.parse().map_err(StoreError::Corrupt)?,
            note: self.note,
            timestamp: self.created_at,
        })
    }
}
