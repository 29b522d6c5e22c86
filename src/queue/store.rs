//! Synchronous SQL for the work queue.
//!
//! Every function here either runs inside a caller-supplied transaction or
//! opens its own `BEGIN IMMEDIATE` transaction, so a crash leaves either the
//! old or the new state and two drivers never both own a task.

use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use ratchet_common::{
    Checkpoint, NewTask, Task, TaskStatus, Transition, ValidationError, Verdict, session_key,
};
use rusqlite::{OptionalExtension, Row, Transaction, TransactionBehavior, params};
use tracing::debug;

use super::graph::DependencyGraph;
use super::{StatusChange, StatusCounts};
use crate::db::{Database, millis_to_datetime, now_millis};
use crate::errors::{QueueError, StoreError};

const TASK_COLUMNS: &str = "seq, id, description, status, priority, dependencies, retry_count, \
     iteration_budget, completion_sentinel, session_ref, owner, lease_expires_at, status_reason, \
     created_at, updated_at";

const CHECKPOINT_COLUMNS: &str =
    "id, task_id, iteration, transition, verdict, reason, recoverable, created_at";

/// Highest-priority pending task whose dependencies are all completed.
/// Completed dependencies may already be archived.
const READY_SQL: &str = "
    SELECT t.id FROM tasks t
    WHERE t.status = 'pending'
      AND NOT EXISTS (
          SELECT 1 FROM json_each(t.dependencies) d
          WHERE NOT EXISTS (SELECT 1 FROM tasks c WHERE c.id = d.value AND c.status = 'completed')
            AND NOT EXISTS (SELECT 1 FROM archived_tasks a WHERE a.id = d.value AND a.status = 'completed')
      )
    ORDER BY t.priority DESC, t.seq ASC
    LIMIT 1";

/// A guarded status change. The UPDATE only applies when the row is still in
/// `from` (and, when `expected_owner` is set, still owned by that driver).
pub(crate) struct StatusUpdate<'a> {
    pub id: &'a str,
    pub from: TaskStatus,
    pub to: TaskStatus,
    pub expected_owner: Option<&'a str>,
    pub new_owner: Option<&'a str>,
    pub lease_expires_at: Option<i64>,
    pub reason: Option<&'a str>,
    pub retry_count: Option<u32>,
}

impl<'a> StatusUpdate<'a> {
    pub fn new(id: &'a str, from: TaskStatus, to: TaskStatus) -> Self {
        Self {
            id,
            from,
            to,
            expected_owner: None,
            new_owner: None,
            lease_expires_at: None,
            reason: None,
            retry_count: None,
        }
    }

    pub fn owned_by(mut self, owner: &'a str) -> Self {
        self.expected_owner = Some(owner);
        self
    }

    pub fn reason(mut self, reason: Option<&'a str>) -> Self {
        self.reason = reason;
        self
    }
}

impl Database {
    pub fn enqueue(&mut self, new: &NewTask) -> Result<Task, QueueError> {
        new.validate()?;
        let deps = new.unique_dependencies();

        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)?;

        let exists: bool = tx.query_row(
            "SELECT EXISTS(SELECT 1 FROM tasks WHERE id = ?1)
                 OR EXISTS(SELECT 1 FROM archived_tasks WHERE id = ?1)",
            params![new.id],
            |row| row.get(0),
        )?;
        if exists {
            return Err(ValidationError::DuplicateId { id: new.id.clone() }.into());
        }

        let mut graph = load_graph(&tx)?;
        graph.add(&new.id, &deps);
        graph.validate_acyclic()?;

        let now = Utc::now();
        tx.execute(
            "INSERT INTO tasks (id, description, status, priority, dependencies, retry_count,
                 iteration_budget, completion_sentinel, session_ref, created_at, updated_at)
             VALUES (?1, ?2, 'pending', ?3, ?4, 0, ?5, ?6, ?7, ?8, ?8)",
            params![
                new.id,
                new.description,
                new.priority,
                serde_json::to_string(&deps)?,
                new.iteration_budget,
                new.completion_sentinel,
                session_key(&new.id),
                now,
            ],
        )?;
        let task = require_task(&tx, &new.id)?;
        tx.commit()?;
        debug!(task_id = %task.id, seq = task.seq, "enqueued task");
        Ok(task)
    }

    pub fn dequeue_ready(
        &mut self,
        owner: &str,
        ceiling: usize,
        lease: Duration,
    ) -> Result<Option<Task>, QueueError> {
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)?;

        let in_progress: i64 = tx.query_row(
            "SELECT COUNT(*) FROM tasks WHERE status = 'in_progress'",
            [],
            |row| row.get(0),
        )?;
        if in_progress >= ceiling as i64 {
            debug!(in_progress, ceiling, "concurrency ceiling reached");
            return Ok(None);
        }

        let Some(id) = tx
            .query_row(READY_SQL, [], |row| row.get::<_, String>(0))
            .optional()?
        else {
            return Ok(None);
        };

        let changed = tx.execute(
            "UPDATE tasks SET status = 'in_progress', owner = ?1, lease_expires_at = ?2,
                 status_reason = NULL, updated_at = ?3
             WHERE id = ?4 AND status = 'pending'",
            params![owner, lease_deadline(lease), Utc::now(), id],
        )?;
        if changed != 1 {
            return Ok(None);
        }
        let task = require_task(&tx, &id)?;
        tx.commit()?;
        Ok(Some(task))
    }

    /// Take ownership of an in-progress task nobody holds (after an OVERRIDE
    /// resolution or a reaped lease).
    pub fn claim_resumed(
        &mut self,
        owner: &str,
        lease: Duration,
    ) -> Result<Option<Task>, QueueError> {
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)?;
        let Some(id) = tx
            .query_row(
                "SELECT id FROM tasks WHERE status = 'in_progress' AND owner IS NULL
                 ORDER BY priority DESC, seq ASC LIMIT 1",
                [],
                |row| row.get::<_, String>(0),
            )
            .optional()?
        else {
            return Ok(None);
        };
        let changed = tx.execute(
            "UPDATE tasks SET owner = ?1, lease_expires_at = ?2, updated_at = ?3
             WHERE id = ?4 AND status = 'in_progress' AND owner IS NULL",
            params![owner, lease_deadline(lease), Utc::now(), id],
        )?;
        if changed != 1 {
            return Ok(None);
        }
        let task = require_task(&tx, &id)?;
        tx.commit()?;
        Ok(Some(task))
    }

    /// Append a checkpoint and apply its status change atomically.
    pub fn record_transition(
        &mut self,
        owner: &str,
        checkpoint: &Checkpoint,
        change: &StatusChange,
        lease: Duration,
    ) -> Result<Task, QueueError> {
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)?;
        let task = apply_transition(&tx, owner, checkpoint, change, lease)?;
        tx.commit()?;
        Ok(task)
    }

    /// Append a checkpoint without touching the task's status.
    pub fn record_checkpoint(&mut self, checkpoint: &Checkpoint) -> Result<(), QueueError> {
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)?;
        let task = require_task(&tx, &checkpoint.task_id)?;
        if checkpoint.iteration > task.iteration_budget {
            return Err(QueueError::BudgetExceeded {
                id: task.id,
                budget: task.iteration_budget,
            });
        }
        insert_checkpoint(&tx, checkpoint)?;
        tx.commit()?;
        Ok(())
    }

    /// Run a single guarded status UPDATE in its own transaction.
    pub(crate) fn set_status(&mut self, update: &StatusUpdate<'_>) -> Result<Task, QueueError> {
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)?;
        let task = update_status(&tx, update)?;
        tx.commit()?;
        Ok(task)
    }

    pub fn renew_lease(
        &mut self,
        id: &str,
        owner: &str,
        lease: Duration,
    ) -> Result<bool, QueueError> {
        let changed = self.conn.execute(
            "UPDATE tasks SET lease_expires_at = ?1
             WHERE id = ?2 AND owner = ?3 AND status = 'in_progress'",
            params![lease_deadline(lease), id, owner],
        )?;
        Ok(changed == 1)
    }

    /// Clear the owner of every in-progress task whose lease has lapsed.
    /// The status stays `in_progress` so the task can only be picked up again
    /// through `claim_resumed`.
    pub fn reap_expired_leases(&mut self) -> Result<Vec<String>, QueueError> {
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)?;
        let now = now_millis();
        let ids: Vec<String> = {
            let mut stmt = tx.prepare(
                "SELECT id FROM tasks
                 WHERE status = 'in_progress' AND owner IS NOT NULL AND lease_expires_at < ?1",
            )?;
            let rows = stmt.query_map(params![now], |row| row.get(0))?;
            rows.collect::<Result<_, _>>()?
        };
        tx.execute(
            "UPDATE tasks SET owner = NULL, lease_expires_at = NULL
             WHERE status = 'in_progress' AND owner IS NOT NULL AND lease_expires_at < ?1",
            params![now],
        )?;
        tx.commit()?;
        Ok(ids)
    }

    pub fn get_task(&self, id: &str) -> Result<Option<Task>, QueueError> {
        if let Some(task) = query_task(&self.conn, "tasks", id)? {
            return Ok(Some(task));
        }
        query_task(&self.conn, "archived_tasks", id)
    }

    pub fn list_tasks(&self, status: Option<TaskStatus>) -> Result<Vec<Task>, QueueError> {
        let sql = format!(
            "SELECT {} FROM tasks WHERE (?1 IS NULL OR status = ?1) ORDER BY priority DESC, seq ASC",
            TASK_COLUMNS
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(params![status.map(|s| s.as_str())], read_task_row)?;
        let mut tasks = Vec::new();
        for row in rows {
            tasks.push(row?.into_task()?);
        }
        Ok(tasks)
    }

    pub fn list_archived_tasks(&self) -> Result<Vec<Task>, QueueError> {
        let sql = format!("SELECT {} FROM archived_tasks ORDER BY seq ASC", TASK_COLUMNS);
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map([], read_task_row)?;
        let mut tasks = Vec::new();
        for row in rows {
            tasks.push(row?.into_task()?);
        }
        Ok(tasks)
    }

    /// The full checkpoint stream of a task, including archived entries, in
    /// write order.
    pub fn checkpoints(&self, task_id: &str) -> Result<Vec<Checkpoint>, QueueError> {
        let sql = format!(
            "SELECT {cols} FROM checkpoints WHERE task_id = ?1
             UNION ALL
             SELECT {cols} FROM archived_checkpoints WHERE task_id = ?1
             ORDER BY id ASC",
            cols = CHECKPOINT_COLUMNS
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(params![task_id], read_checkpoint_row)?;
        let mut checkpoints = Vec::new();
        for row in rows {
            checkpoints.push(row?.into_checkpoint()?);
        }
        Ok(checkpoints)
    }

    pub fn last_checkpoint(&self, task_id: &str) -> Result<Option<Checkpoint>, QueueError> {
        let sql = format!(
            "SELECT {} FROM checkpoints WHERE task_id = ?1 ORDER BY id DESC LIMIT 1",
            CHECKPOINT_COLUMNS
        );
        let row = self
            .conn
            .query_row(&sql, params![task_id], read_checkpoint_row)
            .optional()?;
        Ok(row.map(CheckpointRow::into_checkpoint).transpose()?)
    }

    pub fn status_counts(&self) -> Result<StatusCounts, QueueError> {
        let mut counts = StatusCounts::default();
        let mut stmt = self
            .conn
            .prepare("SELECT status, COUNT(*) FROM tasks GROUP BY status")?;
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
        })?;
        for row in rows {
            let (status, n) = row?;
            let n = n as usize;
            match parse_status(&status)? {
                TaskStatus::Pending => counts.pending = n,
                TaskStatus::InProgress => counts.in_progress = n,
                TaskStatus::Blocked => counts.blocked = n,
                TaskStatus::Completed => counts.completed = n,
                TaskStatus::Failed => counts.failed = n,
            }
        }
        counts.archived = self
            .conn
            .query_row("SELECT COUNT(*) FROM archived_tasks", [], |row| {
                row.get::<_, i64>(0)
            })? as usize;
        Ok(counts)
    }

    /// Move a terminal task and its checkpoint stream into the archive tables.
    pub fn archive_task(&mut self, id: &str) -> Result<Task, QueueError> {
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)?;
        let task = require_task(&tx, id)?;
        if !task.status.is_terminal() {
            return Err(QueueError::NotTerminal {
                id: task.id,
                status: task.status,
            });
        }
        let now = Utc::now();
        tx.execute(
            &format!(
                "INSERT INTO archived_tasks ({cols}, archived_at)
                 SELECT {cols}, ?2 FROM tasks WHERE id = ?1",
                cols = TASK_COLUMNS
            ),
            params![id, now],
        )?;
        tx.execute(
            &format!(
                "INSERT INTO archived_checkpoints ({cols}, archived_at)
                 SELECT {cols}, ?2 FROM checkpoints WHERE task_id = ?1",
                cols = CHECKPOINT_COLUMNS
            ),
            params![id, now],
        )?;
        tx.execute("DELETE FROM checkpoints WHERE task_id = ?1", params![id])?;
        tx.execute("DELETE FROM tasks WHERE id = ?1", params![id])?;
        tx.commit()?;
        debug!(task_id = %id, "archived task");
        Ok(task)
    }
}

/// Checkpoint + status change + retry_count, inside the caller's transaction.
pub(crate) fn apply_transition(
    tx: &Transaction<'_>,
    owner: &str,
    checkpoint: &Checkpoint,
    change: &StatusChange,
    lease: Duration,
) -> Result<Task, QueueError> {
    let task = require_task(tx, &checkpoint.task_id)?;
    if checkpoint.iteration > task.iteration_budget {
        return Err(QueueError::BudgetExceeded {
            id: task.id,
            budget: task.iteration_budget,
        });
    }

    let to = change.target();
    let mut update = StatusUpdate::new(&task.id, TaskStatus::InProgress, to)
        .owned_by(owner)
        .reason(change.reason());
    update.retry_count = Some(checkpoint.iteration);
    if let StatusChange::Continue = change {
        update.new_owner = Some(owner);
        update.lease_expires_at = Some(lease_deadline(lease));
    }

    if task.status != TaskStatus::InProgress {
        return Err(QueueError::InvalidTransition {
            id: task.id.clone(),
            from: task.status,
            to,
        });
    }
    if task.owner.as_deref() != Some(owner) {
        return Err(QueueError::NotOwner {
            id: task.id.clone(),
            owner: owner.to_string(),
        });
    }
    insert_checkpoint(tx, checkpoint)?;
    update_status(tx, &update)
}

pub(crate) fn update_status(
    tx: &Transaction<'_>,
    update: &StatusUpdate<'_>,
) -> Result<Task, QueueError> {
    if update.from != update.to && !update.from.can_transition_to(update.to) {
        return Err(QueueError::InvalidTransition {
            id: update.id.to_string(),
            from: update.from,
            to: update.to,
        });
    }
    let changed = tx.execute(
        "UPDATE tasks SET status = ?1, owner = ?2, lease_expires_at = ?3, status_reason = ?4,
             retry_count = MAX(retry_count, COALESCE(?5, retry_count)), updated_at = ?6
         WHERE id = ?7 AND status = ?8 AND (?9 IS NULL OR owner = ?9)",
        params![
            update.to.as_str(),
            update.new_owner,
            update.lease_expires_at,
            update.reason,
            update.retry_count,
            Utc::now(),
            update.id,
            update.from.as_str(),
            update.expected_owner,
        ],
    )?;
    if changed == 1 {
        return require_task(tx, update.id);
    }

    // The guard did not match; report why.
    let current = require_task(tx, update.id)?;
    if current.status != update.from {
        return Err(QueueError::InvalidTransition {
            id: current.id,
            from: current.status,
            to: update.to,
        });
    }
    Err(QueueError::NotOwner {
        id: current.id,
        owner: update.expected_owner.unwrap_or_default().to_string(),
    })
}

pub(crate) fn insert_checkpoint(
    tx: &Transaction<'_>,
    checkpoint: &Checkpoint,
) -> Result<(), QueueError> {
    let verdict = checkpoint
        .verdict
        .as_ref()
        .map(serde_json::to_string)
        .transpose()?;
    tx.execute(
        "INSERT INTO checkpoints (task_id, iteration, transition, verdict, reason, recoverable, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            checkpoint.task_id,
            checkpoint.iteration,
            checkpoint.transition.as_str(),
            verdict,
            checkpoint.reason,
            checkpoint.recoverable,
            checkpoint.timestamp,
        ],
    )?;
    Ok(())
}

pub(crate) fn require_task(tx: &rusqlite::Connection, id: &str) -> Result<Task, QueueError> {
    query_task(tx, "tasks", id)?.ok_or_else(|| QueueError::NotFound { id: id.to_string() })
}

fn query_task(
    conn: &rusqlite::Connection,
    table: &str,
    id: &str,
) -> Result<Option<Task>, QueueError> {
    let sql = format!("SELECT {} FROM {} WHERE id = ?1", TASK_COLUMNS, table);
    let row = conn.query_row(&sql, params![id], read_task_row).optional()?;
    Ok(row.map(TaskRow::into_task).transpose()?)
}

/// Active tasks only. Archived tasks are terminal and never run again, so
/// an edge through one cannot hold up live work in a cycle.
fn load_graph(conn: &rusqlite::Connection) -> Result<DependencyGraph, QueueError> {
    let mut stmt = conn.prepare("SELECT id, dependencies FROM tasks ORDER BY seq")?;
    let rows = stmt.query_map([], |row| {
        Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
    })?;
    let mut graph = DependencyGraph::new();
    for row in rows {
        let (id, deps) = row?;
        let deps: Vec<String> = serde_json::from_str(&deps)?;
        graph.add(&id, &deps);
    }
    Ok(graph)
}

fn lease_deadline(lease: Duration) -> i64 {
    now_millis().saturating_add(lease.as_millis() as i64)
}

fn parse_status(s: &str) -> Result<TaskStatus, StoreError> {
    TaskStatus::from_str(s).map_err(StoreError::Corrupt)
}

/// Intermediate row struct for reading tasks before converting the status and
/// dependency columns into typed values.
struct TaskRow {
    seq: i64,
    id: String,
    description: String,
    status: String,
    priority: i64,
    dependencies: String,
    retry_count: u32,
    iteration_budget: u32,
    completion_sentinel: String,
    session_ref: String,
    owner: Option<String>,
    lease_expires_at: Option<i64>,
    status_reason: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

fn read_task_row(row: &Row<'_>) -> rusqlite::Result<TaskRow> {
    Ok(TaskRow {
        seq: row.get(0)?,
        id: row.get(1)?,
        description: row.get(2)?,
        status: row.get(3)?,
        priority: row.get(4)?,
        dependencies: row.get(5)?,
        retry_count: row.get(6)?,
        iteration_budget: row.get(7)?,
        completion_sentinel: row.get(8)?,
        session_ref: row.get(9)?,
        owner: row.get(10)?,
        lease_expires_at: row.get(11)?,
        status_reason: row.get(12)?,
        created_at: row.get(13)?,
        updated_at: row.get(14)?,
    })
}

impl TaskRow {
    fn into_task(self) -> Result<Task, StoreError> {
        Ok(Task {
            status: parse_status(&self.status)?,
            dependencies: serde_json::from_str(&self.dependencies)?,
            lease_expires_at: self.lease_expires_at.map(millis_to_datetime).transpose()?,
            id: self.id,
            description: self.description,
            priority: self.priority,
            retry_count: self.retry_count,
            iteration_budget: self.iteration_budget,
            completion_sentinel: self.completion_sentinel,
            session_ref: self.session_ref,
            owner: self.owner,
            status_reason: self.status_reason,
            seq: self.seq,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

struct CheckpointRow {
    task_id: String,
    iteration: u32,
    transition: String,
    verdict: Option<String>,
    reason: Option<String>,
    recoverable: bool,
    created_at: DateTime<Utc>,
}

fn read_checkpoint_row(row: &Row<'_>) -> rusqlite::Result<CheckpointRow> {
    Ok(CheckpointRow {
        task_id: row.get(1)?,
        iteration: row.get(2)?,
        transition: row.get(3)?,
        verdict: row.get(4)?,
        reason: row.get(5)?,
        recoverable: row.get(6)?,
        created_at: row.get(7)?,
    })
}

impl CheckpointRow {
    fn into_checkpoint(self) -> Result<Checkpoint, StoreError> {
        let transition = Transition::from_str(&self.transition).map_err(StoreError::Corrupt)?;
        let verdict: Option<Verdict> = self
            .verdict
            .as_deref()
            .map(serde_json::from_str)
            .transpose()?;
        Ok(Checkpoint {
            task_id: self.task_id,
            iteration: self.iteration,
            transition,
            verdict,
            reason: self.reason,
            recoverable: self.recoverable,
            timestamp: self.created_at,
        })
    }
}
