//! Task Ledger: durable records for background operations.
//!
//! Every asynchronous operation runs under a task row with a strict
//! status state machine (`queued -> in_progress -> {success,
//! completed_with_errors, failed, cancelled}`) and an append-only audit
//! trail. Derived timestamps (`started_at`, `completed_at`,
//! `cancelled_at`) are always computed from the trail, never stored
//! alongside the status, so the two cannot drift.
//!
//! Dispatch is two-phase: the task row commits first, the job is
//! enqueued after. A failed enqueue marks the task `failed` immediately
//! instead of leaving it `queued` forever.

use anyhow::Result;
use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use sqlx::{Row, SqlitePool};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio::task::AbortHandle;

use crate::error::WikiError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskStatus {
    Queued,
    InProgress,
    Success,
    CompletedWithErrors,
    Failed,
    Cancelled,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Queued => "queued",
            TaskStatus::InProgress => "in_progress",
            TaskStatus::Success => "success",
            TaskStatus::CompletedWithErrors => "completed_with_errors",
            TaskStatus::Failed => "failed",
            TaskStatus::Cancelled => "cancelled",
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            TaskStatus::Queued => "Queued",
            TaskStatus::InProgress => "In Progress",
            TaskStatus::Success => "Success",
            TaskStatus::CompletedWithErrors => "Completed with Errors",
            TaskStatus::Failed => "Failed",
            TaskStatus::Cancelled => "Cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<TaskStatus> {
        match s {
            "queued" => Some(TaskStatus::Queued),
            "in_progress" => Some(TaskStatus::InProgress),
            "success" => Some(TaskStatus::Success),
            "completed_with_errors" => Some(TaskStatus::CompletedWithErrors),
            "failed" => Some(TaskStatus::Failed),
            "cancelled" => Some(TaskStatus::Cancelled),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Success
                | TaskStatus::CompletedWithErrors
                | TaskStatus::Failed
                | TaskStatus::Cancelled
        )
    }

    pub fn can_cancel(&self) -> bool {
        matches!(self, TaskStatus::Queued | TaskStatus::InProgress)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuditEvent {
    Created,
    Started,
    Completed,
    CompletedWithErrors,
    Failed,
    Cancelled,
}

impl AuditEvent {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditEvent::Created => "created",
            AuditEvent::Started => "started",
            AuditEvent::Completed => "completed",
            AuditEvent::CompletedWithErrors => "completed_with_errors",
            AuditEvent::Failed => "failed",
            AuditEvent::Cancelled => "cancelled",
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            AuditEvent::Created => "Created",
            AuditEvent::Started => "Started",
            AuditEvent::Completed => "Completed",
            AuditEvent::CompletedWithErrors => "Completed with Errors",
            AuditEvent::Failed => "Failed",
            AuditEvent::Cancelled => "Cancelled",
        }
    }
}

const ADJECTIVES: &[&str] = &[
    "amber", "bold", "brisk", "calm", "clever", "copper", "crisp", "eager", "fuzzy", "gentle",
    "golden", "humble", "ivory", "jolly", "keen", "lively", "mellow", "nimble", "proud", "quiet",
    "rapid", "rustic", "silent", "steady", "swift", "vivid",
];

const NOUNS: &[&str] = &[
    "badger", "beacon", "canyon", "cedar", "comet", "falcon", "fjord", "glacier", "harbor",
    "heron", "lantern", "meadow", "orchid", "osprey", "pebble", "prairie", "raven", "reef",
    "sparrow", "summit", "thicket", "tundra", "walnut", "willow",
];

/// 12-character hexadecimal id.
pub fn generate_short_id() -> String {
    let bytes: [u8; 6] = rand::thread_rng().gen();
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

/// Random human-memorable label, e.g. `swift-falcon`.
pub fn generate_task_name() -> String {
    let mut rng = rand::thread_rng();
    let adjective = ADJECTIVES[rng.gen_range(0..ADJECTIVES.len())];
    let noun = NOUNS[rng.gen_range(0..NOUNS.len())];
    format!("{}-{}", adjective, noun)
}

fn now_micros() -> i64 {
    Utc::now().timestamp_micros()
}

fn micros_to_datetime(micros: i64) -> Option<DateTime<Utc>> {
    DateTime::from_timestamp_micros(micros)
}

#[derive(Debug, Clone)]
pub struct Task {
    pub id: String,
    pub name: String,
    pub status: TaskStatus,
    pub logs: String,
    pub job_id: Option<String>,
    pub task_type: String,
    pub task_args: serde_json::Value,
    pub total_items: Option<i64>,
    pub completed_items: i64,
    pub created_at: i64,
}

#[derive(Debug, Clone)]
pub struct TaskAuditEntry {
    pub id: String,
    pub task_id: String,
    pub event: AuditEvent,
    pub created_at: i64,
}

/// Snapshot consumed by a polling UI.
#[derive(Debug, Clone, Serialize)]
pub struct TaskSnapshot {
    pub id: String,
    pub name: String,
    pub status: String,
    pub status_label: String,
    pub logs: String,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub cancelled_at: Option<DateTime<Utc>>,
    pub duration_seconds: Option<f64>,
    pub can_cancel: bool,
    pub total_items: Option<i64>,
    pub completed_items: i64,
    pub progress_percent: Option<f64>,
}

/// Audit read model.
#[derive(Debug, Clone, Serialize)]
pub struct TaskAuditView {
    pub id: String,
    pub event: String,
    pub event_label: String,
    pub created_at: DateTime<Utc>,
}

fn row_to_task(row: &sqlx::sqlite::SqliteRow) -> Task {
    let status_str: String = row.get("status");
    let args_str: String = row.get("task_args");
    Task {
        id: row.get("id"),
        name: row.get("name"),
        status: TaskStatus::parse(&status_str).unwrap_or(TaskStatus::Failed),
        logs: row.get("logs"),
        job_id: row.get("job_id"),
        task_type: row.get("task_type"),
        task_args: serde_json::from_str(&args_str).unwrap_or(serde_json::Value::Null),
        total_items: row.get("total_items"),
        completed_items: row.get("completed_items"),
        created_at: row.get("created_at"),
    }
}

pub struct TaskLedger {
    pool: SqlitePool,
}

impl TaskLedger {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Create a task in `queued` with its `created` audit entry, both in
    /// one transaction.
    pub async fn create(
        &self,
        task_type: &str,
        task_args: &serde_json::Value,
        initial_logs: &str,
    ) -> Result<Task> {
        let id = generate_short_id();
        let name = generate_task_name();
        let created_at = now_micros();

        let mut tx = self.pool.begin().await?;
        sqlx::query(
            r#"
            INSERT INTO tasks (id, name, status, logs, task_type, task_args, created_at)
            VALUES (?, ?, 'queued', ?, ?, ?, ?)
            "#,
        )
        .bind(&id)
        .bind(&name)
        .bind(initial_logs)
        .bind(task_type)
        .bind(task_args.to_string())
        .bind(created_at)
        .execute(&mut *tx)
        .await?;

        sqlx::query("INSERT INTO task_audit (id, task_id, event, created_at) VALUES (?, ?, ?, ?)")
            .bind(generate_short_id())
            .bind(&id)
            .bind(AuditEvent::Created.as_str())
            .bind(created_at)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;

        self.get(&id)
            .await?
            .ok_or_else(|| anyhow::anyhow!("task {} vanished after create", id))
    }

    pub async fn get(&self, id: &str) -> Result<Option<Task>> {
        let row = sqlx::query("SELECT * FROM tasks WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.as_ref().map(row_to_task))
    }

    pub async fn list(&self, limit: i64) -> Result<Vec<Task>> {
        let rows = sqlx::query("SELECT * FROM tasks ORDER BY created_at DESC LIMIT ?")
            .bind(limit)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.iter().map(row_to_task).collect())
    }

    async fn status_of(&self, id: &str) -> Result<TaskStatus> {
        let task = self
            .get(id)
            .await?
            .ok_or_else(|| anyhow::anyhow!("unknown task: {}", id))?;
        Ok(task.status)
    }

    async fn transition(
        &self,
        id: &str,
        status: TaskStatus,
        event: AuditEvent,
        append: Option<&str>,
    ) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("UPDATE tasks SET status = ?, logs = logs || ? WHERE id = ?")
            .bind(status.as_str())
            .bind(append.unwrap_or(""))
            .bind(id)
            .execute(&mut *tx)
            .await?;

        sqlx::query("INSERT INTO task_audit (id, task_id, event, created_at) VALUES (?, ?, ?, ?)")
            .bind(generate_short_id())
            .bind(id)
            .bind(event.as_str())
            .bind(now_micros())
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(())
    }

    /// Mark the task as started.
    pub async fn start(&self, id: &str) -> Result<()> {
        let status = self.status_of(id).await?;
        if status.is_terminal() {
            return Err(WikiError::TerminalTask(id.to_string()).into());
        }
        self.transition(id, TaskStatus::InProgress, AuditEvent::Started, None)
            .await
    }

    /// Terminal transition. Logs are appended, never replaced.
    ///
    /// `success` + no errors -> `success`; `success` + errors ->
    /// `completed_with_errors`; failure -> `failed`. Completing a task
    /// that is already terminal is an orchestration bug and fails fast.
    pub async fn complete(
        &self,
        id: &str,
        success: bool,
        has_errors: bool,
        logs: &str,
    ) -> Result<()> {
        let status = self.status_of(id).await?;
        if status.is_terminal() {
            return Err(WikiError::TerminalTask(id.to_string()).into());
        }

        let (new_status, event) = if !success {
            (TaskStatus::Failed, AuditEvent::Failed)
        } else if has_errors {
            (TaskStatus::CompletedWithErrors, AuditEvent::CompletedWithErrors)
        } else {
            (TaskStatus::Success, AuditEvent::Completed)
        };

        self.transition(id, new_status, event, Some(logs)).await
    }

    /// Cancel a `queued` or `in_progress` task. The record flips
    /// immediately; terminating the underlying job is the caller's
    /// best-effort follow-up via [`JobQueue::abort`].
    pub async fn cancel(&self, id: &str) -> Result<Task> {
        let status = self.status_of(id).await?;
        if !status.can_cancel() {
            return Err(WikiError::TerminalTask(id.to_string()).into());
        }

        self.transition(
            id,
            TaskStatus::Cancelled,
            AuditEvent::Cancelled,
            Some("\n\nTask cancelled"),
        )
        .await?;

        self.get(id)
            .await?
            .ok_or_else(|| anyhow::anyhow!("unknown task: {}", id))
    }

    pub async fn append_logs(&self, id: &str, text: &str) -> Result<()> {
        sqlx::query("UPDATE tasks SET logs = logs || ? WHERE id = ?")
            .bind(text)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn set_progress(
        &self,
        id: &str,
        completed_items: i64,
        total_items: Option<i64>,
    ) -> Result<()> {
        sqlx::query("UPDATE tasks SET completed_items = ?, total_items = COALESCE(?, total_items) WHERE id = ?")
            .bind(completed_items)
            .bind(total_items)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn set_job_id(&self, id: &str, job_id: &str) -> Result<()> {
        sqlx::query("UPDATE tasks SET job_id = ? WHERE id = ?")
            .bind(job_id)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// First audit entry matching any of `events`, if present.
    async fn first_event_at(&self, id: &str, events: &[AuditEvent]) -> Result<Option<i64>> {
        let placeholders = vec!["?"; events.len()].join(", ");
        let sql = format!(
            "SELECT created_at FROM task_audit WHERE task_id = ? AND event IN ({}) ORDER BY created_at ASC LIMIT 1",
            placeholders
        );

        let mut query = sqlx::query_scalar(&sql).bind(id);
        for event in events {
            query = query.bind(event.as_str());
        }

        Ok(query.fetch_optional(&self.pool).await?)
    }

    pub async fn audit_trail(&self, id: &str) -> Result<Vec<TaskAuditEntry>> {
        let rows = sqlx::query(
            "SELECT id, task_id, event, created_at FROM task_audit WHERE task_id = ? ORDER BY created_at ASC",
        )
        .bind(id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .iter()
            .filter_map(|row| {
                let event_str: String = row.get("event");
                let event = match event_str.as_str() {
                    "created" => AuditEvent::Created,
                    "started" => AuditEvent::Started,
                    "completed" => AuditEvent::Completed,
                    "completed_with_errors" => AuditEvent::CompletedWithErrors,
                    "failed" => AuditEvent::Failed,
                    "cancelled" => AuditEvent::Cancelled,
                    _ => return None,
                };
                Some(TaskAuditEntry {
                    id: row.get("id"),
                    task_id: row.get("task_id"),
                    event,
                    created_at: row.get("created_at"),
                })
            })
            .collect())
    }

    pub async fn audit_view(&self, id: &str) -> Result<Vec<TaskAuditView>> {
        Ok(self
            .audit_trail(id)
            .await?
            .into_iter()
            .filter_map(|entry| {
                Some(TaskAuditView {
                    id: entry.id,
                    event: entry.event.as_str().to_string(),
                    event_label: entry.event.label().to_string(),
                    created_at: micros_to_datetime(entry.created_at)?,
                })
            })
            .collect())
    }

    /// Full read model with audit-derived timestamps.
    pub async fn snapshot(&self, id: &str) -> Result<Option<TaskSnapshot>> {
        let Some(task) = self.get(id).await? else {
            return Ok(None);
        };

        let started_at = self.first_event_at(id, &[AuditEvent::Started]).await?;
        let completed_at = self
            .first_event_at(
                id,
                &[
                    AuditEvent::Completed,
                    AuditEvent::CompletedWithErrors,
                    AuditEvent::Failed,
                ],
            )
            .await?;
        let cancelled_at = self.first_event_at(id, &[AuditEvent::Cancelled]).await?;

        let duration_seconds = started_at.map(|start| {
            let end = completed_at.unwrap_or_else(now_micros);
            (end - start) as f64 / 1_000_000.0
        });

        let progress_percent = match task.total_items {
            Some(total) if total > 0 => {
                Some(task.completed_items as f64 / total as f64 * 100.0)
            }
            _ => None,
        };

        Ok(Some(TaskSnapshot {
            id: task.id,
            name: task.name,
            status: task.status.as_str().to_string(),
            status_label: task.status.label().to_string(),
            logs: task.logs,
            created_at: micros_to_datetime(task.created_at)
                .unwrap_or_else(|| DateTime::<Utc>::MIN_UTC),
            started_at: started_at.and_then(micros_to_datetime),
            completed_at: completed_at.and_then(micros_to_datetime),
            cancelled_at: cancelled_at.and_then(micros_to_datetime),
            duration_seconds,
            can_cancel: task.status.can_cancel(),
            total_items: task.total_items,
            completed_items: task.completed_items,
            progress_percent,
        }))
    }
}

// ---- job queue ----

/// A unit of background work, named by the operation it performs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum JobKind {
    SyncToRemote { message: String },
    SyncFromRemote,
    RebuildSearchIndex,
    WarmCaches,
    SendNotification {
        operation: String,
        page_path: String,
        title: String,
    },
}

impl JobKind {
    pub fn task_type(&self) -> &'static str {
        match self {
            JobKind::SyncToRemote { .. } => "wiki.sync_to_remote",
            JobKind::SyncFromRemote => "wiki.sync_from_remote",
            JobKind::RebuildSearchIndex => "wiki.rebuild_search_index",
            JobKind::WarmCaches => "wiki.warm_caches",
            JobKind::SendNotification { .. } => "wiki.send_notification",
        }
    }

    pub fn task_args(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }
}

#[derive(Debug, Clone)]
pub struct Job {
    pub job_id: String,
    pub task_id: String,
    pub kind: JobKind,
}

/// Sender half of the worker queue plus the registry of running jobs for
/// best-effort cancellation.
#[derive(Clone)]
pub struct JobQueue {
    tx: mpsc::UnboundedSender<Job>,
    registry: Arc<Mutex<HashMap<String, AbortHandle>>>,
}

impl JobQueue {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Job>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                tx,
                registry: Arc::new(Mutex::new(HashMap::new())),
            },
            rx,
        )
    }

    pub fn enqueue(&self, job: Job) -> Result<()> {
        self.tx
            .send(job)
            .map_err(|e| anyhow::anyhow!("job queue unavailable: {}", e))
    }

    pub fn register(&self, job_id: &str, handle: AbortHandle) {
        let mut registry = self.registry.lock().unwrap_or_else(|e| e.into_inner());
        registry.insert(job_id.to_string(), handle);
    }

    pub fn unregister(&self, job_id: &str) {
        let mut registry = self.registry.lock().unwrap_or_else(|e| e.into_inner());
        registry.remove(job_id);
    }

    /// Best-effort termination: aborts the job if it is currently
    /// running. A job already finished (or not yet started) is a no-op.
    pub fn abort(&self, job_id: &str) -> bool {
        let registry = self.registry.lock().unwrap_or_else(|e| e.into_inner());
        match registry.get(job_id) {
            Some(handle) => {
                handle.abort();
                true
            }
            None => false,
        }
    }
}

/// Create a task record and hand the job to the workers.
///
/// The enqueue happens only after the creating transaction has
/// committed, so a worker can never observe a job whose task row is not
/// yet visible. If the enqueue itself fails the task is marked `failed`
/// with the error in its logs.
pub async fn dispatch(
    ledger: &TaskLedger,
    queue: &JobQueue,
    kind: JobKind,
    initial_logs: &str,
) -> Result<Task> {
    let task = ledger
        .create(kind.task_type(), &kind.task_args(), initial_logs)
        .await?;

    let job_id = uuid::Uuid::new_v4().to_string();
    ledger.set_job_id(&task.id, &job_id).await?;

    let job = Job {
        job_id,
        task_id: task.id.clone(),
        kind,
    };

    if let Err(e) = queue.enqueue(job) {
        tracing::error!(task = %task.id, error = %e, "failed to dispatch task");
        ledger
            .complete(
                &task.id,
                false,
                false,
                &format!("\n\nFailed to dispatch task: {}", e),
            )
            .await?;
    }

    ledger
        .get(&task.id)
        .await?
        .ok_or_else(|| anyhow::anyhow!("task {} vanished after dispatch", task.id))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{db, migrate};
    use tempfile::TempDir;

    async fn ledger() -> (TempDir, TaskLedger) {
        let dir = TempDir::new().unwrap();
        let pool = db::connect(&dir.path().join("tasks.sqlite")).await.unwrap();
        migrate::run_migrations(&pool).await.unwrap();
        (dir, TaskLedger::new(pool))
    }

    async fn queued_task(ledger: &TaskLedger) -> Task {
        ledger
            .create("wiki.rebuild_search_index", &serde_json::json!({}), "")
            .await
            .unwrap()
    }

    #[test]
    fn short_ids_are_twelve_hex_chars() {
        let id = generate_short_id();
        assert_eq!(id.len(), 12);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn task_names_are_memorable() {
        let name = generate_task_name();
        assert!(name.contains('-'));
    }

    #[tokio::test]
    async fn create_starts_queued_with_audit_entry() {
        let (_dir, ledger) = ledger().await;
        let task = queued_task(&ledger).await;

        assert_eq!(task.status, TaskStatus::Queued);
        assert!(!task.name.is_empty());

        let trail = ledger.audit_trail(&task.id).await.unwrap();
        assert_eq!(trail.len(), 1);
        assert_eq!(trail[0].event, AuditEvent::Created);
    }

    #[tokio::test]
    async fn start_sets_in_progress_and_started_at() {
        let (_dir, ledger) = ledger().await;
        let task = queued_task(&ledger).await;

        ledger.start(&task.id).await.unwrap();

        let snapshot = ledger.snapshot(&task.id).await.unwrap().unwrap();
        assert_eq!(snapshot.status, "in_progress");
        assert!(snapshot.started_at.is_some());
        assert!(snapshot.completed_at.is_none());
    }

    #[tokio::test]
    async fn complete_success_sets_terminal_state_and_duration() {
        let (_dir, ledger) = ledger().await;
        let task = queued_task(&ledger).await;
        ledger.start(&task.id).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        ledger.complete(&task.id, true, false, "\nAll done").await.unwrap();

        let snapshot = ledger.snapshot(&task.id).await.unwrap().unwrap();
        assert_eq!(snapshot.status, "success");
        assert!(snapshot.completed_at.is_some());
        assert!(snapshot.duration_seconds.unwrap() > 0.0);
        assert!(!snapshot.can_cancel);
        assert!(snapshot.logs.contains("All done"));
    }

    #[tokio::test]
    async fn complete_with_errors_and_failed_statuses() {
        let (_dir, ledger) = ledger().await;

        let task = queued_task(&ledger).await;
        ledger.start(&task.id).await.unwrap();
        ledger.complete(&task.id, true, true, "").await.unwrap();
        assert_eq!(
            ledger.get(&task.id).await.unwrap().unwrap().status,
            TaskStatus::CompletedWithErrors
        );

        let task = queued_task(&ledger).await;
        ledger.start(&task.id).await.unwrap();
        ledger.complete(&task.id, false, false, "\nboom").await.unwrap();
        assert_eq!(
            ledger.get(&task.id).await.unwrap().unwrap().status,
            TaskStatus::Failed
        );
    }

    #[tokio::test]
    async fn logs_are_appended_never_replaced() {
        let (_dir, ledger) = ledger().await;
        let task = ledger
            .create("wiki.sync_to_remote", &serde_json::json!({}), "initial")
            .await
            .unwrap();

        ledger.append_logs(&task.id, "\nprogress").await.unwrap();
        ledger.start(&task.id).await.unwrap();
        ledger.complete(&task.id, true, false, "\nfinal").await.unwrap();

        let logs = ledger.get(&task.id).await.unwrap().unwrap().logs;
        assert!(logs.starts_with("initial"));
        assert!(logs.contains("progress"));
        assert!(logs.ends_with("final"));
    }

    #[tokio::test]
    async fn cancel_flips_status_and_records_marker() {
        let (_dir, ledger) = ledger().await;
        let task = queued_task(&ledger).await;

        let cancelled = ledger.cancel(&task.id).await.unwrap();
        assert_eq!(cancelled.status, TaskStatus::Cancelled);
        assert!(cancelled.logs.contains("Task cancelled"));

        let snapshot = ledger.snapshot(&task.id).await.unwrap().unwrap();
        assert!(snapshot.cancelled_at.is_some());
        assert!(!snapshot.can_cancel);
    }

    #[tokio::test]
    async fn cancel_in_progress_is_allowed() {
        let (_dir, ledger) = ledger().await;
        let task = queued_task(&ledger).await;
        ledger.start(&task.id).await.unwrap();
        assert!(ledger.cancel(&task.id).await.is_ok());
    }

    #[tokio::test]
    async fn terminal_tasks_reject_further_transitions() {
        let (_dir, ledger) = ledger().await;
        let task = queued_task(&ledger).await;
        ledger.start(&task.id).await.unwrap();
        ledger.complete(&task.id, true, false, "").await.unwrap();

        for result in [
            ledger.start(&task.id).await,
            ledger.complete(&task.id, true, false, "").await,
            ledger.cancel(&task.id).await.map(|_| ()),
        ] {
            let err = result.unwrap_err();
            assert!(matches!(
                err.downcast_ref::<WikiError>(),
                Some(WikiError::TerminalTask(_))
            ));
        }
    }

    #[tokio::test]
    async fn progress_percent_requires_total() {
        let (_dir, ledger) = ledger().await;
        let task = queued_task(&ledger).await;

        let snapshot = ledger.snapshot(&task.id).await.unwrap().unwrap();
        assert!(snapshot.progress_percent.is_none());

        ledger.set_progress(&task.id, 50, Some(100)).await.unwrap();
        let snapshot = ledger.snapshot(&task.id).await.unwrap().unwrap();
        assert_eq!(snapshot.progress_percent, Some(50.0));
    }

    #[tokio::test]
    async fn lifecycle_produces_ordered_audit_trail() {
        let (_dir, ledger) = ledger().await;
        let task = queued_task(&ledger).await;
        ledger.start(&task.id).await.unwrap();
        ledger.complete(&task.id, true, false, "").await.unwrap();

        let events: Vec<AuditEvent> = ledger
            .audit_trail(&task.id)
            .await
            .unwrap()
            .into_iter()
            .map(|e| e.event)
            .collect();
        assert_eq!(
            events,
            vec![AuditEvent::Created, AuditEvent::Started, AuditEvent::Completed]
        );
    }

    #[tokio::test]
    async fn dispatch_enqueues_after_create() {
        let (_dir, ledger) = ledger().await;
        let (queue, mut rx) = JobQueue::new();

        let task = dispatch(&ledger, &queue, JobKind::RebuildSearchIndex, "kick off")
            .await
            .unwrap();

        assert_eq!(task.status, TaskStatus::Queued);
        assert!(task.job_id.is_some());

        let job = rx.recv().await.unwrap();
        assert_eq!(job.task_id, task.id);
        assert_eq!(job.job_id, task.job_id.unwrap());
    }

    #[tokio::test]
    async fn dispatch_failure_marks_task_failed() {
        let (_dir, ledger) = ledger().await;
        let (queue, rx) = JobQueue::new();
        drop(rx); // queue becomes unavailable

        let task = dispatch(&ledger, &queue, JobKind::SyncFromRemote, "")
            .await
            .unwrap();

        assert_eq!(task.status, TaskStatus::Failed);
        assert!(task.logs.contains("Failed to dispatch task"));

        let trail = ledger.audit_trail(&task.id).await.unwrap();
        assert_eq!(trail.last().unwrap().event, AuditEvent::Failed);
    }
}
