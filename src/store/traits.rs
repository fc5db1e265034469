//! Unified `Database` trait, the single async interface for persistence.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::channels::channel::{ChannelCredential, ChannelKind};
use crate::channels::oauth::OAuthState;
use crate::error::DatabaseError;
use crate::tasks::model::{
    Approval, LogEntry, LogFilter, NewLog, Page, SlaRecord, Task, TaskFilter, TaskStatus,
};

/// External message id to record together with a new task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessedMarker {
    pub channel: ChannelKind,
    pub external_id: String,
}

/// Result of inserting a task that may carry a processed marker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskInsert {
    Inserted,
    /// The marker already existed; nothing was written.
    AlreadyProcessed,
}

/// Stamp applied to an SLA record when its task completes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlaCompletion {
    pub record_id: i64,
    pub completed_at: DateTime<Utc>,
    pub met_sla: bool,
}

/// One guarded, transactional change to an existing task.
///
/// The write only applies while the stored status still equals
/// `expected_status`.
#[derive(Debug, Clone)]
pub struct TaskChange<'a> {
    pub task: &'a Task,
    pub expected_status: TaskStatus,
    pub approval: Option<&'a Approval>,
    pub sla_completion: Option<SlaCompletion>,
    pub log: &'a NewLog,
}

/// Backend-agnostic database trait covering tasks, channel state and settings.
#[async_trait]
pub trait Database: Send + Sync {
    /// Run all pending schema migrations.
    async fn run_migrations(&self) -> Result<(), DatabaseError>;

    // ── Tasks ───────────────────────────────────────────────────────

    /// Insert a task, its SLA record, its creation log and (optionally) a
    /// processed marker in one transaction.
    async fn insert_task(
        &self,
        task: &Task,
        log: &NewLog,
        marker: Option<&ProcessedMarker>,
    ) -> Result<TaskInsert, DatabaseError>;

    async fn get_task(&self, id: Uuid) -> Result<Option<Task>, DatabaseError>;

    /// Tasks matching `filter`, newest first, plus the total match count.
    async fn list_tasks(
        &self,
        filter: &TaskFilter,
        page: Page,
    ) -> Result<(Vec<Task>, u64), DatabaseError>;

    /// Apply a guarded change. Returns `false` when the status guard failed.
    async fn apply_task_change(&self, change: TaskChange<'_>) -> Result<bool, DatabaseError>;

    /// Delete a task with its approvals, SLA records and logs, then append
    /// `log`. Returns `false` if the task did not exist.
    async fn delete_task(&self, id: Uuid, log: &NewLog) -> Result<bool, DatabaseError>;

    // ── Approvals / SLA / Logs ──────────────────────────────────────

    async fn list_approvals(&self, task_id: Option<Uuid>) -> Result<Vec<Approval>, DatabaseError>;

    async fn list_sla_records(&self, task_id: Option<Uuid>)
        -> Result<Vec<SlaRecord>, DatabaseError>;

    /// Most recent SLA record for a task.
    async fn latest_sla_record(&self, task_id: Uuid) -> Result<Option<SlaRecord>, DatabaseError>;

    async fn append_log(&self, log: &NewLog) -> Result<i64, DatabaseError>;

    /// Logs matching `filter`, newest first.
    async fn list_logs(&self, filter: &LogFilter, page: Page)
        -> Result<Vec<LogEntry>, DatabaseError>;

    // ── Processed markers ───────────────────────────────────────────

    async fn is_processed(
        &self,
        channel: ChannelKind,
        external_id: &str,
    ) -> Result<bool, DatabaseError>;

    async fn count_processed(&self, channel: ChannelKind) -> Result<u64, DatabaseError>;

    // ── Credentials ─────────────────────────────────────────────────

    async fn get_credential(
        &self,
        channel: ChannelKind,
    ) -> Result<Option<ChannelCredential>, DatabaseError>;

    /// Insert or replace the credential for its channel.
    async fn save_credential(&self, credential: &ChannelCredential) -> Result<(), DatabaseError>;

    async fn mark_polled(
        &self,
        channel: ChannelKind,
        at: DateTime<Utc>,
    ) -> Result<(), DatabaseError>;

    // ── OAuth states ────────────────────────────────────────────────

    async fn insert_oauth_state(&self, state: &OAuthState) -> Result<(), DatabaseError>;

    /// Remove and return a state token, if present.
    async fn take_oauth_state(&self, state: &str) -> Result<Option<OAuthState>, DatabaseError>;

    /// Delete states that expired before `now`.
    async fn purge_oauth_states(&self, now: DateTime<Utc>) -> Result<u64, DatabaseError>;

    // ── Settings ────────────────────────────────────────────────────

    async fn get_setting(&self, key: &str) -> Result<Option<serde_json::Value>, DatabaseError>;

    async fn set_setting(
        &self,
        key: &str,
        value: &serde_json::Value,
        at: DateTime<Utc>,
    ) -> Result<(), DatabaseError>;

    // ── Scheduler ───────────────────────────────────────────────────

    async fn get_schedule_run(&self, name: &str) -> Result<Option<DateTime<Utc>>, DatabaseError>;

    async fn set_schedule_run(&self, name: &str, at: DateTime<Utc>) -> Result<(), DatabaseError>;
}
