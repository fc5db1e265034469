//! Task lifecycle engine. The only code path that mutates tasks.
//!
//! Every operation validates against the status table, writes the task
//! change and exactly one audit row in one transaction, and re-checks the
//! stored status inside that transaction so concurrent callers cannot both
//! win the same transition.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::{DateTime, Utc};
use mockable::Clock;
use serde_json::json;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::LifecycleConfig;
use crate::error::TaskError;
use crate::sensitivity::{self, SensitivityReport};
use crate::store::{Database, ProcessedMarker, SlaCompletion, TaskChange, TaskInsert};
use crate::tasks::model::{
    Approval, ApprovalDecision, LogEntry, LogFilter, NewLog, NewTask, Page, Priority, SlaRecord,
    Task, TaskFilter, TaskPatch, TaskStatus,
};

/// Settings key holding the persisted autonomy override.
pub const AUTONOMY_OVERRIDE_KEY: &str = "autonomy_override";

/// Drives tasks through their lifecycle.
pub struct TaskEngine {
    db: Arc<dyn Database>,
    clock: Arc<dyn Clock>,
    config: LifecycleConfig,
    autonomy_override: AtomicBool,
}

impl TaskEngine {
    /// Build an engine, restoring a persisted autonomy override if present.
    pub async fn new(
        db: Arc<dyn Database>,
        clock: Arc<dyn Clock>,
        config: LifecycleConfig,
    ) -> Result<Self, TaskError> {
        let persisted = db
            .get_setting(AUTONOMY_OVERRIDE_KEY)
            .await?
            .and_then(|v| v.as_bool());
        let enabled = persisted.unwrap_or(config.autonomy_mode);
        if enabled {
            info!("Autonomy override is on: sensitive tasks skip approval");
        }
        Ok(Self {
            db,
            clock,
            config,
            autonomy_override: AtomicBool::new(enabled),
        })
    }

    pub fn db(&self) -> &Arc<dyn Database> {
        &self.db
    }

    pub fn config(&self) -> &LifecycleConfig {
        &self.config
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.utc()
    }

    // ── Autonomy override ───────────────────────────────────────────

    pub fn autonomy_override(&self) -> bool {
        self.autonomy_override.load(Ordering::SeqCst)
    }

    /// Toggle the override and persist it.
    pub async fn set_autonomy_override(&self, enabled: bool) -> Result<(), TaskError> {
        let now = self.clock.utc();
        self.db
            .set_setting(AUTONOMY_OVERRIDE_KEY, &json!(enabled), now)
            .await?;
        let previous = self.autonomy_override.swap(enabled, Ordering::SeqCst);
        if previous != enabled {
            self.db
                .append_log(&NewLog::new(
                    "autonomy_override_changed",
                    json!({ "enabled": enabled }),
                    now,
                ))
                .await?;
            info!(enabled, "Autonomy override changed");
        }
        Ok(())
    }

    // ── Derivations ─────────────────────────────────────────────────

    /// Raise `hint` to the most urgent priority keyword found in `text`.
    pub fn detect_priority(&self, text: &str, hint: Priority) -> Priority {
        let lower = text.to_lowercase();
        self.config
            .priority_keywords
            .iter()
            .filter(|(keyword, _)| lower.contains(keyword.as_str()))
            .map(|(_, p)| *p)
            .min()
            .filter(|p| p.is_more_urgent_than(hint))
            .unwrap_or(hint)
    }

    fn sla_deadline(&self, priority: Priority, from: DateTime<Utc>) -> DateTime<Utc> {
        from + chrono::Duration::hours(i64::from(self.config.sla.hours_for(priority)))
    }

    fn score(&self, title: &str, body: &str) -> SensitivityReport {
        sensitivity::score(&format!("{title} {body}"), self.config.sensitivity_threshold)
    }

    /// First routing decision for a scored task: target status and whether
    /// the override bypassed approval.
    fn route(&self, report: &SensitivityReport) -> (TaskStatus, bool) {
        match (report.requires_approval, self.autonomy_override()) {
            (true, true) => (TaskStatus::InProgress, true),
            (true, false) => (TaskStatus::AwaitingApproval, false),
            (false, _) => (TaskStatus::InProgress, false),
        }
    }

    fn build_task(&self, new: &NewTask, now: DateTime<Utc>) -> (Task, SensitivityReport) {
        let text = format!("{} {}", new.title, new.body);
        let priority = self.detect_priority(&text, new.priority);
        let report = self.score(&new.title, &new.body);
        let task = Task {
            id: Uuid::new_v4(),
            title: new.title.clone(),
            body: new.body.clone(),
            priority,
            status: TaskStatus::Pending,
            sensitivity_score: report.score,
            sensitivity_category: report.category,
            sla_deadline: Some(self.sla_deadline(priority, now)),
            source: new.source.clone(),
            created_at: now,
            updated_at: now,
        };
        (task, report)
    }

    // ── Creation ────────────────────────────────────────────────────

    /// Create and route a task.
    pub async fn create(&self, new: NewTask) -> Result<Task, TaskError> {
        match self.insert_routed(new, None).await? {
            Some(task) => Ok(task),
            // Unreachable without a marker; report as a storage fault.
            None => Err(TaskError::Database(crate::error::DatabaseError::Constraint(
                "task insert reported a duplicate without a marker".into(),
            ))),
        }
    }

    /// Create and route a task for an external message. Returns `None`
    /// when the message was already processed.
    pub async fn create_from_message(
        &self,
        new: NewTask,
        marker: &ProcessedMarker,
    ) -> Result<Option<Task>, TaskError> {
        self.insert_routed(new, Some(marker)).await
    }

    async fn insert_routed(
        &self,
        new: NewTask,
        marker: Option<&ProcessedMarker>,
    ) -> Result<Option<Task>, TaskError> {
        let now = self.clock.utc();
        let (mut task, report) = self.build_task(&new, now);
        let (status, overridden) = self.route(&report);
        task.status = status;

        let mut detail = json!({
            "title": task.title,
            "priority": task.priority,
            "priority_hint": new.priority,
            "status": task.status,
            "source": task.source,
            "sla_deadline": task.sla_deadline,
            "sensitivity": report,
            "autonomy_override": overridden,
        });
        if let Some(marker) = marker {
            detail["channel"] = json!(marker.channel);
            detail["external_id"] = json!(marker.external_id);
        }
        let log = NewLog::new("task_created", detail, now).for_task(task.id);

        match self.db.insert_task(&task, &log, marker).await? {
            TaskInsert::Inserted => {
                info!(
                    id = %task.id,
                    status = %task.status,
                    priority = %task.priority,
                    score = task.sensitivity_score,
                    "Task created"
                );
                Ok(Some(task))
            }
            TaskInsert::AlreadyProcessed => {
                debug!(external_id = ?marker.map(|m| &m.external_id), "Message already processed");
                Ok(None)
            }
        }
    }

    /// Create a task left in `pending` with no routing decision.
    pub async fn create_pending(&self, new: NewTask) -> Result<Task, TaskError> {
        let now = self.clock.utc();
        let (task, report) = self.build_task(&new, now);
        let log = NewLog::new(
            "task_created",
            json!({
                "title": task.title,
                "priority": task.priority,
                "priority_hint": new.priority,
                "status": task.status,
                "source": task.source,
                "sla_deadline": task.sla_deadline,
                "sensitivity": report,
                "autonomy_override": false,
            }),
            now,
        )
        .for_task(task.id);
        self.db.insert_task(&task, &log, None).await?;
        debug!(id = %task.id, "Pending task created");
        Ok(task)
    }

    // ── Transitions ─────────────────────────────────────────────────

    /// Apply a whitelisted patch. Approve and reject have their own
    /// operations; a `completed` status stamps the SLA like [`Self::complete`].
    pub async fn update(&self, id: Uuid, patch: TaskPatch) -> Result<Task, TaskError> {
        let current = self.load(id).await?;
        let now = self.clock.utc();

        let mut next = current.clone();
        let mut changes = serde_json::Map::new();

        if let Some(title) = patch.title.filter(|t| *t != current.title) {
            changes.insert("title".into(), json!({ "from": current.title, "to": title }));
            next.title = title;
        }
        if let Some(body) = patch.body.filter(|b| *b != current.body) {
            changes.insert("body".into(), json!({ "from": current.body, "to": body }));
            next.body = body;
        }
        if let Some(priority) = patch.priority.filter(|p| *p != current.priority) {
            changes.insert(
                "priority".into(),
                json!({ "from": current.priority, "to": priority }),
            );
            next.priority = priority;
        }
        let mut sla_completion = None;
        if let Some(status) = patch.status.filter(|s| *s != current.status) {
            if matches!(status, TaskStatus::Approved | TaskStatus::Rejected)
                || !current.status.can_transition_to(status)
            {
                return Err(TaskError::InvalidTransition {
                    id,
                    state: current.status,
                    target: status,
                });
            }
            if status == TaskStatus::Completed {
                let (completion, met) = self.sla_completion(&current, now).await?;
                sla_completion = completion;
                changes.insert("met_sla".into(), json!(met));
            }
            changes.insert(
                "status".into(),
                json!({ "from": current.status, "to": status }),
            );
            next.status = status;
        }

        if changes.is_empty() {
            return Ok(current);
        }
        next.updated_at = now;

        let log = NewLog::new("task_updated", json!({ "changes": changes }), now).for_task(id);
        self.commit(
            &current,
            TaskChange {
                task: &next,
                expected_status: current.status,
                approval: None,
                sla_completion,
                log: &log,
            },
            next.status,
        )
        .await?;
        info!(id = %id, fields = changes.len(), "Task updated");
        Ok(next)
    }

    pub async fn approve(&self, id: Uuid, reason: &str, decided_by: &str) -> Result<Task, TaskError> {
        self.decide(id, ApprovalDecision::Approved, reason, decided_by)
            .await
    }

    pub async fn reject(&self, id: Uuid, reason: &str, decided_by: &str) -> Result<Task, TaskError> {
        self.decide(id, ApprovalDecision::Rejected, reason, decided_by)
            .await
    }

    async fn decide(
        &self,
        id: Uuid,
        decision: ApprovalDecision,
        reason: &str,
        decided_by: &str,
    ) -> Result<Task, TaskError> {
        let current = self.load(id).await?;
        let target = match decision {
            ApprovalDecision::Approved => TaskStatus::Approved,
            ApprovalDecision::Rejected => TaskStatus::Rejected,
        };
        if current.status != TaskStatus::AwaitingApproval {
            return Err(TaskError::InvalidTransition {
                id,
                state: current.status,
                target,
            });
        }

        let now = self.clock.utc();
        let mut next = current.clone();
        next.status = target;
        next.updated_at = now;

        let approval = Approval {
            id: Uuid::new_v4(),
            task_id: id,
            decision,
            reason: reason.to_string(),
            decided_by: decided_by.to_string(),
            decided_at: now,
        };
        let action = match decision {
            ApprovalDecision::Approved => "task_approved",
            ApprovalDecision::Rejected => "task_rejected",
        };
        let log = NewLog::new(
            action,
            json!({
                "approval_id": approval.id,
                "reason": reason,
                "decided_by": decided_by,
            }),
            now,
        )
        .for_task(id);

        self.commit(
            &current,
            TaskChange {
                task: &next,
                expected_status: TaskStatus::AwaitingApproval,
                approval: Some(&approval),
                sla_completion: None,
                log: &log,
            },
            target,
        )
        .await?;
        info!(id = %id, decision = %decision, decided_by, "Approval recorded");
        Ok(next)
    }

    /// Mark a task completed and stamp its SLA record.
    pub async fn complete(&self, id: Uuid) -> Result<Task, TaskError> {
        let current = self.load(id).await?;
        if !current.status.can_transition_to(TaskStatus::Completed) {
            return Err(TaskError::InvalidTransition {
                id,
                state: current.status,
                target: TaskStatus::Completed,
            });
        }

        let now = self.clock.utc();
        let (sla_completion, met) = self.sla_completion(&current, now).await?;
        let mut next = current.clone();
        next.status = TaskStatus::Completed;
        next.updated_at = now;

        let log = NewLog::new(
            "task_completed",
            json!({ "from": current.status, "met_sla": met }),
            now,
        )
        .for_task(id);
        self.commit(
            &current,
            TaskChange {
                task: &next,
                expected_status: current.status,
                approval: None,
                sla_completion,
                log: &log,
            },
            TaskStatus::Completed,
        )
        .await?;
        info!(id = %id, met_sla = met, "Task completed");
        Ok(next)
    }

    /// Delete a task and everything it owns. Returns `false` if it did not exist.
    pub async fn delete(&self, id: Uuid) -> Result<bool, TaskError> {
        let now = self.clock.utc();
        let log = NewLog::new("task_deleted", json!({ "task_id": id }), now);
        let deleted = self.db.delete_task(id, &log).await?;
        if deleted {
            info!(id = %id, "Task deleted");
        }
        Ok(deleted)
    }

    /// Rescore a task. Only a `pending` task is (re)routed; later states
    /// keep their status and just pick up the new score.
    pub async fn reprocess(&self, id: Uuid) -> Result<Task, TaskError> {
        let current = self.load(id).await?;
        let report = self.score(&current.title, &current.body);
        let now = self.clock.utc();

        let mut next = current.clone();
        next.sensitivity_score = report.score;
        next.sensitivity_category = report.category;

        let (action, detail) = if current.status == TaskStatus::Pending {
            let (status, overridden) = self.route(&report);
            next.status = status;
            let action = if overridden {
                "autonomy_override"
            } else {
                "task_reprocessed"
            };
            (
                action,
                json!({
                    "from": current.status,
                    "to": status,
                    "sensitivity": report,
                    "autonomy_override": overridden,
                }),
            )
        } else {
            if current.sensitivity_score == report.score
                && current.sensitivity_category == report.category
            {
                return Ok(current);
            }
            (
                "task_rescored",
                json!({
                    "status": current.status,
                    "previous_score": current.sensitivity_score,
                    "sensitivity": report,
                }),
            )
        };
        next.updated_at = now;

        let log = NewLog::new(action, detail, now).for_task(id);
        self.commit(
            &current,
            TaskChange {
                task: &next,
                expected_status: current.status,
                approval: None,
                sla_completion: None,
                log: &log,
            },
            next.status,
        )
        .await?;
        info!(id = %id, action, status = %next.status, "Task reprocessed");
        Ok(next)
    }

    // ── Reads ───────────────────────────────────────────────────────

    pub async fn get_task(&self, id: Uuid) -> Result<Task, TaskError> {
        self.load(id).await
    }

    pub async fn list_tasks(
        &self,
        filter: &TaskFilter,
        page: Page,
    ) -> Result<(Vec<Task>, u64), TaskError> {
        Ok(self.db.list_tasks(filter, page).await?)
    }

    pub async fn list_approvals(&self, task_id: Option<Uuid>) -> Result<Vec<Approval>, TaskError> {
        Ok(self.db.list_approvals(task_id).await?)
    }

    pub async fn list_logs(&self, filter: &LogFilter, page: Page) -> Result<Vec<LogEntry>, TaskError> {
        Ok(self.db.list_logs(filter, page).await?)
    }

    pub async fn list_sla_records(
        &self,
        task_id: Option<Uuid>,
    ) -> Result<Vec<SlaRecord>, TaskError> {
        Ok(self.db.list_sla_records(task_id).await?)
    }

    /// Append a non-transition audit row (reply outcomes, scheduler runs).
    pub async fn record(&self, log: NewLog) -> Result<i64, TaskError> {
        Ok(self.db.append_log(&log).await?)
    }

    // ── Helpers ─────────────────────────────────────────────────────

    async fn load(&self, id: Uuid) -> Result<Task, TaskError> {
        self.db
            .get_task(id)
            .await?
            .ok_or(TaskError::NotFound { id })
    }

    async fn sla_completion(
        &self,
        task: &Task,
        now: DateTime<Utc>,
    ) -> Result<(Option<SlaCompletion>, bool), TaskError> {
        let record = self.db.latest_sla_record(task.id).await?;
        let deadline = record
            .as_ref()
            .and_then(|r| r.deadline)
            .or(task.sla_deadline);
        let met = deadline.is_none_or(|d| now <= d);
        let completion = record.map(|r| SlaCompletion {
            record_id: r.id,
            completed_at: now,
            met_sla: met,
        });
        Ok((completion, met))
    }

    /// Write a guarded change, turning a lost race into a typed error.
    async fn commit(
        &self,
        current: &Task,
        change: TaskChange<'_>,
        target: TaskStatus,
    ) -> Result<(), TaskError> {
        if self.db.apply_task_change(change).await? {
            return Ok(());
        }
        let latest = self.load(current.id).await?;
        warn!(
            id = %current.id,
            expected = %current.status,
            actual = %latest.status,
            "Concurrent status change; transition refused"
        );
        Err(TaskError::InvalidTransition {
            id: current.id,
            state: latest.status,
            target,
        })
    }
}
