//! Task data model: tasks, approvals, SLA records and audit log rows.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::sensitivity::SensitivityCategory;

/// Source tag for tasks created through the API surface.
pub const SOURCE_API: &str = "api";
/// Source tag for tasks created by the scheduler.
pub const SOURCE_SCHEDULER: &str = "scheduler";

/// Default page size for list queries.
pub const DEFAULT_PAGE_LIMIT: u32 = 50;
/// Largest page size a caller may request.
pub const MAX_PAGE_LIMIT: u32 = 200;

/// Task priority. `P0` is the most urgent.
///
/// Ordering follows urgency: `P0 < P1 < P2 < P3`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Priority {
    P0,
    P1,
    P2,
    P3,
}

impl Priority {
    /// True when `self` demands a faster response than `other`.
    pub fn is_more_urgent_than(self, other: Priority) -> bool {
        self < other
    }
}

impl Default for Priority {
    fn default() -> Self {
        Priority::P2
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::P0 => "P0",
            Self::P1 => "P1",
            Self::P2 => "P2",
            Self::P3 => "P3",
        };
        write!(f, "{s}")
    }
}

impl FromStr for Priority {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "P0" => Ok(Self::P0),
            "P1" => Ok(Self::P1),
            "P2" => Ok(Self::P2),
            "P3" => Ok(Self::P3),
            other => Err(format!("unknown priority: {other}")),
        }
    }
}

/// Lifecycle status of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Created but not yet routed.
    Pending,
    /// Being worked on.
    InProgress,
    /// Held for a human decision.
    AwaitingApproval,
    /// A human approved the task; an executor finishes it.
    Approved,
    /// A human rejected the task.
    Rejected,
    Completed,
    Cancelled,
}

impl TaskStatus {
    /// Check if this status allows moving to `target`.
    pub fn can_transition_to(&self, target: TaskStatus) -> bool {
        use TaskStatus::*;

        matches!(
            (self, target),
            // From Pending
            (Pending, InProgress) | (Pending, AwaitingApproval) |
            (Pending, Completed) | (Pending, Cancelled) |
            // From InProgress
            (InProgress, AwaitingApproval) | (InProgress, Completed) |
            (InProgress, Cancelled) |
            // From AwaitingApproval
            (AwaitingApproval, Approved) | (AwaitingApproval, Rejected) |
            (AwaitingApproval, Completed) | (AwaitingApproval, Cancelled) |
            // From Approved (an executor picks it up)
            (Approved, InProgress) | (Approved, Completed) | (Approved, Cancelled) |
            // From Rejected
            (Rejected, Completed) | (Rejected, Cancelled)
        )
    }

    /// Check if this is a terminal status.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Cancelled)
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::InProgress => "in_progress",
            Self::AwaitingApproval => "awaiting_approval",
            Self::Approved => "approved",
            Self::Rejected => "rejected",
            Self::Completed => "completed",
            Self::Cancelled => "cancelled",
        };
        write!(f, "{s}")
    }
}

impl FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "in_progress" => Ok(Self::InProgress),
            "awaiting_approval" => Ok(Self::AwaitingApproval),
            "approved" => Ok(Self::Approved),
            "rejected" => Ok(Self::Rejected),
            "completed" => Ok(Self::Completed),
            "cancelled" => Ok(Self::Cancelled),
            other => Err(format!("unknown task status: {other}")),
        }
    }
}

/// A unit of work in the queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: Uuid,
    pub title: String,
    pub body: String,
    pub priority: Priority,
    pub status: TaskStatus,
    pub sensitivity_score: f64,
    pub sensitivity_category: SensitivityCategory,
    /// Set at creation; never moved afterwards.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sla_deadline: Option<DateTime<Utc>>,
    /// Channel tag, `api` or `scheduler`.
    pub source: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Input for task creation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewTask {
    pub title: String,
    pub body: String,
    /// Caller's priority. Keyword detection may only raise it.
    pub priority: Priority,
    pub source: String,
}

impl NewTask {
    pub fn new(title: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            body: body.into(),
            priority: Priority::default(),
            source: SOURCE_API.to_string(),
        }
    }

    /// Builder: set the priority hint.
    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    /// Builder: set the source tag.
    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = source.into();
        self
    }
}

/// Whitelisted fields a caller may change on an existing task.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskPatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<Priority>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<TaskStatus>,
}

impl TaskPatch {
    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = Some(title.into());
        self
    }

    pub fn with_body(mut self, body: impl Into<String>) -> Self {
        self.body = Some(body.into());
        self
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn with_status(mut self, status: TaskStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.title.is_none() && self.body.is_none() && self.priority.is_none() && self.status.is_none()
    }
}

/// Human decision on a task awaiting approval.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalDecision {
    Approved,
    Rejected,
}

impl fmt::Display for ApprovalDecision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Approved => write!(f, "approved"),
            Self::Rejected => write!(f, "rejected"),
        }
    }
}

impl FromStr for ApprovalDecision {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "approved" => Ok(Self::Approved),
            "rejected" => Ok(Self::Rejected),
            other => Err(format!("unknown approval decision: {other}")),
        }
    }
}

/// Immutable record of an approve/reject decision.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Approval {
    pub id: Uuid,
    pub task_id: Uuid,
    pub decision: ApprovalDecision,
    pub reason: String,
    pub decided_by: String,
    pub decided_at: DateTime<Utc>,
}

/// SLA bookkeeping for a task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SlaRecord {
    pub id: i64,
    pub task_id: Uuid,
    pub priority: Priority,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deadline: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    /// `None` until the task completes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub met_sla: Option<bool>,
    pub created_at: DateTime<Utc>,
}

/// One row of the append-only audit trail.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub id: i64,
    pub action: String,
    pub detail: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
}

/// An audit row waiting to be written.
#[derive(Debug, Clone, PartialEq)]
pub struct NewLog {
    pub action: String,
    pub detail: serde_json::Value,
    pub task_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
}

impl NewLog {
    pub fn new(action: impl Into<String>, detail: serde_json::Value, at: DateTime<Utc>) -> Self {
        Self {
            action: action.into(),
            detail,
            task_id: None,
            created_at: at,
        }
    }

    /// Builder: attach the row to a task.
    pub fn for_task(mut self, task_id: Uuid) -> Self {
        self.task_id = Some(task_id);
        self
    }
}

/// Filter for task listings. Unset fields match everything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TaskFilter {
    pub status: Option<TaskStatus>,
    pub priority: Option<Priority>,
    pub source: Option<String>,
}

/// Filter for audit log listings.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LogFilter {
    pub task_id: Option<Uuid>,
    pub action: Option<String>,
}

/// Offset pagination.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Page {
    pub offset: u32,
    pub limit: u32,
}

impl Page {
    /// Build a page, clamping `limit` to `1..=MAX_PAGE_LIMIT`.
    pub fn new(offset: u32, limit: u32) -> Self {
        Self {
            offset,
            limit: limit.clamp(1, MAX_PAGE_LIMIT),
        }
    }
}

impl Default for Page {
    fn default() -> Self {
        Self::new(0, DEFAULT_PAGE_LIMIT)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn priority_orders_by_urgency() {
        assert!(Priority::P0.is_more_urgent_than(Priority::P1));
        assert!(Priority::P2.is_more_urgent_than(Priority::P3));
        assert!(!Priority::P2.is_more_urgent_than(Priority::P2));
        assert!(!Priority::P3.is_more_urgent_than(Priority::P0));
    }

    #[test]
    fn priority_parses_case_insensitively() {
        assert_eq!("p1".parse::<Priority>().unwrap(), Priority::P1);
        assert_eq!(" P3 ".parse::<Priority>().unwrap(), Priority::P3);
        assert!("P9".parse::<Priority>().is_err());
    }

    #[test]
    fn approve_only_from_awaiting_approval() {
        use TaskStatus::*;
        for s in [Pending, InProgress, Approved, Rejected, Completed, Cancelled] {
            assert!(!s.can_transition_to(Approved), "{s} -> approved");
            assert!(!s.can_transition_to(Rejected), "{s} -> rejected");
        }
        assert!(AwaitingApproval.can_transition_to(Approved));
        assert!(AwaitingApproval.can_transition_to(Rejected));
    }

    #[test]
    fn terminal_states_are_locked() {
        use TaskStatus::*;
        for target in [
            Pending,
            InProgress,
            AwaitingApproval,
            Approved,
            Rejected,
            Completed,
            Cancelled,
        ] {
            assert!(!Completed.can_transition_to(target));
            assert!(!Cancelled.can_transition_to(target));
        }
    }

    #[test]
    fn cancel_from_any_non_terminal() {
        use TaskStatus::*;
        for s in [Pending, InProgress, AwaitingApproval, Approved, Rejected] {
            assert!(!s.is_terminal());
            assert!(s.can_transition_to(Cancelled), "{s} -> cancelled");
        }
    }

    #[test]
    fn status_serde_is_snake_case() {
        let json = serde_json::to_string(&TaskStatus::AwaitingApproval).unwrap();
        assert_eq!(json, "\"awaiting_approval\"");
        let parsed: TaskStatus = serde_json::from_str("\"in_progress\"").unwrap();
        assert_eq!(parsed, TaskStatus::InProgress);
    }

    #[test]
    fn page_clamps_limit() {
        assert_eq!(Page::new(0, 0).limit, 1);
        assert_eq!(Page::new(0, 10_000).limit, MAX_PAGE_LIMIT);
        assert_eq!(Page::default().limit, DEFAULT_PAGE_LIMIT);
    }

    #[test]
    fn patch_builders() {
        let p = TaskPatch::default();
        assert!(p.is_empty());
        let p = p.with_title("x").with_status(TaskStatus::Cancelled);
        assert!(!p.is_empty());
        assert_eq!(p.status, Some(TaskStatus::Cancelled));
    }
}
