//! Cron-driven recurring tasks.
//!
//! Each tick compares the next fire time after a schedule's last run with
//! the current time. Due schedules create a pending task, which is then
//! routed through [`TaskEngine::reprocess`]. Last-run times live in the
//! store so restarts neither skip nor repeat a firing.

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use serde_json::json;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::config::env_or;
use crate::error::{ConfigError, TaskError};
use crate::tasks::engine::TaskEngine;
use crate::tasks::model::{NewLog, NewTask, Priority, SOURCE_SCHEDULER, Task};

/// One recurring task definition.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ScheduleSpec {
    pub name: String,
    /// Six or seven fields, seconds first (`0 0 9 * * MON-FRI`).
    pub cron: String,
    pub template: String,
    #[serde(default = "default_priority")]
    pub priority: Priority,
}

fn default_priority() -> Priority {
    Priority::P2
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchedulerConfig {
    pub schedules: Vec<ScheduleSpec>,
    pub tick: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            schedules: Vec::new(),
            tick: Duration::from_secs(60),
        }
    }
}

impl SchedulerConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let schedules = match std::env::var("TASKDESK_SCHEDULES") {
            Ok(raw) if !raw.trim().is_empty() => parse_schedules(&raw)?,
            _ => Vec::new(),
        };
        Ok(Self {
            schedules,
            tick: Duration::from_secs(env_or("TASKDESK_SCHEDULER_TICK_SECS", 60)),
        })
    }
}

/// Parse the JSON array held in `TASKDESK_SCHEDULES`.
pub fn parse_schedules(raw: &str) -> Result<Vec<ScheduleSpec>, ConfigError> {
    serde_json::from_str(raw)
        .map_err(|e| ConfigError::ParseError(format!("TASKDESK_SCHEDULES: {e}")))
}

struct Entry {
    spec: ScheduleSpec,
    schedule: cron::Schedule,
}

pub struct Scheduler {
    engine: Arc<TaskEngine>,
    entries: Vec<Entry>,
    tick: Duration,
}

impl Scheduler {
    /// Schedules with an invalid cron expression are logged and dropped.
    pub fn new(engine: Arc<TaskEngine>, config: &SchedulerConfig) -> Self {
        let entries = config
            .schedules
            .iter()
            .filter_map(|spec| match cron::Schedule::from_str(&spec.cron) {
                Ok(schedule) => Some(Entry {
                    spec: spec.clone(),
                    schedule,
                }),
                Err(e) => {
                    warn!(schedule = %spec.name, cron = %spec.cron, error = %e,
                        "Invalid cron expression, schedule skipped");
                    None
                }
            })
            .collect();
        Self {
            engine,
            entries,
            tick: config.tick,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Fire every due schedule once. Returns the tasks created.
    pub async fn tick(&self) -> Vec<Task> {
        let mut created = Vec::new();
        for entry in &self.entries {
            match self.check(entry).await {
                Ok(Some(task)) => created.push(task),
                Ok(None) => {}
                Err(e) => error!(schedule = %entry.spec.name, error = %e, "Schedule check failed"),
            }
        }
        created
    }

    async fn check(&self, entry: &Entry) -> Result<Option<Task>, TaskError> {
        let db = self.engine.db();
        let now = self.engine.now();
        let name = &entry.spec.name;

        let Some(last_run) = db.get_schedule_run(name).await? else {
            db.set_schedule_run(name, now).await?;
            debug!(schedule = %name, "Schedule seen for the first time, seeded");
            return Ok(None);
        };

        let due = entry
            .schedule
            .after(&last_run)
            .next()
            .is_some_and(|next| next <= now);
        if !due {
            return Ok(None);
        }

        let pending = self
            .engine
            .create_pending(
                NewTask::new(
                    format!("[Scheduled] {}", entry.spec.template),
                    format!("Auto-created by scheduler: {name}"),
                )
                .with_priority(entry.spec.priority)
                .with_source(SOURCE_SCHEDULER),
            )
            .await?;
        // A run is stamped as soon as its task exists.
        db.set_schedule_run(name, now).await?;
        let task = self.engine.reprocess(pending.id).await?;
        self.engine
            .record(
                NewLog::new(
                    "scheduler_created_task",
                    json!({ "schedule": name, "template": entry.spec.template }),
                    now,
                )
                .for_task(task.id),
            )
            .await?;
        info!(schedule = %name, task_id = %task.id, status = %task.status, "Scheduler created task");
        Ok(Some(task))
    }

    /// Tick until `shutdown` turns true or its sender is dropped.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        info!(schedules = self.entries.len(), tick_secs = self.tick.as_secs(), "Scheduler started");
        loop {
            if *shutdown.borrow() {
                break;
            }
            self.tick().await;

            tokio::select! {
                _ = tokio::time::sleep(self.tick) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }
        info!("Scheduler stopped");
    }
}
