//! libSQL implementation of the async `Database` trait.
//!
//! Supports local file and in-memory databases. All statements go through
//! one connection guarded by an async mutex, so each transaction runs
//! without interleaving from other loops.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use libsql::{Connection, Database as LibSqlDatabase, Value, params};
use secrecy::{ExposeSecret, SecretString};
use tokio::sync::Mutex;
use tracing::{debug, info};
use uuid::Uuid;

use crate::channels::channel::{ChannelCredential, ChannelKind, CredentialExtra};
use crate::channels::oauth::OAuthState;
use crate::error::DatabaseError;
use crate::store::migrations;
use crate::store::traits::{Database, ProcessedMarker, TaskChange, TaskInsert};
use crate::tasks::model::{
    Approval, LogEntry, LogFilter, NewLog, Page, SlaRecord, Task, TaskFilter,
};

/// libSQL database backend.
pub struct LibSqlBackend {
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    conn: Mutex<Connection>,
}

impl LibSqlBackend {
    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(path: &Path) -> Result<Self, DatabaseError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                DatabaseError::Pool(format!("Failed to create database directory: {e}"))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| DatabaseError::Pool(format!("Failed to open libSQL database: {e}")))?;

        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;

        let backend = Self {
            db: Arc::new(db),
            conn: Mutex::new(conn),
        };
        backend.run_migrations().await?;
        info!(path = %path.display(), "Database opened");
        Ok(backend)
    }

    /// Create an in-memory database (for tests).
    pub async fn new_memory() -> Result<Self, DatabaseError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| {
                DatabaseError::Pool(format!("Failed to create in-memory database: {e}"))
            })?;

        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;

        let backend = Self {
            db: Arc::new(db),
            conn: Mutex::new(conn),
        };
        backend.run_migrations().await?;
        Ok(backend)
    }
}

// ── Helper functions ────────────────────────────────────────────────

/// Canonical timestamp format for every TEXT time column.
fn fmt_ts(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Parse an RFC 3339 or SQLite datetime string into DateTime<Utc>.
fn parse_datetime(s: &str) -> DateTime<Utc> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return dt.with_timezone(&Utc);
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f") {
        return ndt.and_utc();
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S") {
        return ndt.and_utc();
    }
    DateTime::<Utc>::MIN_UTC
}

fn parse_optional_datetime(s: &Option<String>) -> Option<DateTime<Utc>> {
    s.as_ref().filter(|s| !s.is_empty()).map(|s| parse_datetime(s))
}

fn opt_ts(dt: Option<DateTime<Utc>>) -> Value {
    match dt {
        Some(dt) => Value::Text(fmt_ts(&dt)),
        None => Value::Null,
    }
}

fn parse_uuid(s: &str, field: &str) -> Result<Uuid, DatabaseError> {
    Uuid::parse_str(s).map_err(|e| DatabaseError::Serialization(format!("{field}: {e}")))
}

fn parse_enum<T: std::str::FromStr<Err = String>>(s: &str) -> Result<T, DatabaseError> {
    s.parse::<T>().map_err(DatabaseError::Serialization)
}

/// Write one audit row on `conn` (which may be a transaction).
async fn insert_log_on(conn: &Connection, log: &NewLog) -> Result<i64, DatabaseError> {
    let detail = serde_json::to_string(&log.detail)
        .map_err(|e| DatabaseError::Serialization(e.to_string()))?;
    conn.execute(
        "INSERT INTO logs (action, detail, task_id, created_at) VALUES (?1, ?2, ?3, ?4)",
        params![
            log.action.as_str(),
            detail,
            log.task_id.map(|id| id.to_string()),
            fmt_ts(&log.created_at),
        ],
    )
    .await
    .map_err(|e| DatabaseError::Query(format!("insert_log: {e}")))?;
    Ok(conn.last_insert_rowid())
}

// ── Trait implementation ────────────────────────────────────────────

#[async_trait]
impl Database for LibSqlBackend {
    async fn run_migrations(&self) -> Result<(), DatabaseError> {
        let conn = self.conn.lock().await;
        migrations::run_migrations(&conn).await
    }

    // ── Tasks ───────────────────────────────────────────────────────

    async fn insert_task(
        &self,
        task: &Task,
        log: &NewLog,
        marker: Option<&ProcessedMarker>,
    ) -> Result<TaskInsert, DatabaseError> {
        let conn = self.conn.lock().await;
        let tx = conn
            .transaction()
            .await
            .map_err(|e| DatabaseError::Query(format!("insert_task begin: {e}")))?;

        let result: Result<TaskInsert, DatabaseError> = async {
            if let Some(marker) = marker {
                let inserted = tx
                    .execute(
                        &format!(
                            "INSERT OR IGNORE INTO {} (external_id, task_id, created_at) VALUES (?1, ?2, ?3)",
                            marker.channel.processed_table()
                        ),
                        params![
                            marker.external_id.as_str(),
                            task.id.to_string(),
                            fmt_ts(&task.created_at),
                        ],
                    )
                    .await
                    .map_err(|e| DatabaseError::Query(format!("insert_task marker: {e}")))?;
                if inserted == 0 {
                    return Ok(TaskInsert::AlreadyProcessed);
                }
            }

            tx.execute(
                &format!("INSERT INTO tasks ({TASK_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)"),
                params![
                    task.id.to_string(),
                    task.title.as_str(),
                    task.body.as_str(),
                    task.priority.to_string(),
                    task.status.to_string(),
                    task.sensitivity_score,
                    task.sensitivity_category.to_string(),
                    opt_ts(task.sla_deadline),
                    task.source.as_str(),
                    fmt_ts(&task.created_at),
                    fmt_ts(&task.updated_at),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("insert_task: {e}")))?;

            tx.execute(
                "INSERT INTO sla_records (task_id, priority, deadline, created_at) VALUES (?1, ?2, ?3, ?4)",
                params![
                    task.id.to_string(),
                    task.priority.to_string(),
                    opt_ts(task.sla_deadline),
                    fmt_ts(&task.created_at),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("insert_task sla: {e}")))?;

            insert_log_on(&tx, log).await?;
            Ok(TaskInsert::Inserted)
        }
        .await;

        match result {
            Ok(TaskInsert::Inserted) => {
                tx.commit()
                    .await
                    .map_err(|e| DatabaseError::Query(format!("insert_task commit: {e}")))?;
                debug!(id = %task.id, "Task inserted");
                Ok(TaskInsert::Inserted)
            }
            Ok(TaskInsert::AlreadyProcessed) => {
                let _ = tx.rollback().await;
                Ok(TaskInsert::AlreadyProcessed)
            }
            Err(e) => {
                let _ = tx.rollback().await;
                Err(e)
            }
        }
    }

    async fn get_task(&self, id: Uuid) -> Result<Option<Task>, DatabaseError> {
        let conn = self.conn.lock().await;
        let mut rows = conn
            .query(
                &format!("SELECT {TASK_COLUMNS} FROM tasks WHERE id = ?1"),
                params![id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_task: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(row_to_task(&row)?)),
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("get_task row: {e}"))),
        }
    }

    async fn list_tasks(
        &self,
        filter: &TaskFilter,
        page: Page,
    ) -> Result<(Vec<Task>, u64), DatabaseError> {
        let mut clauses: Vec<String> = Vec::new();
        let mut values: Vec<Value> = Vec::new();
        if let Some(status) = filter.status {
            values.push(Value::Text(status.to_string()));
            clauses.push(format!("status = ?{}", values.len()));
        }
        if let Some(priority) = filter.priority {
            values.push(Value::Text(priority.to_string()));
            clauses.push(format!("priority = ?{}", values.len()));
        }
        if let Some(ref source) = filter.source {
            values.push(Value::Text(source.clone()));
            clauses.push(format!("source = ?{}", values.len()));
        }
        let where_sql = if clauses.is_empty() {
            String::new()
        } else {
            format!("WHERE {}", clauses.join(" AND "))
        };

        let conn = self.conn.lock().await;

        let mut rows = conn
            .query(
                &format!("SELECT COUNT(*) FROM tasks {where_sql}"),
                libsql::params_from_iter(values.clone()),
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("list_tasks count: {e}")))?;
        let total: i64 = match rows.next().await {
            Ok(Some(row)) => row.get(0).unwrap_or(0),
            _ => 0,
        };

        let limit_idx = values.len() + 1;
        let offset_idx = values.len() + 2;
        values.push(Value::Integer(page.limit as i64));
        values.push(Value::Integer(page.offset as i64));

        let mut rows = conn
            .query(
                &format!(
                    "SELECT {TASK_COLUMNS} FROM tasks {where_sql} \
                     ORDER BY created_at DESC, rowid DESC LIMIT ?{limit_idx} OFFSET ?{offset_idx}"
                ),
                libsql::params_from_iter(values),
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("list_tasks: {e}")))?;

        let mut tasks = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            tasks.push(row_to_task(&row)?);
        }
        Ok((tasks, total.max(0) as u64))
    }

    async fn apply_task_change(&self, change: TaskChange<'_>) -> Result<bool, DatabaseError> {
        let task = change.task;
        let conn = self.conn.lock().await;
        let tx = conn
            .transaction()
            .await
            .map_err(|e| DatabaseError::Query(format!("apply_task_change begin: {e}")))?;

        let result: Result<bool, DatabaseError> = async {
            let updated = tx
                .execute(
                    "UPDATE tasks SET title = ?1, body = ?2, priority = ?3, status = ?4, \
                     sensitivity_score = ?5, sensitivity_category = ?6, updated_at = ?7 \
                     WHERE id = ?8 AND status = ?9",
                    params![
                        task.title.as_str(),
                        task.body.as_str(),
                        task.priority.to_string(),
                        task.status.to_string(),
                        task.sensitivity_score,
                        task.sensitivity_category.to_string(),
                        fmt_ts(&task.updated_at),
                        task.id.to_string(),
                        change.expected_status.to_string(),
                    ],
                )
                .await
                .map_err(|e| DatabaseError::Query(format!("apply_task_change: {e}")))?;
            if updated == 0 {
                return Ok(false);
            }

            if let Some(approval) = change.approval {
                tx.execute(
                    "INSERT INTO approvals (id, task_id, decision, reason, decided_by, decided_at) \
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                    params![
                        approval.id.to_string(),
                        approval.task_id.to_string(),
                        approval.decision.to_string(),
                        approval.reason.as_str(),
                        approval.decided_by.as_str(),
                        fmt_ts(&approval.decided_at),
                    ],
                )
                .await
                .map_err(|e| DatabaseError::Query(format!("apply_task_change approval: {e}")))?;
            }

            if let Some(sla) = change.sla_completion {
                tx.execute(
                    "UPDATE sla_records SET completed_at = ?1, met_sla = ?2 WHERE id = ?3",
                    params![fmt_ts(&sla.completed_at), sla.met_sla as i64, sla.record_id],
                )
                .await
                .map_err(|e| DatabaseError::Query(format!("apply_task_change sla: {e}")))?;
            }

            insert_log_on(&tx, change.log).await?;
            Ok(true)
        }
        .await;

        match result {
            Ok(true) => {
                tx.commit()
                    .await
                    .map_err(|e| DatabaseError::Query(format!("apply_task_change commit: {e}")))?;
                Ok(true)
            }
            Ok(false) => {
                let _ = tx.rollback().await;
                Ok(false)
            }
            Err(e) => {
                let _ = tx.rollback().await;
                Err(e)
            }
        }
    }

    async fn delete_task(&self, id: Uuid, log: &NewLog) -> Result<bool, DatabaseError> {
        let conn = self.conn.lock().await;
        let tx = conn
            .transaction()
            .await
            .map_err(|e| DatabaseError::Query(format!("delete_task begin: {e}")))?;

        let result: Result<bool, DatabaseError> = async {
            let id_str = id.to_string();
            for table in ["approvals", "sla_records", "logs"] {
                tx.execute(
                    &format!("DELETE FROM {table} WHERE task_id = ?1"),
                    params![id_str.as_str()],
                )
                .await
                .map_err(|e| DatabaseError::Query(format!("delete_task {table}: {e}")))?;
            }
            let deleted = tx
                .execute("DELETE FROM tasks WHERE id = ?1", params![id_str.as_str()])
                .await
                .map_err(|e| DatabaseError::Query(format!("delete_task: {e}")))?;
            if deleted == 0 {
                return Ok(false);
            }
            insert_log_on(&tx, log).await?;
            Ok(true)
        }
        .await;

        match result {
            Ok(true) => {
                tx.commit()
                    .await
                    .map_err(|e| DatabaseError::Query(format!("delete_task commit: {e}")))?;
                Ok(true)
            }
            Ok(false) => {
                let _ = tx.rollback().await;
                Ok(false)
            }
            Err(e) => {
                let _ = tx.rollback().await;
                Err(e)
            }
        }
    }

    // ── Approvals / SLA / Logs ──────────────────────────────────────

    async fn list_approvals(&self, task_id: Option<Uuid>) -> Result<Vec<Approval>, DatabaseError> {
        let conn = self.conn.lock().await;
        let mut rows = match task_id {
            Some(id) => conn
                .query(
                    &format!("SELECT {APPROVAL_COLUMNS} FROM approvals WHERE task_id = ?1 ORDER BY decided_at DESC, rowid DESC"),
                    params![id.to_string()],
                )
                .await,
            None => conn
                .query(
                    &format!("SELECT {APPROVAL_COLUMNS} FROM approvals ORDER BY decided_at DESC, rowid DESC"),
                    (),
                )
                .await,
        }
        .map_err(|e| DatabaseError::Query(format!("list_approvals: {e}")))?;

        let mut approvals = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            approvals.push(row_to_approval(&row)?);
        }
        Ok(approvals)
    }

    async fn list_sla_records(
        &self,
        task_id: Option<Uuid>,
    ) -> Result<Vec<SlaRecord>, DatabaseError> {
        let conn = self.conn.lock().await;
        let mut rows = match task_id {
            Some(id) => conn
                .query(
                    &format!("SELECT {SLA_COLUMNS} FROM sla_records WHERE task_id = ?1 ORDER BY id DESC"),
                    params![id.to_string()],
                )
                .await,
            None => conn
                .query(
                    &format!("SELECT {SLA_COLUMNS} FROM sla_records ORDER BY id DESC"),
                    (),
                )
                .await,
        }
        .map_err(|e| DatabaseError::Query(format!("list_sla_records: {e}")))?;

        let mut records = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            records.push(row_to_sla(&row)?);
        }
        Ok(records)
    }

    async fn latest_sla_record(&self, task_id: Uuid) -> Result<Option<SlaRecord>, DatabaseError> {
        let conn = self.conn.lock().await;
        let mut rows = conn
            .query(
                &format!("SELECT {SLA_COLUMNS} FROM sla_records WHERE task_id = ?1 ORDER BY id DESC LIMIT 1"),
                params![task_id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("latest_sla_record: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(row_to_sla(&row)?)),
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("latest_sla_record row: {e}"))),
        }
    }

    async fn append_log(&self, log: &NewLog) -> Result<i64, DatabaseError> {
        let conn = self.conn.lock().await;
        insert_log_on(&conn, log).await
    }

    async fn list_logs(
        &self,
        filter: &LogFilter,
        page: Page,
    ) -> Result<Vec<LogEntry>, DatabaseError> {
        let mut clauses: Vec<String> = Vec::new();
        let mut values: Vec<Value> = Vec::new();
        if let Some(task_id) = filter.task_id {
            values.push(Value::Text(task_id.to_string()));
            clauses.push(format!("task_id = ?{}", values.len()));
        }
        if let Some(ref action) = filter.action {
            values.push(Value::Text(action.clone()));
            clauses.push(format!("action = ?{}", values.len()));
        }
        let where_sql = if clauses.is_empty() {
            String::new()
        } else {
            format!("WHERE {}", clauses.join(" AND "))
        };
        let limit_idx = values.len() + 1;
        let offset_idx = values.len() + 2;
        values.push(Value::Integer(page.limit as i64));
        values.push(Value::Integer(page.offset as i64));

        let conn = self.conn.lock().await;
        let mut rows = conn
            .query(
                &format!(
                    "SELECT {LOG_COLUMNS} FROM logs {where_sql} \
                     ORDER BY id DESC LIMIT ?{limit_idx} OFFSET ?{offset_idx}"
                ),
                libsql::params_from_iter(values),
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("list_logs: {e}")))?;

        let mut logs = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            logs.push(row_to_log(&row)?);
        }
        Ok(logs)
    }

    // ── Processed markers ───────────────────────────────────────────

    async fn is_processed(
        &self,
        channel: ChannelKind,
        external_id: &str,
    ) -> Result<bool, DatabaseError> {
        let conn = self.conn.lock().await;
        let mut rows = conn
            .query(
                &format!(
                    "SELECT 1 FROM {} WHERE external_id = ?1 LIMIT 1",
                    channel.processed_table()
                ),
                params![external_id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("is_processed: {e}")))?;

        match rows.next().await {
            Ok(row) => Ok(row.is_some()),
            Err(e) => Err(DatabaseError::Query(format!("is_processed row: {e}"))),
        }
    }

    async fn count_processed(&self, channel: ChannelKind) -> Result<u64, DatabaseError> {
        let conn = self.conn.lock().await;
        let mut rows = conn
            .query(
                &format!("SELECT COUNT(*) FROM {}", channel.processed_table()),
                (),
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("count_processed: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => Ok(row.get::<i64>(0).unwrap_or(0).max(0) as u64),
            _ => Ok(0),
        }
    }

    // ── Credentials ─────────────────────────────────────────────────

    async fn get_credential(
        &self,
        channel: ChannelKind,
    ) -> Result<Option<ChannelCredential>, DatabaseError> {
        let conn = self.conn.lock().await;
        let mut rows = conn
            .query(
                &format!("SELECT {CREDENTIAL_COLUMNS} FROM credentials WHERE channel = ?1"),
                params![channel.as_str()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_credential: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(row_to_credential(&row)?)),
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("get_credential row: {e}"))),
        }
    }

    async fn save_credential(&self, credential: &ChannelCredential) -> Result<(), DatabaseError> {
        let extra = serde_json::to_string(&credential.extra)
            .map_err(|e| DatabaseError::Serialization(e.to_string()))?;
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO credentials (channel, access_token, refresh_token, expires_at, extra, last_polled_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
             ON CONFLICT (channel) DO UPDATE SET
                access_token = ?2, refresh_token = ?3, expires_at = ?4, extra = ?5,
                last_polled_at = ?6, updated_at = ?7",
            params![
                credential.channel.as_str(),
                credential.access_token.expose_secret(),
                credential
                    .refresh_token
                    .as_ref()
                    .map(|t| t.expose_secret().to_string()),
                opt_ts(credential.expires_at),
                extra,
                opt_ts(credential.last_polled_at),
                fmt_ts(&Utc::now()),
            ],
        )
        .await
        .map_err(|e| DatabaseError::Query(format!("save_credential: {e}")))?;
        debug!(channel = %credential.channel, "Credential saved");
        Ok(())
    }

    async fn mark_polled(
        &self,
        channel: ChannelKind,
        at: DateTime<Utc>,
    ) -> Result<(), DatabaseError> {
        let conn = self.conn.lock().await;
        conn.execute(
            "UPDATE credentials SET last_polled_at = ?1 WHERE channel = ?2",
            params![fmt_ts(&at), channel.as_str()],
        )
        .await
        .map_err(|e| DatabaseError::Query(format!("mark_polled: {e}")))?;
        Ok(())
    }

    // ── OAuth states ────────────────────────────────────────────────

    async fn insert_oauth_state(&self, state: &OAuthState) -> Result<(), DatabaseError> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO oauth_states (state, channel, created_at, expires_at) VALUES (?1, ?2, ?3, ?4)",
            params![
                state.state.as_str(),
                state.channel.as_str(),
                fmt_ts(&state.created_at),
                fmt_ts(&state.expires_at),
            ],
        )
        .await
        .map_err(|e| DatabaseError::Query(format!("insert_oauth_state: {e}")))?;
        Ok(())
    }

    async fn take_oauth_state(&self, state: &str) -> Result<Option<OAuthState>, DatabaseError> {
        let conn = self.conn.lock().await;
        let mut rows = conn
            .query(
                "SELECT state, channel, created_at, expires_at FROM oauth_states WHERE state = ?1",
                params![state],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("take_oauth_state: {e}")))?;

        let found = match rows.next().await {
            Ok(Some(row)) => {
                let state: String = row
                    .get(0)
                    .map_err(|e| DatabaseError::Query(format!("oauth_state.state: {e}")))?;
                let channel: String = row
                    .get(1)
                    .map_err(|e| DatabaseError::Query(format!("oauth_state.channel: {e}")))?;
                let created: String = row.get(2).unwrap_or_default();
                let expires: String = row.get(3).unwrap_or_default();
                Some(OAuthState {
                    state,
                    channel: parse_enum(&channel)?,
                    created_at: parse_datetime(&created),
                    expires_at: parse_datetime(&expires),
                })
            }
            Ok(None) => None,
            Err(e) => return Err(DatabaseError::Query(format!("take_oauth_state row: {e}"))),
        };
        drop(rows);

        if found.is_some() {
            conn.execute("DELETE FROM oauth_states WHERE state = ?1", params![state])
                .await
                .map_err(|e| DatabaseError::Query(format!("take_oauth_state delete: {e}")))?;
        }
        Ok(found)
    }

    async fn purge_oauth_states(&self, now: DateTime<Utc>) -> Result<u64, DatabaseError> {
        let conn = self.conn.lock().await;
        conn.execute(
            "DELETE FROM oauth_states WHERE expires_at < ?1",
            params![fmt_ts(&now)],
        )
        .await
        .map_err(|e| DatabaseError::Query(format!("purge_oauth_states: {e}")))
    }

    // ── Settings ────────────────────────────────────────────────────

    async fn get_setting(&self, key: &str) -> Result<Option<serde_json::Value>, DatabaseError> {
        let conn = self.conn.lock().await;
        let mut rows = conn
            .query("SELECT value FROM settings WHERE key = ?1", params![key])
            .await
            .map_err(|e| DatabaseError::Query(format!("get_setting: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => {
                let value_str: String = row.get(0).unwrap_or_else(|_| "null".to_string());
                let value: serde_json::Value =
                    serde_json::from_str(&value_str).unwrap_or(serde_json::Value::Null);
                Ok(Some(value))
            }
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("get_setting: {e}"))),
        }
    }

    async fn set_setting(
        &self,
        key: &str,
        value: &serde_json::Value,
        at: DateTime<Utc>,
    ) -> Result<(), DatabaseError> {
        let value_str = serde_json::to_string(value)
            .map_err(|e| DatabaseError::Serialization(e.to_string()))?;
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO settings (key, value, updated_at) VALUES (?1, ?2, ?3)
             ON CONFLICT (key) DO UPDATE SET value = ?2, updated_at = ?3",
            params![key, value_str, fmt_ts(&at)],
        )
        .await
        .map_err(|e| DatabaseError::Query(format!("set_setting: {e}")))?;
        Ok(())
    }

    // ── Scheduler ───────────────────────────────────────────────────

    async fn get_schedule_run(&self, name: &str) -> Result<Option<DateTime<Utc>>, DatabaseError> {
        let conn = self.conn.lock().await;
        let mut rows = conn
            .query(
                "SELECT last_run_at FROM schedule_runs WHERE name = ?1",
                params![name],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_schedule_run: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => {
                let raw: String = row.get(0).unwrap_or_default();
                Ok(Some(parse_datetime(&raw)))
            }
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("get_schedule_run row: {e}"))),
        }
    }

    async fn set_schedule_run(&self, name: &str, at: DateTime<Utc>) -> Result<(), DatabaseError> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO schedule_runs (name, last_run_at) VALUES (?1, ?2)
             ON CONFLICT (name) DO UPDATE SET last_run_at = ?2",
            params![name, fmt_ts(&at)],
        )
        .await
        .map_err(|e| DatabaseError::Query(format!("set_schedule_run: {e}")))?;
        Ok(())
    }
}

// ── Row mapping helpers ─────────────────────────────────────────────

/// Column list for task SELECT queries (11 columns).
const TASK_COLUMNS: &str = "id, title, body, priority, status, sensitivity_score, sensitivity_category, sla_deadline, source, created_at, updated_at";

const APPROVAL_COLUMNS: &str = "id, task_id, decision, reason, decided_by, decided_at";

const SLA_COLUMNS: &str = "id, task_id, priority, deadline, completed_at, met_sla, created_at";

const LOG_COLUMNS: &str = "id, action, detail, task_id, created_at";

const CREDENTIAL_COLUMNS: &str =
    "channel, access_token, refresh_token, expires_at, extra, last_polled_at";

fn row_to_task(row: &libsql::Row) -> Result<Task, DatabaseError> {
    let id_str: String = row.get(0).map_err(|e| DatabaseError::Query(format!("task.id: {e}")))?;
    let title: String = row.get(1).map_err(|e| DatabaseError::Query(format!("task.title: {e}")))?;
    let body: String = row.get(2).unwrap_or_default();
    let priority: String = row
        .get(3)
        .map_err(|e| DatabaseError::Query(format!("task.priority: {e}")))?;
    let status: String = row
        .get(4)
        .map_err(|e| DatabaseError::Query(format!("task.status: {e}")))?;
    let score: f64 = row.get(5).unwrap_or(0.0);
    let category: String = row.get(6).unwrap_or_else(|_| "none".to_string());
    let deadline: Option<String> = row.get(7).ok();
    let source: String = row.get(8).unwrap_or_default();
    let created: String = row.get(9).unwrap_or_default();
    let updated: String = row.get(10).unwrap_or_default();

    Ok(Task {
        id: parse_uuid(&id_str, "task.id")?,
        title,
        body,
        priority: parse_enum(&priority)?,
        status: parse_enum(&status)?,
        sensitivity_score: score,
        sensitivity_category: parse_enum(&category)?,
        sla_deadline: parse_optional_datetime(&deadline),
        source,
        created_at: parse_datetime(&created),
        updated_at: parse_datetime(&updated),
    })
}

fn row_to_approval(row: &libsql::Row) -> Result<Approval, DatabaseError> {
    let id: String = row.get(0).map_err(|e| DatabaseError::Query(format!("approval.id: {e}")))?;
    let task_id: String = row
        .get(1)
        .map_err(|e| DatabaseError::Query(format!("approval.task_id: {e}")))?;
    let decision: String = row
        .get(2)
        .map_err(|e| DatabaseError::Query(format!("approval.decision: {e}")))?;
    let reason: String = row.get(3).unwrap_or_default();
    let decided_by: String = row.get(4).unwrap_or_default();
    let decided_at: String = row.get(5).unwrap_or_default();

    Ok(Approval {
        id: parse_uuid(&id, "approval.id")?,
        task_id: parse_uuid(&task_id, "approval.task_id")?,
        decision: parse_enum(&decision)?,
        reason,
        decided_by,
        decided_at: parse_datetime(&decided_at),
    })
}

fn row_to_sla(row: &libsql::Row) -> Result<SlaRecord, DatabaseError> {
    let id: i64 = row.get(0).map_err(|e| DatabaseError::Query(format!("sla.id: {e}")))?;
    let task_id: String = row
        .get(1)
        .map_err(|e| DatabaseError::Query(format!("sla.task_id: {e}")))?;
    let priority: String = row
        .get(2)
        .map_err(|e| DatabaseError::Query(format!("sla.priority: {e}")))?;
    let deadline: Option<String> = row.get(3).ok();
    let completed_at: Option<String> = row.get(4).ok();
    let met_sla: Option<i64> = row.get(5).ok();
    let created: String = row.get(6).unwrap_or_default();

    Ok(SlaRecord {
        id,
        task_id: parse_uuid(&task_id, "sla.task_id")?,
        priority: parse_enum(&priority)?,
        deadline: parse_optional_datetime(&deadline),
        completed_at: parse_optional_datetime(&completed_at),
        met_sla: met_sla.map(|v| v != 0),
        created_at: parse_datetime(&created),
    })
}

fn row_to_log(row: &libsql::Row) -> Result<LogEntry, DatabaseError> {
    let id: i64 = row.get(0).map_err(|e| DatabaseError::Query(format!("log.id: {e}")))?;
    let action: String = row
        .get(1)
        .map_err(|e| DatabaseError::Query(format!("log.action: {e}")))?;
    let detail_str: String = row.get(2).unwrap_or_else(|_| "{}".to_string());
    let task_id: Option<String> = row.get(3).ok();
    let created: String = row.get(4).unwrap_or_default();

    let task_id = match task_id.filter(|s| !s.is_empty()) {
        Some(s) => Some(parse_uuid(&s, "log.task_id")?),
        None => None,
    };

    Ok(LogEntry {
        id,
        action,
        detail: serde_json::from_str(&detail_str).unwrap_or(serde_json::Value::Null),
        task_id,
        created_at: parse_datetime(&created),
    })
}

fn row_to_credential(row: &libsql::Row) -> Result<ChannelCredential, DatabaseError> {
    let channel: String = row
        .get(0)
        .map_err(|e| DatabaseError::Query(format!("credential.channel: {e}")))?;
    let access_token: String = row
        .get(1)
        .map_err(|e| DatabaseError::Query(format!("credential.access_token: {e}")))?;
    let refresh_token: Option<String> = row.get(2).ok();
    let expires_at: Option<String> = row.get(3).ok();
    let extra: String = row.get(4).unwrap_or_else(|_| "{}".to_string());
    let last_polled_at: Option<String> = row.get(5).ok();

    let extra: CredentialExtra = serde_json::from_str(&extra)
        .map_err(|e| DatabaseError::Serialization(format!("credential.extra: {e}")))?;

    Ok(ChannelCredential {
        channel: parse_enum(&channel)?,
        access_token: SecretString::from(access_token),
        refresh_token: refresh_token
            .filter(|s| !s.is_empty())
            .map(SecretString::from),
        expires_at: parse_optional_datetime(&expires_at),
        extra,
        last_polled_at: parse_optional_datetime(&last_polled_at),
    })
}

// ── Tests ───────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sensitivity::SensitivityCategory;
    use crate::tasks::model::{ApprovalDecision, Priority, TaskStatus};
    use chrono::TimeZone;

    async fn test_db() -> LibSqlBackend {
        LibSqlBackend::new_memory().await.unwrap()
    }

    fn at(h: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, h, 0, 0).unwrap()
    }

    fn make_task(title: &str, status: TaskStatus, created: DateTime<Utc>) -> Task {
        Task {
            id: Uuid::new_v4(),
            title: title.to_string(),
            body: "body".to_string(),
            priority: Priority::P2,
            status,
            sensitivity_score: 0.0,
            sensitivity_category: SensitivityCategory::Unflagged,
            sla_deadline: Some(created + chrono::Duration::hours(24)),
            source: "api".to_string(),
            created_at: created,
            updated_at: created,
        }
    }

    fn created_log(task: &Task) -> NewLog {
        NewLog::new("task_created", serde_json::json!({"title": task.title}), task.created_at)
            .for_task(task.id)
    }

    // ── Task tests ──────────────────────────────────────────────────

    #[tokio::test]
    async fn insert_and_get_task() {
        let db = test_db().await;
        let task = make_task("hello", TaskStatus::InProgress, at(9));

        let r = db.insert_task(&task, &created_log(&task), None).await.unwrap();
        assert_eq!(r, TaskInsert::Inserted);

        let fetched = db.get_task(task.id).await.unwrap().unwrap();
        assert_eq!(fetched, task);

        let sla = db.latest_sla_record(task.id).await.unwrap().unwrap();
        assert_eq!(sla.deadline, task.sla_deadline);
        assert_eq!(sla.met_sla, None);

        let logs = db
            .list_logs(&LogFilter { task_id: Some(task.id), action: None }, Page::default())
            .await
            .unwrap();
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].action, "task_created");
    }

    #[tokio::test]
    async fn get_task_not_found() {
        let db = test_db().await;
        assert!(db.get_task(Uuid::new_v4()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn duplicate_marker_writes_nothing() {
        let db = test_db().await;
        let marker = ProcessedMarker {
            channel: ChannelKind::Gmail,
            external_id: "msg-1".into(),
        };
        let first = make_task("first", TaskStatus::InProgress, at(9));
        let second = make_task("second", TaskStatus::InProgress, at(10));

        assert_eq!(
            db.insert_task(&first, &created_log(&first), Some(&marker)).await.unwrap(),
            TaskInsert::Inserted
        );
        assert_eq!(
            db.insert_task(&second, &created_log(&second), Some(&marker)).await.unwrap(),
            TaskInsert::AlreadyProcessed
        );

        assert!(db.get_task(second.id).await.unwrap().is_none());
        let (tasks, total) = db.list_tasks(&TaskFilter::default(), Page::default()).await.unwrap();
        assert_eq!(total, 1);
        assert_eq!(tasks[0].id, first.id);
        assert!(db.is_processed(ChannelKind::Gmail, "msg-1").await.unwrap());
        assert!(!db.is_processed(ChannelKind::Twitter, "msg-1").await.unwrap());
        assert_eq!(db.count_processed(ChannelKind::Gmail).await.unwrap(), 1);
        assert_eq!(db.list_sla_records(None).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn list_tasks_filters_and_pages_newest_first() {
        let db = test_db().await;
        for (i, status) in [
            TaskStatus::InProgress,
            TaskStatus::AwaitingApproval,
            TaskStatus::InProgress,
        ]
        .into_iter()
        .enumerate()
        {
            let t = make_task(&format!("t{i}"), status, at(i as u32));
            db.insert_task(&t, &created_log(&t), None).await.unwrap();
        }

        let (all, total) = db.list_tasks(&TaskFilter::default(), Page::default()).await.unwrap();
        assert_eq!(total, 3);
        assert_eq!(
            all.iter().map(|t| t.title.as_str()).collect::<Vec<_>>(),
            vec!["t2", "t1", "t0"]
        );

        let filter = TaskFilter {
            status: Some(TaskStatus::InProgress),
            ..TaskFilter::default()
        };
        let (page, total) = db.list_tasks(&filter, Page::new(1, 1)).await.unwrap();
        assert_eq!(total, 2);
        assert_eq!(page.len(), 1);
        assert_eq!(page[0].title, "t0");
    }

    #[tokio::test]
    async fn guarded_change_applies_once() {
        let db = test_db().await;
        let task = make_task("approve me", TaskStatus::AwaitingApproval, at(9));
        db.insert_task(&task, &created_log(&task), None).await.unwrap();

        let mut approved = task.clone();
        approved.status = TaskStatus::Approved;
        approved.updated_at = at(10);
        let approval = Approval {
            id: Uuid::new_v4(),
            task_id: task.id,
            decision: ApprovalDecision::Approved,
            reason: "ok".into(),
            decided_by: "alex".into(),
            decided_at: at(10),
        };
        let log = NewLog::new("task_approved", serde_json::json!({}), at(10)).for_task(task.id);

        let change = TaskChange {
            task: &approved,
            expected_status: TaskStatus::AwaitingApproval,
            approval: Some(&approval),
            sla_completion: None,
            log: &log,
        };
        assert!(db.apply_task_change(change.clone()).await.unwrap());
        // The stored status no longer matches the guard.
        assert!(!db.apply_task_change(change).await.unwrap());

        assert_eq!(db.list_approvals(Some(task.id)).await.unwrap().len(), 1);
        let logs = db
            .list_logs(&LogFilter { task_id: Some(task.id), action: None }, Page::default())
            .await
            .unwrap();
        assert_eq!(logs.len(), 2);
        assert_eq!(logs[0].action, "task_approved");
    }

    #[tokio::test]
    async fn delete_cascades_but_keeps_markers() {
        let db = test_db().await;
        let task = make_task("gone", TaskStatus::InProgress, at(9));
        let marker = ProcessedMarker {
            channel: ChannelKind::WhatsApp,
            external_id: "SM1".into(),
        };
        db.insert_task(&task, &created_log(&task), Some(&marker)).await.unwrap();

        let log = NewLog::new("task_deleted", serde_json::json!({"task_id": task.id}), at(11));
        assert!(db.delete_task(task.id, &log).await.unwrap());
        assert!(!db.delete_task(task.id, &log).await.unwrap());

        assert!(db.get_task(task.id).await.unwrap().is_none());
        assert!(db.list_sla_records(Some(task.id)).await.unwrap().is_empty());
        assert!(db.is_processed(ChannelKind::WhatsApp, "SM1").await.unwrap());

        let logs = db.list_logs(&LogFilter::default(), Page::default()).await.unwrap();
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].action, "task_deleted");
        assert_eq!(logs[0].task_id, None);
    }

    // ── Credential / state tests ────────────────────────────────────

    #[tokio::test]
    async fn credential_round_trip() {
        let db = test_db().await;
        let cred = ChannelCredential::new(
            "access",
            CredentialExtra::LinkedIn {
                person_urn: Some("urn:li:person:1".into()),
                watch_urn: None,
            },
        )
        .with_refresh_token("refresh")
        .with_expiry(at(12));
        db.save_credential(&cred).await.unwrap();

        let loaded = db.get_credential(ChannelKind::LinkedIn).await.unwrap().unwrap();
        assert_eq!(loaded.access_token.expose_secret(), "access");
        assert_eq!(loaded.refresh_token.unwrap().expose_secret(), "refresh");
        assert_eq!(loaded.expires_at, Some(at(12)));
        assert_eq!(loaded.extra, cred.extra);

        db.mark_polled(ChannelKind::LinkedIn, at(13)).await.unwrap();
        let loaded = db.get_credential(ChannelKind::LinkedIn).await.unwrap().unwrap();
        assert_eq!(loaded.last_polled_at, Some(at(13)));
    }

    #[tokio::test]
    async fn oauth_state_is_single_use() {
        let db = test_db().await;
        let state = OAuthState {
            state: "abc".into(),
            channel: ChannelKind::Twitter,
            created_at: at(9),
            expires_at: at(10),
        };
        db.insert_oauth_state(&state).await.unwrap();

        assert_eq!(db.take_oauth_state("abc").await.unwrap(), Some(state));
        assert_eq!(db.take_oauth_state("abc").await.unwrap(), None);
    }

    #[tokio::test]
    async fn purge_removes_only_expired_states() {
        let db = test_db().await;
        for (name, exp) in [("old", at(8)), ("fresh", at(12))] {
            db.insert_oauth_state(&OAuthState {
                state: name.into(),
                channel: ChannelKind::Gmail,
                created_at: at(7),
                expires_at: exp,
            })
            .await
            .unwrap();
        }
        assert_eq!(db.purge_oauth_states(at(10)).await.unwrap(), 1);
        assert!(db.take_oauth_state("fresh").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn settings_and_schedule_runs() {
        let db = test_db().await;
        assert!(db.get_setting("autonomy_override").await.unwrap().is_none());
        db.set_setting("autonomy_override", &serde_json::json!(true), at(9))
            .await
            .unwrap();
        db.set_setting("autonomy_override", &serde_json::json!(false), at(10))
            .await
            .unwrap();
        assert_eq!(
            db.get_setting("autonomy_override").await.unwrap(),
            Some(serde_json::json!(false))
        );

        assert!(db.get_schedule_run("daily").await.unwrap().is_none());
        db.set_schedule_run("daily", at(9)).await.unwrap();
        db.set_schedule_run("daily", at(11)).await.unwrap();
        assert_eq!(db.get_schedule_run("daily").await.unwrap(), Some(at(11)));
    }

    #[tokio::test]
    async fn local_file_database_persists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("taskdesk.db");
        let task = make_task("persisted", TaskStatus::InProgress, at(9));
        {
            let db = LibSqlBackend::new_local(&path).await.unwrap();
            db.insert_task(&task, &created_log(&task), None).await.unwrap();
        }
        let db = LibSqlBackend::new_local(&path).await.unwrap();
        assert_eq!(db.get_task(task.id).await.unwrap().unwrap().title, "persisted");
    }
}
