//! Error types for taskdesk.

use uuid::Uuid;

use crate::tasks::model::TaskStatus;

/// Top-level error type.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Channel error: {0}")]
    Channel(#[from] ChannelError),

    #[error("Task error: {0}")]
    Task(#[from] TaskError),

    #[error("Ingest error: {0}")]
    Ingest(#[from] IngestError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("Failed to parse configuration: {0}")]
    ParseError(String),
}

/// Database-related errors.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Connection pool error: {0}")]
    Pool(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Constraint violation: {0}")]
    Constraint(String),

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Task lifecycle errors.
#[derive(Debug, thiserror::Error)]
pub enum TaskError {
    #[error("Task {id} not found")]
    NotFound { id: Uuid },

    #[error("Task {id} is {state}, cannot transition to {target}")]
    InvalidTransition {
        id: Uuid,
        state: TaskStatus,
        target: TaskStatus,
    },

    #[error(transparent)]
    Database(#[from] DatabaseError),
}

/// Provider call errors. A credential that needs re-authorization is not
/// an error: adapters return `Ok(None)` for it.
#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("Request to {name} failed: {reason}")]
    RequestFailed { name: String, reason: String },

    #[error("Channel {name} responded with HTTP {status}: {body}")]
    Http {
        name: String,
        status: u16,
        body: String,
    },

    #[error("Invalid payload from {name}: {reason}")]
    InvalidPayload { name: String, reason: String },

    #[error("Channel {name} is not configured")]
    NotConfigured { name: String },

    #[error(transparent)]
    Database(#[from] DatabaseError),
}

/// Errors from turning an inbound message into a task.
#[derive(Debug, thiserror::Error)]
pub enum IngestError {
    #[error("External service unavailable for {channel}: {reason}")]
    ExternalUnavailable { channel: String, reason: String },

    #[error("Task creation failed: {0}")]
    Task(#[from] TaskError),
}

impl From<DatabaseError> for IngestError {
    fn from(e: DatabaseError) -> Self {
        IngestError::Task(TaskError::Database(e))
    }
}

/// Result type alias for taskdesk.
pub type Result<T> = std::result::Result<T, Error>;
