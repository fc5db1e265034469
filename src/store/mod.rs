//! Persistence layer: libSQL-backed storage for tasks and channel state.

pub mod libsql_backend;
pub mod migrations;
pub mod traits;

pub use libsql_backend::LibSqlBackend;
pub use traits::{Database, ProcessedMarker, SlaCompletion, TaskChange, TaskInsert};
