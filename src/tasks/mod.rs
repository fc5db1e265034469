//! Task model and lifecycle engine.

pub mod engine;
pub mod model;

pub use engine::TaskEngine;
pub use model::{NewTask, Priority, Task, TaskPatch, TaskStatus};
