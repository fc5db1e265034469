//! Taskdesk: task intake with sensitivity routing and channel ingestion.

pub mod channels;
pub mod config;
pub mod error;
pub mod reply;
pub mod scheduler;
pub mod sensitivity;
pub mod store;
pub mod tasks;
pub mod web;

#[cfg(test)]
pub(crate) mod test_support;
