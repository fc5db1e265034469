//! Per-channel poll loops and the supervisor that owns them.
//!
//! Each loop runs one cycle (credential, fetch, ingest each message oldest
//! first, stamp `last_polled_at`), then sleeps until the channel's interval
//! elapses or shutdown is signalled. A failing or panicking cycle is
//! logged and the loop carries on.

use std::collections::BTreeMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::channels::channel::{ChannelAdapter, ChannelKind};
use crate::channels::ingest::{IngestOutcome, Ingestor, ReplyOutcome};
use crate::error::IngestError;

/// Counters for one poll cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PollSummary {
    pub fetched: usize,
    pub created: usize,
    pub duplicates: usize,
    pub replied: usize,
    pub errors: usize,
}

/// Run a single poll cycle for `adapter`.
///
/// A missing credential yields an empty summary. Failing to obtain a
/// credential or to fetch ends the cycle with `ExternalUnavailable`;
/// per-message failures are counted and the cycle continues.
pub async fn poll_once(
    adapter: &dyn ChannelAdapter,
    ingestor: &Ingestor,
) -> Result<PollSummary, IngestError> {
    let channel = adapter.kind();
    let unavailable = |reason: String| IngestError::ExternalUnavailable {
        channel: channel.to_string(),
        reason,
    };
    let mut summary = PollSummary::default();

    let credential = match adapter.get_valid_credential().await {
        Ok(Some(cred)) => cred,
        Ok(None) => {
            debug!(channel = %channel, "No valid credential, re-authentication required");
            return Ok(summary);
        }
        Err(e) => return Err(unavailable(e.to_string())),
    };

    let mut messages = adapter
        .fetch_new(&credential)
        .await
        .map_err(|e| unavailable(e.to_string()))?;
    messages.sort_by_key(|m| m.received_at);
    summary.fetched = messages.len();

    for message in &messages {
        match ingestor.ingest(adapter, &credential, message).await {
            Ok(IngestOutcome::Duplicate) => summary.duplicates += 1,
            Ok(IngestOutcome::Created { reply, .. }) => {
                summary.created += 1;
                if matches!(reply, ReplyOutcome::Sent(_)) {
                    summary.replied += 1;
                }
            }
            Err(e) => {
                summary.errors += 1;
                error!(channel = %channel, id = %message.external_id, error = %e,
                    "Failed to ingest message");
            }
        }
    }

    let now = ingestor.engine().now();
    if let Err(e) = ingestor.engine().db().mark_polled(channel, now).await {
        warn!(channel = %channel, error = %e, "Failed to record poll time");
    }

    if summary.fetched > 0 {
        info!(
            channel = %channel,
            fetched = summary.fetched,
            created = summary.created,
            duplicates = summary.duplicates,
            replied = summary.replied,
            errors = summary.errors,
            "Poll cycle finished"
        );
    }
    Ok(summary)
}

/// Poll `adapter` until `shutdown` turns true or its sender is dropped.
pub async fn run_poll_loop(
    adapter: Arc<dyn ChannelAdapter>,
    ingestor: Arc<Ingestor>,
    mut shutdown: watch::Receiver<bool>,
) {
    let channel = adapter.kind();
    let interval = adapter.poll_interval();
    info!(channel = %channel, interval_secs = interval.as_secs(), "Poll loop started");

    loop {
        if *shutdown.borrow() {
            break;
        }

        let cycle = AssertUnwindSafe(poll_once(adapter.as_ref(), &ingestor))
            .catch_unwind()
            .await;
        match cycle {
            Ok(Ok(_)) => {}
            Ok(Err(e)) => warn!(channel = %channel, error = %e, "Poll cycle aborted"),
            Err(_) => error!(channel = %channel, "Poll cycle panicked"),
        }

        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            changed = shutdown.changed() => {
                if changed.is_err() {
                    break;
                }
            }
        }
    }

    info!(channel = %channel, "Poll loop stopped");
}

/// Owns the background loops and their shared shutdown signal.
pub struct PollSupervisor {
    ingestor: Arc<Ingestor>,
    adapters: BTreeMap<ChannelKind, Arc<dyn ChannelAdapter>>,
    shutdown: watch::Sender<bool>,
    handles: Vec<(String, JoinHandle<()>)>,
    grace: Duration,
}

impl PollSupervisor {
    pub fn new(ingestor: Arc<Ingestor>, grace: Duration) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            ingestor,
            adapters: BTreeMap::new(),
            shutdown,
            handles: Vec::new(),
            grace,
        }
    }

    /// A receiver for loops not started through this supervisor.
    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.shutdown.subscribe()
    }

    /// Start the poll loop for `adapter`.
    pub fn spawn_channel(&mut self, adapter: Arc<dyn ChannelAdapter>) {
        let kind = adapter.kind();
        let handle = tokio::spawn(run_poll_loop(
            Arc::clone(&adapter),
            Arc::clone(&self.ingestor),
            self.subscribe(),
        ));
        self.adapters.insert(kind, adapter);
        self.handles.push((kind.to_string(), handle));
    }

    /// Track another long-running loop (the scheduler) under the same
    /// shutdown.
    pub fn spawn<F>(&mut self, name: impl Into<String>, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.handles.push((name.into(), tokio::spawn(task)));
    }

    pub fn channels(&self) -> impl Iterator<Item = ChannelKind> + '_ {
        self.adapters.keys().copied()
    }

    /// Run one cycle for `kind` now, outside its loop.
    ///
    /// `None` when the channel is not running.
    pub async fn poll_now(&self, kind: ChannelKind) -> Option<Result<PollSummary, IngestError>> {
        let adapter = self.adapters.get(&kind)?;
        Some(poll_once(adapter.as_ref(), &self.ingestor).await)
    }

    /// Signal every loop, wait up to the grace period, abort stragglers.
    pub async fn shutdown(self) {
        self.shutdown.send_replace(true);
        let deadline = tokio::time::Instant::now() + self.grace;

        for (name, mut handle) in self.handles {
            match tokio::time::timeout_at(deadline, &mut handle).await {
                Ok(Ok(())) => debug!(loop_name = %name, "Loop exited"),
                Ok(Err(e)) => error!(loop_name = %name, error = %e, "Loop task failed"),
                Err(_) => {
                    warn!(loop_name = %name, "Loop did not stop within grace period, aborting");
                    handle.abort();
                }
            }
        }
        info!("All loops stopped");
    }
}
