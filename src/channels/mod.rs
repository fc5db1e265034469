//! Inbound channels: provider adapters, ingestion and poll loops.

pub mod channel;
pub mod facebook;
pub mod gmail;
pub mod http;
pub mod ingest;
pub mod linkedin;
pub mod oauth;
pub mod poller;
pub mod twitter;
pub mod whatsapp;

use std::sync::Arc;
use std::time::Duration;

use mockable::Clock;

use crate::store::Database;

pub use channel::*;
pub use facebook::FacebookAdapter;
pub use gmail::GmailAdapter;
pub use ingest::{IngestOutcome, Ingestor, ReplyOutcome};
pub use linkedin::LinkedInAdapter;
pub use poller::{PollSummary, PollSupervisor};
pub use twitter::TwitterAdapter;
pub use whatsapp::WhatsAppAdapter;

use self::http::RetryPolicy;
use self::oauth::{CredentialSource, DEFAULT_REFRESH_BUFFER};

/// Shared dependencies handed to every adapter.
#[derive(Clone)]
pub struct ChannelDeps {
    pub db: Arc<dyn Database>,
    pub clock: Arc<dyn Clock>,
    pub client: reqwest::Client,
    pub retry: RetryPolicy,
    /// Refresh OAuth tokens this long before they expire.
    pub refresh_buffer: Duration,
}

impl ChannelDeps {
    pub fn new(db: Arc<dyn Database>, clock: Arc<dyn Clock>, client: reqwest::Client) -> Self {
        Self {
            db,
            clock,
            client,
            retry: RetryPolicy::default(),
            refresh_buffer: DEFAULT_REFRESH_BUFFER,
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_refresh_buffer(mut self, buffer: Duration) -> Self {
        self.refresh_buffer = buffer;
        self
    }

    /// Credential loader for `kind`, without token refresh.
    pub fn credential_source(&self, kind: ChannelKind) -> CredentialSource {
        CredentialSource::new(
            kind,
            Arc::clone(&self.db),
            Arc::clone(&self.clock),
            self.client.clone(),
            self.retry,
        )
        .with_buffer(self.refresh_buffer)
    }
}
