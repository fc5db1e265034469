//! OAuth support: single-use state tokens and access-token refresh.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use mockable::Clock;
use rand::Rng;
use rand::distributions::Alphanumeric;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::channels::channel::{ChannelCredential, ChannelKind};
use crate::channels::http::{RetryPolicy, read_json, send_with_retry};
use crate::error::{ChannelError, DatabaseError};
use crate::store::Database;

/// How long an issued state token stays valid.
pub const STATE_TTL: Duration = Duration::from_secs(600);

/// Default refresh buffer before token expiry.
pub const DEFAULT_REFRESH_BUFFER: Duration = Duration::from_secs(300);

/// A CSRF state token handed out before an authorization redirect.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OAuthState {
    pub state: String,
    pub channel: ChannelKind,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

/// Random URL-safe state token.
pub fn generate_state_token() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(32)
        .map(char::from)
        .collect()
}

/// Issues and verifies state tokens for authorization callbacks.
pub struct OAuthStates {
    db: Arc<dyn Database>,
    clock: Arc<dyn Clock>,
    ttl: Duration,
}

impl OAuthStates {
    pub fn new(db: Arc<dyn Database>, clock: Arc<dyn Clock>) -> Self {
        Self {
            db,
            clock,
            ttl: STATE_TTL,
        }
    }

    /// Store a fresh state token for `channel`.
    pub async fn issue(&self, channel: ChannelKind) -> Result<OAuthState, DatabaseError> {
        let now = self.clock.utc();
        let ttl = chrono::Duration::from_std(self.ttl).unwrap_or(chrono::Duration::minutes(10));
        let state = OAuthState {
            state: generate_state_token(),
            channel,
            created_at: now,
            expires_at: now + ttl,
        };
        self.db.insert_oauth_state(&state).await?;
        debug!(channel = %channel, "OAuth state issued");
        Ok(state)
    }

    /// Consume a state token. Valid only once, before expiry, for the
    /// channel it was issued for.
    pub async fn consume(&self, state: &str, channel: ChannelKind) -> Result<bool, DatabaseError> {
        let now = self.clock.utc();
        match self.db.take_oauth_state(state).await? {
            Some(found) if found.channel == channel && found.expires_at >= now => Ok(true),
            Some(found) => {
                warn!(
                    channel = %channel,
                    issued_for = %found.channel,
                    "Rejected stale or mismatched OAuth state"
                );
                Ok(false)
            }
            None => Ok(false),
        }
    }

    /// Drop expired tokens.
    pub async fn purge(&self) -> Result<u64, DatabaseError> {
        self.db.purge_oauth_states(self.clock.utc()).await
    }
}

// ── Token refresh ───────────────────────────────────────────────────

/// How the client authenticates to the token endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientAuth {
    /// `client_id` and `client_secret` in the form body.
    Form,
    /// HTTP basic auth with the client id and secret.
    Basic,
}

/// A provider's refresh-token grant endpoint.
#[derive(Debug, Clone)]
pub struct TokenEndpoint {
    pub url: String,
    pub client_id: String,
    pub client_secret: SecretString,
    pub client_auth: ClientAuth,
    /// Lifetime assumed when the response omits `expires_in`.
    pub default_expires_in: Duration,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    expires_in: Option<i64>,
}

/// Loads a channel's stored credential and keeps it fresh.
pub struct CredentialSource {
    kind: ChannelKind,
    db: Arc<dyn Database>,
    clock: Arc<dyn Clock>,
    client: reqwest::Client,
    retry: RetryPolicy,
    buffer: Duration,
    refresh: Option<TokenEndpoint>,
}

impl CredentialSource {
    pub fn new(
        kind: ChannelKind,
        db: Arc<dyn Database>,
        clock: Arc<dyn Clock>,
        client: reqwest::Client,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            kind,
            db,
            clock,
            client,
            retry,
            buffer: DEFAULT_REFRESH_BUFFER,
            refresh: None,
        }
    }

    pub fn with_buffer(mut self, buffer: Duration) -> Self {
        self.buffer = buffer;
        self
    }

    pub fn with_refresh(mut self, endpoint: TokenEndpoint) -> Self {
        self.refresh = Some(endpoint);
        self
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.utc()
    }

    /// The stored credential, refreshed when it expires within the buffer.
    ///
    /// `Ok(None)` means the channel must be re-authorized.
    pub async fn valid_credential(&self) -> Result<Option<ChannelCredential>, ChannelError> {
        let Some(cred) = self.db.get_credential(self.kind).await? else {
            debug!(channel = %self.kind, "No stored credential");
            return Ok(None);
        };

        let now = self.clock.utc();
        if !cred.expires_within(now, self.buffer) {
            return Ok(Some(cred));
        }

        let still_valid = cred.expires_at.is_some_and(|at| at > now);
        let (Some(endpoint), Some(refresh_token)) = (&self.refresh, cred.refresh_token.clone())
        else {
            if still_valid {
                return Ok(Some(cred));
            }
            warn!(channel = %self.kind, "Token expired and cannot be refreshed; re-authentication required");
            return Ok(None);
        };

        match self.refresh_token(endpoint, &refresh_token).await {
            Ok(token) => {
                let lifetime = token
                    .expires_in
                    .filter(|s| *s > 0)
                    .map(chrono::Duration::seconds)
                    .unwrap_or_else(|| {
                        chrono::Duration::from_std(endpoint.default_expires_in)
                            .unwrap_or(chrono::Duration::hours(1))
                    });
                let mut refreshed = cred;
                refreshed.access_token = SecretString::from(token.access_token);
                if let Some(rt) = token.refresh_token {
                    refreshed.refresh_token = Some(SecretString::from(rt));
                }
                refreshed.expires_at = Some(now + lifetime);
                self.db.save_credential(&refreshed).await?;
                info!(channel = %self.kind, "Access token refreshed");
                Ok(Some(refreshed))
            }
            Err(ChannelError::Http { status, body, .. }) if (400..500).contains(&status) => {
                warn!(channel = %self.kind, status, body = %body, "Refresh rejected; re-authentication required");
                Ok(None)
            }
            Err(e) if still_valid => {
                warn!(channel = %self.kind, error = %e, "Refresh failed; using current token");
                Ok(Some(cred))
            }
            Err(e) => Err(e),
        }
    }

    async fn refresh_token(
        &self,
        endpoint: &TokenEndpoint,
        refresh_token: &SecretString,
    ) -> Result<TokenResponse, ChannelError> {
        let resp = send_with_retry(self.kind, &self.retry, || {
            let mut form = vec![
                ("grant_type", "refresh_token".to_string()),
                ("refresh_token", refresh_token.expose_secret().to_string()),
                ("client_id", endpoint.client_id.clone()),
            ];
            let req = self.client.post(&endpoint.url);
            match endpoint.client_auth {
                ClientAuth::Form => {
                    form.push((
                        "client_secret",
                        endpoint.client_secret.expose_secret().to_string(),
                    ));
                    req.form(&form)
                }
                ClientAuth::Basic => req
                    .basic_auth(
                        &endpoint.client_id,
                        Some(endpoint.client_secret.expose_secret()),
                    )
                    .form(&form),
            }
        })
        .await?;
        read_json(self.kind, resp).await
    }
}
