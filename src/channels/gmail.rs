//! Gmail channel: REST polling for unread mail, threaded replies via lettre.
//!
//! Messages are fetched in `raw` format and parsed with mail-parser, so the
//! RFC 822 headers needed for threading (Message-ID) are available. Replies
//! are built with lettre and posted base64url-encoded to the send endpoint.

use std::time::Duration;

use async_trait::async_trait;
use base64::Engine as _;
use base64::alphabet;
use base64::engine::general_purpose::{GeneralPurpose, NO_PAD};
use base64::engine::DecodePaddingMode;
use chrono::{DateTime, TimeZone, Utc};
use lettre::Message;
use lettre::message::header::ContentType;
use mail_parser::MessageParser;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, info, warn};

use crate::channels::channel::{
    ChannelAdapter, ChannelCredential, ChannelKind, CredentialExtra, RawMessage, ReplyTarget,
    truncate_chars,
};
use crate::channels::http::{ensure_success, read_json, send_with_retry};
use crate::channels::oauth::{ClientAuth, CredentialSource, TokenEndpoint};
use crate::channels::ChannelDeps;
use crate::config::{env_bool, env_nonempty, env_or};
use crate::error::ChannelError;
use crate::tasks::model::NewTask;

pub const GMAIL_API_BASE: &str = "https://gmail.googleapis.com/gmail/v1/users/me";
pub const GOOGLE_TOKEN_URL: &str = "https://oauth2.googleapis.com/token";

/// base64url, accepting input with or without padding.
const B64URL: GeneralPurpose = GeneralPurpose::new(
    &alphabet::URL_SAFE,
    NO_PAD.with_decode_padding_mode(DecodePaddingMode::Indifferent),
);

// ── Configuration ───────────────────────────────────────────────────

/// Gmail channel configuration, built from environment variables.
#[derive(Debug, Clone)]
pub struct GmailConfig {
    pub client_id: String,
    pub client_secret: SecretString,
    pub api_base: String,
    pub token_url: String,
    pub max_per_poll: u32,
    pub poll_interval: Duration,
    pub auto_reply: bool,
}

impl GmailConfig {
    /// Returns `None` if the OAuth client is not configured (channel disabled).
    pub fn from_env() -> Option<Self> {
        let client_id = env_nonempty("GMAIL_CLIENT_ID")?;
        let client_secret = env_nonempty("GMAIL_CLIENT_SECRET")?;
        Some(Self {
            client_id,
            client_secret: SecretString::from(client_secret),
            api_base: env_nonempty("GMAIL_API_BASE").unwrap_or_else(|| GMAIL_API_BASE.into()),
            token_url: env_nonempty("GMAIL_TOKEN_URL").unwrap_or_else(|| GOOGLE_TOKEN_URL.into()),
            max_per_poll: env_or("GMAIL_MAX_EMAILS_PER_POLL", 10),
            poll_interval: Duration::from_secs(env_or("GMAIL_POLL_INTERVAL_SECONDS", 120)),
            auto_reply: env_bool("GMAIL_AUTO_REPLY_ENABLED", false),
        })
    }
}

// ── Wire types ──────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct MessageList {
    #[serde(default)]
    messages: Vec<MessageRef>,
}

#[derive(Debug, Deserialize)]
struct MessageRef {
    id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawResource {
    id: String,
    #[serde(default)]
    thread_id: Option<String>,
    raw: String,
    /// Milliseconds since the epoch, as a string.
    #[serde(default)]
    internal_date: Option<String>,
}

// ── Adapter ─────────────────────────────────────────────────────────

pub struct GmailAdapter {
    config: GmailConfig,
    deps: ChannelDeps,
    credentials: CredentialSource,
}

impl GmailAdapter {
    pub fn new(config: GmailConfig, deps: ChannelDeps) -> Self {
        let credentials = deps
            .credential_source(ChannelKind::Gmail)
            .with_refresh(TokenEndpoint {
                url: config.token_url.clone(),
                client_id: config.client_id.clone(),
                client_secret: config.client_secret.clone(),
                client_auth: ClientAuth::Form,
                default_expires_in: Duration::from_secs(3600),
            });
        Self {
            config,
            deps,
            credentials,
        }
    }

    async fn fetch_one(
        &self,
        token: &SecretString,
        id: &str,
    ) -> Result<RawMessage, ChannelError> {
        let url = format!("{}/messages/{id}", self.config.api_base);
        let resp = send_with_retry(ChannelKind::Gmail, &self.deps.retry, || {
            self.deps
                .client
                .get(&url)
                .bearer_auth(token.expose_secret())
                .query(&[("format", "raw")])
        })
        .await?;
        let resource: RawResource = read_json(ChannelKind::Gmail, resp).await?;
        parse_raw_message(&resource)
    }
}

#[async_trait]
impl ChannelAdapter for GmailAdapter {
    fn kind(&self) -> ChannelKind {
        ChannelKind::Gmail
    }

    fn poll_interval(&self) -> Duration {
        self.config.poll_interval
    }

    fn auto_reply_enabled(&self) -> bool {
        self.config.auto_reply
    }

    async fn get_valid_credential(&self) -> Result<Option<ChannelCredential>, ChannelError> {
        self.credentials.valid_credential().await
    }

    async fn fetch_new(
        &self,
        credential: &ChannelCredential,
    ) -> Result<Vec<RawMessage>, ChannelError> {
        let token = &credential.access_token;
        let url = format!("{}/messages", self.config.api_base);
        let max = self.config.max_per_poll.to_string();
        let resp = send_with_retry(ChannelKind::Gmail, &self.deps.retry, || {
            self.deps
                .client
                .get(&url)
                .bearer_auth(token.expose_secret())
                .query(&[("q", "is:unread"), ("maxResults", max.as_str())])
        })
        .await?;
        let list: MessageList = read_json(ChannelKind::Gmail, resp).await?;

        let mut messages = Vec::with_capacity(list.messages.len());
        for msg_ref in &list.messages {
            match self.fetch_one(token, &msg_ref.id).await {
                Ok(msg) => messages.push(msg),
                Err(e) => warn!(id = %msg_ref.id, error = %e, "Skipping unreadable Gmail message"),
            }
        }
        messages.sort_by_key(|m| m.received_at);
        debug!(count = messages.len(), "Fetched unread Gmail messages");
        Ok(messages)
    }

    async fn send(
        &self,
        credential: &ChannelCredential,
        target: &ReplyTarget,
        text: &str,
    ) -> Result<(), ChannelError> {
        let from = match &credential.extra {
            CredentialExtra::Gmail {
                email_address: Some(addr),
            } => addr.clone(),
            _ => {
                return Err(ChannelError::NotConfigured {
                    name: "gmail (sender address unknown)".into(),
                });
            }
        };
        let raw = build_reply(&from, target, text)?;
        let mut payload = json!({ "raw": B64URL.encode(raw) });
        if let Some(thread) = &target.thread_id {
            payload["threadId"] = json!(thread);
        }

        let url = format!("{}/messages/send", self.config.api_base);
        let resp = send_with_retry(ChannelKind::Gmail, &self.deps.retry, || {
            self.deps
                .client
                .post(&url)
                .bearer_auth(credential.access_token.expose_secret())
                .json(&payload)
        })
        .await?;
        ensure_success(ChannelKind::Gmail, resp).await?;
        info!(to = %target.recipient, "Gmail reply sent");
        Ok(())
    }

    /// Remove the UNREAD label so the message is not listed again.
    async fn acknowledge(
        &self,
        credential: &ChannelCredential,
        message: &RawMessage,
    ) -> Result<(), ChannelError> {
        let url = format!(
            "{}/messages/{}/modify",
            self.config.api_base, message.external_id
        );
        let payload = json!({ "removeLabelIds": ["UNREAD"] });
        let resp = send_with_retry(ChannelKind::Gmail, &self.deps.retry, || {
            self.deps
                .client
                .post(&url)
                .bearer_auth(credential.access_token.expose_secret())
                .json(&payload)
        })
        .await?;
        ensure_success(ChannelKind::Gmail, resp).await?;
        Ok(())
    }

    fn task_for(&self, message: &RawMessage) -> NewTask {
        let subject = message.subject.as_deref().unwrap_or("(no subject)");
        NewTask::new(
            format!("[Gmail] {}", truncate_chars(subject, 450)),
            format!(
                "From: {}\n\n{}",
                message.sender,
                truncate_chars(&message.body, 5000)
            ),
        )
        .with_source(ChannelKind::Gmail.as_str())
    }
}

// ── Helpers ─────────────────────────────────────────────────────────

fn parse_raw_message(resource: &RawResource) -> Result<RawMessage, ChannelError> {
    let invalid = |reason: String| ChannelError::InvalidPayload {
        name: "gmail".into(),
        reason,
    };
    let bytes = B64URL
        .decode(resource.raw.trim())
        .map_err(|e| invalid(format!("message {}: bad base64: {e}", resource.id)))?;
    let parsed = MessageParser::default()
        .parse(&bytes[..])
        .ok_or_else(|| invalid(format!("message {}: not RFC 822", resource.id)))?;

    let sender = extract_sender(&parsed);
    let subject = parsed.subject().unwrap_or("(no subject)").to_string();
    let body = extract_text(&parsed);

    let received_at = resource
        .internal_date
        .as_deref()
        .and_then(|ms| ms.parse::<i64>().ok())
        .and_then(|ms| Utc.timestamp_millis_opt(ms).single())
        .or_else(|| {
            parsed
                .date()
                .and_then(|d| DateTime::from_timestamp(d.to_timestamp(), 0))
        })
        .unwrap_or(DateTime::<Utc>::MIN_UTC);

    let mut reply_to = ReplyTarget::to(sender.clone()).with_subject(subject.clone());
    if let Some(thread) = &resource.thread_id {
        reply_to = reply_to.with_thread(thread.clone());
    }
    if let Some(message_id) = parsed.message_id() {
        reply_to = reply_to.with_in_reply_to(format!("<{message_id}>"));
    }

    Ok(RawMessage {
        external_id: resource.id.clone(),
        sender,
        subject: Some(subject),
        body,
        received_at,
        reply_to,
    })
}

/// Extract the sender address from a parsed email.
fn extract_sender(parsed: &mail_parser::Message) -> String {
    parsed
        .from()
        .and_then(|addr| addr.first())
        .and_then(|a| a.address())
        .map(|s| s.to_string())
        .unwrap_or_else(|| "unknown".into())
}

/// Extract readable text from a parsed email, falling back to stripped HTML.
fn extract_text(parsed: &mail_parser::Message) -> String {
    if let Some(text) = parsed.body_text(0) {
        return text.trim().to_string();
    }
    if let Some(html) = parsed.body_html(0) {
        return strip_html(html.as_ref());
    }
    String::new()
}

/// Strip HTML tags from content (basic).
pub fn strip_html(html: &str) -> String {
    let mut result = String::new();
    let mut in_tag = false;
    for ch in html.chars() {
        match ch {
            '<' => in_tag = true,
            '>' => in_tag = false,
            _ if !in_tag => result.push(ch),
            _ => {}
        }
    }
    result.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// `Re: ` prefix unless the subject already carries one.
fn reply_subject(subject: Option<&str>) -> String {
    let subject = subject.unwrap_or("(no subject)");
    if subject.len() >= 3 && subject[..3].eq_ignore_ascii_case("re:") {
        subject.to_string()
    } else {
        format!("Re: {subject}")
    }
}

/// Build the RFC 822 reply.
pub(crate) fn build_reply(
    from: &str,
    target: &ReplyTarget,
    text: &str,
) -> Result<Vec<u8>, ChannelError> {
    let invalid = |reason: String| ChannelError::InvalidPayload {
        name: "gmail".into(),
        reason,
    };
    let mut builder = Message::builder()
        .from(from.parse().map_err(|e| invalid(format!("Invalid from address: {e}")))?)
        .to(target
            .recipient
            .parse()
            .map_err(|e| invalid(format!("Invalid to address: {e}")))?)
        .subject(reply_subject(target.subject.as_deref()))
        .header(ContentType::TEXT_PLAIN);
    if let Some(message_id) = &target.in_reply_to {
        builder = builder
            .in_reply_to(message_id.clone())
            .references(message_id.clone());
    }
    let email = builder
        .body(text.to_string())
        .map_err(|e| invalid(format!("Failed to build email: {e}")))?;
    Ok(email.formatted())
}
