//! WhatsApp channel via Twilio: static account credentials, REST polling,
//! and the webhook form payload for push delivery.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use sha1::Sha1;
use tracing::{debug, info};

use crate::channels::ChannelDeps;
use crate::channels::channel::{
    ChannelAdapter, ChannelCredential, ChannelKind, CredentialExtra, RawMessage, ReplyTarget,
};
use crate::channels::http::{ensure_success, read_json, send_with_retry};
use crate::config::{env_bool, env_nonempty, env_or};
use crate::error::ChannelError;
use crate::tasks::model::NewTask;

pub const TWILIO_API_BASE: &str = "https://api.twilio.com/2010-04-01";

const WHATSAPP_PREFIX: &str = "whatsapp:";

type HmacSha1 = Hmac<Sha1>;

// ── Configuration ───────────────────────────────────────────────────

/// Twilio WhatsApp configuration, built from environment variables.
#[derive(Debug, Clone)]
pub struct WhatsAppConfig {
    pub account_sid: String,
    pub auth_token: SecretString,
    /// Business number, with or without the `whatsapp:` prefix.
    pub from_number: String,
    pub api_base: String,
    pub page_size: u32,
    pub poll_interval: Duration,
    pub auto_reply: bool,
    /// Public URL Twilio posts webhooks to. Enables signature checks.
    pub webhook_url: Option<String>,
}

impl WhatsAppConfig {
    /// Returns `None` unless the Twilio account is configured.
    pub fn from_env() -> Option<Self> {
        let account_sid = env_nonempty("TWILIO_ACCOUNT_SID")?;
        let auth_token = env_nonempty("TWILIO_AUTH_TOKEN")?;
        let from_number = env_nonempty("TWILIO_PHONE_NUMBER")?;
        Some(Self {
            account_sid,
            auth_token: SecretString::from(auth_token),
            from_number,
            api_base: env_nonempty("TWILIO_API_BASE").unwrap_or_else(|| TWILIO_API_BASE.into()),
            page_size: env_or("WHATSAPP_MAX_MESSAGES_PER_POLL", 20),
            poll_interval: Duration::from_secs(env_or("WHATSAPP_POLL_INTERVAL_SECONDS", 120)),
            auto_reply: env_bool("WHATSAPP_AUTO_REPLY_ENABLED", true),
            webhook_url: env_nonempty("WHATSAPP_WEBHOOK_URL"),
        })
    }

    /// Webhook signature checker, when a public webhook URL is configured.
    pub fn webhook_signature(&self) -> Option<WebhookSignature> {
        self.webhook_url
            .as_ref()
            .map(|url| WebhookSignature::new(self.auth_token.clone(), url.clone()))
    }
}

/// Validates the `X-Twilio-Signature` header of webhook requests.
///
/// Twilio signs the public URL followed by every form field name and value,
/// fields sorted by name, with HMAC-SHA1 keyed by the account auth token.
#[derive(Debug, Clone)]
pub struct WebhookSignature {
    auth_token: SecretString,
    url: String,
}

impl WebhookSignature {
    pub fn new(auth_token: SecretString, url: impl Into<String>) -> Self {
        Self {
            auth_token,
            url: url.into(),
        }
    }

    fn mac(&self, form: &HashMap<String, String>) -> Option<HmacSha1> {
        let mut mac = HmacSha1::new_from_slice(self.auth_token.expose_secret().as_bytes()).ok()?;
        mac.update(self.url.as_bytes());
        let mut fields: Vec<_> = form.iter().collect();
        fields.sort_by(|a, b| a.0.cmp(b.0));
        for (name, value) in fields {
            mac.update(name.as_bytes());
            mac.update(value.as_bytes());
        }
        Some(mac)
    }

    /// Base64 signature Twilio would send for `form`.
    pub fn sign(&self, form: &HashMap<String, String>) -> String {
        self.mac(form)
            .map(|mac| STANDARD.encode(mac.finalize().into_bytes()))
            .unwrap_or_default()
    }

    /// Constant-time check of a received header value.
    pub fn verify(&self, form: &HashMap<String, String>, header: &str) -> bool {
        let Ok(received) = STANDARD.decode(header.trim()) else {
            return false;
        };
        self.mac(form)
            .is_some_and(|mac| mac.verify_slice(&received).is_ok())
    }
}

/// Add the `whatsapp:` address prefix if missing.
pub fn whatsapp_address(number: &str) -> String {
    if number.starts_with(WHATSAPP_PREFIX) {
        number.to_string()
    } else {
        format!("{WHATSAPP_PREFIX}{number}")
    }
}

// ── Wire types ──────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct MessagePage {
    #[serde(default)]
    messages: Vec<TwilioMessage>,
}

#[derive(Debug, Deserialize)]
struct TwilioMessage {
    sid: String,
    from: String,
    #[serde(default)]
    body: String,
    #[serde(default)]
    direction: String,
    /// RFC 2822.
    #[serde(default)]
    date_created: Option<String>,
}

// ── Adapter ─────────────────────────────────────────────────────────

pub struct WhatsAppAdapter {
    config: WhatsAppConfig,
    deps: ChannelDeps,
}

impl WhatsAppAdapter {
    pub fn new(config: WhatsAppConfig, deps: ChannelDeps) -> Self {
        Self { config, deps }
    }

    fn messages_url(&self) -> String {
        format!(
            "{}/Accounts/{}/Messages.json",
            self.config.api_base, self.config.account_sid
        )
    }

    /// Task fields for a Twilio sender and text.
    fn task(from: &str, body: &str) -> NewTask {
        NewTask::new(
            format!("[WhatsApp] Message from {from}"),
            format!("Sender: {from}\n\n{body}"),
        )
        .with_source(ChannelKind::WhatsApp.as_str())
    }
}

#[async_trait]
impl ChannelAdapter for WhatsAppAdapter {
    fn kind(&self) -> ChannelKind {
        ChannelKind::WhatsApp
    }

    fn poll_interval(&self) -> Duration {
        self.config.poll_interval
    }

    fn auto_reply_enabled(&self) -> bool {
        self.config.auto_reply
    }

    /// Account credentials never expire and always come from configuration.
    /// The stored row mirrors them and tracks polling.
    async fn get_valid_credential(&self) -> Result<Option<ChannelCredential>, ChannelError> {
        let mut cred = ChannelCredential::new(
            self.config.auth_token.expose_secret(),
            CredentialExtra::WhatsApp {
                account_sid: self.config.account_sid.clone(),
                from_number: self.config.from_number.clone(),
            },
        );
        let stored = self.deps.db.get_credential(ChannelKind::WhatsApp).await?;
        if let Some(stored) = &stored {
            cred.last_polled_at = stored.last_polled_at;
            if stored.access_token.expose_secret() == self.config.auth_token.expose_secret()
                && stored.extra == cred.extra
            {
                return Ok(Some(cred));
            }
        }
        self.deps.db.save_credential(&cred).await?;
        if stored.is_some() {
            info!("WhatsApp credential updated from configuration");
        } else {
            debug!("Seeded WhatsApp credential from configuration");
        }
        Ok(Some(cred))
    }

    async fn fetch_new(
        &self,
        credential: &ChannelCredential,
    ) -> Result<Vec<RawMessage>, ChannelError> {
        let to = whatsapp_address(&self.config.from_number);
        let page_size = self.config.page_size.to_string();
        let url = self.messages_url();
        let resp = send_with_retry(ChannelKind::WhatsApp, &self.deps.retry, || {
            self.deps
                .client
                .get(&url)
                .basic_auth(
                    &self.config.account_sid,
                    Some(credential.access_token.expose_secret()),
                )
                .query(&[("To", to.as_str()), ("PageSize", page_size.as_str())])
        })
        .await?;
        let page: MessagePage = read_json(ChannelKind::WhatsApp, resp).await?;

        let mut messages: Vec<RawMessage> = page
            .messages
            .into_iter()
            .filter(|m| m.direction == "inbound")
            .map(|m| {
                let received_at = m
                    .date_created
                    .as_deref()
                    .and_then(|d| DateTime::parse_from_rfc2822(d).ok())
                    .map(|d| d.with_timezone(&Utc))
                    .unwrap_or(DateTime::<Utc>::MIN_UTC);
                RawMessage {
                    reply_to: ReplyTarget::to(m.from.clone()),
                    external_id: m.sid,
                    sender: m.from,
                    subject: None,
                    body: m.body,
                    received_at,
                }
            })
            .collect();
        messages.sort_by_key(|m| m.received_at);
        Ok(messages)
    }

    async fn send(
        &self,
        credential: &ChannelCredential,
        target: &ReplyTarget,
        text: &str,
    ) -> Result<(), ChannelError> {
        let from = whatsapp_address(&self.config.from_number);
        let to = whatsapp_address(&target.recipient);
        let url = self.messages_url();
        let resp = send_with_retry(ChannelKind::WhatsApp, &self.deps.retry, || {
            self.deps
                .client
                .post(&url)
                .basic_auth(
                    &self.config.account_sid,
                    Some(credential.access_token.expose_secret()),
                )
                .form(&[("From", from.as_str()), ("To", to.as_str()), ("Body", text)])
        })
        .await?;
        ensure_success(ChannelKind::WhatsApp, resp).await?;
        info!(to = %to, "WhatsApp message sent");
        Ok(())
    }

    fn task_for(&self, message: &RawMessage) -> NewTask {
        Self::task(&message.sender, &message.body)
    }
}

/// Build a message from a Twilio webhook form (`MessageSid`, `From`, `Body`).
pub fn message_from_webhook(
    form: &HashMap<String, String>,
    received_at: DateTime<Utc>,
) -> Result<RawMessage, ChannelError> {
    let field = |name: &str| {
        form.get(name)
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .ok_or_else(|| ChannelError::InvalidPayload {
                name: "whatsapp".into(),
                reason: format!("missing {name}"),
            })
    };
    let sid = field("MessageSid")?;
    let from = field("From")?;
    let body = form.get("Body").cloned().unwrap_or_default();
    Ok(RawMessage {
        external_id: sid,
        reply_to: ReplyTarget::to(from.clone()),
        sender: from,
        subject: None,
        body,
        received_at,
    })
}
