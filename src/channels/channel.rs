//! Channel adapter trait and the types shared by every provider.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use secrecy::SecretString;
use serde::{Deserialize, Serialize};

use crate::error::ChannelError;
use crate::tasks::model::NewTask;

/// Inbound channels the service ingests from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelKind {
    Gmail,
    WhatsApp,
    LinkedIn,
    Twitter,
    Facebook,
}

impl ChannelKind {
    pub const ALL: [ChannelKind; 5] = [
        ChannelKind::Gmail,
        ChannelKind::WhatsApp,
        ChannelKind::LinkedIn,
        ChannelKind::Twitter,
        ChannelKind::Facebook,
    ];

    /// Stable tag used as task source and in storage.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Gmail => "gmail",
            Self::WhatsApp => "whatsapp",
            Self::LinkedIn => "linkedin",
            Self::Twitter => "twitter",
            Self::Facebook => "facebook",
        }
    }

    /// Table holding this channel's processed-message markers.
    pub fn processed_table(&self) -> &'static str {
        match self {
            Self::Gmail => "processed_gmail_messages",
            Self::WhatsApp => "processed_whatsapp_messages",
            Self::LinkedIn => "processed_linkedin_messages",
            Self::Twitter => "processed_twitter_messages",
            Self::Facebook => "processed_facebook_messages",
        }
    }
}

impl fmt::Display for ChannelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ChannelKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "gmail" => Ok(Self::Gmail),
            "whatsapp" => Ok(Self::WhatsApp),
            "linkedin" => Ok(Self::LinkedIn),
            "twitter" => Ok(Self::Twitter),
            "facebook" => Ok(Self::Facebook),
            other => Err(format!("unknown channel: {other}")),
        }
    }
}

/// Where a reply to an inbound message should go.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplyTarget {
    /// Address, phone number, or the post/tweet being answered.
    pub recipient: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thread_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subject: Option<String>,
    /// Provider message reference for threading (e.g. RFC 822 Message-ID).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub in_reply_to: Option<String>,
}

impl ReplyTarget {
    pub fn to(recipient: impl Into<String>) -> Self {
        Self {
            recipient: recipient.into(),
            ..Self::default()
        }
    }

    pub fn with_thread(mut self, thread_id: impl Into<String>) -> Self {
        self.thread_id = Some(thread_id.into());
        self
    }

    pub fn with_subject(mut self, subject: impl Into<String>) -> Self {
        self.subject = Some(subject.into());
        self
    }

    pub fn with_in_reply_to(mut self, message_id: impl Into<String>) -> Self {
        self.in_reply_to = Some(message_id.into());
        self
    }
}

/// A message fetched from (or pushed by) a provider, before it becomes a task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawMessage {
    /// Provider message id; the dedup key.
    pub external_id: String,
    pub sender: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subject: Option<String>,
    pub body: String,
    pub received_at: DateTime<Utc>,
    pub reply_to: ReplyTarget,
}

/// Provider-specific fields stored next to a credential.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum CredentialExtra {
    Gmail {
        #[serde(default)]
        email_address: Option<String>,
    },
    WhatsApp {
        account_sid: String,
        from_number: String,
    },
    LinkedIn {
        #[serde(default)]
        person_urn: Option<String>,
        /// Share whose comments are ingested.
        #[serde(default)]
        watch_urn: Option<String>,
    },
    Twitter {
        #[serde(default)]
        user_id: Option<String>,
        #[serde(default)]
        username: Option<String>,
    },
    Facebook {
        page_id: String,
        #[serde(default)]
        instagram_id: Option<String>,
    },
}

impl CredentialExtra {
    pub fn kind(&self) -> ChannelKind {
        match self {
            Self::Gmail { .. } => ChannelKind::Gmail,
            Self::WhatsApp { .. } => ChannelKind::WhatsApp,
            Self::LinkedIn { .. } => ChannelKind::LinkedIn,
            Self::Twitter { .. } => ChannelKind::Twitter,
            Self::Facebook { .. } => ChannelKind::Facebook,
        }
    }
}

/// Access material for one channel.
#[derive(Debug, Clone)]
pub struct ChannelCredential {
    pub channel: ChannelKind,
    pub access_token: SecretString,
    pub refresh_token: Option<SecretString>,
    /// `None` means the token does not expire.
    pub expires_at: Option<DateTime<Utc>>,
    pub extra: CredentialExtra,
    pub last_polled_at: Option<DateTime<Utc>>,
}

impl ChannelCredential {
    pub fn new(access_token: impl Into<String>, extra: CredentialExtra) -> Self {
        Self {
            channel: extra.kind(),
            access_token: SecretString::from(access_token.into()),
            refresh_token: None,
            expires_at: None,
            extra,
            last_polled_at: None,
        }
    }

    pub fn with_refresh_token(mut self, token: impl Into<String>) -> Self {
        self.refresh_token = Some(SecretString::from(token.into()));
        self
    }

    pub fn with_expiry(mut self, expires_at: DateTime<Utc>) -> Self {
        self.expires_at = Some(expires_at);
        self
    }

    /// True when the token expires within `buffer` of `now`.
    pub fn expires_within(&self, now: DateTime<Utc>, buffer: Duration) -> bool {
        match self.expires_at {
            Some(at) => {
                let buffer = chrono::Duration::from_std(buffer).unwrap_or(chrono::Duration::zero());
                at <= now + buffer
            }
            None => false,
        }
    }
}

/// A provider the service can fetch messages from and reply through.
#[async_trait]
pub trait ChannelAdapter: Send + Sync {
    fn kind(&self) -> ChannelKind;

    /// Delay between poll cycles.
    fn poll_interval(&self) -> Duration;

    /// Whether ingested messages get an automatic reply.
    fn auto_reply_enabled(&self) -> bool;

    /// A usable credential, refreshed if it is about to expire.
    ///
    /// `Ok(None)` means the channel needs re-authentication.
    async fn get_valid_credential(&self) -> Result<Option<ChannelCredential>, ChannelError>;

    /// Messages not yet seen, oldest first.
    async fn fetch_new(
        &self,
        credential: &ChannelCredential,
    ) -> Result<Vec<RawMessage>, ChannelError>;

    /// Send `text` to `target`.
    async fn send(
        &self,
        credential: &ChannelCredential,
        target: &ReplyTarget,
        text: &str,
    ) -> Result<(), ChannelError>;

    /// Tell the provider a message was consumed. Most providers need nothing.
    async fn acknowledge(
        &self,
        _credential: &ChannelCredential,
        _message: &RawMessage,
    ) -> Result<(), ChannelError> {
        Ok(())
    }

    /// Task fields for an inbound message.
    fn task_for(&self, message: &RawMessage) -> NewTask;
}

/// Truncate to at most `max` characters on a char boundary.
pub(crate) fn truncate_chars(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}
