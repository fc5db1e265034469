//! LinkedIn channel: comments on a watched share, replies posted as comments.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, info};

use crate::channels::ChannelDeps;
use crate::channels::channel::{
    ChannelAdapter, ChannelCredential, ChannelKind, CredentialExtra, RawMessage, ReplyTarget,
    truncate_chars,
};
use crate::channels::http::{ensure_success, read_json, send_with_retry};
use crate::channels::oauth::{ClientAuth, CredentialSource, TokenEndpoint};
use crate::config::{env_bool, env_nonempty, env_or};
use crate::error::ChannelError;
use crate::tasks::model::NewTask;

pub const LINKEDIN_API_BASE: &str = "https://api.linkedin.com/v2";
pub const LINKEDIN_TOKEN_URL: &str = "https://www.linkedin.com/oauth/v2/accessToken";

/// LinkedIn access tokens live 60 days.
const DEFAULT_TOKEN_LIFETIME: Duration = Duration::from_secs(5_184_000);

#[derive(Debug, Clone)]
pub struct LinkedInConfig {
    pub client_id: String,
    pub client_secret: SecretString,
    pub api_base: String,
    pub token_url: String,
    /// Used when the stored credential names no share to watch.
    pub watch_urn: Option<String>,
    pub poll_interval: Duration,
    pub auto_reply: bool,
}

impl LinkedInConfig {
    pub fn from_env() -> Option<Self> {
        let client_id = env_nonempty("LINKEDIN_CLIENT_ID")?;
        let client_secret = env_nonempty("LINKEDIN_CLIENT_SECRET")?;
        Some(Self {
            client_id,
            client_secret: SecretString::from(client_secret),
            api_base: env_nonempty("LINKEDIN_API_BASE").unwrap_or_else(|| LINKEDIN_API_BASE.into()),
            token_url: env_nonempty("LINKEDIN_TOKEN_URL")
                .unwrap_or_else(|| LINKEDIN_TOKEN_URL.into()),
            watch_urn: env_nonempty("LINKEDIN_WATCH_URN"),
            poll_interval: Duration::from_secs(env_or("LINKEDIN_POLL_INTERVAL_SECONDS", 300)),
            auto_reply: env_bool("LINKEDIN_AUTO_REPLY_ENABLED", false),
        })
    }
}

#[derive(Debug, Deserialize)]
struct CommentPage {
    #[serde(default)]
    elements: Vec<Comment>,
}

#[derive(Debug, Deserialize)]
struct Comment {
    id: String,
    actor: String,
    #[serde(default)]
    message: Option<CommentText>,
    #[serde(default)]
    created: Option<AuditStamp>,
}

#[derive(Debug, Deserialize)]
struct CommentText {
    #[serde(default)]
    text: String,
}

#[derive(Debug, Deserialize)]
struct AuditStamp {
    /// Milliseconds since the epoch.
    time: i64,
}

pub struct LinkedInAdapter {
    config: LinkedInConfig,
    deps: ChannelDeps,
    credentials: CredentialSource,
}

impl LinkedInAdapter {
    pub fn new(config: LinkedInConfig, deps: ChannelDeps) -> Self {
        let credentials = deps
            .credential_source(ChannelKind::LinkedIn)
            .with_refresh(TokenEndpoint {
                url: config.token_url.clone(),
                client_id: config.client_id.clone(),
                client_secret: config.client_secret.clone(),
                client_auth: ClientAuth::Form,
                default_expires_in: DEFAULT_TOKEN_LIFETIME,
            });
        Self {
            config,
            deps,
            credentials,
        }
    }

    fn comments_url(&self, share_urn: &str) -> String {
        format!("{}/socialActions/{share_urn}/comments", self.config.api_base)
    }

    /// (person_urn, watch_urn) from the credential, with the configured
    /// watch URN as fallback.
    fn identity<'a>(
        &'a self,
        credential: &'a ChannelCredential,
    ) -> (Option<&'a str>, Option<&'a str>) {
        match &credential.extra {
            CredentialExtra::LinkedIn {
                person_urn,
                watch_urn,
            } => (
                person_urn.as_deref(),
                watch_urn.as_deref().or(self.config.watch_urn.as_deref()),
            ),
            _ => (None, self.config.watch_urn.as_deref()),
        }
    }
}

#[async_trait]
impl ChannelAdapter for LinkedInAdapter {
    fn kind(&self) -> ChannelKind {
        ChannelKind::LinkedIn
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
        let (person_urn, watch_urn) = self.identity(credential);
        let Some(watch_urn) = watch_urn else {
            debug!("No LinkedIn share to watch, skipping fetch");
            return Ok(Vec::new());
        };

        let url = self.comments_url(watch_urn);
        let resp = send_with_retry(ChannelKind::LinkedIn, &self.deps.retry, || {
            self.deps
                .client
                .get(&url)
                .bearer_auth(credential.access_token.expose_secret())
                .header("X-Restli-Protocol-Version", "2.0.0")
        })
        .await?;
        let page: CommentPage = read_json(ChannelKind::LinkedIn, resp).await?;

        let mut messages: Vec<RawMessage> = page
            .elements
            .into_iter()
            .filter(|c| Some(c.actor.as_str()) != person_urn)
            .map(|c| RawMessage {
                received_at: c
                    .created
                    .and_then(|s| Utc.timestamp_millis_opt(s.time).single())
                    .unwrap_or(DateTime::<Utc>::MIN_UTC),
                reply_to: ReplyTarget::to(watch_urn).with_thread(c.id.clone()),
                external_id: c.id,
                sender: c.actor,
                subject: None,
                body: c.message.map(|m| m.text).unwrap_or_default(),
            })
            .collect();
        messages.sort_by_key(|m| m.received_at);
        Ok(messages)
    }

    /// Comment on the share in `target.recipient` as the connected member.
    async fn send(
        &self,
        credential: &ChannelCredential,
        target: &ReplyTarget,
        text: &str,
    ) -> Result<(), ChannelError> {
        let (Some(person_urn), _) = self.identity(credential) else {
            return Err(ChannelError::NotConfigured {
                name: "linkedin (member URN unknown)".into(),
            });
        };
        let mut payload = json!({
            "actor": person_urn,
            "object": target.recipient,
            "message": { "text": text },
        });
        if let Some(parent) = &target.thread_id {
            payload["parentComment"] = json!(parent);
        }

        let url = self.comments_url(&target.recipient);
        let resp = send_with_retry(ChannelKind::LinkedIn, &self.deps.retry, || {
            self.deps
                .client
                .post(&url)
                .bearer_auth(credential.access_token.expose_secret())
                .header("X-Restli-Protocol-Version", "2.0.0")
                .json(&payload)
        })
        .await?;
        ensure_success(ChannelKind::LinkedIn, resp).await?;
        info!(object = %target.recipient, "LinkedIn comment posted");
        Ok(())
    }

    fn task_for(&self, message: &RawMessage) -> NewTask {
        NewTask::new(
            format!("[LinkedIn] Comment from {}", message.sender),
            format!(
                "Commenter: {}\n\n{}",
                message.sender,
                truncate_chars(&message.body, 5000)
            ),
        )
        .with_source(ChannelKind::LinkedIn.as_str())
    }
}

#[cfg(test)]
mod tests {
    use httpmock::prelude::*;

    use super::*;
    use crate::test_support::{channel_deps, memory_db, t0};

    const SHARE: &str = "urn:li:share:42";
    const ME: &str = "urn:li:person:me";

    fn config(base: &str) -> LinkedInConfig {
        LinkedInConfig {
            client_id: "cid".into(),
            client_secret: SecretString::from("secret".to_string()),
            api_base: base.to_string(),
            token_url: format!("{base}/token"),
            watch_urn: None,
            poll_interval: Duration::from_secs(300),
            auto_reply: false,
        }
    }

    fn credential(watch: Option<&str>) -> ChannelCredential {
        ChannelCredential::new(
            "li-token",
            CredentialExtra::LinkedIn {
                person_urn: Some(ME.into()),
                watch_urn: watch.map(str::to_string),
            },
        )
    }

    #[tokio::test]
    async fn no_watched_share_fetches_nothing() {
        let adapter = LinkedInAdapter::new(
            config("http://127.0.0.1:9"),
            channel_deps(memory_db().await),
        );
        let messages = adapter.fetch_new(&credential(None)).await.unwrap();
        assert!(messages.is_empty());
    }

    #[tokio::test]
    async fn fetches_comments_skipping_our_own() {
        let server = MockServer::start_async().await;
        let t0_ms = t0().timestamp_millis();
        server
            .mock_async(|when, then| {
                when.method(GET)
                    .path(format!("/socialActions/{SHARE}/comments"))
                    .header("authorization", "Bearer li-token");
                then.status(200).json_body(serde_json::json!({
                    "elements": [
                        {"id": "c2", "actor": "urn:li:person:bo",
                         "message": {"text": "later"}, "created": {"time": t0_ms + 60_000}},
                        {"id": "c0", "actor": ME,
                         "message": {"text": "ours"}, "created": {"time": t0_ms - 60_000}},
                        {"id": "c1", "actor": "urn:li:person:al",
                         "message": {"text": "earlier"}, "created": {"time": t0_ms}}
                    ]
                }));
            })
            .await;

        let adapter = LinkedInAdapter::new(
            config(&server.base_url()),
            channel_deps(memory_db().await),
        );
        let messages = adapter.fetch_new(&credential(Some(SHARE))).await.unwrap();
        let ids: Vec<_> = messages.iter().map(|m| m.external_id.as_str()).collect();
        assert_eq!(ids, vec!["c1", "c2"]);
        assert_eq!(messages[0].received_at, t0());
        assert_eq!(messages[0].reply_to.recipient, SHARE);

        let task = adapter.task_for(&messages[0]);
        assert_eq!(task.title, "[LinkedIn] Comment from urn:li:person:al");
        assert_eq!(task.source, "linkedin");
    }

    #[tokio::test]
    async fn send_posts_comment_as_member() {
        let server = MockServer::start_async().await;
        let post = server
            .mock_async(|when, then| {
                when.method(POST)
                    .path(format!("/socialActions/{SHARE}/comments"))
                    .header("X-Restli-Protocol-Version", "2.0.0")
                    .body_includes("\"actor\":\"urn:li:person:me\"")
                    .body_includes("\"parentComment\":\"c1\"");
                then.status(201);
            })
            .await;

        let adapter = LinkedInAdapter::new(
            config(&server.base_url()),
            channel_deps(memory_db().await),
        );
        let target = ReplyTarget::to(SHARE).with_thread("c1");
        adapter
            .send(&credential(Some(SHARE)), &target, "Thanks!")
            .await
            .unwrap();
        post.assert_hits_async(1).await;
    }

    #[tokio::test]
    async fn send_without_member_urn_is_not_configured() {
        let adapter = LinkedInAdapter::new(
            config("http://127.0.0.1:9"),
            channel_deps(memory_db().await),
        );
        let cred = ChannelCredential::new(
            "t",
            CredentialExtra::LinkedIn {
                person_urn: None,
                watch_urn: None,
            },
        );
        let err = adapter
            .send(&cred, &ReplyTarget::to(SHARE), "hi")
            .await
            .unwrap_err();
        assert!(matches!(err, ChannelError::NotConfigured { .. }));
    }
}
