//! Twitter/X channel: mentions of the connected account, replies as tweets.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, info};

use crate::channels::ChannelDeps;
use crate::channels::channel::{
    ChannelAdapter, ChannelCredential, ChannelKind, CredentialExtra, RawMessage, ReplyTarget,
};
use crate::channels::http::{ensure_success, read_json, send_with_retry};
use crate::channels::oauth::{ClientAuth, CredentialSource, TokenEndpoint};
use crate::config::{env_bool, env_nonempty, env_or};
use crate::error::ChannelError;
use crate::tasks::model::NewTask;

pub const TWITTER_API_BASE: &str = "https://api.twitter.com/2";
pub const TWITTER_TOKEN_URL: &str = "https://api.twitter.com/2/oauth2/token";

const DEFAULT_TOKEN_LIFETIME: Duration = Duration::from_secs(7200);
const MAX_TWEET_CHARS: usize = 280;

#[derive(Debug, Clone)]
pub struct TwitterConfig {
    pub client_id: String,
    pub client_secret: SecretString,
    pub api_base: String,
    pub token_url: String,
    /// `max_results` for the mentions timeline (5..=100).
    pub max_per_poll: u32,
    pub poll_interval: Duration,
    pub auto_reply: bool,
}

impl TwitterConfig {
    pub fn from_env() -> Option<Self> {
        let client_id = env_nonempty("TWITTER_CLIENT_ID")?;
        let client_secret = env_nonempty("TWITTER_CLIENT_SECRET")?;
        Some(Self {
            client_id,
            client_secret: SecretString::from(client_secret),
            api_base: env_nonempty("TWITTER_API_BASE").unwrap_or_else(|| TWITTER_API_BASE.into()),
            token_url: env_nonempty("TWITTER_TOKEN_URL").unwrap_or_else(|| TWITTER_TOKEN_URL.into()),
            max_per_poll: env_or("TWITTER_MAX_MENTIONS_PER_POLL", 10u32).clamp(5, 100),
            poll_interval: Duration::from_secs(env_or("TWITTER_POLL_INTERVAL_SECONDS", 300)),
            auto_reply: env_bool("TWITTER_AUTO_REPLY_ENABLED", false),
        })
    }
}

#[derive(Debug, Deserialize)]
struct MentionPage {
    #[serde(default)]
    data: Vec<Tweet>,
    #[serde(default)]
    includes: Option<Includes>,
}

#[derive(Debug, Deserialize)]
struct Tweet {
    id: String,
    text: String,
    #[serde(default)]
    author_id: Option<String>,
    #[serde(default)]
    created_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize)]
struct Includes {
    #[serde(default)]
    users: Vec<User>,
}

#[derive(Debug, Deserialize)]
struct User {
    id: String,
    username: String,
}

pub struct TwitterAdapter {
    config: TwitterConfig,
    deps: ChannelDeps,
    credentials: CredentialSource,
}

impl TwitterAdapter {
    pub fn new(config: TwitterConfig, deps: ChannelDeps) -> Self {
        let credentials = deps
            .credential_source(ChannelKind::Twitter)
            .with_refresh(TokenEndpoint {
                url: config.token_url.clone(),
                client_id: config.client_id.clone(),
                client_secret: config.client_secret.clone(),
                client_auth: ClientAuth::Basic,
                default_expires_in: DEFAULT_TOKEN_LIFETIME,
            });
        Self {
            config,
            deps,
            credentials,
        }
    }
}

#[async_trait]
impl ChannelAdapter for TwitterAdapter {
    fn kind(&self) -> ChannelKind {
        ChannelKind::Twitter
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
        let user_id = match &credential.extra {
            CredentialExtra::Twitter {
                user_id: Some(id), ..
            } => id,
            _ => {
                debug!("Twitter user id unknown, skipping fetch");
                return Ok(Vec::new());
            }
        };

        let url = format!("{}/users/{user_id}/mentions", self.config.api_base);
        let max = self.config.max_per_poll.to_string();
        let resp = send_with_retry(ChannelKind::Twitter, &self.deps.retry, || {
            self.deps
                .client
                .get(&url)
                .bearer_auth(credential.access_token.expose_secret())
                .query(&[
                    ("max_results", max.as_str()),
                    ("expansions", "author_id"),
                    ("tweet.fields", "created_at,author_id"),
                ])
        })
        .await?;
        let page: MentionPage = read_json(ChannelKind::Twitter, resp).await?;

        let usernames: HashMap<String, String> = page
            .includes
            .map(|i| i.users.into_iter().map(|u| (u.id, u.username)).collect())
            .unwrap_or_default();

        let mut messages: Vec<RawMessage> = page
            .data
            .into_iter()
            .map(|t| {
                let sender = t
                    .author_id
                    .as_ref()
                    .and_then(|id| usernames.get(id).cloned())
                    .or(t.author_id.clone())
                    .unwrap_or_else(|| "unknown".into());
                RawMessage {
                    reply_to: ReplyTarget::to(t.id.clone()),
                    external_id: t.id,
                    sender,
                    subject: None,
                    body: t.text,
                    received_at: t.created_at.unwrap_or(DateTime::<Utc>::MIN_UTC),
                }
            })
            .collect();
        messages.sort_by_key(|m| m.received_at);
        Ok(messages)
    }

    /// Reply to the tweet id in `target.recipient`.
    async fn send(
        &self,
        credential: &ChannelCredential,
        target: &ReplyTarget,
        text: &str,
    ) -> Result<(), ChannelError> {
        if text.chars().count() > MAX_TWEET_CHARS {
            return Err(ChannelError::InvalidPayload {
                name: "twitter".into(),
                reason: format!("reply exceeds {MAX_TWEET_CHARS} characters"),
            });
        }
        let payload = json!({
            "text": text,
            "reply": { "in_reply_to_tweet_id": target.recipient },
        });
        let url = format!("{}/tweets", self.config.api_base);
        let resp = send_with_retry(ChannelKind::Twitter, &self.deps.retry, || {
            self.deps
                .client
                .post(&url)
                .bearer_auth(credential.access_token.expose_secret())
                .json(&payload)
        })
        .await?;
        ensure_success(ChannelKind::Twitter, resp).await?;
        info!(in_reply_to = %target.recipient, "Reply tweet posted");
        Ok(())
    }

    fn task_for(&self, message: &RawMessage) -> NewTask {
        NewTask::new(
            format!("[Twitter] Mention from @{}", message.sender),
            format!("From: @{}\n\n{}", message.sender, message.body),
        )
        .with_source(ChannelKind::Twitter.as_str())
    }
}

#[cfg(test)]
mod tests {
    use httpmock::prelude::*;

    use super::*;
    use crate::test_support::{channel_deps, memory_db, t0};

    fn config(base: &str) -> TwitterConfig {
        TwitterConfig {
            client_id: "cid".into(),
            client_secret: SecretString::from("secret".to_string()),
            api_base: base.to_string(),
            token_url: format!("{base}/oauth2/token"),
            max_per_poll: 10,
            poll_interval: Duration::from_secs(300),
            auto_reply: false,
        }
    }

    fn credential() -> ChannelCredential {
        ChannelCredential::new(
            "tw-token",
            CredentialExtra::Twitter {
                user_id: Some("99".into()),
                username: Some("desk".into()),
            },
        )
    }

    #[tokio::test]
    async fn fetches_mentions_with_usernames() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(GET)
                    .path("/users/99/mentions")
                    .query_param("expansions", "author_id")
                    .query_param("max_results", "10");
                then.status(200).json_body(serde_json::json!({
                    "data": [
                        {"id": "t2", "text": "@desk second", "author_id": "7",
                         "created_at": "2026-03-02T09:05:00.000Z"},
                        {"id": "t1", "text": "@desk first", "author_id": "8",
                         "created_at": "2026-03-02T09:00:00.000Z"}
                    ],
                    "includes": {"users": [{"id": "7", "username": "sam"}]}
                }));
            })
            .await;

        let adapter = TwitterAdapter::new(
            config(&server.base_url()),
            channel_deps(memory_db().await),
        );
        let messages = adapter.fetch_new(&credential()).await.unwrap();
        assert_eq!(messages[0].external_id, "t1");
        assert_eq!(messages[0].received_at, t0());
        assert_eq!(messages[0].sender, "8");
        assert_eq!(messages[1].sender, "sam");
        assert_eq!(messages[1].reply_to.recipient, "t2");
        assert_eq!(
            adapter.task_for(&messages[1]).title,
            "[Twitter] Mention from @sam"
        );
    }

    #[tokio::test]
    async fn send_replies_in_thread() {
        let server = MockServer::start_async().await;
        let post = server
            .mock_async(|when, then| {
                when.method(POST)
                    .path("/tweets")
                    .body_includes("\"in_reply_to_tweet_id\":\"t1\"");
                then.status(201)
                    .json_body(serde_json::json!({"data": {"id": "t9"}}));
            })
            .await;

        let adapter = TwitterAdapter::new(
            config(&server.base_url()),
            channel_deps(memory_db().await),
        );
        adapter
            .send(&credential(), &ReplyTarget::to("t1"), "On it")
            .await
            .unwrap();
        post.assert_hits_async(1).await;

        let long = "x".repeat(281);
        assert!(
            adapter
                .send(&credential(), &ReplyTarget::to("t1"), &long)
                .await
                .is_err()
        );
        post.assert_hits_async(1).await;
    }

    #[tokio::test]
    async fn expiring_token_is_refreshed_with_basic_auth() {
        let server = MockServer::start_async().await;
        let token = server
            .mock_async(|when, then| {
                when.method(POST)
                    .path("/oauth2/token")
                    .header("authorization", "Basic Y2lkOnNlY3JldA==")
                    .body_includes("grant_type=refresh_token");
                then.status(200).json_body(serde_json::json!({
                    "access_token": "fresh", "refresh_token": "r2", "expires_in": 7200
                }));
            })
            .await;

        let db = memory_db().await;
        let stale = credential()
            .with_refresh_token("r1")
            .with_expiry(t0() + chrono::Duration::seconds(60));
        db.save_credential(&stale).await.unwrap();

        let adapter = TwitterAdapter::new(config(&server.base_url()), channel_deps(db.clone()));
        let cred = adapter.get_valid_credential().await.unwrap().unwrap();
        assert_eq!(cred.access_token.expose_secret(), "fresh");
        token.assert_hits_async(1).await;
    }
}
