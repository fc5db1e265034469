//! Facebook Page channel via the Graph API.
//!
//! Page tokens are long-lived and cannot be refreshed; an expired token
//! means the page must be connected again.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use tracing::{debug, info};

use crate::channels::ChannelDeps;
use crate::channels::channel::{
    ChannelAdapter, ChannelCredential, ChannelKind, CredentialExtra, RawMessage, ReplyTarget,
    truncate_chars,
};
use crate::channels::http::{ensure_success, read_json, send_with_retry};
use crate::channels::oauth::CredentialSource;
use crate::config::{env_bool, env_nonempty, env_or};
use crate::error::ChannelError;
use crate::tasks::model::NewTask;

pub const GRAPH_API_BASE: &str = "https://graph.facebook.com/v21.0";

/// Graph timestamps look like `2026-03-02T09:00:00+0000`.
const GRAPH_TIME_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%z";

#[derive(Debug, Clone)]
pub struct FacebookConfig {
    pub app_id: String,
    pub app_secret: SecretString,
    pub api_base: String,
    /// Used when the stored credential names no page.
    pub page_id: Option<String>,
    pub poll_interval: Duration,
    pub auto_reply: bool,
}

impl FacebookConfig {
    pub fn from_env() -> Option<Self> {
        let app_id = env_nonempty("FACEBOOK_APP_ID")?;
        let app_secret = env_nonempty("FACEBOOK_APP_SECRET")?;
        Some(Self {
            app_id,
            app_secret: SecretString::from(app_secret),
            api_base: env_nonempty("FACEBOOK_API_BASE").unwrap_or_else(|| GRAPH_API_BASE.into()),
            page_id: env_nonempty("FACEBOOK_PAGE_ID"),
            poll_interval: Duration::from_secs(env_or("FACEBOOK_POLL_INTERVAL_SECONDS", 300)),
            auto_reply: env_bool("FACEBOOK_AUTO_REPLY_ENABLED", false),
        })
    }
}

#[derive(Debug, Deserialize)]
struct TaggedPage {
    #[serde(default)]
    data: Vec<Post>,
}

#[derive(Debug, Deserialize)]
struct Post {
    id: String,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    from: Option<Author>,
    #[serde(default)]
    created_time: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Author {
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    name: Option<String>,
}

fn parse_graph_time(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_str(raw, GRAPH_TIME_FORMAT)
        .or_else(|_| DateTime::parse_from_rfc3339(raw))
        .ok()
        .map(|d| d.with_timezone(&Utc))
}

pub struct FacebookAdapter {
    config: FacebookConfig,
    deps: ChannelDeps,
    credentials: CredentialSource,
}

impl FacebookAdapter {
    pub fn new(config: FacebookConfig, deps: ChannelDeps) -> Self {
        let credentials = deps.credential_source(ChannelKind::Facebook);
        Self {
            config,
            deps,
            credentials,
        }
    }

    fn page_id<'a>(&'a self, credential: &'a ChannelCredential) -> Option<&'a str> {
        match &credential.extra {
            CredentialExtra::Facebook { page_id, .. } if !page_id.is_empty() => Some(page_id),
            _ => self.config.page_id.as_deref(),
        }
    }
}

#[async_trait]
impl ChannelAdapter for FacebookAdapter {
    fn kind(&self) -> ChannelKind {
        ChannelKind::Facebook
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
        let Some(page_id) = self.page_id(credential) else {
            debug!("No Facebook page id, skipping fetch");
            return Ok(Vec::new());
        };

        let url = format!("{}/{page_id}/tagged", self.config.api_base);
        let resp = send_with_retry(ChannelKind::Facebook, &self.deps.retry, || {
            self.deps.client.get(&url).query(&[
                ("fields", "id,message,from,created_time"),
                ("access_token", credential.access_token.expose_secret()),
            ])
        })
        .await?;
        let page: TaggedPage = read_json(ChannelKind::Facebook, resp).await?;

        let mut messages: Vec<RawMessage> = page
            .data
            .into_iter()
            .filter(|p| p.from.as_ref().and_then(|a| a.id.as_deref()) != Some(page_id))
            .map(|p| {
                let sender = p
                    .from
                    .and_then(|a| a.name.or(a.id))
                    .unwrap_or_else(|| "unknown".into());
                RawMessage {
                    received_at: p
                        .created_time
                        .as_deref()
                        .and_then(parse_graph_time)
                        .unwrap_or(DateTime::<Utc>::MIN_UTC),
                    reply_to: ReplyTarget::to(p.id.clone()),
                    external_id: p.id,
                    sender,
                    subject: None,
                    body: p.message.unwrap_or_default(),
                }
            })
            .collect();
        messages.sort_by_key(|m| m.received_at);
        Ok(messages)
    }

    /// Comment on the post id in `target.recipient`.
    async fn send(
        &self,
        credential: &ChannelCredential,
        target: &ReplyTarget,
        text: &str,
    ) -> Result<(), ChannelError> {
        let url = format!("{}/{}/comments", self.config.api_base, target.recipient);
        let resp = send_with_retry(ChannelKind::Facebook, &self.deps.retry, || {
            self.deps.client.post(&url).form(&[
                ("message", text),
                ("access_token", credential.access_token.expose_secret()),
            ])
        })
        .await?;
        ensure_success(ChannelKind::Facebook, resp).await?;
        info!(post = %target.recipient, "Facebook comment posted");
        Ok(())
    }

    fn task_for(&self, message: &RawMessage) -> NewTask {
        NewTask::new(
            format!("[Facebook] Post from {}", message.sender),
            format!(
                "Author: {}\n\n{}",
                message.sender,
                truncate_chars(&message.body, 5000)
            ),
        )
        .with_source(ChannelKind::Facebook.as_str())
    }
}

#[cfg(test)]
mod tests {
    use httpmock::prelude::*;

    use super::*;
    use crate::test_support::{channel_deps, memory_db, t0};

    fn config(base: &str) -> FacebookConfig {
        FacebookConfig {
            app_id: "app".into(),
            app_secret: SecretString::from("secret".to_string()),
            api_base: base.to_string(),
            page_id: None,
            poll_interval: Duration::from_secs(300),
            auto_reply: false,
        }
    }

    fn credential() -> ChannelCredential {
        ChannelCredential::new(
            "page-token",
            CredentialExtra::Facebook {
                page_id: "p1".into(),
                instagram_id: None,
            },
        )
    }

    #[test]
    fn parses_graph_timestamps() {
        assert_eq!(parse_graph_time("2026-03-02T09:00:00+0000"), Some(t0()));
        assert_eq!(parse_graph_time("2026-03-02T10:00:00+01:00"), Some(t0()));
        assert_eq!(parse_graph_time("yesterday"), None);
    }

    #[tokio::test]
    async fn fetches_tagged_posts_oldest_first() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(GET)
                    .path("/p1/tagged")
                    .query_param("access_token", "page-token")
                    .query_param("fields", "id,message,from,created_time");
                then.status(200).json_body(serde_json::json!({
                    "data": [
                        {"id": "p1_3", "message": "from the page itself",
                         "from": {"id": "p1", "name": "Desk"},
                         "created_time": "2026-03-02T08:00:00+0000"},
                        {"id": "u_2", "message": "second",
                         "from": {"id": "u", "name": "Riley"},
                         "created_time": "2026-03-02T09:10:00+0000"},
                        {"id": "u_1", "message": "first",
                         "from": {"id": "u", "name": "Riley"},
                         "created_time": "2026-03-02T09:00:00+0000"}
                    ]
                }));
            })
            .await;

        let adapter = FacebookAdapter::new(
            config(&server.base_url()),
            channel_deps(memory_db().await),
        );
        let messages = adapter.fetch_new(&credential()).await.unwrap();
        let ids: Vec<_> = messages.iter().map(|m| m.external_id.as_str()).collect();
        assert_eq!(ids, vec!["u_1", "u_2"]);
        assert_eq!(messages[0].received_at, t0());
        assert_eq!(
            adapter.task_for(&messages[0]).title,
            "[Facebook] Post from Riley"
        );
    }

    #[tokio::test]
    async fn send_comments_on_post() {
        let server = MockServer::start_async().await;
        let comment = server
            .mock_async(|when, then| {
                when.method(POST)
                    .path("/u_1/comments")
                    .body_includes("message=Thanks")
                    .body_includes("access_token=page-token");
                then.status(200).json_body(serde_json::json!({"id": "c1"}));
            })
            .await;

        let adapter = FacebookAdapter::new(
            config(&server.base_url()),
            channel_deps(memory_db().await),
        );
        adapter
            .send(&credential(), &ReplyTarget::to("u_1"), "Thanks")
            .await
            .unwrap();
        comment.assert_hits_async(1).await;
    }

    #[tokio::test]
    async fn expired_page_token_needs_reconnect() {
        let db = memory_db().await;
        db.save_credential(&credential().with_expiry(t0() - chrono::Duration::hours(1)))
            .await
            .unwrap();
        let adapter = FacebookAdapter::new(config("http://127.0.0.1:9"), channel_deps(db));
        assert!(adapter.get_valid_credential().await.unwrap().is_none());
    }
}
