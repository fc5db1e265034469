//! Helpers shared by unit tests.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Local, TimeZone, Utc};
use mockable::Clock;
use tokio::sync::Notify;

use crate::channels::channel::{
    ChannelAdapter, ChannelCredential, ChannelKind, CredentialExtra, RawMessage, ReplyTarget,
};
use crate::error::ChannelError;
use crate::store::{Database, LibSqlBackend};
use crate::tasks::model::NewTask;

/// A clock that only moves when told to.
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn at(now: DateTime<Utc>) -> Arc<Self> {
        Arc::new(Self {
            now: Mutex::new(now),
        })
    }

    pub fn set(&self, now: DateTime<Utc>) {
        *self.now.lock().unwrap() = now;
    }

    pub fn advance(&self, by: chrono::Duration) {
        let mut now = self.now.lock().unwrap();
        *now += by;
    }
}

impl Clock for ManualClock {
    fn local(&self) -> DateTime<Local> {
        self.utc().with_timezone(&Local)
    }

    fn utc(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap()
    }
}

/// Fixed reference instant for tests.
pub fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 3, 2, 9, 0, 0).unwrap()
}

pub async fn memory_db() -> Arc<dyn Database> {
    Arc::new(LibSqlBackend::new_memory().await.unwrap())
}

/// Adapter dependencies with a fixed clock and a fast retry policy.
pub fn channel_deps(db: Arc<dyn Database>) -> crate::channels::ChannelDeps {
    crate::channels::ChannelDeps::new(db, ManualClock::at(t0()), reqwest::Client::new()).with_retry(
        crate::channels::http::RetryPolicy {
            max_attempts: 2,
            base_delay: Duration::from_millis(1),
            timeout: Duration::from_secs(5),
        },
    )
}

/// Engine over a fresh in-memory database, clock fixed at [`t0`].
pub async fn test_engine() -> Arc<crate::tasks::TaskEngine> {
    Arc::new(
        crate::tasks::TaskEngine::new(
            memory_db().await,
            ManualClock::at(t0()),
            crate::config::LifecycleConfig::default(),
        )
        .await
        .unwrap(),
    )
}

pub fn raw_message(id: &str, sender: &str, body: &str) -> RawMessage {
    RawMessage {
        external_id: id.to_string(),
        sender: sender.to_string(),
        subject: None,
        body: body.to_string(),
        received_at: t0(),
        reply_to: ReplyTarget::to(sender),
    }
}

/// In-process adapter with scripted behavior.
pub struct FakeAdapter {
    kind: ChannelKind,
    auto_reply: bool,
    credential: Option<ChannelCredential>,
    pub inbox: Mutex<Vec<RawMessage>>,
    pub sent: Mutex<Vec<(ReplyTarget, String)>>,
    pub acknowledged: Mutex<Vec<String>>,
    pub fetches: AtomicUsize,
    pub fail_send: AtomicBool,
    pub fail_fetch: AtomicBool,
    pub panic_fetch: AtomicBool,
    fetch_gate: Option<Arc<Notify>>,
}

impl FakeAdapter {
    pub fn new(kind: ChannelKind) -> Self {
        let extra = match kind {
            ChannelKind::Gmail => CredentialExtra::Gmail {
                email_address: Some("desk@example.com".into()),
            },
            ChannelKind::WhatsApp => CredentialExtra::WhatsApp {
                account_sid: "AC1".into(),
                from_number: "+15550001".into(),
            },
            ChannelKind::LinkedIn => CredentialExtra::LinkedIn {
                person_urn: None,
                watch_urn: None,
            },
            ChannelKind::Twitter => CredentialExtra::Twitter {
                user_id: None,
                username: None,
            },
            ChannelKind::Facebook => CredentialExtra::Facebook {
                page_id: "p1".into(),
                instagram_id: None,
            },
        };
        Self {
            kind,
            auto_reply: true,
            credential: Some(ChannelCredential::new("fake-token", extra)),
            inbox: Mutex::new(Vec::new()),
            sent: Mutex::new(Vec::new()),
            acknowledged: Mutex::new(Vec::new()),
            fetches: AtomicUsize::new(0),
            fail_send: AtomicBool::new(false),
            fail_fetch: AtomicBool::new(false),
            panic_fetch: AtomicBool::new(false),
            fetch_gate: None,
        }
    }

    /// Hold every fetch until `gate` is notified.
    pub fn with_fetch_gate(mut self, gate: Arc<Notify>) -> Self {
        self.fetch_gate = Some(gate);
        self
    }

    pub fn with_auto_reply(mut self, enabled: bool) -> Self {
        self.auto_reply = enabled;
        self
    }

    pub fn without_credential(mut self) -> Self {
        self.credential = None;
        self
    }

    pub fn push(&self, message: RawMessage) {
        self.inbox.lock().unwrap().push(message);
    }
}

#[async_trait]
impl ChannelAdapter for FakeAdapter {
    fn kind(&self) -> ChannelKind {
        self.kind
    }

    fn poll_interval(&self) -> Duration {
        Duration::from_secs(3600)
    }

    fn auto_reply_enabled(&self) -> bool {
        self.auto_reply
    }

    async fn get_valid_credential(&self) -> Result<Option<ChannelCredential>, ChannelError> {
        Ok(self.credential.clone())
    }

    async fn fetch_new(
        &self,
        _credential: &ChannelCredential,
    ) -> Result<Vec<RawMessage>, ChannelError> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        if let Some(gate) = &self.fetch_gate {
            gate.notified().await;
        }
        if self.panic_fetch.load(Ordering::SeqCst) {
            panic!("scripted fetch panic");
        }
        if self.fail_fetch.load(Ordering::SeqCst) {
            return Err(ChannelError::RequestFailed {
                name: self.kind.to_string(),
                reason: "scripted outage".into(),
            });
        }
        Ok(self.inbox.lock().unwrap().clone())
    }

    async fn send(
        &self,
        _credential: &ChannelCredential,
        target: &ReplyTarget,
        text: &str,
    ) -> Result<(), ChannelError> {
        if self.fail_send.load(Ordering::SeqCst) {
            return Err(ChannelError::Http {
                name: self.kind.to_string(),
                status: 500,
                body: "scripted failure".into(),
            });
        }
        self.sent
            .lock()
            .unwrap()
            .push((target.clone(), text.to_string()));
        Ok(())
    }

    async fn acknowledge(
        &self,
        _credential: &ChannelCredential,
        message: &RawMessage,
    ) -> Result<(), ChannelError> {
        self.acknowledged
            .lock()
            .unwrap()
            .push(message.external_id.clone());
        Ok(())
    }

    fn task_for(&self, message: &RawMessage) -> NewTask {
        NewTask::new(
            format!("[{}] Message from {}", self.kind, message.sender),
            message.body.clone(),
        )
        .with_source(self.kind.as_str())
    }
}
