//! Turn inbound channel messages into tasks.
//!
//! Poll cycles and webhook pushes both end up in [`Ingestor::ingest`]:
//! the task and its processed marker are committed together first, then
//! the provider is acknowledged and an auto-reply is attempted. Nothing
//! after the commit can undo the task.

use std::sync::Arc;

use serde_json::json;
use tracing::{debug, info, warn};

use crate::channels::channel::{ChannelAdapter, ChannelCredential, RawMessage};
use crate::error::{ChannelError, IngestError};
use crate::reply::{ReplyContext, ReplyGenerator, ReplyKind, StaticReplies};
use crate::store::ProcessedMarker;
use crate::tasks::engine::TaskEngine;
use crate::tasks::model::{NewLog, Task, TaskStatus};

/// What happened to the auto-reply for a new task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplyOutcome {
    /// Auto-reply disabled, no credential, or no reply for this status.
    NotAttempted,
    Sent(ReplyKind),
    /// The task stands; only the reply failed.
    Failed(String),
}

/// Result of ingesting one message.
#[derive(Debug, Clone, PartialEq)]
pub enum IngestOutcome {
    /// The message was seen before. Nothing was written.
    Duplicate,
    Created { task: Task, reply: ReplyOutcome },
}

impl IngestOutcome {
    pub fn task(&self) -> Option<&Task> {
        match self {
            Self::Created { task, .. } => Some(task),
            Self::Duplicate => None,
        }
    }
}

pub struct Ingestor {
    engine: Arc<TaskEngine>,
    replies: Arc<dyn ReplyGenerator>,
}

impl Ingestor {
    /// Ingestor replying with the static templates.
    pub fn new(engine: Arc<TaskEngine>) -> Self {
        Self {
            engine,
            replies: Arc::new(StaticReplies),
        }
    }

    pub fn with_replies(mut self, replies: Arc<dyn ReplyGenerator>) -> Self {
        self.replies = replies;
        self
    }

    pub fn engine(&self) -> &Arc<TaskEngine> {
        &self.engine
    }

    /// Ingest a message fetched with `credential`.
    pub async fn ingest(
        &self,
        adapter: &dyn ChannelAdapter,
        credential: &ChannelCredential,
        message: &RawMessage,
    ) -> Result<IngestOutcome, IngestError> {
        self.ingest_with(adapter, Some(credential), message).await
    }

    /// Ingest a message a provider pushed to us (webhook).
    ///
    /// The task is created even when no credential is available; only the
    /// reply is skipped then.
    pub async fn ingest_push(
        &self,
        adapter: &dyn ChannelAdapter,
        message: RawMessage,
    ) -> Result<IngestOutcome, IngestError> {
        let credential = match adapter.get_valid_credential().await {
            Ok(cred) => cred,
            Err(e) => {
                warn!(channel = %adapter.kind(), error = %e, "No credential for pushed message");
                None
            }
        };
        self.ingest_with(adapter, credential.as_ref(), &message).await
    }

    async fn ingest_with(
        &self,
        adapter: &dyn ChannelAdapter,
        credential: Option<&ChannelCredential>,
        message: &RawMessage,
    ) -> Result<IngestOutcome, IngestError> {
        let channel = adapter.kind();
        let marker = ProcessedMarker {
            channel,
            external_id: message.external_id.clone(),
        };

        let created = if self
            .engine
            .db()
            .is_processed(channel, &message.external_id)
            .await?
        {
            None
        } else {
            self.engine
                .create_from_message(adapter.task_for(message), &marker)
                .await?
        };

        if let Some(cred) = credential {
            if let Err(e) = adapter.acknowledge(cred, message).await {
                warn!(channel = %channel, id = %message.external_id, error = %e,
                    "Failed to acknowledge message");
            }
        }

        let Some(task) = created else {
            debug!(channel = %channel, id = %message.external_id, "Duplicate message ignored");
            return Ok(IngestOutcome::Duplicate);
        };
        info!(channel = %channel, task_id = %task.id, status = %task.status, "Task created from message");

        let reply = match credential {
            Some(cred) if adapter.auto_reply_enabled() => {
                self.reply(adapter, cred, &task, message).await
            }
            _ => ReplyOutcome::NotAttempted,
        };
        Ok(IngestOutcome::Created { task, reply })
    }

    async fn reply(
        &self,
        adapter: &dyn ChannelAdapter,
        credential: &ChannelCredential,
        task: &Task,
        message: &RawMessage,
    ) -> ReplyOutcome {
        let kind = match task.status {
            TaskStatus::InProgress => ReplyKind::Acknowledgement,
            TaskStatus::AwaitingApproval => ReplyKind::ApprovalNotice,
            _ => return ReplyOutcome::NotAttempted,
        };
        let channel = adapter.kind();
        let ctx = ReplyContext {
            channel,
            task,
            message,
        };

        let sent = self.send_reply(adapter, credential, kind, &ctx).await;

        let now = self.engine.now();
        match sent {
            Ok(()) => {
                let action = match kind {
                    ReplyKind::Acknowledgement => "auto_reply_sent",
                    ReplyKind::ApprovalNotice => "approval_required",
                };
                let log = NewLog::new(
                    action,
                    json!({
                        "channel": channel,
                        "external_id": message.external_id,
                        "recipient": message.reply_to.recipient,
                    }),
                    now,
                )
                .for_task(task.id);
                if let Err(log_err) = self.engine.record(log).await {
                    warn!(channel = %channel, task_id = %task.id, error = %log_err,
                        "Failed to audit auto-reply");
                }
                ReplyOutcome::Sent(kind)
            }
            Err(e) => {
                warn!(channel = %channel, task_id = %task.id, error = %e, "Auto-reply failed");
                let log = NewLog::new(
                    "auto_reply_failed",
                    json!({
                        "channel": channel,
                        "external_id": message.external_id,
                        "error": e.to_string(),
                    }),
                    now,
                )
                .for_task(task.id);
                if let Err(log_err) = self.engine.record(log).await {
                    warn!(channel = %channel, task_id = %task.id, error = %log_err,
                        "Failed to audit auto-reply failure");
                }
                ReplyOutcome::Failed(e.to_string())
            }
        }
    }

    async fn send_reply(
        &self,
        adapter: &dyn ChannelAdapter,
        credential: &ChannelCredential,
        kind: ReplyKind,
        ctx: &ReplyContext<'_>,
    ) -> Result<(), ChannelError> {
        let text = self.replies.reply_text(kind, ctx).await?;
        adapter
            .send(credential, &ctx.message.reply_to, &text)
            .await
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering;

    use super::*;
    use crate::channels::ChannelKind;
    use crate::reply::APPROVAL_NOTICE;
    use crate::tasks::model::{LogFilter, Page, TaskFilter};
    use crate::test_support::{FakeAdapter, raw_message, test_engine};

    async fn setup(adapter: &FakeAdapter) -> (Ingestor, ChannelCredential) {
        let engine = test_engine().await;
        let cred = adapter.get_valid_credential().await.unwrap().unwrap();
        (Ingestor::new(engine), cred)
    }

    async fn count_logs(ingestor: &Ingestor, action: &str) -> usize {
        let filter = LogFilter {
            action: Some(action.to_string()),
            ..LogFilter::default()
        };
        ingestor
            .engine()
            .list_logs(&filter, Page::default())
            .await
            .unwrap()
            .len()
    }

    #[tokio::test]
    async fn same_message_twice_creates_one_task() {
        let adapter = FakeAdapter::new(ChannelKind::WhatsApp);
        let (ingestor, cred) = setup(&adapter).await;
        let msg = raw_message("msg-1", "+1999", "Update meeting notes");

        let first = ingestor.ingest(&adapter, &cred, &msg).await.unwrap();
        assert!(first.task().is_some());
        let second = ingestor.ingest(&adapter, &cred, &msg).await.unwrap();
        assert_eq!(second, IngestOutcome::Duplicate);

        let (_, total) = ingestor
            .engine()
            .list_tasks(&TaskFilter::default(), Page::default())
            .await
            .unwrap();
        assert_eq!(total, 1);
        let db = ingestor.engine().db();
        assert_eq!(db.count_processed(ChannelKind::WhatsApp).await.unwrap(), 1);
        assert_eq!(adapter.sent.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn webhook_and_poll_racing_on_one_message_create_one_task() {
        let adapter = FakeAdapter::new(ChannelKind::WhatsApp);
        let (ingestor, cred) = setup(&adapter).await;
        let msg = raw_message("SM5", "+1999", "Please call me back");

        let (pushed, polled) = tokio::join!(
            ingestor.ingest_push(&adapter, msg.clone()),
            ingestor.ingest(&adapter, &cred, &msg),
        );
        let outcomes = [pushed.unwrap(), polled.unwrap()];
        let created = outcomes.iter().filter(|o| o.task().is_some()).count();
        assert_eq!(created, 1);
        assert!(outcomes.contains(&IngestOutcome::Duplicate));

        let (_, total) = ingestor
            .engine()
            .list_tasks(&TaskFilter::default(), Page::default())
            .await
            .unwrap();
        assert_eq!(total, 1);
        assert_eq!(adapter.sent.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn routine_message_gets_acknowledged() {
        let adapter = FakeAdapter::new(ChannelKind::WhatsApp);
        let (ingestor, cred) = setup(&adapter).await;
        let msg = raw_message("m1", "+1999", "simple note about lunch");

        let outcome = ingestor.ingest(&adapter, &cred, &msg).await.unwrap();
        let IngestOutcome::Created { task, reply } = outcome else {
            panic!("expected a task");
        };
        assert_eq!(task.status, TaskStatus::InProgress);
        assert_eq!(task.source, "whatsapp");
        assert_eq!(reply, ReplyOutcome::Sent(ReplyKind::Acknowledgement));
        assert_eq!(count_logs(&ingestor, "auto_reply_sent").await, 1);
        assert_eq!(adapter.acknowledged.lock().unwrap().as_slice(), ["m1"]);
    }

    #[tokio::test]
    async fn sensitive_message_gets_approval_notice() {
        let adapter = FakeAdapter::new(ChannelKind::Gmail);
        let (ingestor, cred) = setup(&adapter).await;
        let msg = raw_message(
            "m2",
            "ops@example.com",
            "Reset password for admin, credential access change",
        );

        let outcome = ingestor.ingest(&adapter, &cred, &msg).await.unwrap();
        let task = outcome.task().unwrap();
        assert_eq!(task.status, TaskStatus::AwaitingApproval);
        let sent = adapter.sent.lock().unwrap();
        assert_eq!(sent[0].1, APPROVAL_NOTICE);
        drop(sent);
        assert_eq!(count_logs(&ingestor, "approval_required").await, 1);
    }

    #[tokio::test]
    async fn send_failure_keeps_the_task() {
        let adapter = FakeAdapter::new(ChannelKind::Twitter);
        adapter.fail_send.store(true, Ordering::SeqCst);
        let (ingestor, cred) = setup(&adapter).await;

        let outcome = ingestor
            .ingest(&adapter, &cred, &raw_message("t1", "sam", "hello"))
            .await
            .unwrap();
        let IngestOutcome::Created { task, reply } = outcome else {
            panic!("expected a task");
        };
        assert!(matches!(reply, ReplyOutcome::Failed(_)));
        assert!(ingestor.engine().get_task(task.id).await.is_ok());
        assert_eq!(count_logs(&ingestor, "auto_reply_failed").await, 1);
    }

    #[tokio::test]
    async fn disabled_auto_reply_sends_nothing() {
        let adapter = FakeAdapter::new(ChannelKind::LinkedIn).with_auto_reply(false);
        let (ingestor, cred) = setup(&adapter).await;

        let outcome = ingestor
            .ingest(&adapter, &cred, &raw_message("c1", "urn:li:person:x", "hi"))
            .await
            .unwrap();
        assert!(matches!(
            outcome,
            IngestOutcome::Created {
                reply: ReplyOutcome::NotAttempted,
                ..
            }
        ));
        assert!(adapter.sent.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn push_without_credential_still_creates_task() {
        let adapter = FakeAdapter::new(ChannelKind::WhatsApp).without_credential();
        let engine = test_engine().await;
        let ingestor = Ingestor::new(engine);

        let outcome = ingestor
            .ingest_push(&adapter, raw_message("SM1", "+1999", "hello"))
            .await
            .unwrap();
        assert!(matches!(
            outcome,
            IngestOutcome::Created {
                reply: ReplyOutcome::NotAttempted,
                ..
            }
        ));
        let again = ingestor
            .ingest_push(&adapter, raw_message("SM1", "+1999", "hello"))
            .await
            .unwrap();
        assert_eq!(again, IngestOutcome::Duplicate);
    }

    #[tokio::test]
    async fn duplicates_are_still_acknowledged() {
        let adapter = FakeAdapter::new(ChannelKind::Gmail);
        let (ingestor, cred) = setup(&adapter).await;
        let msg = raw_message("g1", "a@example.com", "note");

        ingestor.ingest(&adapter, &cred, &msg).await.unwrap();
        ingestor.ingest(&adapter, &cred, &msg).await.unwrap();
        assert_eq!(adapter.acknowledged.lock().unwrap().len(), 2);
    }
}
