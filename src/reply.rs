//! Auto-reply text for ingested messages.
//!
//! The default is a fixed template per channel. An external generator
//! (an LLM, a template service) can be plugged in through [`ReplyGenerator`].

use async_trait::async_trait;

use crate::channels::channel::{ChannelKind, RawMessage};
use crate::error::ChannelError;
use crate::tasks::model::Task;

/// Which reply the ingestor wants.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyKind {
    /// The task went straight to work.
    Acknowledgement,
    /// The task is held for a human decision.
    ApprovalNotice,
}

/// What a generator may look at.
#[derive(Debug, Clone, Copy)]
pub struct ReplyContext<'a> {
    pub channel: ChannelKind,
    pub task: &'a Task,
    pub message: &'a RawMessage,
}

/// Produces reply text.
#[async_trait]
pub trait ReplyGenerator: Send + Sync {
    async fn reply_text(
        &self,
        kind: ReplyKind,
        ctx: &ReplyContext<'_>,
    ) -> Result<String, ChannelError>;
}

pub const GMAIL_ACKNOWLEDGEMENT: &str = "Thank you for your email. This message has been received and logged by the Digital FTE system. A team member will follow up if needed.";

pub const CHAT_ACKNOWLEDGEMENT: &str =
    "Thanks for your message! I've logged this as a task and will get back to you shortly.";

pub const SOCIAL_ACKNOWLEDGEMENT: &str =
    "Thanks for reaching out! We've logged this and will follow up shortly.";

pub const APPROVAL_NOTICE: &str = "I've received your request. Since it involves sensitive actions, I'll need supervisor approval before proceeding.";

/// Fixed templates.
#[derive(Debug, Clone, Copy, Default)]
pub struct StaticReplies;

impl StaticReplies {
    pub fn text(kind: ReplyKind, channel: ChannelKind) -> &'static str {
        match (kind, channel) {
            (ReplyKind::ApprovalNotice, _) => APPROVAL_NOTICE,
            (ReplyKind::Acknowledgement, ChannelKind::Gmail) => GMAIL_ACKNOWLEDGEMENT,
            (ReplyKind::Acknowledgement, ChannelKind::WhatsApp) => CHAT_ACKNOWLEDGEMENT,
            (ReplyKind::Acknowledgement, _) => SOCIAL_ACKNOWLEDGEMENT,
        }
    }
}

#[async_trait]
impl ReplyGenerator for StaticReplies {
    async fn reply_text(
        &self,
        kind: ReplyKind,
        ctx: &ReplyContext<'_>,
    ) -> Result<String, ChannelError> {
        Ok(Self::text(kind, ctx.channel).to_string())
    }
}
