//! 平台无关的入站聊天事件

use std::sync::OnceLock;

use regex::Regex;

use crate::core::request::{Attachment, MessageId, Origin};

/// 入站消息
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InboundMessage {
    pub id: MessageId,
    pub channel_id: String,
    pub thread_id: Option<String>,
    pub author_id: String,
    pub author_is_bot: bool,
    pub content: String,
    pub attachments: Vec<Attachment>,
    /// 私聊
    pub is_direct: bool,
    pub mentions_bot: bool,
}

/// `<@123>` / `<@!123>` / `<@&123>`
fn mention_pattern() -> Option<&'static Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN
        .get_or_init(|| Regex::new(r"<@[!&]?\d+>").ok())
        .as_ref()
}

impl InboundMessage {
    /// 冻结为请求来源；去掉 @ 提及
    pub fn to_origin(&self) -> Origin {
        let content = match mention_pattern() {
            Some(pattern) => pattern.replace_all(&self.content, "").into_owned(),
            None => self.content.clone(),
        };
        Origin {
            message_id: self.id.clone(),
            channel_id: self.channel_id.clone(),
            thread_id: self.thread_id.clone(),
            author_id: self.author_id.clone(),
            content: content.trim().to_string(),
            attachments: self.attachments.clone(),
        }
    }
}

/// 表情回应
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReactionEvent {
    pub message_id: MessageId,
    pub channel_id: String,
    pub user_id: String,
    pub user_is_bot: bool,
    pub emoji: String,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ChatEvent {
    MessageCreated(InboundMessage),
    MessageEdited {
        before_content: String,
        after: InboundMessage,
    },
    MessageDeleted {
        message_id: MessageId,
    },
    ReactionAdded(ReactionEvent),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mentions_are_stripped() {
        let msg = InboundMessage {
            id: "m1".into(),
            channel_id: "c1".into(),
            thread_id: None,
            author_id: "u1".into(),
            author_is_bot: false,
            content: "<@123> what's the weather <@!456>".into(),
            attachments: vec![],
            is_direct: false,
            mentions_bot: true,
        };
        assert_eq!(msg.to_origin().content, "what's the weather");
    }
}
