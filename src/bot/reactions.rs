//! 表情与输入中指示的反馈适配器
//!
//! | 状态       | 界面动作                                                         |
//! |------------|------------------------------------------------------------------|
//! | Pending    | 原消息加取消表情；被取代请求的旧回复清空表情                     |
//! | Processing | 开始输入中                                                       |
//! | Done       | 停止输入；撤下取消表情；首条回复加重试表情与工具表情             |
//! | Error      | 停止输入；撤下取消表情；首条回复（没有则原消息）加重试表情       |
//! | Cancelled  | 停止输入；清空原消息与回复的表情；用户/关闭取消时原消息加重试表情 |

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::bot::feedback::FeedbackAdapter;
use crate::bot::outbound::{ChatSurface, SurfaceError};
use crate::bot::typing::TypingIndicator;
use crate::core::events::StateChange;
use crate::core::request::{CancelReason, Request, RequestState, ResponseRef};

pub const DEFAULT_RETRY_EMOJI: &str = "🔄";
pub const DEFAULT_CANCEL_EMOJI: &str = "🚫";

pub struct ReactionFeedback {
    surface: Arc<dyn ChatSurface>,
    typing: TypingIndicator,
    retry_emoji: String,
    cancel_emoji: String,
}

impl ReactionFeedback {
    pub fn new(
        surface: Arc<dyn ChatSurface>,
        retry_emoji: impl Into<String>,
        cancel_emoji: impl Into<String>,
        typing_interval: Duration,
    ) -> Self {
        Self {
            typing: TypingIndicator::new(Arc::clone(&surface), typing_interval),
            surface,
            retry_emoji: retry_emoji.into(),
            cancel_emoji: cancel_emoji.into(),
        }
    }

    pub fn typing(&self) -> &TypingIndicator {
        &self.typing
    }

    async fn react(&self, message_id: &str, emoji: &str) {
        log_failure("add_reaction", message_id, self.surface.add_reaction(message_id, emoji).await);
    }

    async fn unreact(&self, message_id: &str, emoji: &str) {
        log_failure(
            "remove_own_reaction",
            message_id,
            self.surface.remove_own_reaction(message_id, emoji).await,
        );
    }

    async fn clear(&self, message_id: &str) {
        log_failure("clear_reactions", message_id, self.surface.clear_reactions(message_id).await);
    }

    async fn finish(&self, request: &Request) {
        self.typing.stop(&request.key());
        self.unreact(&request.origin.message_id, &self.cancel_emoji).await;
    }
}

fn log_failure(op: &str, message_id: &str, result: Result<(), SurfaceError>) {
    if let Err(e) = result {
        tracing::debug!(op, message_id, error = %e, "Feedback action failed");
    }
}

#[async_trait]
impl FeedbackAdapter for ReactionFeedback {
    async fn on_state_change(&self, change: &StateChange) {
        let request = &change.request;
        let origin_id = request.origin.message_id.as_str();

        match change.new {
            RequestState::Pending => {
                for previous in &request.previous_refs {
                    self.clear(previous).await;
                }
                self.react(origin_id, &self.cancel_emoji).await;
            }
            RequestState::Processing => self.typing.start(&request.key()),
            RequestState::Done => {
                self.finish(request).await;
                let target = request.response_refs.first().map(String::as_str).unwrap_or(origin_id);
                self.react(target, &self.retry_emoji).await;
                for emoji in &request.tool_emojis {
                    self.react(target, emoji).await;
                }
            }
            RequestState::Error => {
                self.finish(request).await;
                let target = request.response_refs.first().map(String::as_str).unwrap_or(origin_id);
                self.react(target, &self.retry_emoji).await;
            }
            RequestState::Cancelled => {
                self.typing.stop(&request.key());
                self.clear(origin_id).await;
                for response in &request.response_refs {
                    self.clear(response).await;
                }
                if matches!(
                    request.cancel_reason,
                    Some(CancelReason::User) | Some(CancelReason::Shutdown)
                ) {
                    self.react(origin_id, &self.retry_emoji).await;
                }
            }
        }
    }

    async fn remove_responses(&self, refs: &[ResponseRef]) {
        for response in refs {
            log_failure("delete_message", response, self.surface.delete_message(response).await);
        }
    }
}
