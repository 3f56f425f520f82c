//! 出站接口：发送回复与操作聊天界面（平台实现位于核心之外）

use async_trait::async_trait;
use thiserror::Error;

use crate::core::error::{BackendError, EngineError};
use crate::core::request::{MessageId, Origin, ResponseRef};
use crate::engine::FinalResult;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SurfaceError {
    #[error("message not found: {0}")]
    NotFound(MessageId),

    #[error("missing permission: {0}")]
    Forbidden(String),

    #[error("platform error: {0}")]
    Platform(String),
}

/// 要发送的回复
#[derive(Debug, Clone, Copy)]
pub enum Reply<'a> {
    Final(&'a FinalResult),
    /// 失败通知（让重试表情有落点）
    Failure(&'a str),
}

/// 发送回复；previous 为被取代请求的旧回复，实现可原地编辑
#[async_trait]
pub trait OutboundSender: Send + Sync {
    async fn send(
        &self,
        origin: &Origin,
        reply: Reply<'_>,
        previous: &[ResponseRef],
    ) -> Result<Vec<ResponseRef>, SurfaceError>;
}

/// 反馈适配器使用的界面操作
#[async_trait]
pub trait ChatSurface: Send + Sync {
    async fn add_reaction(&self, message_id: &str, emoji: &str) -> Result<(), SurfaceError>;

    async fn remove_own_reaction(&self, message_id: &str, emoji: &str)
        -> Result<(), SurfaceError>;

    async fn clear_reactions(&self, message_id: &str) -> Result<(), SurfaceError>;

    async fn delete_message(&self, message_id: &str) -> Result<(), SurfaceError>;

    async fn send_typing(&self, channel_id: &str) -> Result<(), SurfaceError>;
}

/// 用户可见的失败通知
pub fn failure_notice(error: &EngineError) -> String {
    match error {
        EngineError::BackendFailure(BackendError::Overloaded(_)) => {
            "The model is currently overloaded. Please try again shortly.".to_string()
        }
        other => format!(
            "An error occurred while processing your request.\n```\n{}\n```",
            other
        ),
    }
}
