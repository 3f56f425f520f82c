//! 错误类型
//!
//! RequestError 属于生命周期契约错误（Router / Worker 使用不当），不应暴露给最终用户；
//! EngineError 让请求以 Error 终态结束；ToolFailure 可恢复，作为工具输出回灌给模型。

use serde_json::{json, Value};
use thiserror::Error;

use crate::core::request::{ConversationKey, RequestId, RequestState};

/// 请求生命周期错误
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RequestError {
    /// 同一会话已有活跃请求
    #[error("conversation {key} already has active request {active}")]
    Conflict {
        key: ConversationKey,
        active: RequestId,
    },

    #[error("request {id}: invalid transition {from:?} -> {to:?}")]
    InvalidTransition {
        id: RequestId,
        from: RequestState,
        to: RequestState,
    },

    #[error("request not found: {0}")]
    NotFound(RequestId),

    /// 任务已挂载，不允许重复 spawn
    #[error("request {0} already has a running task")]
    AlreadySpawned(RequestId),

    #[error("request {0} is outside the retry window")]
    RetryWindowElapsed(RequestId),
}

/// 生成式后端调用失败
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BackendError {
    #[error("backend call timed out after {after_secs}s")]
    Timeout { after_secs: u64 },

    #[error("backend overloaded: {0}")]
    Overloaded(String),

    #[error("backend api error: {0}")]
    Api(String),

    #[error("malformed backend reply: {0}")]
    Parse(String),
}

impl BackendError {
    /// 可重试的瞬时错误（超时、过载）
    pub fn is_transient(&self) -> bool {
        matches!(self, BackendError::Timeout { .. } | BackendError::Overloaded(_))
    }
}

/// 单次工具调用失败：记录后回灌给模型，由模型决定如何向用户描述
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ToolFailure {
    #[error("tool {tool} timed out after {after_secs}s")]
    Timeout { tool: String, after_secs: u64 },

    #[error("tool {tool} failed: {message}")]
    Failed { tool: String, message: String },

    #[error("tool {tool} received invalid arguments: {message}")]
    InvalidArguments { tool: String, message: String },
}

impl ToolFailure {
    /// 回灌给模型的失败载荷
    pub fn payload(&self) -> Value {
        json!({
            "status": "error",
            "message": self.to_string(),
        })
    }
}

/// 对话引擎终止错误：请求以 Error 结束
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    #[error("model requested unknown tool: {0}")]
    UnknownTool(String),

    #[error("tool loop exceeded {max_rounds} rounds")]
    ToolLoopExceeded { max_rounds: usize },

    #[error("backend failure: {0}")]
    BackendFailure(#[from] BackendError),

    /// 工具执行器级别的致命错误（任务 panic 等），不回灌模型
    #[error("tool invoker crashed while running {tool}: {reason}")]
    InvokerFatal { tool: String, reason: String },
}

/// 执行器级别错误：工具任务本身崩溃，区别于工具返回的失败
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum InvokerError {
    #[error("tool {tool} panicked: {reason}")]
    Panicked { tool: String, reason: String },
}

impl From<InvokerError> for EngineError {
    fn from(err: InvokerError) -> Self {
        match err {
            InvokerError::Panicked { tool, reason } => EngineError::InvokerFatal { tool, reason },
        }
    }
}
