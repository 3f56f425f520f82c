//! LLM 客户端抽象
//!
//! 所有后端（OpenAI 兼容 / Mock）实现 LlmClient：complete（非流式）、complete_stream（流式 Token）。
//! 重试、超时与工具调用解析不在客户端内，由 engine::backend::LlmBackend 负责。

use std::pin::Pin;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{stream, Stream};
use serde::Deserialize;
use thiserror::Error;

use crate::core::error::BackendError;
use crate::memory::Message;

/// 流式 Token
pub type TokenStream = Pin<Box<dyn Stream<Item = Result<String, LlmError>> + Send>>;

/// 原始客户端错误
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LlmError {
    #[error("rate limited (retry after {retry_after_ms:?}ms)")]
    RateLimited { retry_after_ms: Option<u64> },

    #[error("model overloaded: {0}")]
    Overloaded(String),

    #[error("network error: {0}")]
    Network(String),

    #[error("api error: {0}")]
    ApiError(String),
}

impl LlmError {
    /// 按错误文本归类（async-openai 的错误只有字符串形式可用）
    pub fn classify(message: impl Into<String>) -> Self {
        let message = message.into();
        let lower = message.to_lowercase();
        if lower.contains("429") || lower.contains("rate limit") {
            LlmError::RateLimited {
                retry_after_ms: None,
            }
        } else if lower.contains("503") || lower.contains("overloaded") || lower.contains("unavailable") {
            LlmError::Overloaded(message)
        } else if lower.contains("connection") || lower.contains("dns") || lower.contains("reset") {
            LlmError::Network(message)
        } else {
            LlmError::ApiError(message)
        }
    }
}

impl From<LlmError> for BackendError {
    fn from(err: LlmError) -> Self {
        match err {
            LlmError::RateLimited { .. } | LlmError::Overloaded(_) | LlmError::Network(_) => {
                BackendError::Overloaded(err.to_string())
            }
            LlmError::ApiError(message) => BackendError::Api(message),
        }
    }
}

/// 瞬时错误重试策略：指数退避
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// 总尝试次数（含首次）
    pub max_attempts: u32,
    pub initial_delay_ms: u64,
    pub backoff_factor: u32,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay_ms: 2000,
            backoff_factor: 2,
        }
    }
}

impl RetryConfig {
    /// 第 attempt 次失败（从 1 开始）后的等待时间
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = u64::from(self.backoff_factor.max(1)).saturating_pow(attempt.saturating_sub(1));
        Duration::from_millis(self.initial_delay_ms.saturating_mul(factor))
    }
}

/// LLM 客户端 trait：非流式完成与流式完成（返回 Token 流）
#[async_trait]
pub trait LlmClient: Send + Sync {
    async fn complete(&self, messages: &[Message]) -> Result<String, LlmError>;

    /// 流式完成；默认实现把 complete 的结果包成单元素流
    async fn complete_stream(&self, messages: &[Message]) -> Result<TokenStream, LlmError> {
        let content = self.complete(messages).await?;
        Ok(Box::pin(stream::iter(vec![Ok(content)])))
    }

    /// 累计 token 使用统计：(prompt_tokens, completion_tokens, total_tokens)
    fn token_usage(&self) -> (u64, u64, u64) {
        (0, 0, 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_delays_back_off() {
        let retry = RetryConfig::default();
        assert_eq!(retry.delay_for(1), Duration::from_secs(2));
        assert_eq!(retry.delay_for(2), Duration::from_secs(4));
        assert_eq!(retry.delay_for(3), Duration::from_secs(8));
    }

    #[test]
    fn test_classify_errors() {
        assert_eq!(
            LlmError::classify("HTTP 503 Service Unavailable"),
            LlmError::Overloaded("HTTP 503 Service Unavailable".into())
        );
        assert!(matches!(
            LlmError::classify("429 Too Many Requests"),
            LlmError::RateLimited { .. }
        ));
        assert!(matches!(
            LlmError::classify("invalid api key"),
            LlmError::ApiError(_)
        ));
    }

    #[test]
    fn test_transient_llm_errors_map_to_overloaded() {
        let err: BackendError = LlmError::Network("reset".into()).into();
        assert!(err.is_transient());
        let err: BackendError = LlmError::ApiError("400".into()).into();
        assert!(!err.is_transient());
    }
}
