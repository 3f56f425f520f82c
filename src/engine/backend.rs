//! 生成式后端适配
//!
//! Backend::generate 返回 Generation（文本 + 工具调用）；引擎把它归类为 Step 驱动工具循环。
//! LlmBackend 把任意 LlmClient 适配为 Backend：单次调用超时、瞬时错误指数退避重试、
//! 可选流式（整个流算一次逻辑调用，超时则丢弃已收到的部分文本），并解析 JSON 工具调用。

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::core::error::BackendError;
use crate::engine::prompt::PromptContext;
use crate::llm::{LlmClient, LlmError, RetryConfig};
use crate::memory::Message;

/// 模型请求的工具调用：{"tool": "weather_lookup", "args": {"city": "Paris"}}
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub tool: String,
    #[serde(default = "empty_args")]
    pub args: Value,
}

fn empty_args() -> Value {
    Value::Object(Default::default())
}

/// 一次后端调用的产出
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Generation {
    pub text: Option<String>,
    pub tool_calls: Vec<ToolCall>,
}

impl Generation {
    pub fn answer(text: impl Into<String>) -> Self {
        Self {
            text: Some(text.into()),
            tool_calls: Vec::new(),
        }
    }

    pub fn tool_call(tool: impl Into<String>, args: Value) -> Self {
        Self {
            text: None,
            tool_calls: vec![ToolCall {
                tool: tool.into(),
                args,
            }],
        }
    }
}

/// 工具循环的一步
#[derive(Debug, Clone, PartialEq)]
pub enum Step {
    Answer(String),
    ToolCall {
        calls: Vec<ToolCall>,
        /// 模型在工具调用前附带的文字
        preface: Option<String>,
    },
    Error(BackendError),
}

impl Step {
    pub fn classify(result: Result<Generation, BackendError>) -> Self {
        match result {
            Err(e) => Step::Error(e),
            Ok(generation) if generation.tool_calls.is_empty() => {
                Step::Answer(generation.text.unwrap_or_default())
            }
            Ok(generation) => Step::ToolCall {
                calls: generation.tool_calls,
                preface: generation.text.filter(|t| !t.trim().is_empty()),
            },
        }
    }
}

#[async_trait]
pub trait Backend: Send + Sync {
    async fn generate(&self, prompt: &PromptContext) -> Result<Generation, BackendError>;
}

/// 解析模型文本回复
///
/// - ```json 围栏内为单个调用对象或调用数组；只有围栏内容带 `tool` 键却不是合法调用时才返回 Parse 错误，
///   其余 JSON（如回答中给出的示例对象）按普通回答处理
/// - 无围栏时尝试解析首个 `{`/`[` 到末尾 `}`/`]` 的片段；失败则整段视为普通回答
/// - 调用之前的文字作为 preface 保留在 text 中
pub fn parse_reply(raw: &str) -> Result<Generation, BackendError> {
    let trimmed = raw.trim();

    if let Some(start) = trimmed.find("```json") {
        let rest = &trimmed[start + 7..];
        let body = rest.find("```").map(|end| &rest[..end]).unwrap_or(rest).trim();
        if let Some(calls) = parse_calls(body) {
            return Ok(with_preface(&trimmed[..start], calls));
        }
        if mentions_tool_key(body) {
            return Err(BackendError::Parse(format!("invalid tool call block: {}", body)));
        }
        return Ok(Generation::answer(trimmed));
    }

    let start = trimmed.find(['{', '[']);
    let end = trimmed.rfind(['}', ']']);
    if let (Some(start), Some(end)) = (start, end) {
        if start < end {
            if let Some(calls) = parse_calls(&trimmed[start..=end]) {
                return Ok(with_preface(&trimmed[..start], calls));
            }
        }
    }

    Ok(Generation::answer(trimmed))
}

fn with_preface(preface: &str, calls: Vec<ToolCall>) -> Generation {
    let preface = preface.trim();
    Generation {
        text: (!preface.is_empty()).then(|| preface.to_string()),
        tool_calls: calls,
    }
}

/// 围栏内容是否意在调用工具：合法 JSON 看是否有对象带 `tool` 键，残缺 JSON 看是否出现该键
fn mentions_tool_key(body: &str) -> bool {
    let has_key = |v: &Value| v.as_object().is_some_and(|o| o.contains_key("tool"));
    match serde_json::from_str::<Value>(body) {
        Ok(Value::Array(items)) => items.iter().any(has_key),
        Ok(value) => has_key(&value),
        Err(_) => body.contains("\"tool\""),
    }
}

/// 单个对象或对象数组；tool 为空视为非调用
fn parse_calls(json: &str) -> Option<Vec<ToolCall>> {
    let calls = match serde_json::from_str::<Value>(json).ok()? {
        Value::Array(items) => items
            .into_iter()
            .map(serde_json::from_value::<ToolCall>)
            .collect::<Result<Vec<_>, _>>()
            .ok()?,
        value @ Value::Object(_) => vec![serde_json::from_value::<ToolCall>(value).ok()?],
        _ => return None,
    };
    if calls.is_empty() || calls.iter().any(|c| c.tool.trim().is_empty()) {
        return None;
    }
    Some(calls)
}

/// LlmClient -> Backend 适配器
pub struct LlmBackend {
    llm: Arc<dyn LlmClient>,
    timeout: Duration,
    retry: RetryConfig,
    streaming: bool,
}

impl LlmBackend {
    pub fn new(llm: Arc<dyn LlmClient>, timeout: Duration, retry: RetryConfig) -> Self {
        Self {
            llm,
            timeout,
            retry,
            streaming: false,
        }
    }

    pub fn with_streaming(mut self, streaming: bool) -> Self {
        self.streaming = streaming;
        self
    }

    /// 一次逻辑调用（含超时）
    async fn call_once(&self, messages: &[Message]) -> Result<String, BackendError> {
        let call = async {
            if self.streaming {
                let mut stream = self.llm.complete_stream(messages).await?;
                let mut text = String::new();
                while let Some(token) = stream.next().await {
                    text.push_str(&token?);
                }
                Ok::<_, LlmError>(text)
            } else {
                self.llm.complete(messages).await
            }
        };

        match tokio::time::timeout(self.timeout, call).await {
            Ok(result) => result.map_err(BackendError::from),
            Err(_) => Err(BackendError::Timeout {
                after_secs: self.timeout.as_secs(),
            }),
        }
    }
}

#[async_trait]
impl Backend for LlmBackend {
    async fn generate(&self, prompt: &PromptContext) -> Result<Generation, BackendError> {
        let messages = prompt.to_messages();
        let max_attempts = self.retry.max_attempts.max(1);
        let mut attempt = 1;

        loop {
            match self.call_once(&messages).await {
                Ok(text) => {
                    let (prompt_tokens, completion_tokens, _) = self.llm.token_usage();
                    tracing::debug!(attempt, prompt_tokens, completion_tokens, "Backend replied");
                    return parse_reply(&text);
                }
                Err(e) if e.is_transient() && attempt < max_attempts => {
                    let delay = self.retry.delay_for(attempt);
                    tracing::warn!(
                        attempt,
                        max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Transient backend error, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => {
                    tracing::error!(attempt, error = %e, "Backend call failed");
                    return Err(e);
                }
            }
        }
    }
}
