//! Mock LLM 客户端（用于本地调试与测试，无需 API）
//!
//! 最后一条为 User 消息时回复 echo 工具调用；最后一条为工具结果时给出最终回答，
//! 从而完整跑通一轮工具循环。

use async_trait::async_trait;

use crate::llm::traits::{LlmClient, LlmError};
use crate::memory::{Message, Role};

#[derive(Debug, Default)]
pub struct MockLlmClient;

#[async_trait]
impl LlmClient for MockLlmClient {
    async fn complete(&self, messages: &[Message]) -> Result<String, LlmError> {
        let Some(last) = messages.last() else {
            return Ok(String::new());
        };

        if last.role == Role::Tool {
            let output = serde_json::from_str::<serde_json::Value>(&last.content)
                .ok()
                .and_then(|v| v["output"]["text"].as_str().map(String::from))
                .unwrap_or_else(|| last.content.clone());
            return Ok(format!("Mock says: {}", output));
        }

        let last_user = messages
            .iter()
            .rev()
            .find(|m| m.role == Role::User)
            .map(|m| m.content.as_str())
            .unwrap_or("(no input)");

        Ok(serde_json::json!({
            "tool": "echo",
            "args": { "text": last_user }
        })
        .to_string())
    }
}
