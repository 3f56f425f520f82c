//! 工具注册表
//!
//! 所有工具实现 Tool trait（name / description / execute），由 ToolRegistry 按名注册与查找，
//! ToolExecutor 在调用时加超时并统一转为 ToolOutcome。

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

use crate::core::error::ToolFailure;
use crate::core::request::{ConversationKey, RequestId};

/// 单次调用的上下文：请求身份、轮次与取消信号（工具可自愿观察）
#[derive(Clone, Debug)]
pub struct ToolContext {
    pub request_id: RequestId,
    pub conversation: ConversationKey,
    pub author_id: String,
    pub round_index: usize,
    pub cancel: CancellationToken,
}

/// 工具产出的媒体（图片、音频等），随最终回复一起发送
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Media {
    pub filename: String,
    pub mime_type: String,
    #[serde(skip)]
    pub data: Vec<u8>,
}

/// 工具成功输出：回灌给模型的内容 + 可选媒体
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ToolOutput {
    pub content: Value,
    pub media: Vec<Media>,
}

impl ToolOutput {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            content: json!({ "text": text.into() }),
            media: Vec::new(),
        }
    }

    pub fn json(content: Value) -> Self {
        Self {
            content,
            media: Vec::new(),
        }
    }

    pub fn with_media(mut self, media: Media) -> Self {
        self.media.push(media);
        self
    }
}

/// 一次工具调用的结果
#[derive(Clone, Debug, PartialEq)]
pub enum ToolOutcome {
    Success(ToolOutput),
    Failure(ToolFailure),
}

impl ToolOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, ToolOutcome::Success(_))
    }

    /// 回灌给模型的载荷
    pub fn payload(&self) -> Value {
        match self {
            ToolOutcome::Success(output) => json!({
                "status": "success",
                "output": output.content,
            }),
            ToolOutcome::Failure(failure) => failure.payload(),
        }
    }
}

/// 工具 trait：名称、描述（供 LLM 理解）、参数 schema、异步执行（args 为 JSON 对象）
#[async_trait]
pub trait Tool: Send + Sync {
    /// 工具名称（用于 JSON 中的 "tool" 字段）
    fn name(&self) -> &str;

    fn description(&self) -> &str;

    /// 参数 JSON Schema；默认为不限参数的空对象
    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {},
            "required": []
        })
    }

    /// 调用成功后加在回复上的表情
    fn emoji(&self) -> Option<&str> {
        None
    }

    /// 执行工具；Err 为工具自身的失败描述
    async fn execute(&self, args: Value, ctx: &ToolContext) -> Result<ToolOutput, String>;
}

/// 工具注册表：按名称存储 Arc<dyn Tool>
#[derive(Default)]
pub struct ToolRegistry {
    tools: BTreeMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, tool: impl Tool + 'static) {
        self.register_arc(Arc::new(tool));
    }

    pub fn register_arc(&mut self, tool: Arc<dyn Tool>) {
        let name = tool.name().to_string();
        if self.tools.insert(name.clone(), tool).is_some() {
            tracing::warn!(tool = %name, "Tool registered twice, keeping the latest");
        }
    }

    pub fn lookup(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    /// 按名称排序
    pub fn tool_names(&self) -> Vec<String> {
        self.tools.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    /// 工具目录 JSON（名称、描述、参数 schema），拼入 system prompt
    pub fn to_schema_json(&self) -> String {
        let tools: Vec<Value> = self
            .tools
            .iter()
            .map(|(name, tool)| {
                json!({
                    "name": name,
                    "description": tool.description(),
                    "parameters": tool.parameters_schema()
                })
            })
            .collect();
        serde_json::to_string_pretty(&tools).unwrap_or_else(|_| "[]".to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::echo::EchoTool;

    #[test]
    fn test_lookup_and_catalogue() {
        let mut registry = ToolRegistry::new();
        registry.register(EchoTool);
        assert!(registry.lookup("echo").is_some());
        assert!(registry.lookup("nope").is_none());

        let catalogue: Value = serde_json::from_str(&registry.to_schema_json()).unwrap();
        assert_eq!(catalogue[0]["name"], "echo");
        assert_eq!(catalogue[0]["parameters"]["required"][0], "text");
    }

    #[test]
    fn test_outcome_payloads() {
        let ok = ToolOutcome::Success(ToolOutput::text("sunny"));
        assert_eq!(ok.payload()["status"], "success");
        assert_eq!(ok.payload()["output"]["text"], "sunny");

        let failed = ToolOutcome::Failure(ToolFailure::Failed {
            tool: "weather_lookup".into(),
            message: "no such city".into(),
        });
        assert_eq!(failed.payload()["status"], "error");
    }
}
