//! 对话引擎：有界工具循环
//!
//! 询问后端 -> 归类为 Step -> 回答则结束；请求工具则按序执行并把结果作为 Tool 消息回灌，再次询问。
//! 每次后端调用前后、每次工具调用前后都有取消检查点（对 StateCell 的一次原子读）；
//! 检查点发现已取消时直接返回 Completion::Cancelled，进行中调用的结果被丢弃。

use std::sync::Arc;

use serde_json::Value;

use crate::core::error::EngineError;
use crate::core::request::RequestCtx;
use crate::engine::backend::{Backend, Step, ToolCall};
use crate::engine::prompt::PromptAssembler;
use crate::memory::{HistoryStore, Message};
use crate::tools::{Media, Tool, ToolContext, ToolExecutor, ToolOutcome};

/// 原消息没有文字也没有附件时的回复
pub const GREETING: &str = "Hello! How can I help you today?";
/// 模型最终没有给出任何内容时的回复
pub const NOTHING_TO_ADD: &str = "I processed your request but have nothing to add.";

#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// 允许的工具轮数；第 max_rounds+1 次请求工具时终止
    pub max_rounds: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self { max_rounds: 8 }
    }
}

/// 一次工具调用的记录
#[derive(Debug, Clone, PartialEq)]
pub struct ToolInvocation {
    pub name: String,
    pub arguments: Value,
    pub result: ToolOutcome,
    pub round_index: usize,
}

/// 最终结果
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FinalResult {
    pub text: String,
    pub media: Vec<Media>,
    /// 成功调用过的工具（按首次调用顺序，去重）
    pub tools_used: Vec<String>,
    pub tool_emojis: Vec<String>,
    pub invocations: Vec<ToolInvocation>,
}

impl FinalResult {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Completion {
    Finished(FinalResult),
    Cancelled,
}

pub struct ConversationEngine {
    backend: Arc<dyn Backend>,
    tools: Arc<ToolExecutor>,
    assembler: Arc<dyn PromptAssembler>,
    history: Arc<HistoryStore>,
    config: EngineConfig,
}

impl ConversationEngine {
    pub fn new(
        backend: Arc<dyn Backend>,
        tools: Arc<ToolExecutor>,
        assembler: Arc<dyn PromptAssembler>,
        history: Arc<HistoryStore>,
        config: EngineConfig,
    ) -> Self {
        Self {
            backend,
            tools,
            assembler,
            history,
            config,
        }
    }

    pub fn history(&self) -> &Arc<HistoryStore> {
        &self.history
    }

    pub async fn run(&self, ctx: &RequestCtx) -> Result<Completion, EngineError> {
        let origin = &ctx.origin;
        if origin.is_empty() {
            return Ok(Completion::Finished(FinalResult::text(GREETING)));
        }

        let key = origin.key();
        let history = self.history.snapshot(&key).await;
        let mut prompt = self
            .assembler
            .build(&origin.content, &history, &origin.attachments);
        let mut result = FinalResult::default();
        let mut rounds = 0usize;

        loop {
            if ctx.is_cancelled() {
                return Ok(Completion::Cancelled);
            }
            let reply = self.backend.generate(&prompt).await;
            if ctx.is_cancelled() {
                tracing::debug!("Discarding backend reply for cancelled request");
                return Ok(Completion::Cancelled);
            }

            let (calls, preface) = match Step::classify(reply) {
                Step::Answer(text) => {
                    result.text = if text.trim().is_empty() && result.media.is_empty() {
                        NOTHING_TO_ADD.to_string()
                    } else {
                        text
                    };
                    self.history
                        .record_turn(&key, origin.content.clone(), result.text.clone())
                        .await;
                    tracing::info!(rounds, tools = ?result.tools_used, "Conversation finished");
                    return Ok(Completion::Finished(result));
                }
                Step::Error(e) => return Err(EngineError::BackendFailure(e)),
                Step::ToolCall { calls, preface } => (calls, preface),
            };

            let resolved = self.resolve(calls)?;
            if rounds >= self.config.max_rounds {
                tracing::warn!(max_rounds = self.config.max_rounds, "Tool loop bound reached");
                return Err(EngineError::ToolLoopExceeded {
                    max_rounds: self.config.max_rounds,
                });
            }
            prompt.push(Message::assistant(render_calls(
                preface.as_deref(),
                resolved.iter().map(|(call, _)| call),
            )));

            for (call, tool) in resolved {
                if ctx.is_cancelled() {
                    return Ok(Completion::Cancelled);
                }
                let tool_ctx = ToolContext {
                    request_id: ctx.id.clone(),
                    conversation: key.clone(),
                    author_id: origin.author_id.clone(),
                    round_index: rounds,
                    cancel: ctx.cancel.clone(),
                };
                let outcome = self.tools.invoke(&tool, call.args.clone(), &tool_ctx).await?;
                if ctx.is_cancelled() {
                    tracing::debug!(tool = %call.tool, "Discarding tool result for cancelled request");
                    return Ok(Completion::Cancelled);
                }

                if let ToolOutcome::Success(output) = &outcome {
                    if !result.tools_used.contains(&call.tool) {
                        result.tools_used.push(call.tool.clone());
                    }
                    if let Some(emoji) = tool.emoji() {
                        if !result.tool_emojis.iter().any(|e| e == emoji) {
                            result.tool_emojis.push(emoji.to_string());
                        }
                    }
                    result.media.extend(output.media.iter().cloned());
                }
                prompt.push(Message::tool(call.tool.clone(), outcome.payload().to_string()));
                result.invocations.push(ToolInvocation {
                    name: call.tool,
                    arguments: call.args,
                    result: outcome,
                    round_index: rounds,
                });
            }
            rounds += 1;
        }
    }

    /// 所有名称都必须已注册，否则整个调用批次失败
    fn resolve(&self, calls: Vec<ToolCall>) -> Result<Vec<(ToolCall, Arc<dyn Tool>)>, EngineError> {
        calls
            .into_iter()
            .map(|call| match self.tools.lookup(&call.tool) {
                Some(tool) => Ok((call, tool)),
                None => {
                    tracing::warn!(tool = %call.tool, "Model requested unknown tool");
                    Err(EngineError::UnknownTool(call.tool))
                }
            })
            .collect()
    }
}

/// 工具调用在上下文中的 assistant 表示
fn render_calls<'a>(preface: Option<&str>, calls: impl Iterator<Item = &'a ToolCall>) -> String {
    let calls: Vec<&ToolCall> = calls.collect();
    let json = match calls.as_slice() {
        [single] => serde_json::to_string(single),
        many => serde_json::to_string(many),
    }
    .unwrap_or_default();
    match preface {
        Some(text) => format!("{}\n{}", text, json),
        None => json,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::error::BackendError;
    use crate::core::request::{Origin, RequestId, StateCell};
    use crate::engine::backend::Generation;
    use crate::engine::prompt::{PromptContext, TemplateAssembler};
    use crate::memory::Role;
    use crate::tools::{EchoTool, ToolRegistry};
    use async_trait::async_trait;
    use serde_json::json;
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use tokio_util::sync::CancellationToken;

    /// 按脚本依次返回；脚本耗尽后重复最后一条
    struct Scripted {
        replies: Mutex<VecDeque<Result<Generation, BackendError>>>,
        seen: Mutex<Vec<PromptContext>>,
    }

    impl Scripted {
        fn new(replies: Vec<Result<Generation, BackendError>>) -> Self {
            Self {
                replies: Mutex::new(replies.into()),
                seen: Mutex::new(Vec::new()),
            }
        }

        fn calls(&self) -> usize {
            self.seen.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl Backend for Scripted {
        async fn generate(&self, prompt: &PromptContext) -> Result<Generation, BackendError> {
            self.seen.lock().unwrap().push(prompt.clone());
            let mut replies = self.replies.lock().unwrap();
            if replies.len() > 1 {
                replies.pop_front().unwrap()
            } else {
                replies.front().cloned().unwrap()
            }
        }
    }

    fn engine(backend: Arc<dyn Backend>, max_rounds: usize) -> ConversationEngine {
        let mut registry = ToolRegistry::new();
        registry.register(EchoTool);
        let assembler = Arc::new(TemplateAssembler::new("test", &registry));
        ConversationEngine::new(
            backend,
            Arc::new(ToolExecutor::new(registry, 5)),
            assembler,
            Arc::new(HistoryStore::new(10)),
            EngineConfig { max_rounds },
        )
    }

    fn ctx(content: &str) -> RequestCtx {
        RequestCtx {
            id: RequestId::derive("m1"),
            origin: Arc::new(Origin {
                message_id: "m1".into(),
                channel_id: "c1".into(),
                thread_id: None,
                author_id: "u1".into(),
                content: content.into(),
                attachments: vec![],
            }),
            previous_refs: vec![],
            state: Arc::new(StateCell::new()),
            cancel: CancellationToken::new(),
        }
    }

    #[tokio::test]
    async fn test_empty_origin_greets_without_backend() {
        let backend = Arc::new(Scripted::new(vec![Ok(Generation::answer("unused"))]));
        let engine = engine(backend.clone(), 3);
        let done = engine.run(&ctx("   ")).await.unwrap();
        assert_eq!(done, Completion::Finished(FinalResult::text(GREETING)));
        assert_eq!(backend.calls(), 0);
    }

    #[tokio::test]
    async fn test_tool_round_then_answer() {
        let backend = Arc::new(Scripted::new(vec![
            Ok(Generation::tool_call("echo", json!({"text": "hi"}))),
            Ok(Generation::answer("said hi")),
        ]));
        let engine = engine(backend.clone(), 3);
        let Completion::Finished(result) = engine.run(&ctx("say hi")).await.unwrap() else {
            panic!("expected finished");
        };
        assert_eq!(result.text, "said hi");
        assert_eq!(result.tools_used, vec!["echo".to_string()]);
        assert_eq!(result.tool_emojis, vec!["🔁".to_string()]);
        assert_eq!(result.invocations.len(), 1);
        assert_eq!(result.invocations[0].round_index, 0);

        let second_prompt = &backend.seen.lock().unwrap()[1];
        let last = second_prompt.messages.last().unwrap();
        assert_eq!(last.role, Role::Tool);
        assert!(last.content.contains("\"success\""));

        let history = engine.history().snapshot(&ctx("").origin.key()).await;
        assert_eq!(history.len(), 2);
    }

    /// 按执行顺序记下每次调用的 label
    #[derive(Default)]
    struct Recording {
        order: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl Tool for Recording {
        fn name(&self) -> &str {
            "note"
        }

        fn description(&self) -> &str {
            "Record a label."
        }

        async fn execute(&self, args: Value, _ctx: &ToolContext) -> Result<crate::tools::ToolOutput, String> {
            let label = args["label"].as_str().unwrap_or("?").to_string();
            self.order.lock().unwrap().push(label.clone());
            Ok(crate::tools::ToolOutput::text(format!("noted {}", label)))
        }
    }

    /// 同一轮多个调用：按给出顺序执行，同属第 0 轮，Tool 消息按同样顺序回灌
    #[tokio::test]
    async fn test_batch_of_calls_runs_in_order_within_one_round() {
        let note = |label: &str| ToolCall {
            tool: "note".into(),
            args: json!({ "label": label }),
        };
        let backend = Arc::new(Scripted::new(vec![
            Ok(Generation {
                text: None,
                tool_calls: vec![note("a"), note("b"), note("c")],
            }),
            Ok(Generation::answer("noted all")),
        ]));
        let recording = Arc::new(Recording::default());
        let mut registry = ToolRegistry::new();
        registry.register_arc(recording.clone());
        let assembler = Arc::new(TemplateAssembler::new("test", &registry));
        let engine = ConversationEngine::new(
            backend.clone(),
            Arc::new(ToolExecutor::new(registry, 5)),
            assembler,
            Arc::new(HistoryStore::new(10)),
            EngineConfig { max_rounds: 1 },
        );

        let Completion::Finished(result) = engine.run(&ctx("note things")).await.unwrap() else {
            panic!("expected finished");
        };
        assert_eq!(result.text, "noted all");
        assert_eq!(*recording.order.lock().unwrap(), vec!["a", "b", "c"]);
        assert_eq!(result.invocations.len(), 3);
        assert!(result.invocations.iter().all(|inv| inv.round_index == 0));
        let labels: Vec<&str> = result
            .invocations
            .iter()
            .map(|inv| inv.arguments["label"].as_str().unwrap())
            .collect();
        assert_eq!(labels, vec!["a", "b", "c"]);

        let seen = backend.seen.lock().unwrap();
        assert_eq!(seen.len(), 2);
        let tool_messages: Vec<&Message> = seen[1]
            .messages
            .iter()
            .filter(|m| m.role == Role::Tool)
            .collect();
        assert_eq!(tool_messages.len(), 3);
        for (message, label) in tool_messages.iter().zip(["a", "b", "c"]) {
            assert_eq!(message.name.as_deref(), Some("note"));
            assert!(message.content.contains(&format!("noted {}", label)));
        }
        // 回灌的 assistant 调用消息在所有 Tool 消息之前
        let assistant_at = seen[1]
            .messages
            .iter()
            .rposition(|m| m.role == Role::Assistant)
            .unwrap();
        let first_tool_at = seen[1].messages.iter().position(|m| m.role == Role::Tool).unwrap();
        assert!(assistant_at < first_tool_at);
    }

    #[tokio::test]
    async fn test_unknown_tool_fails_closed() {
        let backend = Arc::new(Scripted::new(vec![Ok(Generation::tool_call(
            "rm_rf",
            json!({}),
        ))]));
        let err = engine(backend, 3).run(&ctx("go")).await.unwrap_err();
        assert_eq!(err, EngineError::UnknownTool("rm_rf".into()));
    }

    #[tokio::test]
    async fn test_empty_answer_is_replaced() {
        let backend = Arc::new(Scripted::new(vec![Ok(Generation::answer(""))]));
        let Completion::Finished(result) = engine(backend, 3).run(&ctx("go")).await.unwrap() else {
            panic!("expected finished");
        };
        assert_eq!(result.text, NOTHING_TO_ADD);
    }

    #[tokio::test]
    async fn test_backend_error_surfaces() {
        let backend = Arc::new(Scripted::new(vec![Err(BackendError::Api("401".into()))]));
        let err = engine(backend, 3).run(&ctx("go")).await.unwrap_err();
        assert_eq!(err, EngineError::BackendFailure(BackendError::Api("401".into())));
    }

    #[tokio::test]
    async fn test_cancelled_before_start() {
        let backend = Arc::new(Scripted::new(vec![Ok(Generation::answer("x"))]));
        let engine = engine(backend.clone(), 3);
        let ctx = ctx("go");
        ctx.state.cancel();
        assert_eq!(engine.run(&ctx).await.unwrap(), Completion::Cancelled);
        assert_eq!(backend.calls(), 0);
    }

    #[test]
    fn test_render_calls() {
        let one = ToolCall {
            tool: "echo".into(),
            args: json!({"text": "a"}),
        };
        let rendered = render_calls(Some("checking"), std::iter::once(&one));
        assert_eq!(rendered, "checking\n{\"tool\":\"echo\",\"args\":{\"text\":\"a\"}}");
    }
}
