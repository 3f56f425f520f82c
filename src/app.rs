//! 组装：由配置与外部协作者（LLM、工具、聊天界面）构建完整的请求处理链
//!
//! Router -> RequestManager -> TurnWorker -> ConversationEngine -> ToolExecutor，
//! 状态变更经 FeedbackDispatcher 交给 ReactionFeedback。

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::bot::{
    ChatSurface, EventRouter, FeedbackDispatcher, OutboundSender, ReactionFeedback, TurnWorker,
};
use crate::config::{AppConfig, LlmSection};
use crate::core::manager::RequestManager;
use crate::engine::{ConversationEngine, LlmBackend, TemplateAssembler};
use crate::llm::{LlmClient, MockLlmClient, OpenAiClient};
use crate::memory::HistoryStore;
use crate::tools::{ClockTool, EchoTool, ToolExecutor, ToolRegistry};

/// 按 provider 创建 LLM 客户端；未知 provider 回退到 mock
pub fn create_llm_client(config: &LlmSection) -> Arc<dyn LlmClient> {
    match config.provider.as_str() {
        "openai" => Arc::new(OpenAiClient::new(
            config.base_url.as_deref(),
            &config.model,
            config.api_key.as_deref(),
        )),
        "mock" => Arc::new(MockLlmClient),
        other => {
            tracing::warn!(provider = other, "Unknown LLM provider, falling back to mock");
            Arc::new(MockLlmClient)
        }
    }
}

/// 内置工具
pub fn default_tools() -> ToolRegistry {
    let mut registry = ToolRegistry::new();
    registry.register(EchoTool);
    registry.register(ClockTool);
    registry
}

pub struct BardApp {
    router: Arc<EventRouter>,
    manager: Arc<RequestManager>,
    history: Arc<HistoryStore>,
    feedback_task: JoinHandle<()>,
    feedback_stop: CancellationToken,
}

impl BardApp {
    /// 需在 tokio 运行时中调用（会启动反馈分发任务）
    pub fn new(
        config: &AppConfig,
        llm: Arc<dyn LlmClient>,
        tools: ToolRegistry,
        surface: Arc<dyn ChatSurface>,
        outbound: Arc<dyn OutboundSender>,
    ) -> Self {
        let (manager, feedback_rx) = RequestManager::new(config.manager_config());
        let manager = Arc::new(manager);

        let assembler = Arc::new(TemplateAssembler::new(&config.app.system_prompt, &tools));
        let executor = Arc::new(ToolExecutor::new(tools, config.tools.tool_timeout_secs));
        let backend = Arc::new(
            LlmBackend::new(llm, config.backend_timeout(), config.llm.retry.clone())
                .with_streaming(config.llm.streaming),
        );
        let history = Arc::new(HistoryStore::new(config.app.max_history_turns));
        let engine = Arc::new(ConversationEngine::new(
            backend,
            executor,
            assembler,
            Arc::clone(&history),
            config.engine_config(),
        ));

        let worker = Arc::new(TurnWorker::new(engine, outbound, manager.clone()));
        let router = Arc::new(EventRouter::new(
            Arc::clone(&manager),
            worker,
            config.router_settings(),
        ));

        let feedback = Arc::new(ReactionFeedback::new(
            surface,
            config.reactions.retry_emoji.clone(),
            config.reactions.cancel_emoji.clone(),
            Duration::from_secs(config.reactions.typing_interval_secs.max(1)),
        ));
        let feedback_stop = CancellationToken::new();
        let feedback_task = FeedbackDispatcher::new(feedback).spawn(feedback_rx, feedback_stop.clone());

        tracing::info!(
            name = %config.app.name,
            provider = %config.llm.provider,
            max_tool_rounds = config.engine.max_tool_rounds,
            "Bard assembled"
        );

        Self {
            router,
            manager,
            history,
            feedback_task,
            feedback_stop,
        }
    }

    pub fn router(&self) -> &Arc<EventRouter> {
        &self.router
    }

    pub fn manager(&self) -> &Arc<RequestManager> {
        &self.manager
    }

    pub fn history(&self) -> &Arc<HistoryStore> {
        &self.history
    }

    /// 停止反馈分发（在请求排空之后调用）
    pub async fn stop_feedback(self) {
        self.feedback_stop.cancel();
        if let Err(e) = self.feedback_task.await {
            tracing::warn!(error = %e, "Feedback dispatcher ended abnormally");
        }
    }
}
