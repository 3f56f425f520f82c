//! TurnWorker：RequestManager 为每个请求 spawn 的任务体
//!
//! 等待 begin_processing -> 运行对话引擎 -> 发送回复并登记 -> complete。
//! 取消后不发送任何内容；complete 与 cancel 的竞争由 Manager 的 CAS 决定。

use std::sync::Arc;

use async_trait::async_trait;

use crate::bot::outbound::{failure_notice, OutboundSender, Reply};
use crate::core::manager::{RequestLedger, TurnProcessor};
use crate::core::request::{Outcome, RequestCtx, RequestState};
use crate::engine::{Completion, ConversationEngine};

pub struct TurnWorker {
    engine: Arc<ConversationEngine>,
    outbound: Arc<dyn OutboundSender>,
    ledger: Arc<dyn RequestLedger>,
}

impl TurnWorker {
    pub fn new(
        engine: Arc<ConversationEngine>,
        outbound: Arc<dyn OutboundSender>,
        ledger: Arc<dyn RequestLedger>,
    ) -> Self {
        Self {
            engine,
            outbound,
            ledger,
        }
    }

    async fn record(&self, ctx: &RequestCtx, refs: Vec<String>) {
        if let Err(e) = self.ledger.record_responses(&ctx.id, refs).await {
            tracing::warn!(error = %e, "Failed to record responses");
        }
    }

    async fn finish(&self, ctx: &RequestCtx, outcome: Outcome) {
        match self.ledger.complete(&ctx.id, outcome).await {
            Ok(true) => {}
            Ok(false) => tracing::debug!("Request already terminal, completion dropped"),
            Err(e) => tracing::error!(error = %e, "Completion rejected"),
        }
    }
}

#[async_trait]
impl TurnProcessor for TurnWorker {
    async fn process(&self, ctx: RequestCtx) {
        if ctx.state.wait_started().await != RequestState::Processing {
            tracing::debug!("Request cancelled before processing started");
            return;
        }

        match self.engine.run(&ctx).await {
            Ok(Completion::Cancelled) => {
                tracing::info!("Request cancelled during processing");
            }
            Ok(Completion::Finished(result)) => {
                if ctx.is_cancelled() {
                    return;
                }
                match self
                    .outbound
                    .send(&ctx.origin, Reply::Final(&result), &ctx.previous_refs)
                    .await
                {
                    Ok(refs) => {
                        self.record(&ctx, refs).await;
                        self.finish(
                            &ctx,
                            Outcome::Done {
                                tool_emojis: result.tool_emojis,
                            },
                        )
                        .await;
                    }
                    Err(e) => {
                        tracing::error!(error = %e, "Failed to send reply");
                        self.finish(
                            &ctx,
                            Outcome::Error {
                                reason: e.to_string(),
                            },
                        )
                        .await;
                    }
                }
            }
            Err(e) => {
                if ctx.is_cancelled() {
                    tracing::debug!(error = %e, "Conversation failed after cancellation");
                    return;
                }
                tracing::error!(error = %e, "Conversation failed");
                let notice = failure_notice(&e);
                match self
                    .outbound
                    .send(&ctx.origin, Reply::Failure(&notice), &ctx.previous_refs)
                    .await
                {
                    Ok(refs) => self.record(&ctx, refs).await,
                    Err(send_err) => {
                        tracing::warn!(error = %send_err, "Failed to send failure notice")
                    }
                }
                self.finish(
                    &ctx,
                    Outcome::Error {
                        reason: e.to_string(),
                    },
                )
                .await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bot::outbound::SurfaceError;
    use crate::core::error::{BackendError, RequestError};
    use crate::core::request::{Origin, RequestId, ResponseRef, StateCell};
    use crate::engine::{Backend, EngineConfig, Generation, PromptContext, TemplateAssembler};
    use crate::memory::HistoryStore;
    use crate::tools::{Tool, ToolContext, ToolExecutor, ToolOutput, ToolRegistry};
    use serde_json::{json, Value};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio_util::sync::CancellationToken;

    struct AskTripwire;

    #[async_trait]
    impl Backend for AskTripwire {
        async fn generate(&self, _prompt: &PromptContext) -> Result<Generation, BackendError> {
            Ok(Generation::tool_call("tripwire", json!({})))
        }
    }

    /// 先取消请求再 panic：引擎以错误返回时请求已是 Cancelled
    struct Tripwire {
        state: Arc<StateCell>,
    }

    #[async_trait]
    impl Tool for Tripwire {
        fn name(&self) -> &str {
            "tripwire"
        }

        fn description(&self) -> &str {
            "Cancels the request, then fails hard."
        }

        async fn execute(&self, _args: Value, _ctx: &ToolContext) -> Result<ToolOutput, String> {
            self.state.cancel();
            panic!("tripwire");
        }
    }

    #[derive(Default)]
    struct Counting {
        sends: AtomicUsize,
        completes: AtomicUsize,
    }

    #[async_trait]
    impl OutboundSender for Counting {
        async fn send(
            &self,
            _origin: &Origin,
            _reply: Reply<'_>,
            _previous: &[ResponseRef],
        ) -> Result<Vec<ResponseRef>, SurfaceError> {
            self.sends.fetch_add(1, Ordering::SeqCst);
            Ok(vec!["r1".into()])
        }
    }

    #[async_trait]
    impl RequestLedger for Counting {
        async fn record_responses(
            &self,
            _id: &RequestId,
            _refs: Vec<ResponseRef>,
        ) -> Result<(), RequestError> {
            Ok(())
        }

        async fn complete(&self, _id: &RequestId, _outcome: Outcome) -> Result<bool, RequestError> {
            self.completes.fetch_add(1, Ordering::SeqCst);
            Ok(true)
        }
    }

    #[tokio::test]
    async fn test_failure_after_cancellation_sends_nothing() {
        let state = Arc::new(StateCell::new());
        assert!(state.transition(RequestState::Pending, RequestState::Processing));

        let mut registry = ToolRegistry::new();
        registry.register(Tripwire {
            state: Arc::clone(&state),
        });
        let assembler = Arc::new(TemplateAssembler::new("test", &registry));
        let engine = Arc::new(ConversationEngine::new(
            Arc::new(AskTripwire),
            Arc::new(ToolExecutor::new(registry, 5)),
            assembler,
            Arc::new(HistoryStore::new(10)),
            EngineConfig::default(),
        ));
        let counting = Arc::new(Counting::default());
        let worker = TurnWorker::new(engine, counting.clone(), counting.clone());

        worker
            .process(RequestCtx {
                id: RequestId::derive("m1"),
                origin: Arc::new(Origin {
                    message_id: "m1".into(),
                    channel_id: "c1".into(),
                    thread_id: None,
                    author_id: "u1".into(),
                    content: "trip it".into(),
                    attachments: vec![],
                }),
                previous_refs: vec![],
                state: Arc::clone(&state),
                cancel: CancellationToken::new(),
            })
            .await;

        assert_eq!(state.load(), RequestState::Cancelled);
        assert_eq!(counting.sends.load(Ordering::SeqCst), 0);
        assert_eq!(counting.completes.load(Ordering::SeqCst), 0);
    }
}
