//! 反馈分发：把 RequestManager 推送的 FeedbackEvent 交给 UI 反馈适配器
//!
//! 适配器是尽力而为的：界面操作失败只记日志，不影响请求状态。

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::core::events::{FeedbackEvent, StateChange};
use crate::core::request::ResponseRef;

#[async_trait]
pub trait FeedbackAdapter: Send + Sync {
    async fn on_state_change(&self, change: &StateChange);

    /// 删除已发送的回复
    async fn remove_responses(&self, refs: &[ResponseRef]);
}

pub struct FeedbackDispatcher {
    adapter: Arc<dyn FeedbackAdapter>,
}

impl FeedbackDispatcher {
    pub fn new(adapter: Arc<dyn FeedbackAdapter>) -> Self {
        Self { adapter }
    }

    /// 顺序处理事件，直到通道关闭或 shutdown 被取消
    pub async fn run(
        self,
        mut rx: mpsc::UnboundedReceiver<FeedbackEvent>,
        shutdown: CancellationToken,
    ) {
        loop {
            let event = tokio::select! {
                _ = shutdown.cancelled() => break,
                event = rx.recv() => match event {
                    Some(event) => event,
                    None => break,
                },
            };
            self.dispatch(event).await;
        }
        // 排空已排队的事件
        while let Ok(event) = rx.try_recv() {
            self.dispatch(event).await;
        }
        tracing::debug!("Feedback dispatcher stopped");
    }

    pub fn spawn(
        self,
        rx: mpsc::UnboundedReceiver<FeedbackEvent>,
        shutdown: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(self.run(rx, shutdown))
    }

    async fn dispatch(&self, event: FeedbackEvent) {
        match event {
            FeedbackEvent::StateChanged(change) => {
                tracing::debug!(
                    request_id = %change.request.id,
                    old = ?change.old,
                    new = ?change.new,
                    "Feedback"
                );
                self.adapter.on_state_change(&change).await;
            }
            FeedbackEvent::RemoveResponses(refs) => self.adapter.remove_responses(&refs).await,
        }
    }
}
