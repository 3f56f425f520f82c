//! 请求管理器：创建、追踪、取消、重试请求，是状态的唯一来源
//!
//! 注册表（请求 ID -> 记录、会话键 -> 活跃请求）由 RwLock 保护，只通过公开方法访问；
//! 状态写入走 StateCell 的 CAS，complete 与 cancel 的竞争由先写者胜出。
//! 每次状态转移向反馈通道推送 FeedbackEvent，发送失败（接收端已关闭）直接忽略。
//! 事件在持有注册表写锁时发送，因此通道中的事件顺序与 CAS 顺序一致。

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::core::error::RequestError;
use crate::core::events::{FeedbackEvent, StateChange};
use crate::core::request::{
    CancelReason, ConversationKey, Origin, Outcome, Request, RequestCtx, RequestId, RequestState,
    ResponseRef, StateCell, TaskHandle,
};

/// 被 Manager spawn 的任务体（通常是 TurnWorker）
#[async_trait]
pub trait TurnProcessor: Send + Sync {
    async fn process(&self, ctx: RequestCtx);
}

/// 任务体向 Manager 回报所需的窄接口
#[async_trait]
pub trait RequestLedger: Send + Sync {
    async fn record_responses(
        &self,
        id: &RequestId,
        refs: Vec<ResponseRef>,
    ) -> Result<(), RequestError>;

    async fn complete(&self, id: &RequestId, outcome: Outcome) -> Result<bool, RequestError>;
}

/// Manager 配置
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// 终态请求可被重试的时长；None 表示不限
    pub retry_window: Option<Duration>,
    /// 关闭时等待每个任务退出的上限
    pub shutdown_timeout: Duration,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            retry_window: None,
            shutdown_timeout: Duration::from_secs(5),
        }
    }
}

/// 单个请求的内部记录
struct Slot {
    id: RequestId,
    origin: Arc<Origin>,
    cell: Arc<StateCell>,
    task: Option<TaskHandle>,
    response_refs: Vec<ResponseRef>,
    previous_refs: Vec<ResponseRef>,
    created_at: DateTime<Utc>,
    terminal_at: Option<DateTime<Utc>>,
    cancel_reason: Option<CancelReason>,
    tool_emojis: Vec<String>,
    error: Option<String>,
}

impl Slot {
    fn new(origin: Arc<Origin>, previous_refs: Vec<ResponseRef>) -> Self {
        Self {
            id: RequestId::derive(&origin.message_id),
            origin,
            cell: Arc::new(StateCell::new()),
            task: None,
            response_refs: Vec::new(),
            previous_refs,
            created_at: Utc::now(),
            terminal_at: None,
            cancel_reason: None,
            tool_emojis: Vec::new(),
            error: None,
        }
    }

    fn snapshot(&self) -> Request {
        Request {
            id: self.id.clone(),
            state: self.cell.load(),
            origin: Arc::clone(&self.origin),
            response_refs: self.response_refs.clone(),
            previous_refs: self.previous_refs.clone(),
            created_at: self.created_at,
            terminal_at: self.terminal_at,
            cancel_reason: self.cancel_reason,
            tool_emojis: self.tool_emojis.clone(),
            error: self.error.clone(),
        }
    }
}

#[derive(Default)]
struct Registry {
    slots: HashMap<RequestId, Slot>,
    /// 会话键 -> 当前活跃（非终态）请求
    active: HashMap<ConversationKey, RequestId>,
}

impl Registry {
    fn active_slot(&self, key: &ConversationKey) -> Option<&Slot> {
        self.active
            .get(key)
            .and_then(|id| self.slots.get(id))
            .filter(|slot| !slot.cell.load().is_terminal())
    }

    fn release_active(&mut self, key: &ConversationKey, id: &RequestId) {
        if self.active.get(key) == Some(id) {
            self.active.remove(key);
        }
    }

    /// 同一会话中已终态的请求被新请求取代，逐出
    fn evict_terminal_for(&mut self, key: &ConversationKey) -> usize {
        let before = self.slots.len();
        self.slots
            .retain(|_, slot| !(slot.origin.key() == *key && slot.cell.load().is_terminal()));
        before - self.slots.len()
    }
}

/// 请求管理器
pub struct RequestManager {
    registry: RwLock<Registry>,
    feedback_tx: mpsc::UnboundedSender<FeedbackEvent>,
    /// 所有请求令牌的父令牌，关闭时一并取消
    root_token: CancellationToken,
    config: ManagerConfig,
}

impl RequestManager {
    /// 创建 Manager，同时返回反馈事件接收端
    pub fn new(config: ManagerConfig) -> (Self, mpsc::UnboundedReceiver<FeedbackEvent>) {
        let (feedback_tx, feedback_rx) = mpsc::unbounded_channel();
        (
            Self {
                registry: RwLock::new(Registry::default()),
                feedback_tx,
                root_token: CancellationToken::new(),
                config,
            },
            feedback_rx,
        )
    }

    /// 为一条入站消息创建 Pending 请求；该会话已有活跃请求时返回 Conflict
    pub async fn create(&self, origin: Origin) -> Result<Request, RequestError> {
        self.create_replacing(Arc::new(origin), Vec::new()).await
    }

    /// 创建请求并携带被取代请求的回复，供发送方原地编辑
    pub async fn create_replacing(
        &self,
        origin: Arc<Origin>,
        previous_refs: Vec<ResponseRef>,
    ) -> Result<Request, RequestError> {
        let key = origin.key();
        let snapshot = {
            let mut registry = self.registry.write().await;
            if let Some(active) = registry.active_slot(&key) {
                return Err(RequestError::Conflict {
                    key,
                    active: active.id.clone(),
                });
            }
            let evicted = registry.evict_terminal_for(&key);
            if evicted > 0 {
                tracing::debug!(conversation = %key, evicted, "Evicted superseded requests");
            }

            let slot = Slot::new(origin, previous_refs);
            let snapshot = slot.snapshot();
            registry.active.insert(key, slot.id.clone());
            registry.slots.insert(slot.id.clone(), slot);
            self.notify(snapshot.clone(), None, RequestState::Pending);
            snapshot
        };

        tracing::info!(
            request_id = %snapshot.id,
            message_id = %snapshot.origin.message_id,
            "Request created"
        );
        Ok(snapshot)
    }

    /// 为请求启动任务并保存句柄；请求已终态（spawn 前就被取消）时不启动，返回 false
    pub async fn spawn(
        &self,
        id: &RequestId,
        processor: Arc<dyn TurnProcessor>,
    ) -> Result<bool, RequestError> {
        let mut registry = self.registry.write().await;
        let slot = registry
            .slots
            .get_mut(id)
            .ok_or_else(|| RequestError::NotFound(id.clone()))?;
        if slot.task.is_some() {
            return Err(RequestError::AlreadySpawned(id.clone()));
        }
        if slot.cell.load().is_terminal() {
            tracing::debug!(request_id = %id, "Request already terminal, not spawning");
            return Ok(false);
        }

        let cancel = self.root_token.child_token();
        let ctx = RequestCtx {
            id: id.clone(),
            origin: Arc::clone(&slot.origin),
            previous_refs: slot.previous_refs.clone(),
            state: Arc::clone(&slot.cell),
            cancel: cancel.clone(),
        };
        let span = tracing::info_span!("request", request_id = %id);
        let join = tokio::spawn(async move { processor.process(ctx).await }.instrument(span));
        slot.task = Some(TaskHandle { cancel, join });
        Ok(true)
    }

    /// Pending -> Processing
    ///
    /// 持写锁完成转移与通知：任务被唤醒后的 complete 必须等这里释放锁，
    /// Processing 事件因此总在同一请求的终态事件之前。
    pub async fn begin_processing(&self, id: &RequestId) -> Result<(), RequestError> {
        let registry = self.registry.write().await;
        let slot = registry
            .slots
            .get(id)
            .ok_or_else(|| RequestError::NotFound(id.clone()))?;
        if !slot
            .cell
            .transition(RequestState::Pending, RequestState::Processing)
        {
            return Err(RequestError::InvalidTransition {
                id: id.clone(),
                from: slot.cell.load(),
                to: RequestState::Processing,
            });
        }
        self.notify(slot.snapshot(), Some(RequestState::Pending), RequestState::Processing);
        Ok(())
    }

    /// Processing -> Done / Error；已终态（或已被逐出）时为 no-op，返回 false
    pub async fn complete(&self, id: &RequestId, outcome: Outcome) -> Result<bool, RequestError> {
        let target = match &outcome {
            Outcome::Done { .. } => RequestState::Done,
            Outcome::Error { .. } => RequestState::Error,
        };
        {
            let mut registry = self.registry.write().await;
            let Some(slot) = registry.slots.get_mut(id) else {
                tracing::debug!(request_id = %id, "Completion for evicted request ignored");
                return Ok(false);
            };
            if !slot.cell.transition(RequestState::Processing, target) {
                let current = slot.cell.load();
                if current.is_terminal() {
                    tracing::debug!(request_id = %id, state = ?current, "Completion lost the race");
                    return Ok(false);
                }
                return Err(RequestError::InvalidTransition {
                    id: id.clone(),
                    from: current,
                    to: target,
                });
            }
            slot.terminal_at = Some(Utc::now());
            match outcome {
                Outcome::Done { tool_emojis } => slot.tool_emojis = tool_emojis,
                Outcome::Error { reason } => slot.error = Some(reason),
            }
            let snapshot = slot.snapshot();
            registry.release_active(&snapshot.key(), id);
            self.notify(snapshot, Some(RequestState::Processing), target);
        }

        tracing::info!(request_id = %id, state = ?target, "Request completed");
        Ok(true)
    }

    /// 任意非终态 -> Cancelled，并向任务发出取消信号；幂等
    pub async fn cancel(&self, id: &RequestId, reason: CancelReason) -> Result<bool, RequestError> {
        {
            let mut registry = self.registry.write().await;
            let slot = registry
                .slots
                .get_mut(id)
                .ok_or_else(|| RequestError::NotFound(id.clone()))?;
            let Some(previous) = slot.cell.cancel() else {
                return Ok(false);
            };
            slot.terminal_at = Some(Utc::now());
            slot.cancel_reason = Some(reason);
            if let Some(task) = &slot.task {
                task.cancel.cancel();
            }
            let snapshot = slot.snapshot();
            registry.release_active(&snapshot.key(), id);
            self.notify(snapshot, Some(previous), RequestState::Cancelled);
        }

        tracing::info!(request_id = %id, reason = ?reason, "Request cancelled");
        Ok(true)
    }

    /// 用终态请求的原始内容创建新请求
    pub async fn retry(&self, id: &RequestId) -> Result<Request, RequestError> {
        let (origin, previous_refs) = {
            let registry = self.registry.read().await;
            let slot = registry
                .slots
                .get(id)
                .ok_or_else(|| RequestError::NotFound(id.clone()))?;
            let state = slot.cell.load();
            if !state.is_terminal() {
                return Err(RequestError::InvalidTransition {
                    id: id.clone(),
                    from: state,
                    to: RequestState::Pending,
                });
            }
            if let (Some(window), Some(terminal_at)) = (self.config.retry_window, slot.terminal_at) {
                let elapsed = (Utc::now() - terminal_at).to_std().unwrap_or_default();
                if elapsed > window {
                    return Err(RequestError::RetryWindowElapsed(id.clone()));
                }
            }
            (Arc::clone(&slot.origin), slot.response_refs.clone())
        };

        tracing::info!(request_id = %id, "Retrying request");
        self.create_replacing(origin, previous_refs).await
    }

    /// 追加已发送回复；任何状态都允许，保证取消后仍能清理
    pub async fn record_responses(
        &self,
        id: &RequestId,
        refs: Vec<ResponseRef>,
    ) -> Result<(), RequestError> {
        let mut registry = self.registry.write().await;
        let slot = registry
            .slots
            .get_mut(id)
            .ok_or_else(|| RequestError::NotFound(id.clone()))?;
        for r in refs {
            if !slot.response_refs.contains(&r) {
                slot.response_refs.push(r);
            }
        }
        Ok(())
    }

    /// 取走请求的全部回复引用（交给 remove_responses 清理）
    pub async fn take_responses(&self, id: &RequestId) -> Vec<ResponseRef> {
        let mut registry = self.registry.write().await;
        registry
            .slots
            .get_mut(id)
            .map(|slot| std::mem::take(&mut slot.response_refs))
            .unwrap_or_default()
    }

    /// 请求反馈适配器删除这些回复
    pub fn remove_responses(&self, refs: Vec<ResponseRef>) {
        if refs.is_empty() {
            return;
        }
        let _ = self.feedback_tx.send(FeedbackEvent::RemoveResponses(refs));
    }

    pub async fn get(&self, id: &RequestId) -> Option<Request> {
        self.registry.read().await.slots.get(id).map(Slot::snapshot)
    }

    /// 以原消息 ID 查找最近的请求
    pub async fn find_by_message(&self, message_id: &str) -> Option<Request> {
        let registry = self.registry.read().await;
        registry
            .slots
            .values()
            .filter(|slot| slot.origin.message_id == message_id)
            .max_by_key(|slot| slot.created_at)
            .map(Slot::snapshot)
    }

    /// 以已发送回复的消息 ID 查找请求
    pub async fn find_by_response(&self, response: &str) -> Option<Request> {
        let registry = self.registry.read().await;
        registry
            .slots
            .values()
            .find(|slot| slot.response_refs.iter().any(|r| r == response))
            .map(Slot::snapshot)
    }

    pub async fn active_for(&self, key: &ConversationKey) -> Option<Request> {
        self.registry.read().await.active_slot(key).map(Slot::snapshot)
    }

    pub async fn active_count(&self) -> usize {
        let registry = self.registry.read().await;
        registry
            .slots
            .values()
            .filter(|slot| !slot.cell.load().is_terminal())
            .count()
    }

    pub async fn len(&self) -> usize {
        self.registry.read().await.slots.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// 逐出终态请求；非终态请求不可逐出，返回 None
    pub async fn evict(&self, id: &RequestId) -> Option<Request> {
        let mut registry = self.registry.write().await;
        let terminal = registry.slots.get(id)?.cell.load().is_terminal();
        if !terminal {
            tracing::warn!(request_id = %id, "Refusing to evict an active request");
            return None;
        }
        registry.slots.remove(id).map(|slot| slot.snapshot())
    }

    /// 清理终态超过 max_age 的请求，返回清理数量
    pub async fn prune_terminal(&self, max_age: Duration) -> usize {
        let now = Utc::now();
        let mut registry = self.registry.write().await;
        let before = registry.slots.len();
        registry.slots.retain(|_, slot| match slot.terminal_at {
            Some(at) if slot.cell.load().is_terminal() => {
                (now - at).to_std().map(|age| age <= max_age).unwrap_or(true)
            }
            _ => true,
        });
        before - registry.slots.len()
    }

    /// 取消全部在途请求并等待任务退出
    pub async fn shutdown(&self) {
        let live: Vec<RequestId> = {
            let registry = self.registry.read().await;
            registry
                .slots
                .values()
                .filter(|slot| !slot.cell.load().is_terminal())
                .map(|slot| slot.id.clone())
                .collect()
        };
        for id in &live {
            let _ = self.cancel(id, CancelReason::Shutdown).await;
        }
        self.root_token.cancel();

        let handles: Vec<(RequestId, TaskHandle)> = {
            let mut registry = self.registry.write().await;
            registry
                .slots
                .values_mut()
                .filter_map(|slot| slot.task.take().map(|task| (slot.id.clone(), task)))
                .collect()
        };
        tracing::info!(cancelled = live.len(), tasks = handles.len(), "Draining request tasks");
        for (id, task) in handles {
            if tokio::time::timeout(self.config.shutdown_timeout, task.join)
                .await
                .is_err()
            {
                tracing::warn!(request_id = %id, "Request task did not stop before shutdown timeout");
            }
        }
    }

    fn notify(&self, request: Request, old: Option<RequestState>, new: RequestState) {
        let _ = self
            .feedback_tx
            .send(FeedbackEvent::StateChanged(StateChange { request, old, new }));
    }
}

#[async_trait]
impl RequestLedger for RequestManager {
    async fn record_responses(
        &self,
        id: &RequestId,
        refs: Vec<ResponseRef>,
    ) -> Result<(), RequestError> {
        RequestManager::record_responses(self, id, refs).await
    }

    async fn complete(&self, id: &RequestId, outcome: Outcome) -> Result<bool, RequestError> {
        RequestManager::complete(self, id, outcome).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn origin(message_id: &str, channel: &str) -> Origin {
        Origin {
            message_id: message_id.to_string(),
            channel_id: channel.to_string(),
            thread_id: None,
            author_id: "u1".to_string(),
            content: "hello".to_string(),
            attachments: Vec::new(),
        }
    }

    fn drain_states(rx: &mut mpsc::UnboundedReceiver<FeedbackEvent>) -> Vec<(Option<RequestState>, RequestState)> {
        let mut out = Vec::new();
        while let Ok(ev) = rx.try_recv() {
            if let FeedbackEvent::StateChanged(change) = ev {
                out.push((change.old, change.new));
            }
        }
        out
    }

    struct Idle;

    #[async_trait]
    impl TurnProcessor for Idle {
        async fn process(&self, ctx: RequestCtx) {
            ctx.state.wait_started().await;
            ctx.cancel.cancelled().await;
        }
    }

    #[tokio::test]
    async fn test_create_conflict_on_same_key() {
        let (manager, _rx) = RequestManager::new(ManagerConfig::default());
        let first = manager.create(origin("m1", "c1")).await.unwrap();
        let err = manager.create(origin("m2", "c1")).await.unwrap_err();
        assert_eq!(
            err,
            RequestError::Conflict {
                key: ConversationKey::new("c1", None),
                active: first.id.clone(),
            }
        );
        assert!(manager.create(origin("m3", "c2")).await.is_ok());
    }

    #[tokio::test]
    async fn test_full_transition_sequence_notifies() {
        let (manager, mut rx) = RequestManager::new(ManagerConfig::default());
        let req = manager.create(origin("m1", "c1")).await.unwrap();
        manager.begin_processing(&req.id).await.unwrap();
        assert!(manager
            .complete(&req.id, Outcome::Done { tool_emojis: vec![] })
            .await
            .unwrap());

        assert_eq!(
            drain_states(&mut rx),
            vec![
                (None, RequestState::Pending),
                (Some(RequestState::Pending), RequestState::Processing),
                (Some(RequestState::Processing), RequestState::Done),
            ]
        );
        assert!(manager.active_for(&req.key()).await.is_none());
    }

    #[tokio::test]
    async fn test_begin_processing_after_cancel_is_invalid() {
        let (manager, _rx) = RequestManager::new(ManagerConfig::default());
        let req = manager.create(origin("m1", "c1")).await.unwrap();
        assert!(manager.cancel(&req.id, CancelReason::User).await.unwrap());
        let err = manager.begin_processing(&req.id).await.unwrap_err();
        assert!(matches!(
            err,
            RequestError::InvalidTransition {
                from: RequestState::Cancelled,
                to: RequestState::Processing,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_complete_before_cancel_keeps_done() {
        let (manager, _rx) = RequestManager::new(ManagerConfig::default());
        let req = manager.create(origin("m1", "c1")).await.unwrap();
        manager.begin_processing(&req.id).await.unwrap();
        manager
            .complete(&req.id, Outcome::Done { tool_emojis: vec![] })
            .await
            .unwrap();
        assert!(!manager.cancel(&req.id, CancelReason::User).await.unwrap());
        assert_eq!(manager.get(&req.id).await.unwrap().state, RequestState::Done);
    }

    #[tokio::test]
    async fn test_cancel_before_complete_makes_complete_noop() {
        let (manager, _rx) = RequestManager::new(ManagerConfig::default());
        let req = manager.create(origin("m1", "c1")).await.unwrap();
        manager.begin_processing(&req.id).await.unwrap();
        assert!(manager.cancel(&req.id, CancelReason::User).await.unwrap());
        let changed = manager
            .complete(&req.id, Outcome::Error { reason: "late".into() })
            .await
            .unwrap();
        assert!(!changed);
        let snapshot = manager.get(&req.id).await.unwrap();
        assert_eq!(snapshot.state, RequestState::Cancelled);
        assert_eq!(snapshot.cancel_reason, Some(CancelReason::User));
        assert!(snapshot.error.is_none());
    }

    #[tokio::test]
    async fn test_complete_from_pending_is_invalid() {
        let (manager, _rx) = RequestManager::new(ManagerConfig::default());
        let req = manager.create(origin("m1", "c1")).await.unwrap();
        let err = manager
            .complete(&req.id, Outcome::Done { tool_emojis: vec![] })
            .await
            .unwrap_err();
        assert!(matches!(err, RequestError::InvalidTransition { .. }));
    }

    #[tokio::test]
    async fn test_retry_requires_terminal_and_reuses_origin() {
        let (manager, _rx) = RequestManager::new(ManagerConfig::default());
        let req = manager.create(origin("m1", "c1")).await.unwrap();
        assert!(matches!(
            manager.retry(&req.id).await,
            Err(RequestError::InvalidTransition { .. })
        ));

        manager.begin_processing(&req.id).await.unwrap();
        manager
            .record_responses(&req.id, vec!["r1".into()])
            .await
            .unwrap();
        manager
            .complete(&req.id, Outcome::Error { reason: "boom".into() })
            .await
            .unwrap();

        let retried = manager.retry(&req.id).await.unwrap();
        assert_ne!(retried.id, req.id);
        assert_eq!(retried.origin, req.origin);
        assert_eq!(retried.previous_refs, vec!["r1".to_string()]);
        assert_eq!(retried.state, RequestState::Pending);
        // 旧请求被新请求取代后逐出
        assert!(manager.get(&req.id).await.is_none());
    }

    #[tokio::test]
    async fn test_retry_window_elapsed() {
        let config = ManagerConfig {
            retry_window: Some(Duration::ZERO),
            ..ManagerConfig::default()
        };
        let (manager, _rx) = RequestManager::new(config);
        let req = manager.create(origin("m1", "c1")).await.unwrap();
        manager.cancel(&req.id, CancelReason::User).await.unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert_eq!(
            manager.retry(&req.id).await.unwrap_err(),
            RequestError::RetryWindowElapsed(req.id.clone())
        );
    }

    #[tokio::test]
    async fn test_lookup_by_message_and_response() {
        let (manager, _rx) = RequestManager::new(ManagerConfig::default());
        let req = manager.create(origin("m1", "c1")).await.unwrap();
        manager
            .record_responses(&req.id, vec!["r1".into(), "r2".into(), "r1".into()])
            .await
            .unwrap();
        assert_eq!(manager.find_by_message("m1").await.unwrap().id, req.id);
        let found = manager.find_by_response("r2").await.unwrap();
        assert_eq!(found.response_refs, vec!["r1".to_string(), "r2".to_string()]);
        assert_eq!(manager.take_responses(&req.id).await.len(), 2);
        assert!(manager.find_by_response("r2").await.is_none());
    }

    #[tokio::test]
    async fn test_evict_only_terminal() {
        let (manager, _rx) = RequestManager::new(ManagerConfig::default());
        let req = manager.create(origin("m1", "c1")).await.unwrap();
        assert!(manager.evict(&req.id).await.is_none());
        manager.cancel(&req.id, CancelReason::Delete).await.unwrap();
        assert!(manager.evict(&req.id).await.is_some());
        assert!(manager.is_empty().await);
    }

    #[tokio::test]
    async fn test_prune_terminal() {
        let (manager, _rx) = RequestManager::new(ManagerConfig::default());
        let a = manager.create(origin("m1", "c1")).await.unwrap();
        manager.create(origin("m2", "c2")).await.unwrap();
        manager.cancel(&a.id, CancelReason::User).await.unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert_eq!(manager.prune_terminal(Duration::ZERO).await, 1);
        assert_eq!(manager.len().await, 1);
    }

    #[tokio::test]
    async fn test_spawn_and_shutdown_drains_tasks() {
        let (manager, _rx) = RequestManager::new(ManagerConfig::default());
        let req = manager.create(origin("m1", "c1")).await.unwrap();
        assert!(manager.spawn(&req.id, Arc::new(Idle)).await.unwrap());
        assert_eq!(
            manager.spawn(&req.id, Arc::new(Idle)).await.unwrap_err(),
            RequestError::AlreadySpawned(req.id.clone())
        );
        manager.begin_processing(&req.id).await.unwrap();

        manager.shutdown().await;
        let snapshot = manager.get(&req.id).await.unwrap();
        assert_eq!(snapshot.state, RequestState::Cancelled);
        assert_eq!(snapshot.cancel_reason, Some(CancelReason::Shutdown));
        assert_eq!(manager.active_count().await, 0);
    }

    /// 一被唤醒就立即完成的任务体
    struct Immediate {
        manager: Arc<RequestManager>,
    }

    #[async_trait]
    impl TurnProcessor for Immediate {
        async fn process(&self, ctx: RequestCtx) {
            if ctx.state.wait_started().await == RequestState::Processing {
                let _ = self
                    .manager
                    .complete(&ctx.id, Outcome::Done { tool_emojis: vec![] })
                    .await;
            }
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_events_follow_transition_order_under_fast_completion() {
        let (manager, mut rx) = RequestManager::new(ManagerConfig::default());
        let manager = Arc::new(manager);
        let processor: Arc<dyn TurnProcessor> = Arc::new(Immediate {
            manager: Arc::clone(&manager),
        });

        let mut ids = Vec::new();
        for i in 0..300 {
            let req = manager
                .create(origin(&format!("m{}", i), &format!("c{}", i % 7)))
                .await
                .unwrap_or_else(|_| panic!("conversation c{} still busy", i % 7));
            manager.spawn(&req.id, Arc::clone(&processor)).await.unwrap();
            manager.begin_processing(&req.id).await.unwrap();
            // 等该请求结束再复用同一会话键
            while manager.get(&req.id).await.map(|r| r.is_terminal()) == Some(false) {
                tokio::task::yield_now().await;
            }
            ids.push(req.id);
        }
        manager.shutdown().await;

        let mut per_request: HashMap<RequestId, Vec<RequestState>> = HashMap::new();
        let mut per_key: HashMap<ConversationKey, Vec<RequestState>> = HashMap::new();
        while let Ok(ev) = rx.try_recv() {
            if let FeedbackEvent::StateChanged(change) = ev {
                per_key.entry(change.request.key()).or_default().push(change.new);
                per_request.entry(change.request.id).or_default().push(change.new);
            }
        }
        for id in &ids {
            assert_eq!(
                per_request[id],
                vec![RequestState::Pending, RequestState::Processing, RequestState::Done],
                "events of {} out of order",
                id
            );
        }
        // 同一会话上：每个 Processing 之后紧跟其终态，不与下一个请求交错
        for states in per_key.values() {
            for chunk in states.chunks(3) {
                assert_eq!(chunk, [RequestState::Pending, RequestState::Processing, RequestState::Done]);
            }
        }
    }

    #[tokio::test]
    async fn test_spawn_skips_cancelled_request() {
        let (manager, _rx) = RequestManager::new(ManagerConfig::default());
        let req = manager.create(origin("m1", "c1")).await.unwrap();
        manager.cancel(&req.id, CancelReason::Superseded).await.unwrap();
        assert!(!manager.spawn(&req.id, Arc::new(Idle)).await.unwrap());
    }
}
