//! 事件路由：把平台事件翻译为 RequestManager 操作
//!
//! - 新消息（发给机器人的）：取代同会话的活跃请求，创建并启动新请求
//! - 编辑：内容未变忽略；进行中则取消并以新内容重来；已完成则以新内容重跑并原地编辑旧回复
//! - 删除：取消、删除回复、逐出
//! - 表情：原作者的取消表情取消进行中请求；重试表情重跑已结束请求
//!   （点在原消息上时仅限已取消或没有回复的请求）

use std::sync::Arc;

use crate::bot::events::{ChatEvent, InboundMessage, ReactionEvent};
use crate::core::error::RequestError;
use crate::core::manager::{RequestManager, TurnProcessor};
use crate::core::request::{
    CancelReason, ConversationKey, Origin, Request, RequestId, RequestState, ResponseRef,
};

#[derive(Debug, Clone)]
pub struct RouterSettings {
    pub retry_emoji: String,
    pub cancel_emoji: String,
    /// 允许触发请求的其他机器人
    pub allowed_bot_ids: Vec<String>,
}

/// handle 的结果（日志与测试用）
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Routed {
    Started(RequestId),
    /// 编辑了进行中的请求
    Restarted {
        cancelled: RequestId,
        started: RequestId,
    },
    /// 编辑了已完成的请求
    Replaced {
        previous: RequestId,
        started: RequestId,
    },
    Cancelled(RequestId),
    Retried {
        previous: RequestId,
        started: RequestId,
    },
    Removed(RequestId),
    Ignored(&'static str),
}

pub struct EventRouter {
    manager: Arc<RequestManager>,
    processor: Arc<dyn TurnProcessor>,
    settings: RouterSettings,
}

impl EventRouter {
    pub fn new(
        manager: Arc<RequestManager>,
        processor: Arc<dyn TurnProcessor>,
        settings: RouterSettings,
    ) -> Self {
        Self {
            manager,
            processor,
            settings,
        }
    }

    pub fn manager(&self) -> &Arc<RequestManager> {
        &self.manager
    }

    pub async fn handle(&self, event: ChatEvent) -> Result<Routed, RequestError> {
        let routed = match event {
            ChatEvent::MessageCreated(message) => self.on_message(message).await?,
            ChatEvent::MessageEdited {
                before_content,
                after,
            } => self.on_edit(&before_content, after).await?,
            ChatEvent::MessageDeleted { message_id } => self.on_delete(&message_id).await?,
            ChatEvent::ReactionAdded(reaction) => self.on_reaction(reaction).await?,
        };
        tracing::debug!(routed = ?routed, "Event routed");
        Ok(routed)
    }

    fn qualifies(&self, message: &InboundMessage) -> bool {
        let author_ok = !message.author_is_bot
            || self
                .settings
                .allowed_bot_ids
                .iter()
                .any(|id| *id == message.author_id);
        author_ok && (message.is_direct || message.mentions_bot)
    }

    async fn on_message(&self, message: InboundMessage) -> Result<Routed, RequestError> {
        if !self.qualifies(&message) {
            return Ok(Routed::Ignored("not addressed to the bot"));
        }
        let started = self.start(Arc::new(message.to_origin()), Vec::new()).await?;
        Ok(Routed::Started(started))
    }

    async fn on_edit(&self, before: &str, after: InboundMessage) -> Result<Routed, RequestError> {
        if before == after.content {
            return Ok(Routed::Ignored("content unchanged"));
        }
        let Some(existing) = self.manager.find_by_message(&after.id).await else {
            return Ok(Routed::Ignored("untracked message"));
        };

        if !existing.is_terminal() {
            self.manager.cancel(&existing.id, CancelReason::Edit).await?;
            self.drop_responses(&existing).await;
            if !self.qualifies(&after) {
                return Ok(Routed::Cancelled(existing.id));
            }
            let started = self.start(Arc::new(after.to_origin()), Vec::new()).await?;
            return Ok(Routed::Restarted {
                cancelled: existing.id,
                started,
            });
        }

        if !self.qualifies(&after) {
            self.drop_responses(&existing).await;
            self.manager.evict(&existing.id).await;
            return Ok(Routed::Removed(existing.id));
        }
        let previous = self.manager.take_responses(&existing.id).await;
        let started = self.start(Arc::new(after.to_origin()), previous).await?;
        Ok(Routed::Replaced {
            previous: existing.id,
            started,
        })
    }

    async fn on_delete(&self, message_id: &str) -> Result<Routed, RequestError> {
        let Some(existing) = self.manager.find_by_message(message_id).await else {
            return Ok(Routed::Ignored("untracked message"));
        };
        if !existing.is_terminal() {
            self.manager.cancel(&existing.id, CancelReason::Delete).await?;
        }
        self.drop_responses(&existing).await;
        self.manager.evict(&existing.id).await;
        Ok(Routed::Removed(existing.id))
    }

    async fn on_reaction(&self, reaction: ReactionEvent) -> Result<Routed, RequestError> {
        if reaction.user_is_bot {
            return Ok(Routed::Ignored("reaction from a bot"));
        }

        if reaction.emoji == self.settings.cancel_emoji {
            let Some(request) = self.manager.find_by_message(&reaction.message_id).await else {
                return Ok(Routed::Ignored("untracked message"));
            };
            if request.origin.author_id != reaction.user_id {
                return Ok(Routed::Ignored("reaction from someone other than the author"));
            }
            if request.is_terminal() {
                return Ok(Routed::Ignored("request already finished"));
            }
            self.manager.cancel(&request.id, CancelReason::User).await?;
            return Ok(Routed::Cancelled(request.id));
        }

        if reaction.emoji == self.settings.retry_emoji {
            let (request, on_origin) =
                match self.manager.find_by_response(&reaction.message_id).await {
                    Some(request) => (request, false),
                    None => match self.manager.find_by_message(&reaction.message_id).await {
                        Some(request) => (request, true),
                        None => return Ok(Routed::Ignored("untracked message")),
                    },
                };
            if request.origin.author_id != reaction.user_id {
                return Ok(Routed::Ignored("reaction from someone other than the author"));
            }
            if !request.is_terminal() {
                return Ok(Routed::Ignored("request still running"));
            }
            if on_origin && !retry_target_is_origin(&request) {
                return Ok(Routed::Ignored("retry belongs on the reply"));
            }
            self.supersede_active(&request.key()).await?;
            let retried = self.manager.retry(&request.id).await?;
            self.launch(&retried.id).await?;
            return Ok(Routed::Retried {
                previous: request.id,
                started: retried.id,
            });
        }

        Ok(Routed::Ignored("unrelated reaction"))
    }

    /// 取代同会话的活跃请求后创建、启动新请求
    async fn start(
        &self,
        origin: Arc<Origin>,
        previous: Vec<ResponseRef>,
    ) -> Result<RequestId, RequestError> {
        self.supersede_active(&origin.key()).await?;
        let request = self.manager.create_replacing(origin, previous).await?;
        self.launch(&request.id).await?;
        Ok(request.id)
    }

    async fn supersede_active(&self, key: &ConversationKey) -> Result<(), RequestError> {
        if let Some(active) = self.manager.active_for(key).await {
            self.manager.cancel(&active.id, CancelReason::Superseded).await?;
        }
        Ok(())
    }

    async fn launch(&self, id: &RequestId) -> Result<(), RequestError> {
        if !self.manager.spawn(id, Arc::clone(&self.processor)).await? {
            return Ok(());
        }
        match self.manager.begin_processing(id).await {
            Ok(()) => Ok(()),
            // 启动前已被取消
            Err(RequestError::InvalidTransition { .. }) => {
                tracing::debug!(request_id = %id, "Request cancelled before processing");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    async fn drop_responses(&self, request: &Request) {
        let refs = self.manager.take_responses(&request.id).await;
        self.manager.remove_responses(refs);
    }
}

/// 重试表情落在原消息上的情形：已取消，或结束时没有任何回复
fn retry_target_is_origin(request: &Request) -> bool {
    request.state == RequestState::Cancelled || request.response_refs.is_empty()
}
