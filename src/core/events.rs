//! 状态变更通知：Manager 每次转移后推送，由 FeedbackDispatcher 交给 UI 反馈适配器

use crate::core::request::{Request, RequestState, ResponseRef};

/// 一次状态转移；old 为 None 表示刚创建
#[derive(Clone, Debug)]
pub struct StateChange {
    pub request: Request,
    pub old: Option<RequestState>,
    pub new: RequestState,
}

/// 反馈通道上的事件
#[derive(Clone, Debug)]
pub enum FeedbackEvent {
    StateChanged(StateChange),
    /// 删除已发送的回复（原消息被删/编辑时）
    RemoveResponses(Vec<ResponseRef>),
}
