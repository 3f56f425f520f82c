//! Request：一次逻辑对话轮次的记账单元
//!
//! 状态保存在 StateCell（AtomicU8）中：Manager 以 CAS 写入，引擎在检查点做一次原子读。
//! Request 本身是 Manager 内部记录的快照，供 Router / 反馈适配器读取。

use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// 平台消息 ID
pub type MessageId = String;

/// 已发送回复的消息 ID（用于取消/重试时清理或原地编辑）
pub type ResponseRef = MessageId;

/// 请求 ID：由触发消息 ID 派生，外加随机后缀区分重试
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize)]
pub struct RequestId(String);

impl RequestId {
    pub fn derive(message_id: &str) -> Self {
        let suffix = uuid::Uuid::new_v4().simple().to_string();
        Self(format!("{}-{}", message_id, &suffix[..8]))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// 会话键：频道 + 可选子线程；同一键下最多一个活跃请求
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize)]
pub struct ConversationKey {
    pub channel_id: String,
    pub thread_id: Option<String>,
}

impl ConversationKey {
    pub fn new(channel_id: impl Into<String>, thread_id: Option<String>) -> Self {
        Self {
            channel_id: channel_id.into(),
            thread_id,
        }
    }
}

impl fmt::Display for ConversationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.thread_id {
            Some(thread) => write!(f, "{}/{}", self.channel_id, thread),
            None => f.write_str(&self.channel_id),
        }
    }
}

/// 请求状态
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
pub enum RequestState {
    Pending,
    Processing,
    Done,
    Cancelled,
    Error,
}

impl RequestState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            RequestState::Done | RequestState::Cancelled | RequestState::Error
        )
    }

    fn as_u8(self) -> u8 {
        match self {
            RequestState::Pending => 0,
            RequestState::Processing => 1,
            RequestState::Done => 2,
            RequestState::Cancelled => 3,
            RequestState::Error => 4,
        }
    }

    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => RequestState::Pending,
            1 => RequestState::Processing,
            2 => RequestState::Done,
            3 => RequestState::Cancelled,
            _ => RequestState::Error,
        }
    }
}

/// 取消原因（反馈适配器据此决定是否给出重试入口）
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum CancelReason {
    /// 作者点了取消表情
    User,
    /// 原消息被编辑，随后会以新内容重建请求
    Edit,
    /// 原消息被删除
    Delete,
    /// 同一会话出现了新的请求
    Superseded,
    /// 进程关闭
    Shutdown,
}

/// 原消息附件描述（上传细节不在本核心范围内）
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Attachment {
    pub filename: String,
    pub mime_type: String,
    pub url: String,
}

/// 触发请求的入站消息快照（创建时冻结）
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Origin {
    pub message_id: MessageId,
    pub channel_id: String,
    pub thread_id: Option<String>,
    pub author_id: String,
    pub content: String,
    pub attachments: Vec<Attachment>,
}

impl Origin {
    pub fn key(&self) -> ConversationKey {
        ConversationKey::new(self.channel_id.clone(), self.thread_id.clone())
    }

    /// 无文字也无附件
    pub fn is_empty(&self) -> bool {
        self.content.trim().is_empty() && self.attachments.is_empty()
    }
}

/// 共享状态单元：唯一权威的状态写入点
#[derive(Debug)]
pub struct StateCell {
    state: AtomicU8,
    started: Notify,
}

impl Default for StateCell {
    fn default() -> Self {
        Self::new()
    }
}

impl StateCell {
    pub fn new() -> Self {
        Self {
            state: AtomicU8::new(RequestState::Pending.as_u8()),
            started: Notify::new(),
        }
    }

    pub fn load(&self) -> RequestState {
        RequestState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn is_cancelled(&self) -> bool {
        self.load() == RequestState::Cancelled
    }

    /// CAS：仅当当前状态为 from 时写入 to
    pub(crate) fn transition(&self, from: RequestState, to: RequestState) -> bool {
        let swapped = self
            .state
            .compare_exchange(from.as_u8(), to.as_u8(), Ordering::AcqRel, Ordering::Acquire)
            .is_ok();
        if swapped && from == RequestState::Pending {
            self.started.notify_one();
        }
        swapped
    }

    /// 任意非终态 -> Cancelled；返回取消前的状态，已是终态时返回 None
    pub(crate) fn cancel(&self) -> Option<RequestState> {
        loop {
            let current = self.load();
            if current.is_terminal() {
                return None;
            }
            if self.transition(current, RequestState::Cancelled) {
                return Some(current);
            }
        }
    }

    /// 等待离开 Pending（begin_processing 或 cancel），返回此时的状态
    pub async fn wait_started(&self) -> RequestState {
        loop {
            let current = self.load();
            if current != RequestState::Pending {
                return current;
            }
            self.started.notified().await;
        }
    }
}

/// 任务句柄：仅用于取消与关闭时等待，不用于取结果
#[derive(Debug)]
pub struct TaskHandle {
    pub(crate) cancel: CancellationToken,
    pub(crate) join: JoinHandle<()>,
}

/// 请求完成结果（complete 的参数）
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Outcome {
    Done { tool_emojis: Vec<String> },
    Error { reason: String },
}

/// 请求快照
#[derive(Clone, Debug)]
pub struct Request {
    pub id: RequestId,
    pub state: RequestState,
    pub origin: Arc<Origin>,
    pub response_refs: Vec<ResponseRef>,
    pub previous_refs: Vec<ResponseRef>,
    pub created_at: DateTime<Utc>,
    pub terminal_at: Option<DateTime<Utc>>,
    pub cancel_reason: Option<CancelReason>,
    pub tool_emojis: Vec<String>,
    pub error: Option<String>,
}

impl Request {
    pub fn key(&self) -> ConversationKey {
        self.origin.key()
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }
}

/// 交给任务体的上下文：身份、来源与状态单元
#[derive(Clone, Debug)]
pub struct RequestCtx {
    pub id: RequestId,
    pub origin: Arc<Origin>,
    pub previous_refs: Vec<ResponseRef>,
    pub state: Arc<StateCell>,
    /// 协作式取消信号；工具可自行观察，引擎不强制中断进行中的调用
    pub cancel: CancellationToken,
}

impl RequestCtx {
    /// 取消检查点：一次原子读
    pub fn is_cancelled(&self) -> bool {
        self.state.is_cancelled()
    }
}
