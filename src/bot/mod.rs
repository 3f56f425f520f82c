//! 聊天机器人层：入站事件、路由、任务体、出站接口与 UI 反馈（表情、输入中）

pub mod events;
pub mod feedback;
pub mod outbound;
pub mod reactions;
pub mod router;
pub mod typing;
pub mod worker;

pub use events::{ChatEvent, InboundMessage, ReactionEvent};
pub use feedback::{FeedbackAdapter, FeedbackDispatcher};
pub use outbound::{failure_notice, ChatSurface, OutboundSender, Reply, SurfaceError};
pub use reactions::{ReactionFeedback, DEFAULT_CANCEL_EMOJI, DEFAULT_RETRY_EMOJI};
pub use router::{EventRouter, Routed, RouterSettings};
pub use typing::TypingIndicator;
pub use worker::TurnWorker;
