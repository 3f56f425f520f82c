//! 核心层：请求模型、状态机与请求管理器、错误类型、优雅关闭

pub mod error;
pub mod events;
pub mod manager;
pub mod request;
pub mod shutdown;

pub use error::{BackendError, EngineError, InvokerError, RequestError, ToolFailure};
pub use events::{FeedbackEvent, StateChange};
pub use manager::{ManagerConfig, RequestLedger, RequestManager, TurnProcessor};
pub use request::{
    Attachment, CancelReason, ConversationKey, MessageId, Origin, Outcome, Request, RequestCtx,
    RequestId, RequestState, ResponseRef, StateCell,
};
pub use shutdown::{RequestDrain, ShutdownCoordinator, ShutdownManager, ShutdownReason};
