//! 对话引擎层：Prompt 组装、后端适配与有界工具循环

pub mod backend;
pub mod conversation;
pub mod prompt;

pub use backend::{parse_reply, Backend, Generation, LlmBackend, Step, ToolCall};
pub use conversation::{
    Completion, ConversationEngine, EngineConfig, FinalResult, ToolInvocation, GREETING,
    NOTHING_TO_ADD,
};
pub use prompt::{PromptAssembler, PromptContext, TemplateAssembler};
