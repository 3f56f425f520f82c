//! 记忆层：对话消息与按会话键存放的短期历史

pub mod conversation;
pub mod history;

pub use conversation::{Message, Role};
pub use history::HistoryStore;
