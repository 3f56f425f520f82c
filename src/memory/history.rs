//! 会话历史存储：每个会话键保留最近 N 轮 (user, assistant)
//!
//! 仅内存，重启即丢失；引擎在请求完成后写入一轮。工具调用的中间消息不进入历史。

use std::collections::{HashMap, VecDeque};

use tokio::sync::RwLock;

use crate::core::request::ConversationKey;
use crate::memory::conversation::Message;

/// 一轮问答
#[derive(Clone, Debug)]
struct Turn {
    user: String,
    assistant: String,
}

pub struct HistoryStore {
    conversations: RwLock<HashMap<ConversationKey, VecDeque<Turn>>>,
    max_turns: usize,
}

impl HistoryStore {
    pub fn new(max_turns: usize) -> Self {
        Self {
            conversations: RwLock::new(HashMap::new()),
            max_turns,
        }
    }

    /// 按时间顺序展开为消息（构建 prompt 用）
    pub async fn snapshot(&self, key: &ConversationKey) -> Vec<Message> {
        let conversations = self.conversations.read().await;
        let Some(turns) = conversations.get(key) else {
            return Vec::new();
        };
        turns
            .iter()
            .flat_map(|turn| [Message::user(&turn.user), Message::assistant(&turn.assistant)])
            .collect()
    }

    pub async fn record_turn(
        &self,
        key: &ConversationKey,
        user: impl Into<String>,
        assistant: impl Into<String>,
    ) {
        if self.max_turns == 0 {
            return;
        }
        let mut conversations = self.conversations.write().await;
        let turns = conversations.entry(key.clone()).or_default();
        turns.push_back(Turn {
            user: user.into(),
            assistant: assistant.into(),
        });
        while turns.len() > self.max_turns {
            turns.pop_front();
        }
    }

    pub async fn turns(&self, key: &ConversationKey) -> usize {
        self.conversations.read().await.get(key).map_or(0, VecDeque::len)
    }

    pub async fn clear(&self, key: &ConversationKey) {
        self.conversations.write().await.remove(key);
    }
}
