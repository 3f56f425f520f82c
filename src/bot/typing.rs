//! 输入中指示器：每个会话键一个后台循环，周期性发送 typing 直到 stop

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::bot::outbound::ChatSurface;
use crate::core::request::ConversationKey;

pub struct TypingIndicator {
    surface: Arc<dyn ChatSurface>,
    interval: Duration,
    active: Mutex<HashMap<ConversationKey, CancellationToken>>,
}

impl TypingIndicator {
    pub fn new(surface: Arc<dyn ChatSurface>, interval: Duration) -> Self {
        Self {
            surface,
            interval,
            active: Mutex::new(HashMap::new()),
        }
    }

    fn active(&self) -> MutexGuard<'_, HashMap<ConversationKey, CancellationToken>> {
        self.active.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// 已在输入中时为 no-op
    pub fn start(&self, key: &ConversationKey) {
        let token = {
            let mut active = self.active();
            if active.contains_key(key) {
                return;
            }
            let token = CancellationToken::new();
            active.insert(key.clone(), token.clone());
            token
        };

        let surface = Arc::clone(&self.surface);
        let interval = self.interval;
        let target = key.thread_id.clone().unwrap_or_else(|| key.channel_id.clone());
        tokio::spawn(async move {
            loop {
                if let Err(e) = surface.send_typing(&target).await {
                    tracing::debug!(channel = %target, error = %e, "send_typing failed");
                }
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {}
                }
            }
        });
    }

    pub fn stop(&self, key: &ConversationKey) {
        if let Some(token) = self.active().remove(key) {
            token.cancel();
        }
    }

    pub fn is_typing(&self, key: &ConversationKey) -> bool {
        self.active().contains_key(key)
    }

    pub fn stop_all(&self) {
        for (_, token) in self.active().drain() {
            token.cancel();
        }
    }
}

impl Drop for TypingIndicator {
    fn drop(&mut self) {
        self.stop_all();
    }
}
