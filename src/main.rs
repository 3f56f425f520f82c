//! bard 控制台调试入口
//!
//! 把 stdin 的每一行当作聊天事件送入路由，回复与表情打印到 stdout：
//!
//! ```text
//! <text>              以 user 身份 @ 机器人发送消息
//! /edit <id> <text>   编辑消息
//! /delete <id>        删除消息
//! /cancel <id>        在消息上加取消表情
//! /retry <id>         在消息（或回复）上加重试表情
//! /quit               退出
//! ```

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, BufReader};

use bard::app::{create_llm_client, default_tools, BardApp};
use bard::bot::{
    ChatEvent, ChatSurface, EventRouter, InboundMessage, OutboundSender, ReactionEvent, Reply,
    SurfaceError,
};
use bard::config::{load_config, AppConfig};
use bard::core::shutdown::{run_until_shutdown, RequestDrain, ShutdownCoordinator, ShutdownManager};
use bard::core::{Origin, ResponseRef};
use bard::observability;

const CHANNEL: &str = "console";
const USER: &str = "user";

/// 打印到终端的聊天界面
#[derive(Default)]
struct ConsoleSurface {
    next_id: AtomicU64,
}

#[async_trait]
impl OutboundSender for ConsoleSurface {
    async fn send(
        &self,
        origin: &Origin,
        reply: Reply<'_>,
        previous: &[ResponseRef],
    ) -> Result<Vec<ResponseRef>, SurfaceError> {
        let (text, media) = match reply {
            Reply::Final(result) => (result.text.as_str(), result.media.len()),
            Reply::Failure(notice) => (notice, 0),
        };
        let id = match previous.first() {
            Some(existing) => {
                println!("[bot edits {} in reply to {}] {}", existing, origin.message_id, text);
                existing.clone()
            }
            None => {
                let id = format!("r{}", self.next_id.fetch_add(1, Ordering::Relaxed) + 1);
                println!("[bot {} in reply to {}] {}", id, origin.message_id, text);
                id
            }
        };
        if media > 0 {
            println!("[bot {}] ({} attachment(s))", id, media);
        }
        Ok(vec![id])
    }
}

#[async_trait]
impl ChatSurface for ConsoleSurface {
    async fn add_reaction(&self, message_id: &str, emoji: &str) -> Result<(), SurfaceError> {
        println!("  + {} on {}", emoji, message_id);
        Ok(())
    }

    async fn remove_own_reaction(&self, message_id: &str, emoji: &str) -> Result<(), SurfaceError> {
        println!("  - {} on {}", emoji, message_id);
        Ok(())
    }

    async fn clear_reactions(&self, message_id: &str) -> Result<(), SurfaceError> {
        println!("  (reactions cleared on {})", message_id);
        Ok(())
    }

    async fn delete_message(&self, message_id: &str) -> Result<(), SurfaceError> {
        println!("  (deleted {})", message_id);
        Ok(())
    }

    async fn send_typing(&self, _channel_id: &str) -> Result<(), SurfaceError> {
        println!("  (typing...)");
        Ok(())
    }
}

fn message(id: &str, content: &str) -> InboundMessage {
    InboundMessage {
        id: id.to_string(),
        channel_id: CHANNEL.to_string(),
        thread_id: None,
        author_id: USER.to_string(),
        author_is_bot: false,
        content: content.to_string(),
        attachments: Vec::new(),
        is_direct: true,
        mentions_bot: true,
    }
}

fn reaction(message_id: &str, emoji: &str) -> ChatEvent {
    ChatEvent::ReactionAdded(ReactionEvent {
        message_id: message_id.to_string(),
        channel_id: CHANNEL.to_string(),
        user_id: USER.to_string(),
        user_is_bot: false,
        emoji: emoji.to_string(),
    })
}

/// 解析一行输入；None 表示退出
fn parse_line(
    line: &str,
    next_id: &mut u64,
    contents: &mut HashMap<String, String>,
    config: &AppConfig,
) -> Option<Option<ChatEvent>> {
    let line = line.trim();
    let (command, rest) = line.split_once(' ').unwrap_or((line, ""));
    let event = match command {
        "/quit" | "/exit" => return None,
        "/edit" => {
            let (id, text) = rest.split_once(' ').unwrap_or((rest, ""));
            match contents.insert(id.to_string(), text.to_string()) {
                Some(before) => Some(ChatEvent::MessageEdited {
                    before_content: before,
                    after: message(id, text),
                }),
                None => {
                    contents.remove(id);
                    println!("unknown message {}", id);
                    None
                }
            }
        }
        "/delete" => {
            contents.remove(rest);
            Some(ChatEvent::MessageDeleted {
                message_id: rest.to_string(),
            })
        }
        "/cancel" => Some(reaction(rest, &config.reactions.cancel_emoji)),
        "/retry" => Some(reaction(rest, &config.reactions.retry_emoji)),
        _ if line.is_empty() => None,
        _ => {
            *next_id += 1;
            let id = format!("m{}", next_id);
            contents.insert(id.clone(), line.to_string());
            println!("[you {}] {}", id, line);
            Some(ChatEvent::MessageCreated(message(&id, line)))
        }
    };
    Some(event)
}

async fn console_loop(router: Arc<EventRouter>, config: AppConfig) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut next_id = 0u64;
    let mut contents = HashMap::new();

    println!("bard console: type a message, or /edit /delete /cancel /retry /quit");
    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => {
                // 输入结束：等在途请求跑完再退出
                while router.manager().active_count().await > 0 {
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
                break;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to read stdin");
                break;
            }
        };
        let Some(event) = parse_line(&line, &mut next_id, &mut contents, &config) else {
            break;
        };
        let Some(event) = event else {
            continue;
        };
        match router.handle(event).await {
            Ok(routed) => tracing::debug!(?routed, "handled"),
            Err(e) => tracing::warn!(error = %e, "Event rejected"),
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    observability::init();

    let config_path = std::env::args().nth(1).map(PathBuf::from);
    let config = load_config(config_path.as_deref()).context("Failed to load config")?;

    let surface = Arc::new(ConsoleSurface::default());
    let app = BardApp::new(
        &config,
        create_llm_client(&config.llm),
        default_tools(),
        surface.clone(),
        surface,
    );

    let mut coordinator = ShutdownCoordinator::new()
        .with_timeout(Duration::from_secs(config.app.shutdown_timeout_secs + 1));
    coordinator.register(RequestDrain::new(Arc::clone(app.manager())));

    let reason = run_until_shutdown(
        Arc::new(ShutdownManager::new()),
        console_loop(Arc::clone(app.router()), config.clone()),
        &coordinator,
    )
    .await;
    tracing::debug!(?reason, "Console loop stopped");

    app.stop_feedback().await;
    Ok(())
}
