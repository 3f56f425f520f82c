//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `BARD__*` 覆盖（双下划线表示嵌套，如 `BARD__LLM__PROVIDER=openai`）。

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::bot::{RouterSettings, DEFAULT_CANCEL_EMOJI, DEFAULT_RETRY_EMOJI};
use crate::core::manager::ManagerConfig;
use crate::engine::EngineConfig;
use crate::llm::RetryConfig;

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub app: AppSection,
    pub engine: EngineSection,
    pub llm: LlmSection,
    pub tools: ToolsSection,
    pub reactions: ReactionsSection,
}

/// [app] 段
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AppSection {
    pub name: String,
    /// 每个会话保留的历史轮数
    pub max_history_turns: usize,
    /// 已结束请求可被重试的秒数；不设置表示不限
    pub retry_window_secs: Option<u64>,
    /// 允许触发请求的机器人账号
    pub allowed_bot_ids: Vec<String>,
    pub system_prompt: String,
    /// 关闭时等待在途请求退出的秒数
    pub shutdown_timeout_secs: u64,
}

impl Default for AppSection {
    fn default() -> Self {
        Self {
            name: "bard".to_string(),
            max_history_turns: 20,
            retry_window_secs: None,
            allowed_bot_ids: Vec::new(),
            system_prompt: default_system_prompt(),
            shutdown_timeout_secs: 5,
        }
    }
}

fn default_system_prompt() -> String {
    "You are a helpful assistant in a group chat. Answer concisely. \
     Use the available tools when they help answer the question."
        .to_string()
}

/// [engine] 段
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EngineSection {
    pub max_tool_rounds: usize,
}

impl Default for EngineSection {
    fn default() -> Self {
        Self { max_tool_rounds: 8 }
    }
}

/// [llm] 段：后端选择、超时、重试
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LlmSection {
    /// mock / openai
    pub provider: String,
    pub model: String,
    pub base_url: Option<String>,
    /// 未设置时读 OPENAI_API_KEY
    pub api_key: Option<String>,
    /// 以流式读取回复（整个流算一次调用）
    pub streaming: bool,
    pub timeouts: LlmTimeoutsSection,
    pub retry: RetryConfig,
}

impl Default for LlmSection {
    fn default() -> Self {
        Self {
            provider: "mock".to_string(),
            model: "gpt-4o-mini".to_string(),
            base_url: None,
            api_key: None,
            streaming: false,
            timeouts: LlmTimeoutsSection::default(),
            retry: RetryConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LlmTimeoutsSection {
    pub request: u64,
    pub stream: u64,
}

impl Default for LlmTimeoutsSection {
    fn default() -> Self {
        Self {
            request: 60,
            stream: 120,
        }
    }
}

/// [tools] 段
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ToolsSection {
    /// 单次工具调用超时（秒）
    pub tool_timeout_secs: u64,
}

impl Default for ToolsSection {
    fn default() -> Self {
        Self {
            tool_timeout_secs: 30,
        }
    }
}

/// [reactions] 段
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ReactionsSection {
    pub retry_emoji: String,
    pub cancel_emoji: String,
    pub typing_interval_secs: u64,
}

impl Default for ReactionsSection {
    fn default() -> Self {
        Self {
            retry_emoji: DEFAULT_RETRY_EMOJI.to_string(),
            cancel_emoji: DEFAULT_CANCEL_EMOJI.to_string(),
            typing_interval_secs: 8,
        }
    }
}

impl AppConfig {
    pub fn manager_config(&self) -> ManagerConfig {
        ManagerConfig {
            retry_window: self.app.retry_window_secs.map(Duration::from_secs),
            shutdown_timeout: Duration::from_secs(self.app.shutdown_timeout_secs),
        }
    }

    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            max_rounds: self.engine.max_tool_rounds,
        }
    }

    pub fn router_settings(&self) -> RouterSettings {
        RouterSettings {
            retry_emoji: self.reactions.retry_emoji.clone(),
            cancel_emoji: self.reactions.cancel_emoji.clone(),
            allowed_bot_ids: self.app.allowed_bot_ids.clone(),
        }
    }

    /// 单次后端调用超时：流式读取用 stream 超时
    pub fn backend_timeout(&self) -> Duration {
        if self.llm.streaming {
            Duration::from_secs(self.llm.timeouts.stream)
        } else {
            Duration::from_secs(self.llm.timeouts.request)
        }
    }
}

/// 从 config 目录加载配置，环境变量 BARD__* 可覆盖
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml，找到则作为第一源
/// 2. 若传入 config_path，则追加该文件（必须存在）
/// 3. 最后叠加环境变量 BARD__*（双下划线表示嵌套键）
pub fn load_config(config_path: Option<&Path>) -> Result<AppConfig, config::ConfigError> {
    load_config_from(Path::new("."), config_path)
}

/// 以 base_dir 为根查找默认配置
pub fn load_config_from(
    base_dir: &Path,
    config_path: Option<&Path>,
) -> Result<AppConfig, config::ConfigError> {
    let mut builder = config::Config::builder();

    for name in ["config/default.toml", "../config/default.toml"] {
        let path: PathBuf = base_dir.join(name);
        if path.exists() {
            builder = builder.add_source(config::File::from(path).required(false));
            break;
        }
    }

    if let Some(path) = config_path {
        builder = builder.add_source(config::File::from(path.to_path_buf()).required(true));
    }

    builder = builder.add_source(
        config::Environment::with_prefix("BARD")
            .separator("__")
            .list_separator(",")
            .with_list_parse_key("app.allowed_bot_ids")
            .try_parsing(true),
    );

    builder.build()?.try_deserialize()
}
