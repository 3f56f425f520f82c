//! Bard - 聊天机器人请求生命周期协调器与多轮工具调用对话引擎
//!
//! 模块划分：
//! - **app**: 由配置组装完整处理链
//! - **bot**: 入站事件、事件路由、任务体、出站接口、表情与输入中反馈
//! - **config**: 应用配置加载（TOML + 环境变量）
//! - **core**: 请求模型、状态机、RequestManager、错误、优雅关闭
//! - **engine**: Prompt 组装、后端适配、有界工具循环
//! - **llm**: LLM 客户端抽象与实现（OpenAI 兼容 / Mock）
//! - **memory**: 对话消息与会话历史
//! - **observability**: 日志初始化
//! - **tools**: 工具注册表与执行器

pub mod app;
pub mod bot;
pub mod config;
pub mod core;
pub mod engine;
pub mod llm;
pub mod memory;
pub mod observability;
pub mod tools;
