//! Prompt 组装
//!
//! PromptAssembler 把原消息内容、会话历史与附件描述组装为 PromptContext（确定性，无 I/O）。
//! 默认实现 TemplateAssembler：system prompt + 工具目录 + tool call JSON Schema。

use crate::core::request::Attachment;
use crate::memory::Message;
use crate::tools::{tool_call_schema_json, ToolRegistry};

/// 一次后端调用的完整上下文；工具循环中不断追加
#[derive(Clone, Debug, Default, PartialEq)]
pub struct PromptContext {
    pub system: String,
    pub messages: Vec<Message>,
}

impl PromptContext {
    pub fn push(&mut self, message: Message) {
        self.messages.push(message);
    }

    /// system 在前的完整消息列表
    pub fn to_messages(&self) -> Vec<Message> {
        let mut all = Vec::with_capacity(self.messages.len() + 1);
        if !self.system.is_empty() {
            all.push(Message::system(self.system.clone()));
        }
        all.extend(self.messages.iter().cloned());
        all
    }
}

pub trait PromptAssembler: Send + Sync {
    fn build(&self, content: &str, history: &[Message], attachments: &[Attachment]) -> PromptContext;
}

/// 模板组装器：工具目录在构造时渲染一次
pub struct TemplateAssembler {
    system: String,
}

impl TemplateAssembler {
    pub fn new(system_prompt: &str, tools: &ToolRegistry) -> Self {
        let system = if tools.is_empty() {
            system_prompt.to_string()
        } else {
            format!(
                "{}\n\n## Available tools\n{}\n\n## Calling a tool\n\
                 To call a tool, reply with only a JSON object matching this schema \
                 (or a JSON array of such objects to call several in order):\n{}\n\
                 Otherwise reply to the user in plain text.",
                system_prompt,
                tools.to_schema_json(),
                tool_call_schema_json()
            )
        };
        Self { system }
    }

    pub fn system_prompt(&self) -> &str {
        &self.system
    }
}

impl PromptAssembler for TemplateAssembler {
    fn build(&self, content: &str, history: &[Message], attachments: &[Attachment]) -> PromptContext {
        let mut user = content.trim().to_string();
        for attachment in attachments {
            if !user.is_empty() {
                user.push('\n');
            }
            user.push_str(&format!(
                "[attachment: {} ({}) {}]",
                attachment.filename, attachment.mime_type, attachment.url
            ));
        }

        let mut messages = history.to_vec();
        messages.push(Message::user(user));
        PromptContext {
            system: self.system.clone(),
            messages,
        }
    }
}
