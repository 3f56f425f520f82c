//! 工具执行器
//!
//! 持有 ToolRegistry 与默认超时。每次调用在独立任务中执行工具：
//! 超时、工具返回 Err、参数不是 JSON 对象都转为 ToolFailure（可恢复，回灌模型）；
//! 工具任务 panic 则返回 InvokerError。每次调用输出结构化审计日志（JSON）。

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::Value;

use crate::core::error::{InvokerError, ToolFailure};
use crate::tools::registry::{Tool, ToolContext, ToolOutcome, ToolRegistry};

pub struct ToolExecutor {
    registry: ToolRegistry,
    timeout: Duration,
}

impl ToolExecutor {
    pub fn new(registry: ToolRegistry, timeout_secs: u64) -> Self {
        Self {
            registry,
            timeout: Duration::from_secs(timeout_secs),
        }
    }

    pub fn with_timeout(registry: ToolRegistry, timeout: Duration) -> Self {
        Self { registry, timeout }
    }

    pub fn lookup(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.registry.lookup(name)
    }

    pub fn registry(&self) -> &ToolRegistry {
        &self.registry
    }

    /// 以默认超时执行
    pub async fn invoke(
        &self,
        tool: &Arc<dyn Tool>,
        args: Value,
        ctx: &ToolContext,
    ) -> Result<ToolOutcome, InvokerError> {
        self.invoke_with_timeout(tool, args, ctx, self.timeout).await
    }

    pub async fn invoke_with_timeout(
        &self,
        tool: &Arc<dyn Tool>,
        args: Value,
        ctx: &ToolContext,
        timeout: Duration,
    ) -> Result<ToolOutcome, InvokerError> {
        let name = tool.name().to_string();
        let start = Instant::now();
        let preview = args_preview(&args);

        let result = if !args.is_object() {
            Ok(ToolOutcome::Failure(ToolFailure::InvalidArguments {
                tool: name.clone(),
                message: format!("expected a JSON object, got {}", args),
            }))
        } else {
            run_isolated(Arc::clone(tool), args, ctx.clone(), timeout).await
        };

        let outcome = match &result {
            Ok(ToolOutcome::Success(_)) => "ok",
            Ok(ToolOutcome::Failure(ToolFailure::Timeout { .. })) => "timeout",
            Ok(ToolOutcome::Failure(ToolFailure::InvalidArguments { .. })) => "invalid_args",
            Ok(ToolOutcome::Failure(ToolFailure::Failed { .. })) => "error",
            Err(_) => "panic",
        };
        let audit = serde_json::json!({
            "event": "tool_audit",
            "request_id": ctx.request_id.as_str(),
            "tool": name,
            "round": ctx.round_index,
            "ok": outcome == "ok",
            "outcome": outcome,
            "duration_ms": start.elapsed().as_millis() as u64,
            "args_preview": preview,
        });
        tracing::info!(audit = %audit.to_string(), "tool");

        result
    }
}

/// 在独立任务中执行工具：超时后中止任务，panic 由 JoinError 捕获
async fn run_isolated(
    tool: Arc<dyn Tool>,
    args: Value,
    ctx: ToolContext,
    timeout: Duration,
) -> Result<ToolOutcome, InvokerError> {
    let name = tool.name().to_string();
    let mut handle = tokio::spawn(async move { tool.execute(args, &ctx).await });

    match tokio::time::timeout(timeout, &mut handle).await {
        Ok(Ok(Ok(output))) => Ok(ToolOutcome::Success(output)),
        Ok(Ok(Err(message))) => Ok(ToolOutcome::Failure(ToolFailure::Failed {
            tool: name,
            message,
        })),
        Ok(Err(join_err)) => Err(InvokerError::Panicked {
            tool: name,
            reason: join_err.to_string(),
        }),
        Err(_) => {
            handle.abort();
            Ok(ToolOutcome::Failure(ToolFailure::Timeout {
                tool: name,
                after_secs: timeout.as_secs(),
            }))
        }
    }
}

fn args_preview(args: &Value) -> String {
    let s = args.to_string();
    if s.len() > 200 {
        format!("{}...", s.chars().take(200).collect::<String>())
    } else {
        s
    }
}
