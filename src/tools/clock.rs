//! 当前时间工具

use async_trait::async_trait;
use chrono::{FixedOffset, Utc};
use serde_json::{json, Value};

use crate::tools::registry::{Tool, ToolContext, ToolOutput};

/// 返回当前时间（可选 UTC 偏移小时数）
pub struct ClockTool;

#[async_trait]
impl Tool for ClockTool {
    fn name(&self) -> &str {
        "current_time"
    }

    fn description(&self) -> &str {
        "Get the current date and time. Optional utc_offset_hours shifts the result."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": { "utc_offset_hours": { "type": "integer" } },
            "required": []
        })
    }

    fn emoji(&self) -> Option<&str> {
        Some("🕒")
    }

    async fn execute(&self, args: Value, _ctx: &ToolContext) -> Result<ToolOutput, String> {
        let hours = args
            .get("utc_offset_hours")
            .and_then(Value::as_i64)
            .unwrap_or(0);
        let offset = i32::try_from(hours * 3600)
            .ok()
            .and_then(FixedOffset::east_opt)
            .ok_or_else(|| format!("utc offset out of range: {}", hours))?;
        let now = Utc::now().with_timezone(&offset);
        Ok(ToolOutput::json(json!({
            "iso8601": now.to_rfc3339(),
            "weekday": now.format("%A").to_string(),
        })))
    }
}
