//! 工具层：Tool trait、注册表、带超时与隔离的执行器，以及内置调试工具

pub mod clock;
pub mod echo;
pub mod executor;
pub mod registry;
pub mod schema;

pub use clock::ClockTool;
pub use echo::EchoTool;
pub use executor::ToolExecutor;
pub use registry::{Media, Tool, ToolContext, ToolOutcome, ToolOutput, ToolRegistry};
pub use schema::tool_call_schema_json;
