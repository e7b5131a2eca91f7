use async_trait::async_trait;
use serde_json::{Map, Value};

use crate::errors::AgentResult;
use crate::models::tool::ToolSpec;

use super::ToolOutput;

/// A connection to an out-of-process tool host (for example an MCP-style
/// server). The dispatcher drives the lifecycle: `connect` before the first
/// sampling turn, `cleanup` when the loop terminates for any reason.
#[async_trait]
pub trait RemoteToolProvider: Send + Sync {
    /// Establish the session. Called once; calling `list_tools` or
    /// `call_tool` before a successful connect is a usage error.
    async fn connect(&mut self) -> AgentResult<()>;

    /// Tools this provider currently serves.
    async fn list_tools(&self) -> AgentResult<Vec<ToolSpec>>;

    async fn call_tool(&self, name: &str, arguments: &Map<String, Value>)
        -> AgentResult<ToolOutput>;

    /// Release the session. Must be safe to call after a failed connect.
    async fn cleanup(&mut self) -> AgentResult<()>;
}
