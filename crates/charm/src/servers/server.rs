use async_trait::async_trait;
use serde_json::Value;

use crate::errors::ServerResult;
use crate::models::tool::Tool;

/// Core trait for an external server whose tools the agent can call
#[async_trait]
pub trait ToolServer: Send + Sync {
    /// Identifier of the server, as configured
    fn name(&self) -> &str;

    /// Tools exposed by this server, under their original names
    async fn list_tools(&self) -> ServerResult<Vec<Tool>>;

    /// Call a tool and return the raw result envelope
    async fn call_tool(&self, tool: &str, arguments: Value) -> ServerResult<Value>;
}
