//! External tool servers. The engine only consumes them: it lists their tools and
//! forwards calls, it never implements one.
mod config;
mod mcp;
mod server;

pub use config::{load_server_configs, McpServerConfig, McpServersFile};
pub use mcp::{McpServer, Transport};
pub use server::ToolServer;
