mod configuration;
mod error;
mod routes;
mod state;
#[cfg(test)]
mod test_support;

use charm::invoker::ToolInvoker;
use charm::registry::ToolRegistry;
use charm::servers::{load_server_configs, McpServer, ToolServer};
use configuration::{McpSettings, Settings};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;
use tower_http::cors::{Any, CorsLayer};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// Start every configured MCP server. A server that fails to start is left out.
async fn connect_servers(settings: &McpSettings, limit: Duration) -> Vec<Arc<dyn ToolServer>> {
    let Some(path) = &settings.config_path else {
        warn!("no MCP config path set, running without tools");
        return Vec::new();
    };

    let configs = match load_server_configs(path) {
        Ok(configs) => configs,
        Err(e) => {
            warn!(error = %e, "could not load MCP servers");
            return Vec::new();
        }
    };

    let mut servers: Vec<Arc<dyn ToolServer>> = Vec::new();
    for (name, config) in &configs {
        match timeout(limit, McpServer::connect(name, config)).await {
            Ok(Ok(server)) => {
                info!(server = %name, "connected tool server");
                servers.push(Arc::new(server));
            }
            Ok(Err(e)) => warn!(server = %name, error = %e, "skipping tool server"),
            Err(_) => warn!(server = %name, timeout = ?limit, "tool server did not start in time"),
        }
    }
    servers
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let settings = Settings::new()?;

    let tool_timeout = settings.agent.tool_timeout();
    let servers = connect_servers(&settings.mcp, tool_timeout).await;
    let registry = ToolRegistry::new(servers).with_discovery_timeout(tool_timeout);
    let invoker = ToolInvoker::new(registry, tool_timeout);
    let state = state::AppState::new(
        settings.providers.into_configs(),
        settings.default_provider,
        invoker,
        settings.agent.agent_config(),
    )?;

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app = routes::configure(state).layer(cors);

    let listener = tokio::net::TcpListener::bind(settings.server.socket_addr()).await?;
    info!("listening on {}", listener.local_addr()?);
    axum::serve(listener, app).await?;
    Ok(())
}
