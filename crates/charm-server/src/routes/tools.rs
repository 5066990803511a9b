use crate::state::AppState;
use axum::{extract::State, routing::get, Json, Router};
use charm::providers::base::NameDialect;
use serde::Serialize;
use serde_json::{json, Value};

#[derive(Debug, Serialize)]
pub struct ToolSummary {
    name: String,
    description: String,
}

#[derive(Debug, Serialize)]
pub struct ServerSummary {
    name: String,
    tools: Vec<ToolSummary>,
}

#[derive(Debug, Serialize)]
pub struct ServerNames {
    servers: Vec<ServerSummary>,
}

// Lists every connected server, including ones whose tool listing currently fails
async fn server_names(State(state): State<AppState>) -> Json<ServerNames> {
    let registry = state.invoker.registry();
    let catalog = registry.discover(&[], NameDialect::Permissive).await;

    let servers = registry
        .server_ids()
        .into_iter()
        .map(|server| ServerSummary {
            name: server.to_string(),
            tools: catalog
                .descriptors()
                .iter()
                .filter(|d| d.qualified_name.server_id == server)
                .map(|d| ToolSummary {
                    name: d.qualified_name.tool_id.clone(),
                    description: d.description.clone(),
                })
                .collect(),
        })
        .collect();

    Json(ServerNames { servers })
}

async fn health() -> Json<Value> {
    Json(json!({"status": "ok"}))
}

pub fn routes(state: AppState) -> Router {
    Router::new()
        .route("/api/server-names", get(server_names))
        .route("/health", get(health))
        .with_state(state)
}
