//! Scripted collaborators for route tests
use crate::state::AppState;
use async_trait::async_trait;
use charm::agent::AgentConfig;
use charm::errors::{ServerError, ServerResult};
use charm::invoker::ToolInvoker;
use charm::models::{message::Message, tool::Tool};
use charm::providers::base::{CompletionOptions, Provider, Usage};
use charm::providers::factory::ProviderType;
use charm::registry::ToolRegistry;
use charm::servers::ToolServer;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub struct ScriptedProvider {
    responses: Mutex<Vec<Message>>,
}

impl ScriptedProvider {
    pub fn new(responses: Vec<Message>) -> Arc<Self> {
        Arc::new(Self {
            responses: Mutex::new(responses),
        })
    }
}

#[async_trait]
impl Provider for ScriptedProvider {
    async fn complete(
        &self,
        _system: &str,
        _messages: &[Message],
        _tools: &[Tool],
        _options: &CompletionOptions,
    ) -> anyhow::Result<(Message, Usage)> {
        let mut responses = self.responses.lock().unwrap();
        if responses.is_empty() {
            Ok((Message::assistant().with_text(""), Usage::default()))
        } else {
            Ok((responses.remove(0), Usage::default()))
        }
    }
}

enum Listing {
    Tools(Vec<String>),
    Refused,
    Hung,
}

pub struct StaticServer {
    name: String,
    listing: Listing,
}

impl StaticServer {
    pub fn new(name: &str, tools: &[&str]) -> Arc<dyn ToolServer> {
        Self::with_listing(
            name,
            Listing::Tools(tools.iter().map(|t| t.to_string()).collect()),
        )
    }

    pub fn failing(name: &str) -> Arc<dyn ToolServer> {
        Self::with_listing(name, Listing::Refused)
    }

    /// Never answers a tool listing
    pub fn wedged(name: &str) -> Arc<dyn ToolServer> {
        Self::with_listing(name, Listing::Hung)
    }

    fn with_listing(name: &str, listing: Listing) -> Arc<dyn ToolServer> {
        Arc::new(Self {
            name: name.to_string(),
            listing,
        })
    }
}

#[async_trait]
impl ToolServer for StaticServer {
    fn name(&self) -> &str {
        &self.name
    }

    async fn list_tools(&self) -> ServerResult<Vec<Tool>> {
        let tools = match &self.listing {
            Listing::Tools(tools) => tools,
            Listing::Refused => return Err(ServerError::Transport("connection refused".into())),
            Listing::Hung => futures::future::pending().await,
        };
        Ok(tools
            .iter()
            .map(|name| Tool::new(name.as_str(), "static tool", json!({"type": "object"})))
            .collect())
    }

    async fn call_tool(&self, tool: &str, _arguments: Value) -> ServerResult<Value> {
        Ok(json!({"content": [{"type": "text", "text": format!("{} done", tool)}]}))
    }
}

/// State with `provider` registered as OpenAI and no tool servers
pub fn test_state(provider: Arc<ScriptedProvider>) -> AppState {
    test_state_with_servers(provider, vec![])
}

pub fn test_state_with_servers(
    provider: Arc<ScriptedProvider>,
    servers: Vec<Arc<dyn ToolServer>>,
) -> AppState {
    let mut providers: HashMap<ProviderType, Arc<dyn Provider>> = HashMap::new();
    providers.insert(ProviderType::OpenAi, provider);
    AppState::with_providers(
        providers,
        ProviderType::Anthropic,
        ToolInvoker::new(
            ToolRegistry::new(servers).with_discovery_timeout(Duration::from_millis(200)),
            Duration::from_secs(1),
        ),
        AgentConfig {
            provider_timeout: Duration::from_secs(1),
            ..AgentConfig::default()
        },
    )
}
