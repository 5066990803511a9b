use charm::agent::{Agent, AgentConfig};
use charm::invoker::ToolInvoker;
use charm::providers::{
    base::Provider,
    configs::ProviderConfig,
    factory::{self, ProviderType},
};
use std::collections::HashMap;
use std::sync::Arc;

/// Shared application state. Everything here is read-only after startup; per-request
/// state lives in the agent run.
#[derive(Clone)]
pub struct AppState {
    pub providers: Arc<HashMap<ProviderType, Arc<dyn Provider>>>,
    pub default_provider: ProviderType,
    pub invoker: ToolInvoker,
    pub agent_config: AgentConfig,
}

impl AppState {
    pub fn new(
        configs: Vec<ProviderConfig>,
        default_provider: ProviderType,
        invoker: ToolInvoker,
        agent_config: AgentConfig,
    ) -> anyhow::Result<Self> {
        let mut providers: HashMap<ProviderType, Arc<dyn Provider>> = HashMap::new();
        for config in configs {
            let provider_type = config.provider_type();
            let provider: Arc<dyn Provider + Send + Sync> =
                Arc::from(factory::get_provider(config)?);
            providers.insert(provider_type, provider);
        }
        if !providers.contains_key(&default_provider) {
            tracing::warn!(
                provider = %default_provider,
                "default provider is not configured, requests must name a configured modelProvider"
            );
        }
        Ok(Self::with_providers(
            providers,
            default_provider,
            invoker,
            agent_config,
        ))
    }

    pub fn with_providers(
        providers: HashMap<ProviderType, Arc<dyn Provider>>,
        default_provider: ProviderType,
        invoker: ToolInvoker,
        agent_config: AgentConfig,
    ) -> Self {
        Self {
            providers: Arc::new(providers),
            default_provider,
            invoker,
            agent_config,
        }
    }

    /// An agent bound to the requested provider, or the default one
    pub fn agent(&self, requested: Option<ProviderType>) -> Result<Agent, ProviderType> {
        let provider_type = requested.unwrap_or(self.default_provider);
        let provider = self.providers.get(&provider_type).ok_or(provider_type)?;
        Ok(Agent::new(
            provider.clone(),
            self.invoker.clone(),
            self.agent_config.clone(),
        ))
    }
}
