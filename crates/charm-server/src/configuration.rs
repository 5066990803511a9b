use crate::error::{to_env_var, ConfigError};
use charm::agent::AgentConfig;
use charm::providers::{
    anthropic::ANTHROPIC_HOST,
    configs::{AnthropicProviderConfig, OllamaProviderConfig, OpenAiProviderConfig, ProviderConfig},
    factory::ProviderType,
    ollama,
};
use config::{Config, Environment, File};
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

/// Optional settings file read from the working directory
pub const SETTINGS_FILE: &str = "charm.toml";

#[derive(Debug, Deserialize)]
pub struct ServerSettings {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

impl ServerSettings {
    pub fn socket_addr(&self) -> SocketAddr {
        format!("{}:{}", self.host, self.port)
            .parse()
            .expect("Failed to parse socket address")
    }
}

#[derive(Debug, Deserialize)]
pub struct OpenAiSettings {
    #[serde(default = "default_openai_host")]
    pub host: String,
    pub api_key: String,
    #[serde(default = "default_openai_model")]
    pub model: String,
    #[serde(default)]
    pub temperature: Option<f32>,
    #[serde(default)]
    pub max_tokens: Option<i32>,
}

#[derive(Debug, Deserialize)]
pub struct AnthropicSettings {
    #[serde(default = "default_anthropic_host")]
    pub host: String,
    pub api_key: String,
    #[serde(default = "default_anthropic_model")]
    pub model: String,
    #[serde(default)]
    pub temperature: Option<f32>,
    #[serde(default)]
    pub max_tokens: Option<i32>,
}

#[derive(Debug, Deserialize)]
pub struct OllamaSettings {
    #[serde(default = "default_ollama_host")]
    pub host: String,
    #[serde(default = "default_ollama_model")]
    pub model: String,
    #[serde(default)]
    pub temperature: Option<f32>,
    #[serde(default)]
    pub max_tokens: Option<i32>,
}

/// Each vendor is enabled by giving it a section
#[derive(Debug, Default, Deserialize)]
pub struct ProviderSettings {
    #[serde(default)]
    pub anthropic: Option<AnthropicSettings>,
    #[serde(default)]
    pub openai: Option<OpenAiSettings>,
    #[serde(default)]
    pub ollama: Option<OllamaSettings>,
}

impl ProviderSettings {
    /// Convert every configured vendor to its charm ProviderConfig
    pub fn into_configs(self) -> Vec<ProviderConfig> {
        let mut configs = Vec::new();
        if let Some(s) = self.anthropic {
            configs.push(ProviderConfig::Anthropic(AnthropicProviderConfig {
                host: s.host,
                api_key: s.api_key,
                model: s.model,
                temperature: s.temperature,
                max_tokens: s.max_tokens,
            }));
        }
        if let Some(s) = self.openai {
            configs.push(ProviderConfig::OpenAi(OpenAiProviderConfig {
                host: s.host,
                api_key: s.api_key,
                model: s.model,
                temperature: s.temperature,
                max_tokens: s.max_tokens,
            }));
        }
        if let Some(s) = self.ollama {
            configs.push(ProviderConfig::Ollama(OllamaProviderConfig {
                host: s.host,
                model: s.model,
                temperature: s.temperature,
                max_tokens: s.max_tokens,
            }));
        }
        configs
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct McpSettings {
    /// JSON file in the `mcpServers` format; no tools are loaded without it
    #[serde(default)]
    pub config_path: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct AgentSettings {
    #[serde(default = "default_provider_timeout_secs")]
    pub provider_timeout_secs: u64,
    #[serde(default = "default_tool_timeout_secs")]
    pub tool_timeout_secs: u64,
    #[serde(default = "default_max_tool_rounds")]
    pub max_tool_rounds: usize,
    #[serde(default = "default_sequential_thinking_tool")]
    pub sequential_thinking_tool: String,
}

impl Default for AgentSettings {
    fn default() -> Self {
        Self {
            provider_timeout_secs: default_provider_timeout_secs(),
            tool_timeout_secs: default_tool_timeout_secs(),
            max_tool_rounds: default_max_tool_rounds(),
            sequential_thinking_tool: default_sequential_thinking_tool(),
        }
    }
}

impl AgentSettings {
    pub fn agent_config(&self) -> AgentConfig {
        AgentConfig {
            provider_timeout: Duration::from_secs(self.provider_timeout_secs),
            max_tool_rounds: self.max_tool_rounds,
            sequential_thinking_tool: self.sequential_thinking_tool.clone(),
        }
    }

    pub fn tool_timeout(&self) -> Duration {
        Duration::from_secs(self.tool_timeout_secs)
    }
}

#[derive(Debug, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub server: ServerSettings,
    #[serde(default)]
    pub providers: ProviderSettings,
    #[serde(default = "default_provider")]
    pub default_provider: ProviderType,
    #[serde(default)]
    pub mcp: McpSettings,
    #[serde(default)]
    pub agent: AgentSettings,
}

impl Settings {
    pub fn new() -> Result<Self, ConfigError> {
        Self::load(Path::new(SETTINGS_FILE))
    }

    /// Defaults, then `file` if it exists, then `CHARM_*` environment variables
    pub fn load(file: &Path) -> Result<Self, ConfigError> {
        let config = Config::builder()
            .set_default("server.host", default_host())?
            .set_default("server.port", default_port())?
            .add_source(File::from(file).required(false))
            .add_source(
                Environment::with_prefix("CHARM")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let result: Result<Self, config::ConfigError> = config.try_deserialize();

        match result {
            Ok(settings) => Ok(settings),
            Err(err) => {
                tracing::debug!("Configuration error: {:?}", &err);

                // "missing field `api_key`" carries no path, only the field name
                let error_str = err.to_string();
                if error_str.starts_with("missing field") {
                    let field = error_str.split('`').nth(1).unwrap_or_default();
                    Err(ConfigError::MissingEnvVar {
                        env_var: to_env_var(field),
                    })
                } else if let config::ConfigError::NotFound(field) = &err {
                    Err(ConfigError::MissingEnvVar {
                        env_var: to_env_var(field),
                    })
                } else {
                    Err(ConfigError::Other(err))
                }
            }
        }
    }
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    3000
}

fn default_provider() -> ProviderType {
    ProviderType::Anthropic
}

fn default_openai_host() -> String {
    "https://api.openai.com".to_string()
}

fn default_openai_model() -> String {
    "gpt-4o".to_string()
}

fn default_anthropic_host() -> String {
    ANTHROPIC_HOST.to_string()
}

fn default_anthropic_model() -> String {
    "claude-3-5-sonnet-latest".to_string()
}

fn default_ollama_host() -> String {
    ollama::OLLAMA_HOST.to_string()
}

fn default_ollama_model() -> String {
    ollama::OLLAMA_MODEL.to_string()
}

fn default_provider_timeout_secs() -> u64 {
    120
}

fn default_tool_timeout_secs() -> u64 {
    60
}

fn default_max_tool_rounds() -> usize {
    25
}

fn default_sequential_thinking_tool() -> String {
    "sequential-thinking".to_string()
}
