use super::base::{CompletionOptions, NameDialect, Provider, Usage};
use super::configs::OllamaProviderConfig;
use super::utils::{
    classify_http_error, get_openai_usage, openai_chat_payload, openai_response_to_message,
};
use crate::models::message::Message;
use crate::models::tool::Tool;
use anyhow::Result;
use async_trait::async_trait;
use reqwest::Client;
use reqwest::StatusCode;
use serde_json::Value;
use std::time::Duration;

pub const OLLAMA_HOST: &str = "http://localhost:11434";
pub const OLLAMA_MODEL: &str = "qwen2.5";

/// Ollama through its OpenAI-compatible endpoint
pub struct OllamaProvider {
    client: Client,
    config: OllamaProviderConfig,
}

impl OllamaProvider {
    pub fn new(config: OllamaProviderConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(600)) // 10 minutes timeout
            .build()?;

        Ok(Self { client, config })
    }

    async fn post(&self, payload: Value) -> Result<Value> {
        let url = format!(
            "{}/v1/chat/completions",
            self.config.host.trim_end_matches('/')
        );

        let response = self.client.post(&url).json(&payload).send().await?;

        match response.status() {
            StatusCode::OK => Ok(response.json().await?),
            status => {
                let body = response.text().await.unwrap_or_default();
                Err(classify_http_error(status, &body).into())
            }
        }
    }
}

#[async_trait]
impl Provider for OllamaProvider {
    async fn complete(
        &self,
        system: &str,
        messages: &[Message],
        tools: &[Tool],
        options: &CompletionOptions,
    ) -> Result<(Message, Usage)> {
        let payload = openai_chat_payload(
            &self.config.model,
            system,
            messages,
            tools,
            options,
            self.config.temperature,
            self.config.max_tokens,
        )?;

        let response = self.post(payload).await?;
        let message = openai_response_to_message(response.clone())?;
        let usage = get_openai_usage(&response);

        Ok((message, usage))
    }

    // Several local models mangle hyphenated function names
    fn name_dialect(&self) -> NameDialect {
        NameDialect::Strict
    }
}
