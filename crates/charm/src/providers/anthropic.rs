use anyhow::{anyhow, Result};
use async_trait::async_trait;
use reqwest::Client;
use reqwest::StatusCode;
use serde_json::{json, Value};
use std::time::Duration;

use super::base::{CompletionOptions, Provider, ToolChoice, Usage};
use super::configs::AnthropicProviderConfig;
use super::utils::{classify_http_error, request_wire_name};
use crate::errors::AgentError;
use crate::models::content::Content;
use crate::models::message::{Message, MessageContent};
use crate::models::role::Role;
use crate::models::tool::{Tool, ToolCall};

pub const ANTHROPIC_HOST: &str = "https://api.anthropic.com";
const ANTHROPIC_VERSION: &str = "2023-06-01";
const DEFAULT_MAX_TOKENS: i32 = 4096;

pub struct AnthropicProvider {
    client: Client,
    config: AnthropicProviderConfig,
}

impl AnthropicProvider {
    pub fn new(config: AnthropicProviderConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(600)) // 10 minutes timeout
            .build()?;

        Ok(Self { client, config })
    }

    fn get_usage(data: &Value) -> Usage {
        let usage = &data["usage"];
        let input_tokens = usage
            .get("input_tokens")
            .and_then(|v| v.as_i64())
            .map(|v| v as i32);
        let output_tokens = usage
            .get("output_tokens")
            .and_then(|v| v.as_i64())
            .map(|v| v as i32);
        let total_tokens = match (input_tokens, output_tokens) {
            (Some(input), Some(output)) => Some(input + output),
            _ => None,
        };
        Usage::new(input_tokens, output_tokens, total_tokens)
    }

    /// Convert messages into Anthropic content blocks. System-role messages are lifted into
    /// the system prompt and consecutive messages with the same role are merged, since the
    /// messages API requires strict user/assistant alternation.
    fn messages_to_anthropic_spec(messages: &[Message], system: &str) -> (String, Vec<Value>) {
        let mut system_prompt = system.to_string();
        let mut anthropic_messages: Vec<Value> = Vec::new();

        for message in messages {
            let role = match message.role {
                Role::System => {
                    let text = message.text();
                    if !text.is_empty() {
                        system_prompt.push_str("\n\n");
                        system_prompt.push_str(&text);
                    }
                    continue;
                }
                Role::Assistant => "assistant",
                Role::User | Role::Tool => "user",
            };

            let mut blocks = Vec::new();
            for content in &message.content {
                match content {
                    MessageContent::Text(text) => {
                        if !text.text.is_empty() {
                            blocks.push(json!({"type": "text", "text": text.text}));
                        }
                    }
                    MessageContent::Image(image) => {
                        blocks.push(json!({
                            "type": "image",
                            "source": {
                                "type": "base64",
                                "media_type": image.mime_type,
                                "data": image.data,
                            }
                        }));
                    }
                    MessageContent::ToolRequest(request) => {
                        let input = match &request.tool_call {
                            Ok(tool_call) => tool_call.arguments.clone(),
                            Err(_) => json!({}),
                        };
                        blocks.push(json!({
                            "type": "tool_use",
                            "id": request.id,
                            "name": request_wire_name(request),
                            "input": input,
                        }));
                    }
                    MessageContent::ToolResponse(response) => {
                        let (content, is_error) = match &response.tool_result {
                            Ok(contents) => (
                                contents
                                    .iter()
                                    .map(|content| match content {
                                        Content::Text(text) => {
                                            json!({"type": "text", "text": text.text})
                                        }
                                        Content::Image(image) => json!({
                                            "type": "image",
                                            "source": {
                                                "type": "base64",
                                                "media_type": image.mime_type,
                                                "data": image.data,
                                            }
                                        }),
                                    })
                                    .collect::<Vec<_>>(),
                                false,
                            ),
                            Err(e) => (
                                vec![json!({
                                    "type": "text",
                                    "text": format!("The tool call returned the following error:\n{}", e),
                                })],
                                true,
                            ),
                        };
                        blocks.push(json!({
                            "type": "tool_result",
                            "tool_use_id": response.id,
                            "content": content,
                            "is_error": is_error,
                        }));
                    }
                }
            }

            if blocks.is_empty() {
                continue;
            }

            match anthropic_messages.last_mut() {
                Some(last) if last["role"] == role => {
                    if let Some(existing) = last["content"].as_array_mut() {
                        existing.extend(blocks);
                    }
                }
                _ => anthropic_messages.push(json!({"role": role, "content": blocks})),
            }
        }

        (system_prompt, anthropic_messages)
    }

    fn tools_to_anthropic_spec(tools: &[Tool]) -> Vec<Value> {
        tools
            .iter()
            .map(|tool| {
                json!({
                    "name": tool.name,
                    "description": tool.description,
                    "input_schema": tool.input_schema,
                })
            })
            .collect()
    }

    fn response_to_message(response: &Value) -> Result<Message> {
        let blocks = response
            .get("content")
            .and_then(|c| c.as_array())
            .ok_or_else(|| anyhow!("Invalid response format from Anthropic API"))?;

        let mut message = Message::assistant();
        for block in blocks {
            match block.get("type").and_then(|t| t.as_str()) {
                Some("text") => {
                    if let Some(text) = block.get("text").and_then(|t| t.as_str()) {
                        message = message.with_text(text);
                    }
                }
                Some("tool_use") => {
                    let id = block["id"].as_str().unwrap_or_default().to_string();
                    message = match block["name"].as_str() {
                        Some(name) => message.with_tool_request(
                            id,
                            Ok(ToolCall::new(
                                name,
                                block.get("input").cloned().unwrap_or_else(|| json!({})),
                            )),
                        ),
                        None => {
                            let error = AgentError::InvalidParameters(format!(
                                "Tool use block {} had no name",
                                id
                            ));
                            message
                                .with_content(MessageContent::invalid_tool_request(id, "", error))
                        }
                    };
                }
                _ => {}
            }
        }
        Ok(message)
    }

    async fn post(&self, payload: Value) -> Result<Value> {
        let url = format!("{}/v1/messages", self.config.host.trim_end_matches('/'));

        let response = self
            .client
            .post(&url)
            .header("x-api-key", &self.config.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .json(&payload)
            .send()
            .await?;

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
impl Provider for AnthropicProvider {
    async fn complete(
        &self,
        system: &str,
        messages: &[Message],
        tools: &[Tool],
        options: &CompletionOptions,
    ) -> Result<(Message, Usage)> {
        let (system_prompt, anthropic_messages) =
            Self::messages_to_anthropic_spec(messages, system);

        let mut payload = json!({
            "model": self.config.model,
            "system": system_prompt,
            "messages": anthropic_messages,
            "max_tokens": options
                .max_tokens
                .or(self.config.max_tokens)
                .unwrap_or(DEFAULT_MAX_TOKENS),
        });
        let object = payload
            .as_object_mut()
            .ok_or_else(|| anyhow!("payload is not an object"))?;

        if !tools.is_empty() {
            object.insert("tools".to_string(), json!(Self::tools_to_anthropic_spec(tools)));
            if let ToolChoice::Required(name) = &options.tool_choice {
                object.insert(
                    "tool_choice".to_string(),
                    json!({"type": "tool", "name": name}),
                );
            }
        }
        if let Some(temp) = options.temperature.or(self.config.temperature) {
            object.insert("temperature".to_string(), json!(temp));
        }

        let response = self.post(payload).await?;
        let message = Self::response_to_message(&response)?;
        let usage = Self::get_usage(&response);

        Ok((message, usage))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn config(host: String) -> AnthropicProviderConfig {
        AnthropicProviderConfig {
            host,
            api_key: "test_api_key".to_string(),
            model: "claude-3-5-sonnet-20241022".to_string(),
            temperature: Some(0.7),
            max_tokens: None,
        }
    }

    #[tokio::test]
    async fn test_complete_basic() -> Result<()> {
        let mock_server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/messages"))
            .and(header("x-api-key", "test_api_key"))
            .and(header("anthropic-version", ANTHROPIC_VERSION))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "id": "msg_123",
                "type": "message",
                "role": "assistant",
                "content": [{"type": "text", "text": "Hello! How can I assist you today?"}],
                "stop_reason": "end_turn",
                "usage": {"input_tokens": 12, "output_tokens": 15}
            })))
            .mount(&mock_server)
            .await;

        let provider = AnthropicProvider::new(config(mock_server.uri()))?;
        let (message, usage) = provider
            .complete(
                "You are a helpful assistant.",
                &[Message::user().with_text("Hello?")],
                &[],
                &CompletionOptions::default(),
            )
            .await?;

        assert_eq!(
            message.content[0],
            MessageContent::text("Hello! How can I assist you today?")
        );
        assert_eq!(usage.input_tokens, Some(12));
        assert_eq!(usage.total_tokens, Some(27));
        Ok(())
    }

    #[tokio::test]
    async fn test_forced_tool_choice_and_tool_use() -> Result<()> {
        let mock_server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/messages"))
            .and(body_partial_json(json!({
                "tool_choice": {"type": "tool", "name": "response_formatter"}
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "content": [{
                    "type": "tool_use",
                    "id": "toolu_1",
                    "name": "response_formatter",
                    "input": {"conversation": []}
                }],
                "usage": {"input_tokens": 1, "output_tokens": 1}
            })))
            .mount(&mock_server)
            .await;

        let provider = AnthropicProvider::new(config(mock_server.uri()))?;
        let tool = Tool::new("response_formatter", "Format", json!({"type": "object"}));
        let options = CompletionOptions::default()
            .with_tool_choice(ToolChoice::Required("response_formatter".into()));
        let (message, _) = provider
            .complete("system", &[Message::user().with_text("hi")], &[tool], &options)
            .await?;

        let requests = message.tool_requests();
        assert_eq!(requests.len(), 1);
        assert_eq!(
            requests[0].tool_call.as_ref().unwrap().name,
            "response_formatter"
        );
        Ok(())
    }

    #[test]
    fn test_messages_merge_same_role_and_lift_system() {
        let messages = vec![
            Message::system().with_text("Pinned context"),
            Message::user().with_text("first"),
            Message::user().with_text("second"),
            Message::assistant()
                .with_tool_request("t1", Ok(ToolCall::new("pubmed_search", json!({})))),
            Message::user().with_tool_response("t1", Ok(vec![Content::text("done")])),
        ];
        let (system, spec) = AnthropicProvider::messages_to_anthropic_spec(&messages, "base");

        assert_eq!(system, "base\n\nPinned context");
        assert_eq!(spec.len(), 3);
        assert_eq!(spec[0]["content"].as_array().unwrap().len(), 2);
        assert_eq!(spec[1]["content"][0]["type"], "tool_use");
        assert_eq!(spec[2]["content"][0]["type"], "tool_result");
        assert_eq!(spec[2]["content"][0]["tool_use_id"], "t1");
    }

    #[test]
    fn test_unparseable_tool_call_pairs_with_its_result() {
        let error = AgentError::InvalidParameters("arguments were not valid JSON".into());
        let messages = vec![
            Message::user().with_text("Find papers on TP53"),
            Message::assistant().with_content(MessageContent::invalid_tool_request(
                "toolu_1",
                "pubmed.search",
                error.clone(),
            )),
            Message::user().with_tool_response("toolu_1", Err(error)),
        ];
        let (_, spec) = AnthropicProvider::messages_to_anthropic_spec(&messages, "base");

        assert_eq!(spec.len(), 3);
        let tool_use = &spec[1]["content"][0];
        assert_eq!(tool_use["type"], "tool_use");
        assert_eq!(tool_use["id"], "toolu_1");
        assert_eq!(tool_use["name"], "pubmed_search");
        assert_eq!(tool_use["input"], json!({}));
        let tool_result = &spec[2]["content"][0];
        assert_eq!(tool_result["type"], "tool_result");
        assert_eq!(tool_result["tool_use_id"], "toolu_1");
        assert_eq!(tool_result["is_error"], true);
    }
}
