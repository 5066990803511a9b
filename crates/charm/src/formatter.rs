//! Forces the final answer into the structured response schema.
use serde_json::{json, Value};
use std::str::FromStr;
use std::time::Duration;
use tokio::time::timeout;
use tracing::{info, warn};

use crate::artifacts::{ArtifactType, StoreFormat};
use crate::errors::ProviderError;
use crate::models::message::Message;
use crate::models::tool::Tool;
use crate::prompt_template::formatter_prompt;
use crate::providers::base::{CompletionOptions, Provider, ToolChoice};

pub const FORMATTER_TOOL: &str = "response_formatter";

pub const FALLBACK_ANSWER: &str =
    "I was not able to put together a complete answer in time. Please try again, or narrow the question.";

/// The single tool the provider must call to deliver its answer
pub fn formatter_tool() -> Tool {
    let artifact_types: Vec<String> = [
        ArtifactType::Markdown,
        ArtifactType::Code,
        ArtifactType::Svg,
        ArtifactType::Mermaid,
        ArtifactType::Html,
        ArtifactType::React,
        ArtifactType::Json,
    ]
    .iter()
    .map(ToString::to_string)
    .collect();

    Tool::new(
        FORMATTER_TOOL,
        "Format the final answer as ordered text and artifact segments",
        json!({
            "type": "object",
            "properties": {
                "thinking": {
                    "type": "string",
                    "description": "Optional short summary of the reasoning behind the answer"
                },
                "conversation": {
                    "type": "array",
                    "description": "Answer segments in reading order",
                    "items": {
                        "type": "object",
                        "properties": {
                            "type": {"type": "string", "enum": ["text", "artifact"]},
                            "content": {"type": "string", "description": "Text for text segments"},
                            "artifact": {
                                "type": "object",
                                "properties": {
                                    "type": {"type": "string", "enum": artifact_types},
                                    "id": {"type": "string"},
                                    "title": {"type": "string"},
                                    "content": {"type": "string"},
                                    "language": {"type": "string"}
                                },
                                "required": ["type", "title", "content"]
                            }
                        },
                        "required": ["type"]
                    }
                }
            },
            "required": ["conversation"]
        }),
    )
}

/// Why a provider reply could not be used as a formatted answer
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum FormatViolation {
    #[error("provider answered without calling the formatter tool")]
    NoToolCall,
    #[error("formatter arguments were invalid: {0}")]
    InvalidArguments(String),
    #[error("formatted answer was empty")]
    Empty,
}

fn parse_artifact_type(artifact: &Value) -> ArtifactType {
    artifact
        .get("type")
        .and_then(Value::as_str)
        .and_then(|t| ArtifactType::from_str(t).ok())
        .unwrap_or_else(|| {
            if artifact.get("language").is_some() {
                ArtifactType::Code
            } else {
                ArtifactType::Markdown
            }
        })
}

/// Validate a provider reply against the formatter schema
pub fn parse_formatted(message: &Message) -> Result<StoreFormat, FormatViolation> {
    let call = message
        .tool_requests()
        .into_iter()
        .filter_map(|request| request.tool_call.as_ref().ok())
        .find(|call| call.name == FORMATTER_TOOL)
        .ok_or(FormatViolation::NoToolCall)?;

    // Some models double-encode the arguments
    let arguments = match &call.arguments {
        Value::String(raw) => serde_json::from_str(raw)
            .map_err(|e| FormatViolation::InvalidArguments(e.to_string()))?,
        other => other.clone(),
    };
    let conversation = match arguments.get("conversation") {
        Some(Value::Array(items)) => items.clone(),
        Some(Value::String(raw)) => serde_json::from_str::<Vec<Value>>(raw)
            .map_err(|e| FormatViolation::InvalidArguments(e.to_string()))?,
        _ => {
            return Err(FormatViolation::InvalidArguments(
                "conversation must be an array".to_string(),
            ))
        }
    };

    let mut store = StoreFormat {
        thinking: arguments
            .get("thinking")
            .and_then(Value::as_str)
            .filter(|t| !t.trim().is_empty())
            .map(String::from),
        ..StoreFormat::default()
    };

    for item in &conversation {
        match item.get("type").and_then(Value::as_str) {
            Some("text") => {
                if let Some(content) = item.get("content").and_then(Value::as_str) {
                    store.push_text(content);
                }
            }
            Some("artifact") => {
                let Some(artifact) = item.get("artifact") else {
                    continue;
                };
                let content = artifact
                    .get("content")
                    .and_then(Value::as_str)
                    .unwrap_or_default();
                if content.is_empty() {
                    continue;
                }
                let title = artifact
                    .get("title")
                    .and_then(Value::as_str)
                    .unwrap_or("Untitled");
                let language = artifact
                    .get("language")
                    .and_then(Value::as_str)
                    .map(String::from);
                store.push_artifact(parse_artifact_type(artifact), title, content, language);
            }
            _ => {}
        }
    }

    if store.conversation.is_empty() {
        return Err(FormatViolation::Empty);
    }
    Ok(store)
}

/// Issues the constrained provider call and degrades to a plain structure whenever the
/// provider does not comply or does not answer in time
pub struct ResponseFormatter {
    timeout: Duration,
}

impl ResponseFormatter {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    /// Only authentication failures are returned as errors; everything else degrades to
    /// `fallback_text`.
    pub async fn format(
        &self,
        provider: &dyn Provider,
        system: &str,
        messages: &[Message],
        options: &CompletionOptions,
        has_bibliography: bool,
        fallback_text: &str,
    ) -> anyhow::Result<StoreFormat> {
        let fallback_text = if fallback_text.trim().is_empty() {
            FALLBACK_ANSWER
        } else {
            fallback_text
        };

        let instructions = formatter_prompt(FORMATTER_TOOL, has_bibliography)?;
        let system = format!("{}\n\n{}", system, instructions);
        let mut messages = messages.to_vec();
        messages.push(
            Message::user()
                .with_text(format!("Format your final answer using the {} tool.", FORMATTER_TOOL)),
        );
        let options = options
            .clone()
            .with_tool_choice(ToolChoice::Required(FORMATTER_TOOL.to_string()));
        let tools = [formatter_tool()];

        let response = match timeout(
            self.timeout,
            provider.complete(&system, &messages, &tools, &options),
        )
        .await
        {
            Ok(Ok((response, _usage))) => response,
            Ok(Err(e)) => {
                if matches!(
                    e.downcast_ref::<ProviderError>(),
                    Some(ProviderError::Authentication(_))
                ) {
                    return Err(e);
                }
                warn!(error = %e, "formatting call failed, using plain answer");
                return Ok(StoreFormat::fallback(fallback_text));
            }
            Err(_) => {
                warn!(timeout = ?self.timeout, "formatting call timed out, using plain answer");
                return Ok(StoreFormat::fallback(fallback_text));
            }
        };

        match parse_formatted(&response) {
            Ok(store) => {
                info!(
                    segments = store.conversation.len(),
                    artifacts = store.artifacts.len(),
                    "formatted response"
                );
                Ok(store)
            }
            Err(violation) => {
                warn!(%violation, "formatter output rejected, using plain answer");
                let raw = response.text();
                let text = if raw.trim().is_empty() {
                    fallback_text
                } else {
                    raw.as_str()
                };
                Ok(StoreFormat::fallback(text))
            }
        }
    }
}
