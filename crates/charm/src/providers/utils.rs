use anyhow::{anyhow, Result};
use lazy_static::lazy_static;
use regex::Regex;
use reqwest::StatusCode;
use serde_json::{json, Value};

use super::base::{CompletionOptions, ToolChoice};
use crate::errors::{AgentError, ProviderError};
use crate::models::content::{Content, ImageContent};
use crate::models::message::{Message, MessageContent, ToolRequest};
use crate::models::role::Role;
use crate::models::tool::{Tool, ToolCall};

/// Stand-in for a tool request that arrived without a usable name
pub const UNKNOWN_TOOL_NAME: &str = "unknown_tool";

lazy_static! {
    static ref INVALID_FUNCTION_CHARS: Regex = Regex::new(r"[^a-zA-Z0-9_-]").unwrap();
    static ref VALID_FUNCTION_NAME: Regex = Regex::new(r"^[a-zA-Z0-9_-]+$").unwrap();
}

fn openai_role(role: Role) -> &'static str {
    match role {
        Role::User | Role::Tool => "user",
        Role::Assistant => "assistant",
        Role::System => "system",
    }
}

/// Convert internal Message format to OpenAI's API message specification
pub fn messages_to_openai_spec(messages: &[Message]) -> Vec<Value> {
    let mut messages_spec = Vec::new();

    for message in messages {
        let mut converted = json!({
            "role": openai_role(message.role)
        });
        let mut texts = Vec::new();
        let mut tool_calls = Vec::new();
        let mut output = Vec::new();

        for content in &message.content {
            match content {
                MessageContent::Text(text) => {
                    if !text.text.is_empty() {
                        texts.push(text.text.clone());
                    }
                }
                MessageContent::ToolRequest(request) => {
                    // An unparseable call is replayed with empty arguments so its
                    // error response still pairs with it
                    let arguments = match &request.tool_call {
                        Ok(tool_call) => tool_call.arguments.to_string(),
                        Err(_) => "{}".to_string(),
                    };
                    tool_calls.push(json!({
                        "id": request.id,
                        "type": "function",
                        "function": {
                            "name": request_wire_name(request),
                            "arguments": arguments,
                        }
                    }));
                }
                MessageContent::ToolResponse(response) => match &response.tool_result {
                    Ok(contents) => {
                        let mut tool_text = Vec::new();
                        let mut image_messages = Vec::new();
                        for content in contents {
                            match content {
                                Content::Text(text) => tool_text.push(text.text.clone()),
                                Content::Image(image) => {
                                    tool_text.push(
                                        "This tool result included an image that is uploaded in the next message."
                                            .to_string(),
                                    );
                                    image_messages.push(json!({
                                        "role": "user",
                                        "content": [convert_image(image)]
                                    }));
                                }
                            }
                        }
                        output.push(json!({
                            "role": "tool",
                            "content": tool_text.join("\n"),
                            "tool_call_id": response.id
                        }));
                        output.extend(image_messages);
                    }
                    Err(e) => {
                        // Shown as output so the model can interpret the error
                        output.push(json!({
                            "role": "tool",
                            "content": format!("The tool call returned the following error:\n{}", e),
                            "tool_call_id": response.id
                        }));
                    }
                },
                MessageContent::Image(image) => {
                    converted["content"] = json!([convert_image(image)]);
                }
            }
        }

        if !texts.is_empty() && converted.get("content").is_none() {
            converted["content"] = json!(texts.join("\n"));
        }
        if !tool_calls.is_empty() {
            converted["tool_calls"] = json!(tool_calls);
        }
        if converted.get("content").is_some() || converted.get("tool_calls").is_some() {
            output.insert(0, converted);
        }
        messages_spec.extend(output);
    }

    messages_spec
}

/// Convert an image content into an OpenAI image_url part
pub fn convert_image(image: &ImageContent) -> Value {
    json!({
        "type": "image_url",
        "image_url": {
            "url": format!("data:{};base64,{}", image.mime_type, image.data)
        }
    })
}

/// Convert internal Tool format to OpenAI's API tool specification
pub fn tools_to_openai_spec(tools: &[Tool]) -> Result<Vec<Value>> {
    let mut tool_names = std::collections::HashSet::new();
    let mut result = Vec::new();

    for tool in tools {
        if !tool_names.insert(&tool.name) {
            return Err(anyhow!("Duplicate tool name: {}", tool.name));
        }

        result.push(json!({
            "type": "function",
            "function": {
                "name": tool.name,
                "description": tool.description,
                "parameters": tool.input_schema,
            }
        }));
    }

    Ok(result)
}

/// OpenAI-dialect `tool_choice`, or None when the default applies
pub fn tool_choice_to_openai_spec(choice: &ToolChoice) -> Option<Value> {
    match choice {
        ToolChoice::Auto => None,
        ToolChoice::Required(name) => Some(json!({
            "type": "function",
            "function": {"name": name}
        })),
    }
}

/// Convert OpenAI's API response to internal Message format
pub fn openai_response_to_message(response: Value) -> Result<Message> {
    let original = response["choices"][0]["message"].clone();
    let mut content = Vec::new();

    if let Some(text) = original.get("content") {
        if let Some(text_str) = text.as_str() {
            content.push(MessageContent::text(text_str));
        }
    }

    if let Some(tool_calls) = original.get("tool_calls") {
        if let Some(tool_calls_array) = tool_calls.as_array() {
            for tool_call in tool_calls_array {
                let id = tool_call["id"].as_str().unwrap_or_default().to_string();
                let function_name = tool_call["function"]["name"]
                    .as_str()
                    .unwrap_or_default()
                    .to_string();
                let arguments = tool_call["function"]["arguments"]
                    .as_str()
                    .unwrap_or_default()
                    .to_string();

                if !is_valid_function_name(&function_name) {
                    let error = AgentError::ToolNotFound(format!(
                        "The provided function name '{}' had invalid characters, it must match this regex [a-zA-Z0-9_-]+",
                        function_name
                    ));
                    content.push(MessageContent::invalid_tool_request(
                        id,
                        function_name,
                        error,
                    ));
                    continue;
                }

                // Some models send an empty string when the tool takes no arguments
                let arguments = if arguments.trim().is_empty() {
                    "{}".to_string()
                } else {
                    arguments
                };
                match serde_json::from_str::<Value>(&arguments) {
                    Ok(params) => {
                        content.push(MessageContent::tool_request(
                            id,
                            Ok(ToolCall::new(&function_name, params)),
                        ));
                    }
                    Err(e) => {
                        let error = AgentError::InvalidParameters(format!(
                            "Could not interpret tool use parameters for id {}: {}",
                            id, e
                        ));
                        content.push(MessageContent::invalid_tool_request(
                            id,
                            function_name,
                            error,
                        ));
                    }
                }
            }
        }
    }

    Ok(Message {
        role: Role::Assistant,
        created: chrono::Utc::now().timestamp(),
        content,
    })
}

/// Build a chat-completions payload shared by the OpenAI-compatible providers
pub fn openai_chat_payload(
    model: &str,
    system: &str,
    messages: &[Message],
    tools: &[Tool],
    options: &CompletionOptions,
    default_temperature: Option<f32>,
    default_max_tokens: Option<i32>,
) -> Result<Value> {
    let system_message = json!({
        "role": "system",
        "content": system
    });

    let mut messages_array = vec![system_message];
    messages_array.extend(messages_to_openai_spec(messages));

    let mut payload = json!({
        "model": model,
        "messages": messages_array
    });
    let object = payload
        .as_object_mut()
        .ok_or_else(|| anyhow!("payload is not an object"))?;

    if !tools.is_empty() {
        object.insert("tools".to_string(), json!(tools_to_openai_spec(tools)?));
        if let Some(choice) = tool_choice_to_openai_spec(&options.tool_choice) {
            object.insert("tool_choice".to_string(), choice);
        }
    }
    if let Some(temp) = options.temperature.or(default_temperature) {
        object.insert("temperature".to_string(), json!(temp));
    }
    if let Some(tokens) = options.max_tokens.or(default_max_tokens) {
        object.insert("max_tokens".to_string(), json!(tokens));
    }

    Ok(payload)
}

pub fn sanitize_function_name(name: &str) -> String {
    INVALID_FUNCTION_CHARS.replace_all(name, "_").to_string()
}

/// Name to send back for a tool request when replaying history
pub fn request_wire_name(request: &ToolRequest) -> String {
    match request.name().map(sanitize_function_name) {
        Some(name) if !name.is_empty() => name,
        _ => UNKNOWN_TOOL_NAME.to_string(),
    }
}

pub fn is_valid_function_name(name: &str) -> bool {
    VALID_FUNCTION_NAME.is_match(name)
}

pub fn check_openai_context_length_error(error: &Value) -> Option<ProviderError> {
    let code = error.get("code")?.as_str()?;
    if code == "context_length_exceeded" || code == "string_above_max_length" {
        let message = error
            .get("message")
            .and_then(|m| m.as_str())
            .unwrap_or("Unknown error")
            .to_string();
        Some(ProviderError::ContextLengthExceeded(message))
    } else {
        None
    }
}

/// Map a non-success HTTP status to the provider error taxonomy
pub fn classify_http_error(status: StatusCode, body: &str) -> ProviderError {
    let detail = format!("{} - {}", status, body);
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => ProviderError::Authentication(detail),
        StatusCode::TOO_MANY_REQUESTS => ProviderError::RateLimited(detail),
        status if status.is_server_error() => ProviderError::Server(detail),
        _ => ProviderError::Request(detail),
    }
}

pub fn get_openai_usage(data: &Value) -> super::base::Usage {
    let usage = &data["usage"];
    let input_tokens = usage
        .get("prompt_tokens")
        .and_then(|v| v.as_i64())
        .map(|v| v as i32);
    let output_tokens = usage
        .get("completion_tokens")
        .and_then(|v| v.as_i64())
        .map(|v| v as i32);
    let total_tokens = usage
        .get("total_tokens")
        .and_then(|v| v.as_i64())
        .map(|v| v as i32)
        .or_else(|| match (input_tokens, output_tokens) {
            (Some(input), Some(output)) => Some(input + output),
            _ => None,
        });
    super::base::Usage::new(input_tokens, output_tokens, total_tokens)
}
