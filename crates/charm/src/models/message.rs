use super::content::{Content, ImageContent, TextContent};
use super::role::Role;
use super::tool::ToolCall;
use crate::errors::{AgentError, AgentResult};
use chrono::Utc;

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct ToolRequest {
    pub id: String,
    pub tool_call: AgentResult<ToolCall>,
    /// Tool name as the provider sent it, kept when the call could not be parsed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw_name: Option<String>,
}

impl ToolRequest {
    /// The name this request was made under, parsed or not
    pub fn name(&self) -> Option<&str> {
        match &self.tool_call {
            Ok(call) => Some(&call.name),
            Err(_) => self.raw_name.as_deref(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct ToolResponse {
    pub id: String,
    pub tool_result: AgentResult<Vec<Content>>,
}

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
/// Content passed inside a message, which can be both simple content and tool content
pub enum MessageContent {
    Text(TextContent),
    Image(ImageContent),
    ToolRequest(ToolRequest),
    ToolResponse(ToolResponse),
}

impl MessageContent {
    pub fn text<S: Into<String>>(text: S) -> Self {
        MessageContent::Text(TextContent { text: text.into() })
    }

    pub fn tool_request<S: Into<String>>(id: S, tool_call: AgentResult<ToolCall>) -> Self {
        MessageContent::ToolRequest(ToolRequest {
            id: id.into(),
            tool_call,
            raw_name: None,
        })
    }

    /// A request the provider made but that could not be parsed into a [`ToolCall`]
    pub fn invalid_tool_request<S: Into<String>, N: Into<String>>(
        id: S,
        raw_name: N,
        error: AgentError,
    ) -> Self {
        MessageContent::ToolRequest(ToolRequest {
            id: id.into(),
            tool_call: Err(error),
            raw_name: Some(raw_name.into()),
        })
    }

    pub fn tool_response<S: Into<String>>(id: S, tool_result: AgentResult<Vec<Content>>) -> Self {
        MessageContent::ToolResponse(ToolResponse {
            id: id.into(),
            tool_result,
        })
    }

    pub fn as_tool_request(&self) -> Option<&ToolRequest> {
        if let MessageContent::ToolRequest(ref tool_request) = self {
            Some(tool_request)
        } else {
            None
        }
    }

    pub fn as_tool_response(&self) -> Option<&ToolResponse> {
        if let MessageContent::ToolResponse(ref tool_response) = self {
            Some(tool_response)
        } else {
            None
        }
    }

    /// Get the text content if this is a TextContent variant
    pub fn as_text(&self) -> Option<&str> {
        match self {
            MessageContent::Text(text) => Some(&text.text),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
/// A message to or from an LLM
pub struct Message {
    pub role: Role,
    pub created: i64,
    pub content: Vec<MessageContent>,
}

impl Message {
    fn with_role(role: Role) -> Self {
        Message {
            role,
            created: Utc::now().timestamp(),
            content: Vec::new(),
        }
    }

    /// Create a new user message with the current timestamp
    pub fn user() -> Self {
        Self::with_role(Role::User)
    }

    /// Create a new assistant message with the current timestamp
    pub fn assistant() -> Self {
        Self::with_role(Role::Assistant)
    }

    /// Create a new system message with the current timestamp
    pub fn system() -> Self {
        Self::with_role(Role::System)
    }

    /// Add any MessageContent to the message
    pub fn with_content(mut self, content: MessageContent) -> Self {
        self.content.push(content);
        self
    }

    /// Add text content to the message
    pub fn with_text<S: Into<String>>(self, text: S) -> Self {
        self.with_content(MessageContent::text(text))
    }

    /// Add a tool request to the message
    pub fn with_tool_request<S: Into<String>>(
        self,
        id: S,
        tool_call: AgentResult<ToolCall>,
    ) -> Self {
        self.with_content(MessageContent::tool_request(id, tool_call))
    }

    /// Add a tool response to the message
    pub fn with_tool_response<S: Into<String>>(
        self,
        id: S,
        result: AgentResult<Vec<Content>>,
    ) -> Self {
        self.with_content(MessageContent::tool_response(id, result))
    }

    /// All tool requests in this message, in the order the provider returned them
    pub fn tool_requests(&self) -> Vec<&ToolRequest> {
        self.content
            .iter()
            .filter_map(|content| content.as_tool_request())
            .collect()
    }

    /// Concatenated text content, one block per line
    pub fn text(&self) -> String {
        self.content
            .iter()
            .filter_map(|content| content.as_text())
            .collect::<Vec<_>>()
            .join("\n")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_tool_requests_keep_provider_order() {
        let message = Message::assistant()
            .with_text("Looking that up")
            .with_tool_request("1", Ok(ToolCall::new("pubmed_search", json!({"q": "a"}))))
            .with_tool_request("2", Err(AgentError::ToolNotFound("nope".into())));

        let requests = message.tool_requests();
        assert_eq!(requests.len(), 2);
        assert_eq!(requests[0].id, "1");
        assert_eq!(requests[1].id, "2");
        assert_eq!(message.text(), "Looking that up");
    }

    #[test]
    fn test_invalid_request_keeps_raw_name() {
        let content = MessageContent::invalid_tool_request(
            "3",
            "pubmed search!",
            AgentError::InvalidParameters("bad json".into()),
        );
        let request = content.as_tool_request().unwrap();
        assert!(request.tool_call.is_err());
        assert_eq!(request.name(), Some("pubmed search!"));

        let parsed = MessageContent::tool_request("4", Ok(ToolCall::new("kg_genes", json!({}))));
        assert_eq!(parsed.as_tool_request().unwrap().name(), Some("kg_genes"));
    }
}
