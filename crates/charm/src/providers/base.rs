use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::models::message::Message;
use crate::models::tool::Tool;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Usage {
    pub input_tokens: Option<i32>,
    pub output_tokens: Option<i32>,
    pub total_tokens: Option<i32>,
}

impl Usage {
    pub fn new(
        input_tokens: Option<i32>,
        output_tokens: Option<i32>,
        total_tokens: Option<i32>,
    ) -> Self {
        Self {
            input_tokens,
            output_tokens,
            total_tokens,
        }
    }
}

/// How the provider may pick among the offered tools
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum ToolChoice {
    /// The model decides whether to call a tool at all
    #[default]
    Auto,
    /// The model must answer by calling exactly this tool
    Required(String),
}

/// Per-call knobs. Values left unset fall back to the provider's configuration.
#[derive(Debug, Clone, Default)]
pub struct CompletionOptions {
    pub temperature: Option<f32>,
    pub max_tokens: Option<i32>,
    pub tool_choice: ToolChoice,
}

impl CompletionOptions {
    pub fn with_tool_choice(mut self, tool_choice: ToolChoice) -> Self {
        self.tool_choice = tool_choice;
        self
    }
}

/// The identifier syntax a provider accepts for tool names
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NameDialect {
    /// `[A-Za-z0-9_-]`
    Permissive,
    /// `[A-Za-z0-9_]`
    Strict,
}

impl NameDialect {
    pub fn allows(&self, c: char) -> bool {
        match self {
            NameDialect::Permissive => c.is_ascii_alphanumeric() || c == '_' || c == '-',
            NameDialect::Strict => c.is_ascii_alphanumeric() || c == '_',
        }
    }
}

/// Base trait for AI providers (OpenAI, Anthropic, etc)
#[async_trait]
pub trait Provider: Send + Sync {
    /// Generate the next message given the running conversation and the offered tools
    async fn complete(
        &self,
        system: &str,
        messages: &[Message],
        tools: &[Tool],
        options: &CompletionOptions,
    ) -> Result<(Message, Usage)>;

    /// Tool identifier syntax this provider accepts
    fn name_dialect(&self) -> NameDialect {
        NameDialect::Permissive
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_usage_creation() {
        let usage = Usage::new(Some(10), Some(20), Some(30));
        assert_eq!(usage.input_tokens, Some(10));
        assert_eq!(usage.output_tokens, Some(20));
        assert_eq!(usage.total_tokens, Some(30));
    }

    #[test]
    fn test_usage_serialization() -> Result<()> {
        let usage = Usage::new(Some(10), Some(20), Some(30));
        let json_value = serde_json::to_value(&usage)?;
        assert_eq!(json_value["input_tokens"], json!(10));
        assert_eq!(json_value["output_tokens"], json!(20));
        assert_eq!(json_value["total_tokens"], json!(30));
        Ok(())
    }

    #[test]
    fn test_name_dialects() {
        assert!(NameDialect::Permissive.allows('-'));
        assert!(!NameDialect::Strict.allows('-'));
        assert!(!NameDialect::Permissive.allows(':'));
        assert!(NameDialect::Strict.allows('_'));
    }
}
