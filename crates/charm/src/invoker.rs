use serde_json::Value;
use std::time::Duration;
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::aggregate::{BibliographyEntry, BinaryOutput, KnowledgeGraph, SidePayload};
use crate::errors::{AgentError, AgentResult};
use crate::models::content::Content;
use crate::registry::{QualifiedName, ToolRegistry};

const LITERATURE_TOOL_MARKERS: &[&str] = &["pubmed", "literature", "search_articles", "pubtator"];

/// Normalized outcome of one tool call
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ToolInvocationResult {
    /// What the model gets to read. When `error` is set this is failure text.
    pub content: Vec<Content>,
    pub side: SidePayload,
    pub error: Option<String>,
}

impl ToolInvocationResult {
    pub fn failure<S: Into<String>>(message: S, error: S) -> Self {
        Self {
            content: vec![Content::text(message)],
            side: SidePayload::default(),
            error: Some(error.into()),
        }
    }

    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }

    pub fn text(&self) -> String {
        self.content
            .iter()
            .map(Content::summary)
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// Shape for the conversation. A failed call keeps its advisory text so the model
    /// can recover from it.
    pub fn tool_result(&self) -> AgentResult<Vec<Content>> {
        match &self.error {
            None => Ok(self.content.clone()),
            Some(_) => Err(AgentError::ExecutionError(self.text())),
        }
    }
}

fn is_literature_tool(name: &QualifiedName) -> bool {
    let haystack = format!("{} {}", name.server_id, name.tool_id).to_lowercase();
    LITERATURE_TOOL_MARKERS
        .iter()
        .any(|marker| haystack.contains(marker))
}

/// Human-readable failure text, tailored to the tool's domain where we can
pub fn failure_message(name: &QualifiedName, reason: &str) -> String {
    if is_literature_tool(name) {
        format!(
            "The literature search could not be completed ({}). No new articles were retrieved; \
             answer from what is already known and tell the user the search was unavailable.",
            reason
        )
    } else {
        format!(
            "The tool {} could not be completed ({}). Continue without its output.",
            name, reason
        )
    }
}

/// Executes tool calls against their owning servers. Holds no per-request state, so one
/// invoker is shared by every request.
#[derive(Clone)]
pub struct ToolInvoker {
    registry: ToolRegistry,
    timeout: Duration,
}

impl ToolInvoker {
    pub fn new(registry: ToolRegistry, timeout: Duration) -> Self {
        Self { registry, timeout }
    }

    pub fn registry(&self) -> &ToolRegistry {
        &self.registry
    }

    /// Call a tool exactly once. Never fails: unknown tools, transport errors and
    /// timeouts all come back as error results.
    pub async fn invoke(&self, name: &QualifiedName, arguments: Value) -> ToolInvocationResult {
        let Some(server) = self.registry.server(&name.server_id) else {
            warn!(tool = %name, "unknown tool server");
            return ToolInvocationResult::failure(
                failure_message(name, "unknown tool"),
                format!("Tool not found: {}", name),
            );
        };

        debug!(tool = %name, "invoking tool");
        match timeout(self.timeout, server.call_tool(&name.tool_id, arguments)).await {
            Ok(Ok(raw)) => parse_envelope(name, raw),
            Ok(Err(e)) => {
                warn!(tool = %name, error = %e, "tool call failed");
                ToolInvocationResult::failure(failure_message(name, &e.to_string()), e.to_string())
            }
            Err(_) => {
                warn!(tool = %name, timeout = ?self.timeout, "tool call timed out");
                let reason = format!("timed out after {}s", self.timeout.as_secs());
                ToolInvocationResult::failure(failure_message(name, &reason), reason)
            }
        }
    }
}

fn content_block(block: &Value) -> Option<Content> {
    match block.get("type").and_then(Value::as_str)? {
        "text" => block.get("text").and_then(Value::as_str).map(Content::text),
        "image" => {
            let data = block.get("data").and_then(Value::as_str)?;
            let mime_type = block
                .get("mimeType")
                .and_then(Value::as_str)
                .unwrap_or("image/png");
            Some(Content::image(data, mime_type))
        }
        "resource" => {
            let resource = block.get("resource")?;
            match resource.get("text").and_then(Value::as_str) {
                Some(text) => Some(Content::text(text)),
                None => resource
                    .get("uri")
                    .and_then(Value::as_str)
                    .map(|uri| Content::text(format!("[resource: {}]", uri))),
            }
        }
        _ => None,
    }
}

/// Look for a side field at the top level of the envelope, then in `structuredContent`
fn side_field<'a>(raw: &'a Value, key: &str) -> Option<&'a Value> {
    raw.get(key)
        .or_else(|| raw.get("structuredContent").and_then(|s| s.get(key)))
        .filter(|v| !v.is_null())
}

fn extract_side_payload(name: &QualifiedName, raw: &Value) -> SidePayload {
    let mut side = SidePayload::default();

    if let Some(entries) = side_field(raw, "bibliography").and_then(Value::as_array) {
        for entry in entries {
            match serde_json::from_value::<BibliographyEntry>(entry.clone()) {
                Ok(entry) => side.bibliography.push(entry),
                Err(e) => debug!(tool = %name, error = %e, "skipping bibliography entry"),
            }
        }
    }

    if let Some(graph) = side_field(raw, "knowledgeGraph") {
        side.knowledge_graph = KnowledgeGraph::from_value(graph);
        if side.knowledge_graph.is_none() {
            warn!(tool = %name, "ignoring malformed knowledge graph");
        }
    }

    if let Some(binary) = side_field(raw, "binaryOutput") {
        let outputs = match binary {
            Value::Array(items) => items.clone(),
            single => vec![single.clone()],
        };
        for output in outputs {
            match serde_json::from_value::<BinaryOutput>(output) {
                Ok(output) => side.binary_outputs.push(output),
                Err(e) => warn!(tool = %name, error = %e, "ignoring malformed binary output"),
            }
        }
    }

    side
}

/// Normalize a raw `tools/call` result envelope
pub fn parse_envelope(name: &QualifiedName, raw: Value) -> ToolInvocationResult {
    let mut content: Vec<Content> = raw
        .get("content")
        .and_then(Value::as_array)
        .map(|blocks| blocks.iter().filter_map(content_block).collect())
        .unwrap_or_default();

    let side = extract_side_payload(name, &raw);
    let is_error = raw.get("isError").and_then(Value::as_bool).unwrap_or(false);

    if is_error {
        let reason = content
            .iter()
            .map(Content::summary)
            .collect::<Vec<_>>()
            .join("\n");
        let reason = if reason.is_empty() {
            "the tool reported an error".to_string()
        } else {
            reason
        };
        return ToolInvocationResult {
            content: vec![Content::text(failure_message(name, &reason))],
            side,
            error: Some(reason),
        };
    }

    if content.is_empty() {
        content.push(Content::text("The tool completed without returning any text."));
    }

    ToolInvocationResult {
        content,
        side,
        error: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::{ServerError, ServerResult};
    use crate::models::tool::Tool;
    use crate::servers::ToolServer;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct FlakyServer {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl ToolServer for FlakyServer {
        fn name(&self) -> &str {
            "pubmed"
        }

        async fn list_tools(&self) -> ServerResult<Vec<Tool>> {
            Ok(vec![])
        }

        async fn call_tool(&self, tool: &str, _arguments: Value) -> ServerResult<Value> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match tool {
                "slow" => {
                    tokio::time::sleep(Duration::from_secs(5)).await;
                    Ok(json!({}))
                }
                "broken" => Err(ServerError::Transport("connection reset".into())),
                _ => Ok(json!({"content": [{"type": "text", "text": "ok"}]})),
            }
        }
    }

    fn invoker(timeout: Duration) -> (ToolInvoker, Arc<FlakyServer>) {
        let server = Arc::new(FlakyServer {
            calls: AtomicUsize::new(0),
        });
        let registry = ToolRegistry::new(vec![server.clone() as Arc<dyn ToolServer>]);
        (ToolInvoker::new(registry, timeout), server)
    }

    #[tokio::test]
    async fn test_transport_failure_is_a_result_and_not_retried() {
        let (invoker, server) = invoker(Duration::from_secs(1));
        let result = invoker
            .invoke(&QualifiedName::new("pubmed", "broken"), json!({}))
            .await;

        assert!(result.is_error());
        assert!(result.text().contains("literature search could not be completed"));
        assert_eq!(server.calls.load(Ordering::SeqCst), 1);
        assert!(matches!(
            result.tool_result(),
            Err(AgentError::ExecutionError(_))
        ));
    }

    #[tokio::test]
    async fn test_timeout_is_a_result() {
        let (invoker, _) = invoker(Duration::from_millis(50));
        let result = invoker
            .invoke(&QualifiedName::new("pubmed", "slow"), json!({}))
            .await;
        assert!(result.error.as_deref().unwrap().contains("timed out"));
    }

    #[tokio::test]
    async fn test_unknown_server_is_a_result() {
        let (invoker, _) = invoker(Duration::from_secs(1));
        let result = invoker
            .invoke(&QualifiedName::new("graph", "query"), json!({}))
            .await;
        assert!(result.is_error());
        assert!(result.text().contains("graph:query"));
    }

    #[test]
    fn test_parse_envelope_extracts_side_payloads() {
        let raw = json!({
            "content": [
                {"type": "text", "text": "Found 2 articles"},
                {"type": "image", "data": "aGk=", "mimeType": "image/png"}
            ],
            "bibliography": [
                {"pmid": "111", "title": "A"},
                "not an entry",
                {"pmid": 222, "title": "B"}
            ],
            "knowledgeGraph": "{\"nodes\":[{\"id\":\"n\"}],\"links\":[]}",
            "binaryOutput": {"type": "image/png", "data": "aGk=", "metadata": {"size": 2}}
        });
        let result = parse_envelope(&QualifiedName::new("pubmed", "search"), raw);

        assert!(!result.is_error());
        assert_eq!(result.content.len(), 2);
        assert_eq!(result.side.bibliography.len(), 2);
        assert_eq!(result.side.bibliography[1].pmid.as_deref(), Some("222"));
        assert_eq!(result.side.knowledge_graph.as_ref().unwrap().nodes.len(), 1);
        assert_eq!(result.side.binary_outputs[0].mime_type, "image/png");
    }

    #[test]
    fn test_parse_envelope_structured_content_and_is_error() {
        let raw = json!({
            "content": [{"type": "text", "text": "rate limited"}],
            "isError": true,
            "structuredContent": {"bibliography": [{"pmid": "1"}]}
        });
        let result = parse_envelope(&QualifiedName::new("graph", "query"), raw);

        assert_eq!(result.error.as_deref(), Some("rate limited"));
        assert!(result.text().contains("graph:query"));
        assert_eq!(result.side.bibliography.len(), 1);
    }

    #[test]
    fn test_parse_envelope_empty_content() {
        let result = parse_envelope(&QualifiedName::new("s", "t"), json!({}));
        assert!(!result.is_error());
        assert_eq!(result.content.len(), 1);
        assert!(result.side.is_empty());
    }
}
