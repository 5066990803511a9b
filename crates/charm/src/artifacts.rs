use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use strum_macros::{Display, EnumIter, EnumString};
use uuid::Uuid;

use crate::aggregate::{BinaryOutput, SideChannel};

/// The content kinds an artifact can carry
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString, EnumIter,
)]
#[strum(ascii_case_insensitive)]
pub enum ArtifactType {
    #[serde(rename = "text/markdown", alias = "markdown")]
    #[strum(to_string = "text/markdown", serialize = "markdown")]
    Markdown,
    #[serde(rename = "application/vnd.ant.code", alias = "code")]
    #[strum(to_string = "application/vnd.ant.code", serialize = "code")]
    Code,
    #[serde(rename = "image/svg+xml", alias = "svg")]
    #[strum(to_string = "image/svg+xml", serialize = "svg")]
    Svg,
    #[serde(rename = "application/vnd.mermaid", alias = "mermaid")]
    #[strum(to_string = "application/vnd.mermaid", serialize = "mermaid")]
    Mermaid,
    #[serde(rename = "text/html", alias = "html")]
    #[strum(to_string = "text/html", serialize = "html")]
    Html,
    #[serde(rename = "application/vnd.react", alias = "react")]
    #[strum(to_string = "application/vnd.react", serialize = "react")]
    React,
    #[serde(rename = "application/vnd.bibliography", alias = "bibliography")]
    #[strum(to_string = "application/vnd.bibliography", serialize = "bibliography")]
    Bibliography,
    #[serde(rename = "application/vnd.knowledge-graph", alias = "knowledge-graph")]
    #[strum(to_string = "application/vnd.knowledge-graph", serialize = "knowledge-graph")]
    KnowledgeGraph,
    #[serde(rename = "image/png", alias = "png")]
    #[strum(to_string = "image/png", serialize = "png")]
    Png,
    #[serde(rename = "application/json", alias = "json")]
    #[strum(to_string = "application/json", serialize = "json")]
    Json,
}

/// An immutable piece of rich content referenced from the conversation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Artifact {
    pub id: String,
    #[serde(rename = "type")]
    pub artifact_type: ArtifactType,
    pub title: String,
    pub content: String,
    pub position: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
}

/// One segment of the final answer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ConversationItem {
    Text {
        content: String,
    },
    #[serde(rename_all = "camelCase")]
    Artifact {
        artifact_id: String,
    },
}

/// The structured response handed back to the caller
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoreFormat {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thinking: Option<String>,
    pub conversation: Vec<ConversationItem>,
    pub artifacts: Vec<Artifact>,
}

impl StoreFormat {
    /// The structure used when the provider did not produce a formatted answer
    pub fn fallback<S: Into<String>>(text: S) -> Self {
        Self {
            thinking: None,
            conversation: vec![ConversationItem::Text {
                content: text.into(),
            }],
            artifacts: Vec::new(),
        }
    }

    pub fn push_text<S: Into<String>>(&mut self, text: S) {
        let content = text.into();
        if !content.trim().is_empty() {
            self.conversation.push(ConversationItem::Text { content });
        }
    }

    /// Append an artifact at the next available position and reference it from the
    /// conversation. Returns the new artifact's id.
    pub fn push_artifact(
        &mut self,
        artifact_type: ArtifactType,
        title: impl Into<String>,
        content: impl Into<String>,
        language: Option<String>,
    ) -> String {
        let position = self.next_position();
        let id = Uuid::new_v4().to_string();
        self.artifacts.push(Artifact {
            id: id.clone(),
            artifact_type,
            title: title.into(),
            content: content.into(),
            position,
            language,
        });
        self.conversation.push(ConversationItem::Artifact {
            artifact_id: id.clone(),
        });
        id
    }

    pub fn next_position(&self) -> usize {
        self.artifacts
            .iter()
            .map(|a| a.position + 1)
            .max()
            .unwrap_or(0)
    }

    /// All text segments joined, for callers that only render plain text
    pub fn plain_text(&self) -> String {
        self.conversation
            .iter()
            .filter_map(|item| match item {
                ConversationItem::Text { content } => Some(content.as_str()),
                ConversationItem::Artifact { .. } => None,
            })
            .collect::<Vec<_>>()
            .join("\n\n")
    }
}

/// Fold the aggregated side-channel data into the formatted answer. Bibliography and
/// knowledge graph become at most one artifact each; every binary output becomes one
/// or more.
pub fn synthesize(mut store: StoreFormat, side: SideChannel) -> StoreFormat {
    if !side.bibliography.is_empty() {
        let content = serde_json::to_string_pretty(side.bibliography.entries())
            .unwrap_or_else(|_| "[]".to_string());
        store.push_artifact(ArtifactType::Bibliography, "Bibliography", content, None);
    }

    if let Some(graph) = side.knowledge_graph.filter(|g| !g.is_empty()) {
        let content = serde_json::to_string(&graph).unwrap_or_else(|_| "{}".to_string());
        store.push_artifact(ArtifactType::KnowledgeGraph, "Knowledge Graph", content, None);
    }

    for output in side.binary_outputs {
        push_binary_output(&mut store, output);
    }

    store
}

fn push_binary_output(store: &mut StoreFormat, output: BinaryOutput) {
    let title = output
        .metadata
        .get("title")
        .and_then(Value::as_str)
        .map(String::from)
        .unwrap_or_else(|| format!("Generated {}", output.mime_type));

    match output.mime_type.as_str() {
        "image/png" => {
            store.push_artifact(ArtifactType::Png, title, output.data, None);
        }
        "image/svg+xml" => {
            store.push_artifact(ArtifactType::Svg, title, decode_text(&output.data), None);
        }
        "application/json" => {
            store.push_artifact(ArtifactType::Json, title, decode_text(&output.data), None);
        }
        "text/html" => {
            store.push_artifact(ArtifactType::Html, title, decode_text(&output.data), None);
        }
        // No artifact type of their own; embedded so the real MIME type survives
        mime if mime.starts_with("image/") => {
            let content = format!("![{}](data:{};base64,{})", title, mime, output.data.trim());
            store.push_artifact(ArtifactType::Markdown, title, content, None);
        }
        _ => {
            store.push_artifact(ArtifactType::Markdown, title, decode_text(&output.data), None);
        }
    }

    // The code that produced the output travels along as its own artifact
    if let Some(source) = output.metadata.get("sourceCode").and_then(Value::as_str) {
        let language = output
            .metadata
            .get("language")
            .and_then(Value::as_str)
            .unwrap_or("python")
            .to_string();
        store.push_artifact(ArtifactType::Code, "Source code", source, Some(language));
    }
}

/// Text payloads may arrive base64-encoded or raw
fn decode_text(data: &str) -> String {
    STANDARD
        .decode(data.trim())
        .ok()
        .and_then(|bytes| String::from_utf8(bytes).ok())
        .unwrap_or_else(|| data.to_string())
}
