//! Side-channel data accumulated across the tool calls of one request.
//!
//! Both merges are first-seen-wins: an incoming bibliography entry or graph node whose
//! key is already present is dropped, never overwritten. That makes them idempotent, and
//! order only matters for which attribute set survives a key collision.
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};
use std::collections::HashSet;

/// Accept an identifier written either as a string or as a number
fn deserialize_loose_id<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Option::<Value>::deserialize(deserializer)? {
        Some(Value::String(s)) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Some(Value::Number(n)) => Some(n.to_string()),
        _ => None,
    })
}

/// Graph endpoints may come back from a renderer as `{ "id": ... }` objects
fn deserialize_endpoint<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    match Value::deserialize(deserializer)? {
        Value::String(s) => Ok(s),
        Value::Number(n) => Ok(n.to_string()),
        Value::Object(object) => match object.get("id") {
            Some(Value::String(s)) => Ok(s.clone()),
            Some(Value::Number(n)) => Ok(n.to_string()),
            _ => Err(serde::de::Error::custom("link endpoint object without id")),
        },
        other => Err(serde::de::Error::custom(format!(
            "invalid link endpoint: {}",
            other
        ))),
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BibliographyEntry {
    #[serde(
        default,
        deserialize_with = "deserialize_loose_id",
        skip_serializing_if = "Option::is_none"
    )]
    pub pmid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub doi: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub authors: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub journal: Option<String>,
    #[serde(
        default,
        deserialize_with = "deserialize_loose_id",
        skip_serializing_if = "Option::is_none"
    )]
    pub year: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl BibliographyEntry {
    /// Dedup key: PMID, then DOI, then the normalized title, then the whole entry
    pub fn key(&self) -> String {
        if let Some(pmid) = &self.pmid {
            return format!("pmid:{}", pmid);
        }
        if let Some(doi) = &self.doi {
            return format!("doi:{}", doi.to_lowercase());
        }
        if let Some(title) = &self.title {
            return format!("title:{}", title.trim().to_lowercase());
        }
        format!("raw:{}", serde_json::to_string(self).unwrap_or_default())
    }
}

/// An ordered set of bibliography entries, unique by [`BibliographyEntry::key`]
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Bibliography {
    entries: Vec<BibliographyEntry>,
    keys: HashSet<String>,
}

impl Bibliography {
    /// Append entries whose key is new, in incoming order. Returns how many were added.
    pub fn merge<I>(&mut self, incoming: I) -> usize
    where
        I: IntoIterator<Item = BibliographyEntry>,
    {
        let before = self.entries.len();
        for entry in incoming {
            if self.keys.insert(entry.key()) {
                self.entries.push(entry);
            }
        }
        self.entries.len() - before
    }

    pub fn entries(&self) -> &[BibliographyEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl FromIterator<BibliographyEntry> for Bibliography {
    fn from_iter<I: IntoIterator<Item = BibliographyEntry>>(iter: I) -> Self {
        let mut bibliography = Bibliography::default();
        bibliography.merge(iter);
        bibliography
    }
}

/// Pure form of [`Bibliography::merge`]
pub fn merge_bibliography(
    current: &[BibliographyEntry],
    incoming: &[BibliographyEntry],
) -> Vec<BibliographyEntry> {
    let mut merged: Bibliography = current.iter().cloned().collect();
    merged.merge(incoming.iter().cloned());
    merged.entries
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphNode {
    #[serde(deserialize_with = "deserialize_endpoint")]
    pub id: String,
    #[serde(flatten)]
    pub attributes: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphLink {
    #[serde(deserialize_with = "deserialize_endpoint")]
    pub source: String,
    #[serde(deserialize_with = "deserialize_endpoint")]
    pub target: String,
    #[serde(default, alias = "relation", alias = "predicate")]
    pub label: String,
    #[serde(flatten)]
    pub attributes: Map<String, Value>,
}

impl GraphLink {
    fn key(&self) -> (String, String, String) {
        (self.source.clone(), self.target.clone(), self.label.clone())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct KnowledgeGraph {
    #[serde(default)]
    pub nodes: Vec<GraphNode>,
    #[serde(default)]
    pub links: Vec<GraphLink>,
}

impl KnowledgeGraph {
    /// Union `incoming` into this graph: nodes by id, links by (source, target, relation).
    /// Existing nodes keep their attributes.
    pub fn merge(&mut self, incoming: KnowledgeGraph) {
        let mut node_ids: HashSet<String> = self.nodes.iter().map(|n| n.id.clone()).collect();
        let mut link_keys: HashSet<(String, String, String)> =
            self.links.iter().map(GraphLink::key).collect();

        for node in incoming.nodes {
            if node_ids.insert(node.id.clone()) {
                self.nodes.push(node);
            }
        }
        for link in incoming.links {
            if link_keys.insert(link.key()) {
                self.links.push(link);
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty() && self.links.is_empty()
    }

    /// Parse a graph from either a JSON object or a JSON-encoded string
    pub fn from_value(value: &Value) -> Option<Self> {
        let graph = match value {
            Value::String(raw) => serde_json::from_str(raw).ok()?,
            Value::Object(_) => serde_json::from_value(value.clone()).ok()?,
            _ => return None,
        };
        Some(graph)
    }
}

/// Pure form of [`KnowledgeGraph::merge`]
pub fn merge_knowledge_graphs(
    current: &KnowledgeGraph,
    incoming: &KnowledgeGraph,
) -> KnowledgeGraph {
    let mut merged = current.clone();
    merged.merge(incoming.clone());
    merged
}

/// A file-like output produced by a tool, such as a rendered plot
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BinaryOutput {
    #[serde(alias = "type")]
    pub mime_type: String,
    pub data: String,
    #[serde(default)]
    pub metadata: Value,
}

/// Side payloads pulled out of one tool result
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SidePayload {
    pub bibliography: Vec<BibliographyEntry>,
    pub knowledge_graph: Option<KnowledgeGraph>,
    pub binary_outputs: Vec<BinaryOutput>,
}

impl SidePayload {
    pub fn is_empty(&self) -> bool {
        self.bibliography.is_empty()
            && self.knowledge_graph.is_none()
            && self.binary_outputs.is_empty()
    }
}

/// Per-request accumulator threaded through the reasoning loop alongside the messages
#[derive(Debug, Clone, Default)]
pub struct SideChannel {
    pub bibliography: Bibliography,
    pub knowledge_graph: Option<KnowledgeGraph>,
    pub binary_outputs: Vec<BinaryOutput>,
}

impl SideChannel {
    pub fn absorb(&mut self, payload: SidePayload) {
        self.bibliography.merge(payload.bibliography);
        if let Some(graph) = payload.knowledge_graph {
            match &mut self.knowledge_graph {
                Some(current) => current.merge(graph),
                None => self.knowledge_graph = Some(graph),
            }
        }
        self.binary_outputs.extend(payload.binary_outputs);
    }
}
