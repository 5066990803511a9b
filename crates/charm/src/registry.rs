use futures::future::join_all;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;
use tracing::{info, warn};

use crate::models::tool::Tool;
use crate::providers::base::NameDialect;
use crate::servers::ToolServer;

const MAX_TOOL_NAME_LEN: usize = 64;
const DEFAULT_DISCOVERY_TIMEOUT: Duration = Duration::from_secs(30);

/// The (server, tool) pair a tool originates from
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QualifiedName {
    pub server_id: String,
    pub tool_id: String,
}

impl QualifiedName {
    pub fn new<S: Into<String>, T: Into<String>>(server_id: S, tool_id: T) -> Self {
        Self {
            server_id: server_id.into(),
            tool_id: tool_id.into(),
        }
    }
}

impl fmt::Display for QualifiedName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.server_id, self.tool_id)
    }
}

/// A tool as offered to one provider, with the way back to its server
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolDescriptor {
    pub qualified_name: QualifiedName,
    pub display_name: String,
    pub description: String,
    pub input_schema: serde_json::Value,
}

/// The set of tools discovered for one request, and the table resolving the
/// provider-safe display names back to their qualified names
#[derive(Debug, Clone, Default)]
pub struct ToolCatalog {
    descriptors: Vec<ToolDescriptor>,
    tools: Vec<Tool>,
    by_display: HashMap<String, usize>,
}

impl ToolCatalog {
    /// Tools in the provider's dialect, ready to offer to the model
    pub fn tools(&self) -> &[Tool] {
        &self.tools
    }

    pub fn descriptors(&self) -> &[ToolDescriptor] {
        &self.descriptors
    }

    pub fn resolve(&self, display_name: &str) -> Option<&QualifiedName> {
        self.by_display
            .get(display_name)
            .map(|&index| &self.descriptors[index].qualified_name)
    }

    /// Server ids that contributed at least one tool, in discovery order
    pub fn server_names(&self) -> Vec<&str> {
        let mut seen = HashSet::new();
        self.descriptors
            .iter()
            .map(|d| d.qualified_name.server_id.as_str())
            .filter(|name| seen.insert(*name))
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.descriptors.is_empty()
    }

    fn insert(&mut self, qualified_name: QualifiedName, tool: &Tool, dialect: NameDialect) {
        let display_name = self.unique_display_name(&qualified_name, dialect);
        self.by_display
            .insert(display_name.clone(), self.descriptors.len());
        self.tools.push(Tool::new(
            display_name.clone(),
            tool.description.clone(),
            tool.input_schema.clone(),
        ));
        self.descriptors.push(ToolDescriptor {
            qualified_name,
            display_name,
            description: tool.description.clone(),
            input_schema: tool.input_schema.clone(),
        });
    }

    fn unique_display_name(&self, qualified_name: &QualifiedName, dialect: NameDialect) -> String {
        let base = display_name(qualified_name, dialect);
        if !self.by_display.contains_key(&base) {
            return base;
        }
        let mut n = 2;
        loop {
            let suffix = format!("_{}", n);
            let keep = MAX_TOOL_NAME_LEN.saturating_sub(suffix.len());
            let candidate = format!("{}{}", truncate(&base, keep), suffix);
            if !self.by_display.contains_key(&candidate) {
                return candidate;
            }
            n += 1;
        }
    }
}

fn truncate(name: &str, len: usize) -> &str {
    // Display names are ASCII after sanitizing, so byte slicing is safe
    &name[..name.len().min(len)]
}

/// `<server>_<tool>`, with every character outside the dialect replaced by `_`
pub fn display_name(qualified_name: &QualifiedName, dialect: NameDialect) -> String {
    let raw = format!("{}_{}", qualified_name.server_id, qualified_name.tool_id);
    let sanitized: String = raw
        .chars()
        .map(|c| if dialect.allows(c) { c } else { '_' })
        .collect();
    truncate(&sanitized, MAX_TOOL_NAME_LEN).to_string()
}

/// Shared, read-only view over the connected tool servers
#[derive(Clone)]
pub struct ToolRegistry {
    servers: Vec<Arc<dyn ToolServer>>,
    discovery_timeout: Duration,
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new(Vec::new())
    }
}

impl ToolRegistry {
    pub fn new(servers: Vec<Arc<dyn ToolServer>>) -> Self {
        Self {
            servers,
            discovery_timeout: DEFAULT_DISCOVERY_TIMEOUT,
        }
    }

    /// Bound on how long one server may take to list its tools
    pub fn with_discovery_timeout(mut self, discovery_timeout: Duration) -> Self {
        self.discovery_timeout = discovery_timeout;
        self
    }

    pub fn server(&self, server_id: &str) -> Option<&Arc<dyn ToolServer>> {
        self.servers.iter().find(|server| server.name() == server_id)
    }

    pub fn server_ids(&self) -> Vec<&str> {
        self.servers.iter().map(|server| server.name()).collect()
    }

    /// List tools from every server not in `blocked`, named for `dialect`. A server that
    /// fails to list its tools, or does not answer in time, is skipped for this request.
    pub async fn discover(&self, blocked: &[String], dialect: NameDialect) -> ToolCatalog {
        let active: Vec<_> = self
            .servers
            .iter()
            .filter(|server| !blocked.iter().any(|b| b == server.name()))
            .collect();

        let listings = join_all(
            active
                .iter()
                .map(|server| timeout(self.discovery_timeout, server.list_tools())),
        )
        .await;

        let mut catalog = ToolCatalog::default();
        for (server, listing) in active.iter().zip(listings) {
            match listing {
                Ok(Ok(tools)) => {
                    for tool in &tools {
                        let qualified_name = QualifiedName::new(server.name(), &tool.name);
                        catalog.insert(qualified_name, tool, dialect);
                    }
                }
                Ok(Err(e)) => warn!(server = server.name(), error = %e, "tool discovery failed"),
                Err(_) => warn!(
                    server = server.name(),
                    timeout = ?self.discovery_timeout,
                    "tool discovery timed out"
                ),
            }
        }
        info!(
            tools = catalog.descriptors.len(),
            blocked = blocked.len(),
            "discovered tools"
        );
        catalog
    }
}
