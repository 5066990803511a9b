use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::{BTreeMap, HashMap};
use std::path::Path;

/// How to reach one MCP server
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum McpServerConfig {
    Stdio {
        command: String,
        #[serde(default)]
        args: Vec<String>,
        #[serde(default)]
        env: HashMap<String, String>,
    },
    Http {
        url: String,
    },
}

/// The server description file, keyed by server id
#[derive(Debug, Clone, Deserialize)]
pub struct McpServersFile {
    #[serde(rename = "mcpServers")]
    pub mcp_servers: BTreeMap<String, McpServerConfig>,
}

/// Read the server description file, expanding `~` and `$VARS` in its path and in
/// each stdio command
pub fn load_server_configs(path: &str) -> Result<BTreeMap<String, McpServerConfig>> {
    let expanded = shellexpand::full(path)
        .with_context(|| format!("Could not expand MCP config path {}", path))?;
    let raw = std::fs::read_to_string(Path::new(expanded.as_ref()))
        .with_context(|| format!("Could not read MCP config at {}", expanded))?;
    let file: McpServersFile = serde_json::from_str(&raw)
        .with_context(|| format!("Invalid MCP config at {}", expanded))?;

    let mut servers = BTreeMap::new();
    for (name, config) in file.mcp_servers {
        let config = match config {
            McpServerConfig::Stdio { command, args, env } => McpServerConfig::Stdio {
                command: shellexpand::tilde(&command).into_owned(),
                args: args
                    .iter()
                    .map(|arg| shellexpand::tilde(arg).into_owned())
                    .collect(),
                env,
            },
            http => http,
        };
        servers.insert(name, config);
    }
    Ok(servers)
}
