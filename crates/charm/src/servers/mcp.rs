use async_trait::async_trait;
use reqwest::Client;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::Mutex;
use tracing::{debug, info};

use super::config::McpServerConfig;
use super::server::ToolServer;
use crate::errors::{ServerError, ServerResult};
use crate::models::tool::Tool;

const PROTOCOL_VERSION: &str = "2024-11-05";
const SESSION_HEADER: &str = "mcp-session-id";

/// The wire a JSON-RPC exchange travels over
pub enum Transport {
    /// A child process speaking newline-delimited JSON on stdin/stdout
    Stdio {
        // Held so the process lives exactly as long as the server handle
        _child: Child,
        stdin: ChildStdin,
        stdout: BufReader<ChildStdout>,
    },
    /// A streamable-HTTP endpoint
    Http {
        client: Client,
        url: String,
        session_id: Option<String>,
    },
}

impl Transport {
    fn spawn(
        name: &str,
        command: &str,
        args: &[String],
        env: &HashMap<String, String>,
    ) -> ServerResult<Self> {
        let mut child = Command::new(command)
            .args(args)
            .envs(env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| ServerError::Spawn {
                server: name.to_string(),
                reason: e.to_string(),
            })?;

        let stdin = child.stdin.take().ok_or_else(|| ServerError::Spawn {
            server: name.to_string(),
            reason: "stdin unavailable".to_string(),
        })?;
        let stdout = child.stdout.take().ok_or_else(|| ServerError::Spawn {
            server: name.to_string(),
            reason: "stdout unavailable".to_string(),
        })?;

        Ok(Transport::Stdio {
            _child: child,
            stdin,
            stdout: BufReader::new(stdout),
        })
    }

    fn http(url: &str) -> ServerResult<Self> {
        Ok(Transport::Http {
            client: Client::builder().build()?,
            url: url.to_string(),
            session_id: None,
        })
    }

    /// Send one message. For requests, wait for the response carrying the same id.
    async fn exchange(&mut self, message: &Value, id: Option<u64>) -> ServerResult<Option<Value>> {
        match self {
            Transport::Stdio { stdin, stdout, .. } => {
                let mut line = serde_json::to_string(message)?;
                line.push('\n');
                stdin.write_all(line.as_bytes()).await?;
                stdin.flush().await?;

                let Some(id) = id else {
                    return Ok(None);
                };
                let mut buffer = String::new();
                loop {
                    buffer.clear();
                    if stdout.read_line(&mut buffer).await? == 0 {
                        return Err(ServerError::Transport(
                            "tool server closed its output".to_string(),
                        ));
                    }
                    // Servers may interleave log lines and notifications
                    let Ok(value) = serde_json::from_str::<Value>(buffer.trim()) else {
                        continue;
                    };
                    if value.get("id").and_then(Value::as_u64) == Some(id) {
                        return Ok(Some(value));
                    }
                }
            }
            Transport::Http {
                client,
                url,
                session_id,
            } => {
                let mut request = client
                    .post(url.as_str())
                    .header("Accept", "application/json, text/event-stream")
                    .json(message);
                if let Some(session) = session_id.as_deref() {
                    request = request.header(SESSION_HEADER, session);
                }
                let response = request.send().await?;
                if !response.status().is_success() {
                    return Err(ServerError::Transport(format!(
                        "HTTP {} from tool server",
                        response.status()
                    )));
                }
                if let Some(session) = response
                    .headers()
                    .get(SESSION_HEADER)
                    .and_then(|v| v.to_str().ok())
                {
                    *session_id = Some(session.to_string());
                }

                let Some(id) = id else {
                    return Ok(None);
                };
                let is_event_stream = response
                    .headers()
                    .get(reqwest::header::CONTENT_TYPE)
                    .and_then(|v| v.to_str().ok())
                    .is_some_and(|v| v.starts_with("text/event-stream"));
                let body = response.text().await?;
                if is_event_stream {
                    find_event_response(&body, id).map(Some)
                } else {
                    Ok(Some(serde_json::from_str(&body)?))
                }
            }
        }
    }
}

/// Pick the JSON-RPC response with the given id out of an SSE body
fn find_event_response(body: &str, id: u64) -> ServerResult<Value> {
    body.lines()
        .filter_map(|line| line.strip_prefix("data:"))
        .filter_map(|data| serde_json::from_str::<Value>(data.trim()).ok())
        .find(|value| value.get("id").and_then(Value::as_u64) == Some(id))
        .ok_or_else(|| ServerError::Protocol(format!("no response for request {}", id)))
}

/// A Model Context Protocol client for one server. Exchanges are serialized through a
/// mutex, so one handle can be shared by concurrent chat requests.
pub struct McpServer {
    name: String,
    transport: Mutex<Transport>,
    next_id: AtomicU64,
}

impl McpServer {
    /// Start (or reach) the server described by `config` and run the initialize handshake
    pub async fn connect(name: &str, config: &McpServerConfig) -> ServerResult<Self> {
        let transport = match config {
            McpServerConfig::Stdio { command, args, env } => {
                Transport::spawn(name, command, args, env)?
            }
            McpServerConfig::Http { url } => Transport::http(url)?,
        };
        let server = Self::with_transport(name, transport);
        server.initialize().await?;
        info!(server = name, "connected to tool server");
        Ok(server)
    }

    pub fn with_transport(name: &str, transport: Transport) -> Self {
        Self {
            name: name.to_string(),
            transport: Mutex::new(transport),
            next_id: AtomicU64::new(1),
        }
    }

    async fn initialize(&self) -> ServerResult<()> {
        let result = self
            .request(
                "initialize",
                json!({
                    "protocolVersion": PROTOCOL_VERSION,
                    "capabilities": {},
                    "clientInfo": {
                        "name": "charm",
                        "version": env!("CARGO_PKG_VERSION"),
                    }
                }),
            )
            .await?;
        debug!(server = %self.name, info = %result["serverInfo"], "initialized");
        self.notify("notifications/initialized", json!({})).await
    }

    async fn request(&self, method: &str, params: Value) -> ServerResult<Value> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let message = json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": method,
            "params": params,
        });

        let response = {
            let mut transport = self.transport.lock().await;
            transport.exchange(&message, Some(id)).await?
        }
        .ok_or_else(|| ServerError::Protocol(format!("no response to {}", method)))?;

        if let Some(error) = response.get("error") {
            return Err(ServerError::Rpc {
                code: error.get("code").and_then(Value::as_i64).unwrap_or(-1),
                message: error
                    .get("message")
                    .and_then(Value::as_str)
                    .unwrap_or("unknown error")
                    .to_string(),
            });
        }
        response
            .get("result")
            .cloned()
            .ok_or_else(|| ServerError::Protocol(format!("{} response had no result", method)))
    }

    async fn notify(&self, method: &str, params: Value) -> ServerResult<()> {
        let message = json!({
            "jsonrpc": "2.0",
            "method": method,
            "params": params,
        });
        let mut transport = self.transport.lock().await;
        transport.exchange(&message, None).await?;
        Ok(())
    }
}

#[async_trait]
impl ToolServer for McpServer {
    fn name(&self) -> &str {
        &self.name
    }

    async fn list_tools(&self) -> ServerResult<Vec<Tool>> {
        let mut tools = Vec::new();
        let mut cursor: Option<String> = None;
        loop {
            let params = match &cursor {
                Some(cursor) => json!({"cursor": cursor}),
                None => json!({}),
            };
            let result = self.request("tools/list", params).await?;
            let listed = result
                .get("tools")
                .and_then(Value::as_array)
                .ok_or_else(|| ServerError::Protocol("tools/list without tools".to_string()))?;

            for tool in listed {
                let Some(name) = tool.get("name").and_then(Value::as_str) else {
                    continue;
                };
                tools.push(Tool::new(
                    name,
                    tool.get("description")
                        .and_then(Value::as_str)
                        .unwrap_or_default(),
                    tool.get("inputSchema")
                        .cloned()
                        .unwrap_or_else(|| json!({"type": "object", "properties": {}})),
                ));
            }

            cursor = result
                .get("nextCursor")
                .and_then(Value::as_str)
                .map(String::from);
            if cursor.is_none() {
                break;
            }
        }
        Ok(tools)
    }

    async fn call_tool(&self, tool: &str, arguments: Value) -> ServerResult<Value> {
        self.request("tools/call", json!({"name": tool, "arguments": arguments}))
            .await
    }
}
