//! The reasoning loop: alternates provider turns and tool calls until the model stops
//! asking for tools, then formats the answer and folds in the side-channel data.
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::aggregate::{KnowledgeGraph, SideChannel};
use crate::artifacts::{synthesize, ConversationItem, StoreFormat};
use crate::errors::AgentError;
use crate::events::{EventPayload, StatusSink};
use crate::formatter::ResponseFormatter;
use crate::invoker::{ToolInvocationResult, ToolInvoker};
use crate::models::message::{Message, MessageContent, ToolRequest};
use crate::prompt_template::{system_prompt, PinnedContext};
use crate::providers::base::{CompletionOptions, Provider};
use crate::registry::ToolCatalog;

/// Substituted for the provider's answer when a reasoning turn times out
pub const PROVIDER_TIMEOUT_MESSAGE: &str =
    "The model took too long to respond, so this answer is based on the information gathered so far.";

#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub provider_timeout: Duration,
    pub max_tool_rounds: usize,
    /// Tool id whose `nextThoughtNeeded` result decides whether the loop continues
    pub sequential_thinking_tool: String,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            provider_timeout: Duration::from_secs(120),
            max_tool_rounds: 25,
            sequential_thinking_tool: "sequential-thinking".to_string(),
        }
    }
}

/// A knowledge graph the user carried over from an earlier conversation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PinnedGraph {
    pub id: String,
    pub title: String,
    /// The graph itself, as an object or a JSON-encoded string
    pub content: Value,
}

impl PinnedGraph {
    fn content_text(&self) -> String {
        match &self.content {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ChatRequest {
    pub message: String,
    pub history: Vec<Message>,
    pub blocked_servers: Vec<String>,
    pub pinned_graph: Option<PinnedGraph>,
    pub temperature: Option<f32>,
    pub max_tokens: Option<i32>,
}

#[derive(Debug, thiserror::Error)]
pub enum AgentFailure {
    #[error("{0}")]
    Provider(anyhow::Error),
    #[error("Could not build the system prompt: {0}")]
    Prompt(#[from] tera::Error),
    #[error("Request cancelled by the client")]
    Cancelled,
}

enum LoopState {
    Thinking,
    ToolUse(Message),
    Done,
}

/// Request-scoped state of one run of the loop
struct Turn {
    catalog: ToolCatalog,
    system: String,
    options: CompletionOptions,
    messages: Vec<Message>,
    side: SideChannel,
    last_text: String,
    rounds: usize,
}

/// Drives one provider against the shared tool invoker. Cheap to clone; one agent can
/// serve concurrent requests because all per-request state lives in [`Turn`].
#[derive(Clone)]
pub struct Agent {
    provider: Arc<dyn Provider>,
    invoker: ToolInvoker,
    config: AgentConfig,
}

impl Agent {
    pub fn new(provider: Arc<dyn Provider>, invoker: ToolInvoker, config: AgentConfig) -> Self {
        Self {
            provider,
            invoker,
            config,
        }
    }

    fn ensure_open(&self, sink: &StatusSink) -> Result<(), AgentFailure> {
        if sink.is_closed() {
            info!("client went away, stopping");
            return Err(AgentFailure::Cancelled);
        }
        Ok(())
    }

    async fn prepare(&self, request: ChatRequest, sink: &StatusSink) -> Result<Turn, AgentFailure> {
        sink.status("Discovering available tools").await;
        let catalog = self
            .invoker
            .registry()
            .discover(&request.blocked_servers, self.provider.name_dialect())
            .await;

        let mut side = SideChannel::default();
        let pinned_text = request.pinned_graph.as_ref().map(PinnedGraph::content_text);
        if let Some(pinned) = &request.pinned_graph {
            match KnowledgeGraph::from_value(&pinned.content) {
                Some(graph) => side.knowledge_graph = Some(graph),
                None => warn!(graph = %pinned.id, "pinned graph is not a knowledge graph"),
            }
        }
        let pinned = request
            .pinned_graph
            .as_ref()
            .zip(pinned_text.as_deref())
            .map(|(graph, content)| PinnedContext {
                title: &graph.title,
                content,
            });
        let system = system_prompt(catalog.server_names(), pinned)?;

        let mut messages = request.history;
        messages.push(Message::user().with_text(request.message));

        Ok(Turn {
            catalog,
            system,
            options: CompletionOptions {
                temperature: request.temperature,
                max_tokens: request.max_tokens,
                ..CompletionOptions::default()
            },
            messages,
            side,
            last_text: String::new(),
            rounds: 0,
        })
    }

    /// Run the loop to completion and return the synthesized answer. Progress goes to
    /// `sink`; the terminal event is left to the caller.
    pub async fn reply(
        &self,
        request: ChatRequest,
        sink: &StatusSink,
    ) -> Result<StoreFormat, AgentFailure> {
        let mut turn = self.prepare(request, sink).await?;

        let mut state = LoopState::Thinking;
        loop {
            state = match state {
                LoopState::Thinking => self.think(&mut turn, sink).await?,
                LoopState::ToolUse(response) => {
                    if self.use_tools(&mut turn, response, sink).await? {
                        LoopState::Done
                    } else {
                        LoopState::Thinking
                    }
                }
                LoopState::Done => break,
            };
        }

        self.ensure_open(sink)?;
        sink.status("Formatting the response").await;
        let store = ResponseFormatter::new(self.config.provider_timeout)
            .format(
                self.provider.as_ref(),
                &turn.system,
                &turn.messages,
                &turn.options,
                !turn.side.bibliography.is_empty(),
                &turn.last_text,
            )
            .await
            .map_err(AgentFailure::Provider)?;

        Ok(synthesize(store, turn.side))
    }

    async fn think(&self, turn: &mut Turn, sink: &StatusSink) -> Result<LoopState, AgentFailure> {
        self.ensure_open(sink)?;
        if turn.rounds >= self.config.max_tool_rounds {
            warn!(rounds = turn.rounds, "tool round limit reached");
            sink.status("Reached the tool call limit, preparing the answer")
                .await;
            return Ok(LoopState::Done);
        }
        turn.rounds += 1;
        sink.status(format!("Thinking (round {})", turn.rounds)).await;

        let call = self.provider.complete(
            &turn.system,
            &turn.messages,
            turn.catalog.tools(),
            &turn.options,
        );
        let (response, usage) = match timeout(self.config.provider_timeout, call).await {
            Ok(Ok(reply)) => reply,
            Ok(Err(e)) => return Err(AgentFailure::Provider(e)),
            Err(_) => {
                warn!(timeout = ?self.config.provider_timeout, "provider call timed out");
                sink.status("The model did not respond in time").await;
                turn.messages
                    .push(Message::assistant().with_text(PROVIDER_TIMEOUT_MESSAGE));
                turn.last_text = PROVIDER_TIMEOUT_MESSAGE.to_string();
                return Ok(LoopState::Done);
            }
        };
        debug!(
            round = turn.rounds,
            input_tokens = ?usage.input_tokens,
            output_tokens = ?usage.output_tokens,
            "provider turn"
        );

        let text = response.text();
        let has_text = !text.trim().is_empty();
        if has_text {
            turn.last_text = text.clone();
        }

        if response.tool_requests().is_empty() {
            turn.messages.push(response);
            return Ok(LoopState::Done);
        }
        // Text alongside tool calls is the model narrating its plan
        if has_text {
            sink.thinking(text).await;
        }
        Ok(LoopState::ToolUse(response))
    }

    /// Execute the requested calls in order. Returns true when the sequential-thinking
    /// tool ended the reasoning, in which case the remaining calls are skipped.
    async fn use_tools(
        &self,
        turn: &mut Turn,
        response: Message,
        sink: &StatusSink,
    ) -> Result<bool, AgentFailure> {
        let text = response.text();
        let requests: Vec<ToolRequest> = response.tool_requests().into_iter().cloned().collect();

        for (index, request) in requests.into_iter().enumerate() {
            self.ensure_open(sink)?;

            let mut call_message = Message::assistant();
            if index == 0 && !text.trim().is_empty() {
                call_message = call_message.with_text(text.clone());
            }
            let call_message =
                call_message.with_content(MessageContent::ToolRequest(request.clone()));

            let call = match request.tool_call {
                Ok(call) => call,
                Err(e) => {
                    turn.messages.push(call_message);
                    turn.messages
                        .push(Message::user().with_tool_response(&request.id, Err(e)));
                    continue;
                }
            };

            let Some(qualified_name) = turn.catalog.resolve(&call.name).cloned() else {
                warn!(tool = %call.name, "model asked for an unknown tool");
                turn.messages.push(call_message);
                turn.messages.push(Message::user().with_tool_response(
                    &request.id,
                    Err(AgentError::ToolNotFound(call.name.clone())),
                ));
                continue;
            };

            sink.status(format!("Calling {}", qualified_name)).await;
            let mut result = self.invoker.invoke(&qualified_name, call.arguments).await;
            let side = std::mem::take(&mut result.side);
            if result.is_error() {
                sink.status(format!("{} failed, continuing without it", qualified_name))
                    .await;
            }
            turn.side.absorb(side);

            turn.messages.push(call_message);
            turn.messages
                .push(Message::user().with_tool_response(&request.id, result.tool_result()));

            if qualified_name.tool_id == self.config.sequential_thinking_tool {
                if let Some(thought) = current_thought(&result) {
                    sink.thinking(thought).await;
                }
                if !next_thought_needed(&result) {
                    info!("sequential thinking finished");
                    return Ok(true);
                }
            }
        }
        Ok(false)
    }

    /// Run a request and report its outcome on `sink`: the answer's segments as
    /// `content` and `artifact` events, then exactly one `result` or `error` event.
    pub async fn run(&self, request: ChatRequest, sink: &StatusSink) {
        match self.reply(request, sink).await {
            Ok(store) => {
                for item in &store.conversation {
                    if let ConversationItem::Text { content } = item {
                        sink.content(content.clone()).await;
                    }
                }
                for artifact in &store.artifacts {
                    sink.send(EventPayload::Artifact {
                        artifact: artifact.clone(),
                    })
                    .await;
                }
                sink.send(EventPayload::Result { response: store }).await;
            }
            Err(AgentFailure::Cancelled) => debug!("request cancelled"),
            Err(e) => {
                warn!(error = %e, "request failed");
                sink.send(EventPayload::Error {
                    message: e.to_string(),
                })
                .await;
            }
        }
    }
}

/// Malformed output counts as "no further thought needed"
fn next_thought_needed(result: &ToolInvocationResult) -> bool {
    if result.is_error() {
        return false;
    }
    serde_json::from_str::<Value>(&result.text())
        .ok()
        .and_then(|v| v.get("nextThoughtNeeded").and_then(Value::as_bool))
        .unwrap_or(false)
}

fn current_thought(result: &ToolInvocationResult) -> Option<String> {
    let value = serde_json::from_str::<Value>(&result.text()).ok()?;
    value
        .get("thought")
        .and_then(Value::as_str)
        .map(String::from)
}
