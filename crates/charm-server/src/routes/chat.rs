use crate::state::AppState;
use axum::{
    extract::State,
    response::{IntoResponse, Response},
    routing::post,
    Json, Router,
};
use bytes::Bytes;
use charm::{
    agent::{ChatRequest, PinnedGraph},
    events::{EventPayload, StatusSink, StreamEvent},
    models::{message::Message, role::Role},
    providers::factory::ProviderType,
};
use futures::Stream;
use http::header;
use serde::Deserialize;
use serde_json::Value;
use std::{
    convert::Infallible,
    pin::Pin,
    task::{Context, Poll},
};
use tokio_stream::wrappers::ReceiverStream;

const EVENT_BUFFER: usize = 100;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatPayload {
    message: String,
    #[serde(default)]
    history: Vec<HistoryMessage>,
    #[serde(default)]
    model_provider: Option<ProviderType>,
    #[serde(default)]
    blocked_servers: Vec<String>,
    #[serde(default)]
    pinned_graph: Option<PinnedGraph>,
    #[serde(default)]
    temperature: Option<f32>,
    #[serde(default)]
    max_tokens: Option<i32>,
}

#[derive(Debug, Deserialize)]
struct HistoryMessage {
    role: Role,
    content: HistoryContent,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum HistoryContent {
    Text(String),
    Blocks(Vec<Value>),
}

impl HistoryContent {
    fn into_text(self) -> String {
        match self {
            HistoryContent::Text(text) => text,
            HistoryContent::Blocks(blocks) => blocks
                .iter()
                .filter_map(|block| block.get("text").and_then(Value::as_str))
                .collect::<Vec<_>>()
                .join("\n"),
        }
    }
}

// History arrives as plain text turns; earlier tool traffic is not replayed
fn convert_history(history: Vec<HistoryMessage>) -> Vec<Message> {
    history
        .into_iter()
        .filter_map(|msg| {
            let text = msg.content.into_text();
            if text.trim().is_empty() {
                return None;
            }
            let message = match msg.role {
                Role::User | Role::Tool => Message::user(),
                Role::Assistant => Message::assistant(),
                Role::System => Message::system(),
            };
            Some(message.with_text(text))
        })
        .collect()
}

impl ChatPayload {
    fn into_request(self) -> (Option<ProviderType>, ChatRequest) {
        (
            self.model_provider,
            ChatRequest {
                message: self.message,
                history: convert_history(self.history),
                blocked_servers: self.blocked_servers,
                pinned_graph: self.pinned_graph,
                temperature: self.temperature,
                max_tokens: self.max_tokens,
            },
        )
    }
}

/// Newline-delimited JSON stream of status events
pub struct NdjsonResponse {
    rx: ReceiverStream<StreamEvent>,
}

impl NdjsonResponse {
    fn new(rx: ReceiverStream<StreamEvent>) -> Self {
        Self { rx }
    }
}

impl Stream for NdjsonResponse {
    type Item = Result<Bytes, Infallible>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.rx)
            .poll_next(cx)
            .map(|opt| opt.map(|event| Ok(Bytes::from(event.to_ndjson()))))
    }
}

impl IntoResponse for NdjsonResponse {
    fn into_response(self) -> Response {
        let body = axum::body::Body::from_stream(self);
        (
            [
                (header::CONTENT_TYPE, "application/x-ndjson"),
                (header::CACHE_CONTROL, "no-cache"),
            ],
            body,
        )
            .into_response()
    }
}

async fn handler(
    State(state): State<AppState>,
    Json(payload): Json<ChatPayload>,
) -> NdjsonResponse {
    let (sink, rx) = StatusSink::channel(EVENT_BUFFER);
    let stream = ReceiverStream::new(rx);
    let (requested, request) = payload.into_request();

    tracing::info!(
        provider = ?requested,
        history = request.history.len(),
        blocked = request.blocked_servers.len(),
        "chat request"
    );

    // The agent runs detached; dropping the response body closes the sink and stops it
    tokio::spawn(async move {
        match state.agent(requested) {
            Ok(agent) => agent.run(request, &sink).await,
            Err(provider) => {
                tracing::error!(%provider, "provider is not configured");
                sink.send(EventPayload::Error {
                    message: format!("Provider {} is not configured", provider),
                })
                .await;
            }
        }
    });

    NdjsonResponse::new(stream)
}

pub fn routes(state: AppState) -> Router {
    Router::new()
        .route("/api/chat", post(handler))
        .with_state(state)
}
