use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::debug;
use uuid::Uuid;

use crate::artifacts::{Artifact, StoreFormat};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum EventPayload {
    Status { message: String },
    Thinking { message: String },
    Content { content: String },
    Artifact { artifact: Artifact },
    Error { message: String },
    Result { response: StoreFormat },
}

/// One line of the outbound stream
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamEvent {
    #[serde(flatten)]
    pub payload: EventPayload,
    pub id: String,
    pub timestamp: DateTime<Utc>,
}

impl StreamEvent {
    pub fn new(payload: EventPayload) -> Self {
        Self {
            payload,
            id: Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
        }
    }

    /// Terminal events close the stream
    pub fn is_terminal(&self) -> bool {
        matches!(
            self.payload,
            EventPayload::Result { .. } | EventPayload::Error { .. }
        )
    }

    /// Newline-delimited JSON encoding
    pub fn to_ndjson(&self) -> String {
        let mut line = serde_json::to_string(self).unwrap_or_else(|e| {
            format!(
                "{{\"type\":\"error\",\"message\":\"unserializable event: {}\",\"id\":\"{}\",\"timestamp\":\"{}\"}}",
                e,
                self.id,
                self.timestamp.to_rfc3339()
            )
        });
        line.push('\n');
        line
    }
}

/// Request-scoped handle for progress events. Passed explicitly down the call chain;
/// sending never fails the caller, a dropped receiver just marks the sink closed.
#[derive(Debug, Clone)]
pub struct StatusSink {
    tx: Option<mpsc::Sender<StreamEvent>>,
}

impl StatusSink {
    pub fn new(tx: mpsc::Sender<StreamEvent>) -> Self {
        Self { tx: Some(tx) }
    }

    pub fn channel(buffer: usize) -> (Self, mpsc::Receiver<StreamEvent>) {
        let (tx, rx) = mpsc::channel(buffer);
        (Self::new(tx), rx)
    }

    /// A sink that drops everything, for callers that only want the final value
    pub fn discard() -> Self {
        Self { tx: None }
    }

    pub fn is_closed(&self) -> bool {
        self.tx.as_ref().is_some_and(|tx| tx.is_closed())
    }

    /// Returns false when the receiving side has gone away
    pub async fn send(&self, payload: EventPayload) -> bool {
        let Some(tx) = &self.tx else {
            return true;
        };
        if tx.send(StreamEvent::new(payload)).await.is_err() {
            debug!("status receiver dropped");
            return false;
        }
        true
    }

    pub async fn status<S: Into<String>>(&self, message: S) -> bool {
        self.send(EventPayload::Status {
            message: message.into(),
        })
        .await
    }

    pub async fn thinking<S: Into<String>>(&self, message: S) -> bool {
        self.send(EventPayload::Thinking {
            message: message.into(),
        })
        .await
    }

    pub async fn content<S: Into<String>>(&self, content: S) -> bool {
        self.send(EventPayload::Content {
            content: content.into(),
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;

    #[test]
    fn test_event_ndjson_shape() {
        let event = StreamEvent::new(EventPayload::Status {
            message: "Searching PubMed".into(),
        });
        let line = event.to_ndjson();
        assert!(line.ends_with('\n'));
        assert_eq!(line.matches('\n').count(), 1);

        let value: Value = serde_json::from_str(line.trim_end()).unwrap();
        assert_eq!(value["type"], "status");
        assert_eq!(value["message"], "Searching PubMed");
        assert!(value["id"].is_string());
        assert!(value["timestamp"].is_string());

        let parsed: StreamEvent = serde_json::from_value(value).unwrap();
        assert_eq!(parsed, event);
        assert!(!parsed.is_terminal());
    }

    #[test]
    fn test_result_event_is_terminal() {
        let event = StreamEvent::new(EventPayload::Result {
            response: StoreFormat::fallback("done"),
        });
        assert!(event.is_terminal());
        let value: Value = serde_json::from_str(&event.to_ndjson()).unwrap();
        assert_eq!(value["response"]["conversation"][0]["content"], "done");
    }

    #[tokio::test]
    async fn test_sink_reports_closed_receiver() {
        let (sink, mut rx) = StatusSink::channel(4);
        assert!(sink.status("one").await);
        assert_eq!(
            rx.recv().await.unwrap().payload,
            EventPayload::Status {
                message: "one".into()
            }
        );

        drop(rx);
        assert!(sink.is_closed());
        assert!(!sink.thinking("two").await);

        let discard = StatusSink::discard();
        assert!(!discard.is_closed());
        assert!(discard.content("ignored").await);
    }
}
