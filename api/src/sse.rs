//! Server-Sent Events framing for streaming task output down to clients.
//!
//! Wraps a single outbound string channel and exposes the small set of
//! operations an LLM task orchestrator needs to emit progress to a client:
//! [`EventSender::send`], [`EventSender::send_with_fields`],
//! [`EventSender::send_error`], and [`EventSender::send_complete`].

use std::sync::Arc;

use serde::Serialize;
use serde_json::{Map, Value};
use tokio::sync::{Mutex, mpsc};

/// The known SSE event kinds this service emits.
#[derive(Copy, Clone, Debug, Eq, PartialEq, strum::Display)]
#[strum(serialize_all = "snake_case")]
pub enum EventKind {
    TaskStart,
    TaskGoal,
    TaskDeliverable,
    TaskEnd,
    RedefineTitle,
    RedefineGoal,
    Token,
    Error,
    Complete,
    TaskId,
    Fail,
}

/// A single rendered SSE frame pair (`event: ...` and `data: ...`), joined
/// with a blank line as required by the SSE wire format.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Frame(pub String);

impl Frame {
    fn new(kind: EventKind, data_json: &str) -> Self {
        Self(format!("event: {kind}\ndata: {data_json}\n\n"))
    }
}

/// Wraps a single outbound string channel; serializes writes with a mutex so
/// concurrent producers (e.g. the stream parser and a heartbeat task) can
/// never interleave frames.
#[derive(Clone)]
pub struct EventSender {
    inner: Arc<Mutex<mpsc::Sender<Frame>>>,
}

/// Errors closed over the send path: the receiver was dropped (client
/// disconnected) or the payload failed to serialize.
#[derive(Debug, thiserror::Error)]
pub enum SendError {
    #[error("client disconnected")]
    Closed,
    #[error("failed to serialize event payload: {0}")]
    Serialize(#[from] serde_json::Error),
}

impl EventSender {
    /// Builds a new sender/receiver pair. `buffer` controls how many frames
    /// may be queued before the producer suspends waiting for the consumer
    /// to drain; use a small buffer (e.g. 32) since SSE consumers are
    /// expected to keep up with LLM token output.
    pub fn channel(buffer: usize) -> (Self, mpsc::Receiver<Frame>) {
        let (tx, rx) = mpsc::channel(buffer);
        (
            Self {
                inner: Arc::new(Mutex::new(tx)),
            },
            rx,
        )
    }

    /// Sends `event: <kind>\ndata: <json>\n` where the JSON object carries
    /// `event` and `v` (the payload).
    pub async fn send(
        &self,
        kind: EventKind,
        payload: impl Serialize,
    ) -> Result<(), SendError> {
        self.send_with_fields(kind, payload, Map::new()).await
    }

    /// Like [`Self::send`] but merges `extra` keys into the JSON object
    /// alongside `event` and `v`.
    pub async fn send_with_fields(
        &self,
        kind: EventKind,
        payload: impl Serialize,
        extra: Map<String, Value>,
    ) -> Result<(), SendError> {
        let mut obj = extra;
        obj.insert("event".to_owned(), Value::String(kind.to_string()));
        obj.insert("v".to_owned(), serde_json::to_value(payload)?);
        let data_json = serde_json::to_string(&Value::Object(obj))?;
        self.send_frame(Frame::new(kind, &data_json)).await
    }

    /// Sends an `error` event carrying the error's display text.
    pub async fn send_error(&self, err: impl std::fmt::Display) -> Result<(), SendError> {
        self.send(EventKind::Error, format!("{err:#}")).await
    }

    /// Sends a `complete` event and closes the logical output. Subsequent
    /// sends on this [`EventSender`] will return [`SendError::Closed`] once
    /// the receiver has been dropped by the consumer.
    pub async fn send_complete(&self, msg: impl Serialize) -> Result<(), SendError> {
        self.send(EventKind::Complete, msg).await
    }

    async fn send_frame(&self, frame: Frame) -> Result<(), SendError> {
        let tx = self.inner.lock().await;
        tx.send(frame).await.map_err(|_| SendError::Closed)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[tokio::test]
    async fn send_produces_two_line_frame() {
        let (sender, mut rx) = EventSender::channel(8);
        sender.send(EventKind::Token, "hello").await.unwrap();
        let frame = rx.recv().await.unwrap();
        assert!(frame.0.starts_with("event: token\ndata: "));
        assert!(frame.0.contains("\"event\":\"token\""));
        assert!(frame.0.contains("\"v\":\"hello\""));
    }

    #[tokio::test]
    async fn send_with_fields_merges_extra_keys() {
        let (sender, mut rx) = EventSender::channel(8);
        let mut extra = Map::new();
        extra.insert("task_id".to_owned(), Value::from(42));
        sender
            .send_with_fields(EventKind::TaskId, "t-1", extra)
            .await
            .unwrap();
        let frame = rx.recv().await.unwrap();
        assert!(frame.0.contains("\"task_id\":42"));
    }

    #[tokio::test]
    async fn send_after_receiver_dropped_is_closed() {
        let (sender, rx) = EventSender::channel(8);
        drop(rx);
        let err = sender.send(EventKind::Token, "x").await.unwrap_err();
        assert!(matches!(err, SendError::Closed));
    }

    #[tokio::test]
    async fn concurrent_senders_never_interleave_frames() {
        let (sender, mut rx) = EventSender::channel(64);
        let s1 = sender.clone();
        let s2 = sender.clone();
        let h1 = tokio::spawn(async move {
            for i in 0..20 {
                s1.send(EventKind::Token, format!("a{i}")).await.unwrap();
            }
        });
        let h2 = tokio::spawn(async move {
            for i in 0..20 {
                s2.send(EventKind::Token, format!("b{i}")).await.unwrap();
            }
        });
        h1.await.unwrap();
        h2.await.unwrap();
        drop(sender);
        let mut count = 0;
        while let Some(frame) = rx.recv().await {
            // Every frame must be a complete, well-formed two-line pair.
            assert!(frame.0.starts_with("event: token\ndata: "));
            assert!(frame.0.ends_with("\n\n"));
            count += 1;
        }
        assert_eq!(count, 40);
    }
}
