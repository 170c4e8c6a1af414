//! The Streaming Bridge (§4.8): transport-agnostic client frames delivered
//! over bounded, drop-oldest channels so a slow client never backpressures a
//! run.
//!
//! Grounded on `original_source/backend/app/ai/stageflow/bridge.py`'s
//! `StreamingBridge`, re-expressed without the source's WebSocket coupling:
//! this module only produces [`ClientFrame`] values on `tokio::sync::mpsc`
//! channels, per the transport-agnostic decision in `SPEC_FULL.md` §9.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::Serialize;
use serde_json::Value;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::event::{kind, CorrelationIds, Event, EventSink};

/// A frame destined for a single client connection. Serializable so a
/// transport adapter (outside this crate) can forward it verbatim as JSON.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    StatusUpdate { run_id: Uuid, status: String },
    ChatToken { run_id: Uuid, token: String },
    VoiceAudioChunk { run_id: Uuid, audio_base64: String },
    ChatTranscript { run_id: Uuid, text: String },
    ChatComplete { run_id: Uuid },
    VoiceComplete { run_id: Uuid },
    Error { run_id: Uuid, code: String, message: String },
}

impl ClientFrame {
    pub fn run_id(&self) -> Uuid {
        match self {
            ClientFrame::StatusUpdate { run_id, .. }
            | ClientFrame::ChatToken { run_id, .. }
            | ClientFrame::VoiceAudioChunk { run_id, .. }
            | ClientFrame::ChatTranscript { run_id, .. }
            | ClientFrame::ChatComplete { run_id }
            | ClientFrame::VoiceComplete { run_id }
            | ClientFrame::Error { run_id, .. } => *run_id,
        }
    }

    /// Terminal frames (completion or error) are always delivered, even to a
    /// full queue — per §4.8's "never drops a terminal frame" guarantee.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ClientFrame::ChatComplete { .. } | ClientFrame::VoiceComplete { .. } | ClientFrame::Error { .. }
        )
    }
}

/// Bridges the event sink's allowlisted events to a bounded per-run client
/// queue. Non-terminal frames are dropped (oldest first) rather than
/// blocking the run when a client falls behind; every drop emits
/// `stream.dropped` so observability sees it.
pub struct StreamingBridge {
    tx: mpsc::Sender<ClientFrame>,
    sink: Arc<EventSink>,
    dropped: Arc<AtomicU64>,
}

impl StreamingBridge {
    /// Create a bridge with a bounded channel of `capacity` frames, wired to
    /// forward allowlisted events from `sink` via `attach`.
    pub fn new(capacity: usize, sink: Arc<EventSink>) -> (Self, mpsc::Receiver<ClientFrame>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (
            Self {
                tx,
                sink,
                dropped: Arc::new(AtomicU64::new(0)),
            },
            rx,
        )
    }

    /// Push a frame onto the client queue. Terminal frames await capacity;
    /// non-terminal frames are dropped immediately if the queue is full.
    pub async fn push(&self, frame: ClientFrame) {
        if frame.is_terminal() {
            if self.tx.send(frame).await.is_err() {
                log::warn!("streaming bridge: client channel closed, dropping terminal frame");
            }
            return;
        }

        match self.tx.try_send(frame) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(frame)) => {
                self.dropped.fetch_add(1, Ordering::SeqCst);
                let run_id = frame.run_id();
                self.sink.try_emit(
                    run_id,
                    kind::STREAM_DROPPED,
                    Event::payload([("reason", serde_json::json!("client_queue_full"))]),
                    CorrelationIds::default(),
                );
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                log::warn!("streaming bridge: client channel closed, dropping frame");
            }
        }
    }

    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::SeqCst)
    }

    /// Translate a sink-forwarded event into a client frame, if its type is
    /// one the bridge understands. Events outside the allowlist never reach
    /// this function in practice, but unrecognized types are ignored rather
    /// than panicking.
    pub fn frame_for_event(event: &Event) -> Option<ClientFrame> {
        match event.event_type.as_str() {
            kind::CHAT_TOKEN => Some(ClientFrame::ChatToken {
                run_id: event.run_id,
                token: text_field(&event.data, "token"),
            }),
            kind::CHAT_TRANSCRIPT => Some(ClientFrame::ChatTranscript {
                run_id: event.run_id,
                text: text_field(&event.data, "text"),
            }),
            kind::STATUS_UPDATE => Some(ClientFrame::StatusUpdate {
                run_id: event.run_id,
                status: text_field(&event.data, "status"),
            }),
            _ => None,
        }
    }
}

fn text_field(data: &Value, field: &str) -> String {
    data.get(field).and_then(Value::as_str).unwrap_or_default().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    #[tokio::test]
    async fn non_terminal_frames_drop_oldest_when_the_queue_is_full() {
        let store = Arc::new(MemoryStore::new());
        let sink = Arc::new(EventSink::new(store.clone()));
        let (bridge, mut rx) = StreamingBridge::new(1, sink);
        let run_id = Uuid::new_v4();

        bridge
            .push(ClientFrame::ChatToken {
                run_id,
                token: "a".into(),
            })
            .await;
        bridge
            .push(ClientFrame::ChatToken {
                run_id,
                token: "b".into(),
            })
            .await;

        assert_eq!(bridge.dropped_count(), 1);
        let received = rx.recv().await.unwrap();
        match received {
            ClientFrame::ChatToken { token, .. } => assert_eq!(token, "a"),
            _ => panic!("unexpected frame"),
        }
    }

    #[tokio::test]
    async fn terminal_frames_are_never_dropped() {
        let store = Arc::new(MemoryStore::new());
        let sink = Arc::new(EventSink::new(store));
        let (bridge, mut rx) = StreamingBridge::new(1, sink);
        let run_id = Uuid::new_v4();

        bridge
            .push(ClientFrame::ChatToken {
                run_id,
                token: "a".into(),
            })
            .await;

        let bridge = Arc::new(bridge);
        let bridge_clone = bridge.clone();
        let send_task = tokio::spawn(async move {
            bridge_clone.push(ClientFrame::ChatComplete { run_id }).await;
        });

        let first = rx.recv().await.unwrap();
        matches!(first, ClientFrame::ChatToken { .. });
        send_task.await.unwrap();
        let second = rx.recv().await.unwrap();
        assert!(matches!(second, ClientFrame::ChatComplete { .. }));
    }
}
