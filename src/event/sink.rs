//! The Event Sink: durable and fire-and-forget emission, with client
//! transport fan-out.
//!
//! Grounded on `original_source/backend/app/ai/stageflow/events.py`'s
//! `WebSocketEventSink`: a single background task drains an internal
//! ordered queue (`start`/`stop`), `try_emit` is "spawn a task that calls the
//! durable path" rather than a separate code path, and persistence failures
//! are logged and swallowed rather than propagated.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use uuid::Uuid;

use super::types::{CorrelationIds, Event};
use crate::store::Store;

/// Event types forwarded to the client transport. Anything outside this
/// list is persisted but never reaches the Streaming Bridge.
const CLIENT_ALLOWLIST: &[&str] = &[
    super::types::kind::CHAT_TOKEN,
    super::types::kind::CHAT_TRANSCRIPT,
    super::types::kind::STATUS_UPDATE,
];

/// Accepts `(type, data)` pairs tagged with a run id, persists them through a
/// [`Store`], and forwards allowlisted types to a client-transport callback.
///
/// Two emission modes:
/// - [`EventSink::emit`] persists synchronously before returning.
/// - [`EventSink::try_emit`] schedules the persist on the sink's
///   single-writer background queue and returns immediately, while still
///   preserving per-run emit order.
pub struct EventSink {
    store: Arc<dyn Store>,
    queue_tx: mpsc::UnboundedSender<Event>,
    _drain_task: JoinHandle<()>,
    running: Arc<AtomicBool>,
    forward: Option<Arc<dyn Fn(&Event) + Send + Sync>>,
}

impl EventSink {
    /// Construct a sink backed by `store`, starting its background drain
    /// task immediately (idempotent start is enforced by construction —
    /// there is exactly one drain task per sink instance).
    pub fn new(store: Arc<dyn Store>) -> Self {
        let (queue_tx, mut queue_rx) = mpsc::unbounded_channel::<Event>();
        let running = Arc::new(AtomicBool::new(true));
        let drain_store = store.clone();
        let drain_running = running.clone();
        let drain_task = tokio::spawn(async move {
            while drain_running.load(Ordering::SeqCst) {
                match queue_rx.recv().await {
                    Some(event) => {
                        if let Err(err) = drain_store.append_event(event).await {
                            log::warn!("event sink: failed to persist queued event: {}", err);
                        }
                    }
                    None => break,
                }
            }
        });

        Self {
            store,
            queue_tx,
            _drain_task: drain_task,
            running,
            forward: None,
        }
    }

    /// Attach a callback invoked for every event whose type is on the
    /// client-transport allowlist. Used by the Streaming Bridge to receive
    /// `chat.token` / `chat.transcript` / `status.update` events without the
    /// sink depending on the bridge's concrete frame types.
    pub fn with_forwarder(mut self, forward: Arc<dyn Fn(&Event) + Send + Sync>) -> Self {
        self.forward = Some(forward);
        self
    }

    /// Durable emit: persists synchronously, then fans out to the client
    /// transport if the type is allowlisted. Used when ordering with a
    /// following write matters (e.g. `policy.blocked` before a rejection).
    pub async fn emit(
        &self,
        run_id: Uuid,
        event_type: impl Into<String>,
        data: Value,
        correlation: CorrelationIds,
    ) {
        let event = Event::new(run_id, event_type, data, correlation);
        if let Err(err) = self.store.append_event(event.clone()).await {
            log::warn!("event sink: durable emit failed, dropping event: {}", err);
            return;
        }
        self.fan_out(&event);
    }

    /// Fire-and-forget emit: enqueues onto the single-writer background
    /// queue and returns immediately. Used on hot paths (token streams).
    /// Logical order is preserved because the queue is FIFO and has exactly
    /// one reader.
    pub fn try_emit(
        &self,
        run_id: Uuid,
        event_type: impl Into<String>,
        data: Value,
        correlation: CorrelationIds,
    ) {
        let event = Event::new(run_id, event_type, data, correlation);
        self.fan_out(&event);
        if self.queue_tx.send(event).is_err() {
            log::warn!("event sink: queue closed, dropping event");
        }
    }

    fn fan_out(&self, event: &Event) {
        if let Some(forward) = &self.forward {
            if CLIENT_ALLOWLIST.contains(&event.event_type.as_str()) {
                forward(event);
            }
        }
    }

    /// Stop the background drain task. Idempotent.
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use std::sync::Mutex as StdMutex;

    #[tokio::test]
    async fn durable_emit_persists_before_returning() {
        let store = Arc::new(MemoryStore::new());
        let sink = EventSink::new(store.clone());
        let run_id = Uuid::new_v4();
        sink.emit(run_id, "pipeline.created", Value::Null, CorrelationIds::default())
            .await;

        let events = store.events_for(run_id).await;
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type, "pipeline.created");
    }

    #[tokio::test]
    async fn try_emit_preserves_order_via_single_writer_queue() {
        let store = Arc::new(MemoryStore::new());
        let sink = EventSink::new(store.clone());
        let run_id = Uuid::new_v4();

        for i in 0..20 {
            sink.try_emit(
                run_id,
                "chat.token",
                Event::payload([("seq", serde_json::json!(i))]),
                CorrelationIds::default(),
            );
        }

        // Give the background drain task a chance to run.
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        let events = store.events_for(run_id).await;
        assert_eq!(events.len(), 20);
        for (i, event) in events.iter().enumerate() {
            assert_eq!(event.data["seq"], serde_json::json!(i));
        }
    }

    #[tokio::test]
    async fn allowlisted_events_are_forwarded_others_are_not() {
        let store = Arc::new(MemoryStore::new());
        let forwarded = Arc::new(StdMutex::new(Vec::new()));
        let forwarded_clone = forwarded.clone();
        let sink = EventSink::new(store).with_forwarder(Arc::new(move |event: &Event| {
            forwarded_clone.lock().unwrap().push(event.event_type.clone());
        }));
        let run_id = Uuid::new_v4();

        sink.emit(run_id, "chat.token", Value::Null, CorrelationIds::default())
            .await;
        sink.emit(run_id, "stage.started", Value::Null, CorrelationIds::default())
            .await;

        let seen = forwarded.lock().unwrap().clone();
        assert_eq!(seen, vec!["chat.token".to_string()]);
    }
}
