//! Ambient run context and the immutable per-run snapshot.
//!
//! The source language carried run/request/principal/tenant identity in
//! per-task context variables (see `SPEC_FULL.md` §9, Design Notes). Rust has
//! no equivalent ambient mechanism, so this crate makes the carrier explicit:
//! a [`RunContext`] value is threaded by the scheduler into every stage
//! invocation and into every [`EventSink`](crate::event::EventSink) emit.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;
use uuid::Uuid;

/// Identity carried through one pipeline run: ids that every event, log
/// line, and provider call record must be tagged with.
///
/// # Example
///
/// ```rust
/// use stageflow_kernel::context::RunContext;
/// use uuid::Uuid;
///
/// let ctx = RunContext::new(Uuid::new_v4(), "req-1".to_string(), Uuid::new_v4(), Uuid::new_v4());
/// assert_eq!(ctx.request_id, "req-1");
/// ```
#[derive(Debug, Clone)]
pub struct RunContext {
    pub run_id: Uuid,
    pub request_id: String,
    pub principal_id: Uuid,
    pub tenant_id: Uuid,
}

impl RunContext {
    pub fn new(run_id: Uuid, request_id: String, principal_id: Uuid, tenant_id: Uuid) -> Self {
        Self {
            run_id,
            request_id,
            principal_id,
            tenant_id,
        }
    }
}

/// Immutable per-run bundle built once by the Run Controller and read by
/// every stage. Never mutated after construction — stages that need to pass
/// data forward write to their own [`StageOutput`](crate::stage::StageOutput)
/// instead.
#[derive(Debug, Clone)]
pub struct ContextSnapshot {
    pub input_text: Option<String>,
    pub input_audio: Option<Arc<[u8]>>,
    pub messages: Vec<Message>,
    pub topology: String,
    pub channel: String,
    pub behavior: String,
    pub session_id: Uuid,
    /// Enrichment blocks (profile, memory, skills, …) keyed by name; kept as
    /// free-form JSON because their shape is owned by domain services (§1
    /// Out of scope).
    pub enrichment: HashMap<String, Value>,
}

/// A single message in the accumulated conversation history.
#[derive(Debug, Clone)]
pub struct Message {
    pub role: String,
    pub content: String,
}

impl ContextSnapshot {
    /// Build a snapshot for a text-only chat input, matching the minimal
    /// shape `ChatPipelineRunner` assembles before starting the graph.
    pub fn for_chat(topology: impl Into<String>, session_id: Uuid, input_text: impl Into<String>) -> Self {
        Self {
            input_text: Some(input_text.into()),
            input_audio: None,
            messages: Vec::new(),
            topology: topology.into(),
            channel: "chat".into(),
            behavior: "chat".into(),
            session_id,
            enrichment: HashMap::new(),
        }
    }

    /// Build a snapshot for a voice input carrying raw audio bytes.
    pub fn for_voice(topology: impl Into<String>, session_id: Uuid, audio: Arc<[u8]>) -> Self {
        Self {
            input_text: None,
            input_audio: Some(audio),
            messages: Vec::new(),
            topology: topology.into(),
            channel: "voice".into(),
            behavior: "voice".into(),
            session_id,
            enrichment: HashMap::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chat_snapshot_carries_input_text_and_channel() {
        let snapshot = ContextSnapshot::for_chat("chat_fast", Uuid::new_v4(), "Hello");
        assert_eq!(snapshot.input_text.as_deref(), Some("Hello"));
        assert_eq!(snapshot.channel, "chat");
        assert!(snapshot.input_audio.is_none());
    }

    #[test]
    fn voice_snapshot_carries_audio_and_no_text() {
        let audio: Arc<[u8]> = Arc::from(vec![1, 2, 3]);
        let snapshot = ContextSnapshot::for_voice("voice_fast", Uuid::new_v4(), audio);
        assert!(snapshot.input_text.is_none());
        assert_eq!(snapshot.input_audio.unwrap().len(), 3);
    }
}
