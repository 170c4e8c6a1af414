//! Typed event records.
//!
//! The source emits events by dotted-namespace type string plus a free-form
//! payload (spec §3, Event). This module keeps that wire shape — `type` stays
//! a `String` so new event types a stage author invents do not require a
//! kernel release — but provides well-known constants for the type strings
//! this spec itself names, so call sites read like enum variants without
//! losing the open-namespace property the source relies on.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Well-known event type strings named by the spec. Not exhaustive — stage
/// authors may emit any dotted-namespace string they like.
pub mod kind {
    pub const PIPELINE_CREATED: &str = "pipeline.created";
    pub const PIPELINE_STARTED: &str = "pipeline.started";
    pub const PIPELINE_COMPLETED: &str = "pipeline.completed";
    pub const PIPELINE_FAILED: &str = "pipeline.failed";
    pub const PIPELINE_CANCELED: &str = "pipeline.canceled";
    pub const PIPELINE_CANCEL_REQUESTED: &str = "pipeline.cancel_requested";

    pub const STAGE_STARTED: &str = "stage.started";
    pub const STAGE_COMPLETED: &str = "stage.completed";
    pub const STAGE_FAILED: &str = "stage.failed";

    pub const POLICY_DECISION: &str = "policy.decision";
    pub const POLICY_BLOCKED: &str = "policy.blocked";
    pub const POLICY_ESCALATION_DENIED: &str = "policy.escalation.denied";

    pub const PROVIDER_CALL_SUCCEEDED: &str = "provider.call.succeeded";
    pub const PROVIDER_CALL_FAILED: &str = "provider.call.failed";

    pub const CIRCUIT_OPENED: &str = "circuit.opened";
    pub const CIRCUIT_CLOSED: &str = "circuit.closed";
    pub const CIRCUIT_OPEN_CALL_ALLOWED: &str = "circuit.open.call_allowed";

    pub const STREAM_DROPPED: &str = "stream.dropped";

    pub const AGENT_OUTPUT_ARTIFACTS_REJECTED: &str = "agent_output.artifacts.rejected";

    pub const CHAT_TOKEN: &str = "chat.token";
    pub const CHAT_TRANSCRIPT: &str = "chat.transcript";
    pub const STATUS_UPDATE: &str = "status.update";
    /// Durable marker of one synthesized audio chunk, mirroring `chat.token`
    /// for the voice channel; used to compute a run's time-to-first-audio.
    pub const VOICE_AUDIO_CHUNK: &str = "voice.audio_chunk";
}

/// Correlation ids carried on every event in addition to the run id.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CorrelationIds {
    pub request_id: Option<String>,
    pub session_id: Option<Uuid>,
    pub principal_id: Option<Uuid>,
    pub tenant_id: Option<Uuid>,
}

/// One append-only entry in a run's event log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub id: Uuid,
    pub run_id: Uuid,
    pub event_type: String,
    pub timestamp: DateTime<Utc>,
    pub data: Value,
    pub correlation: CorrelationIds,
}

impl Event {
    /// Construct a new event, freezing the current time as its timestamp.
    pub fn new(run_id: Uuid, event_type: impl Into<String>, data: Value, correlation: CorrelationIds) -> Self {
        Self {
            id: Uuid::new_v4(),
            run_id,
            event_type: event_type.into(),
            timestamp: Utc::now(),
            data,
            correlation,
        }
    }

    /// Build a `data` payload from key/value pairs; a small convenience so
    /// call sites don't hand-build `serde_json::Map` literals everywhere.
    pub fn payload(fields: impl IntoIterator<Item = (&'static str, Value)>) -> Value {
        let map: HashMap<&'static str, Value> = fields.into_iter().collect();
        serde_json::to_value(map).unwrap_or(Value::Null)
    }
}
