//! Stage port injection (§4.4).
//!
//! The source resolves a stage's dependencies reflectively, via
//! `inspect.signature` over `__init__`
//! (`original_source/backend/app/ai/substrate/stages/pipeline.py::_get_init_params`)
//! against the frozen `StagePorts` dataclass
//! (`original_source/backend/app/ai/substrate/stages/ports.py`). Rust has no
//! runtime introspection equivalent, so this module keeps the *bundle*
//! (every field the source's `StagePorts` carries, field-for-field) but
//! replaces the reflective binding step with [`StageFactory`](super::StageFactory)
//! implementations that simply read the fields they need — "only the
//! parameters the constructor accepts are passed" becomes "the factory only
//! reads the fields its stage needs," the same effective behavior without
//! reflection.

use std::sync::Arc;

use tokio::sync::{mpsc, Mutex};

use crate::applier::AgentOutputApplier;
use crate::event::EventSink;
use crate::gateway::ProviderCallGateway;
use crate::policy::GuardrailsRegistry;
use crate::provider::{LlmProvider, SttProvider, TtsProvider};
use crate::streaming::StreamingBridge;

/// A retry helper a stage may use to invoke the gateway repeatedly; each
/// attempt is recorded by the gateway itself (§4.2 Retry).
pub type RetryFn = Arc<dyn Fn() -> u32 + Send + Sync>;

/// The frozen bag of typed capabilities a stage's factory may read from.
/// Every field is optional — a given run may omit capabilities it has no
/// use for, exactly as the source's injection only passes what a
/// constructor accepts.
#[derive(Clone)]
pub struct StagePorts {
    pub db_lock: Option<Arc<Mutex<()>>>,
    pub llm_provider: Option<Arc<dyn LlmProvider>>,
    pub stt_provider: Option<Arc<dyn SttProvider>>,
    pub tts_provider: Option<Arc<dyn TtsProvider>>,
    pub call_logger: Option<Arc<ProviderCallGateway>>,
    /// Lets a stage record a durable event (e.g. `chat.token`) alongside
    /// whatever it pushes onto `frame_tx`, so the run's event log and the
    /// client stream stay in sync without a stage depending on
    /// `RunController` directly.
    pub event_sink: Option<Arc<EventSink>>,
    pub retry_fn: Option<RetryFn>,
    /// Where a stage pushes client-bound frames. Backed by a
    /// [`StreamingBridge`] rather than a bare channel so non-terminal frames
    /// get the bounded drop-oldest treatment and terminal frames always get
    /// delivered (§4.8).
    pub frame_tx: Option<Arc<StreamingBridge>>,
    pub llm_chunk_tx: Option<mpsc::Sender<String>>,
    pub partial_text_tx: Option<mpsc::Sender<String>>,
    pub recording: bool,
    pub audio_data: Option<Arc<[u8]>>,
    pub audio_format: Option<String>,
    /// Guardrails checkpoints a stage evaluates itself (`pre_llm` inside
    /// `llm_stream`), rather than the controller gating the whole run.
    pub guardrails: Option<Arc<GuardrailsRegistry>>,
    /// Enforces `pre_action`/`pre_persist` caps on the agent's proposed
    /// output before `persist` writes anything.
    pub applier: Option<Arc<AgentOutputApplier>>,
}

impl Default for StagePorts {
    fn default() -> Self {
        Self {
            db_lock: None,
            llm_provider: None,
            stt_provider: None,
            tts_provider: None,
            call_logger: None,
            event_sink: None,
            retry_fn: None,
            frame_tx: None,
            llm_chunk_tx: None,
            partial_text_tx: None,
            recording: false,
            audio_data: None,
            audio_format: None,
            guardrails: None,
            applier: None,
        }
    }
}

impl StagePorts {
    pub fn with_llm_provider(mut self, provider: Arc<dyn LlmProvider>) -> Self {
        self.llm_provider = Some(provider);
        self
    }

    pub fn with_call_logger(mut self, gateway: Arc<ProviderCallGateway>) -> Self {
        self.call_logger = Some(gateway);
        self
    }

    pub fn with_frame_sender(mut self, bridge: Arc<StreamingBridge>) -> Self {
        self.frame_tx = Some(bridge);
        self
    }

    pub fn with_event_sink(mut self, sink: Arc<EventSink>) -> Self {
        self.event_sink = Some(sink);
        self
    }

    pub fn with_guardrails(mut self, guardrails: Arc<GuardrailsRegistry>) -> Self {
        self.guardrails = Some(guardrails);
        self
    }

    pub fn with_applier(mut self, applier: Arc<AgentOutputApplier>) -> Self {
        self.applier = Some(applier);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_ports_omit_every_capability() {
        let ports = StagePorts::default();
        assert!(ports.llm_provider.is_none());
        assert!(ports.frame_tx.is_none());
        assert!(!ports.recording);
    }
}
