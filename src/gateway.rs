//! The Provider Call Gateway (§4.2): the single entry point for every
//! external call, wrapping invocations with timing, a Provider Call Record,
//! and a per-`(operation, provider, model)` circuit breaker that is
//! deliberately **observe-only** — it never refuses a call.
//!
//! Grounded on
//! `original_source/backend/tests/integration/ai/test_circuit_breaker_observe_only.py`:
//! the breaker's tunables (failure threshold, open duration, failure window,
//! half-open probe count) are constructor fields, not hardcoded constants,
//! so a test can force an immediate open after a single failure.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::error::KernelError;
use crate::event::{kind, CorrelationIds, Event, EventSink};
use crate::pricing;
use crate::store::Store;

/// Tunables for one circuit breaker key. Defaults chosen to match §5's
/// stated provider-call timeout expectations; every field is overridable so
/// tests can force a breaker open after a single failure.
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    pub failure_threshold: u32,
    pub open_duration: Duration,
    pub failure_window: Duration,
    pub half_open_probe_count: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            open_duration: Duration::from_secs(60),
            failure_window: Duration::from_secs(60),
            half_open_probe_count: 1,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Clone)]
struct BreakerEntry {
    state: BreakerState,
    failures_in_window: u32,
    window_started_at: Instant,
    opened_at: Option<Instant>,
    half_open_probes_seen: u32,
}

impl BreakerEntry {
    fn new() -> Self {
        Self {
            state: BreakerState::Closed,
            failures_in_window: 0,
            window_started_at: Instant::now(),
            opened_at: None,
            half_open_probes_seen: 0,
        }
    }
}

/// Global per-key circuit breaker state, guarded by a single mutex. §5 calls
/// out that read-modify-write sequences here are short and must not block
/// provider calls — the mutex is only ever held across a HashMap lookup and
/// a handful of field writes.
struct CircuitBreaker {
    config: CircuitBreakerConfig,
    states: Mutex<HashMap<(String, String, String), BreakerEntry>>,
}

impl CircuitBreaker {
    fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            states: Mutex::new(HashMap::new()),
        }
    }

    async fn before_call(&self, key: &(String, String, String)) -> BreakerState {
        let mut states = self.states.lock().await;
        let entry = states.entry(key.clone()).or_insert_with(BreakerEntry::new);

        if entry.state == BreakerState::Open {
            if let Some(opened_at) = entry.opened_at {
                if opened_at.elapsed() >= self.config.open_duration {
                    entry.state = BreakerState::HalfOpen;
                    entry.half_open_probes_seen = 0;
                }
            }
        }
        entry.state.clone()
    }

    /// Returns `Some(event_type)` when this call triggered a state
    /// transition worth emitting.
    async fn on_success(&self, key: &(String, String, String)) -> Option<&'static str> {
        let mut states = self.states.lock().await;
        let entry = states.entry(key.clone()).or_insert_with(BreakerEntry::new);
        match entry.state {
            BreakerState::HalfOpen | BreakerState::Open => {
                entry.state = BreakerState::Closed;
                entry.failures_in_window = 0;
                entry.opened_at = None;
                Some(kind::CIRCUIT_CLOSED)
            }
            BreakerState::Closed => {
                entry.failures_in_window = 0;
                None
            }
        }
    }

    async fn on_failure(&self, key: &(String, String, String)) -> Option<&'static str> {
        let mut states = self.states.lock().await;
        let entry = states.entry(key.clone()).or_insert_with(BreakerEntry::new);

        if entry.state == BreakerState::HalfOpen {
            entry.state = BreakerState::Open;
            entry.opened_at = Some(Instant::now());
            entry.failures_in_window = 0;
            return Some(kind::CIRCUIT_OPENED);
        }

        if entry.window_started_at.elapsed() > self.config.failure_window {
            entry.window_started_at = Instant::now();
            entry.failures_in_window = 0;
        }
        entry.failures_in_window += 1;

        if entry.state == BreakerState::Closed && entry.failures_in_window >= self.config.failure_threshold {
            entry.state = BreakerState::Open;
            entry.opened_at = Some(Instant::now());
            return Some(kind::CIRCUIT_OPENED);
        }
        None
    }
}

/// A single row tracking one external call. Written even when the call
/// fails — the invariant §3 calls out explicitly.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderCallRecord {
    pub id: Uuid,
    pub run_id: Uuid,
    pub operation: String,
    pub provider: String,
    pub model: String,
    pub request_fingerprint: String,
    pub tokens_in: Option<u64>,
    pub tokens_out: Option<u64>,
    pub cached_tokens: Option<u64>,
    pub cost_cents: Option<i64>,
    pub duration: Option<Duration>,
    pub success: bool,
    pub error: Option<String>,
}

/// The outcome of a single gateway-wrapped invocation, reported by the
/// caller so the gateway can finish the Provider Call Record.
pub struct CallOutcome {
    pub tokens_in: Option<u64>,
    pub tokens_out: Option<u64>,
    pub cached_tokens: Option<u64>,
    pub audio_duration_ms: Option<i64>,
    pub text_length: Option<i64>,
}

impl CallOutcome {
    pub fn empty() -> Self {
        Self {
            tokens_in: None,
            tokens_out: None,
            cached_tokens: None,
            audio_duration_ms: None,
            text_length: None,
        }
    }
}

/// Single entry point for every external provider call.
pub struct ProviderCallGateway {
    breaker: CircuitBreaker,
    sink: Arc<EventSink>,
    store: Arc<dyn Store>,
    provider_call_timeout: Duration,
}

impl ProviderCallGateway {
    pub fn new(
        config: CircuitBreakerConfig,
        provider_call_timeout: Duration,
        sink: Arc<EventSink>,
        store: Arc<dyn Store>,
    ) -> Self {
        Self {
            breaker: CircuitBreaker::new(config),
            sink,
            store,
            provider_call_timeout,
        }
    }

    /// Invoke `call`, recording a [`ProviderCallRecord`] and emitting the
    /// events described in §4.2. `invoke` returns the outcome metadata
    /// (token counts) alongside the actual provider result `T`; gateway
    /// callers that don't report usage can return [`CallOutcome::empty`].
    pub async fn call<T, F, Fut>(
        &self,
        run_id: Uuid,
        operation: &str,
        provider: &str,
        model: &str,
        request_fingerprint_input: &str,
        invoke: F,
    ) -> Result<T, KernelError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<(T, CallOutcome), KernelError>>,
    {
        let key = (operation.to_string(), provider.to_string(), model.to_string());
        let fingerprint = fingerprint(request_fingerprint_input);
        let start = Instant::now();

        let breaker_state = self.breaker.before_call(&key).await;
        if breaker_state == BreakerState::Open {
            self.emit(run_id, kind::CIRCUIT_OPEN_CALL_ALLOWED, &key).await;
        }

        let outcome_result: Result<(T, CallOutcome), KernelError> =
            match tokio::time::timeout(self.provider_call_timeout, invoke()).await {
                Ok(result) => result,
                Err(_) => Err(KernelError::provider_retryable(
                    format!(
                        "provider call timed out after {:?}",
                        self.provider_call_timeout
                    ),
                    None,
                )),
            };

        match outcome_result {
            Ok((value, outcome)) => {
                let duration = start.elapsed();
                let cost_cents = compute_cost_cents(operation, provider, model, &outcome);
                let record = ProviderCallRecord {
                    id: Uuid::new_v4(),
                    run_id,
                    operation: operation.to_string(),
                    provider: provider.to_string(),
                    model: model.to_string(),
                    request_fingerprint: fingerprint,
                    tokens_in: outcome.tokens_in,
                    tokens_out: outcome.tokens_out,
                    cached_tokens: outcome.cached_tokens,
                    cost_cents,
                    duration: Some(duration),
                    success: true,
                    error: None,
                };
                if let Err(e) = self.store.insert_provider_call(record).await {
                    log::warn!("failed to persist provider call record: {e}");
                }
                self.emit(run_id, kind::PROVIDER_CALL_SUCCEEDED, &key).await;
                if let Some(transition) = self.breaker.on_success(&key).await {
                    self.emit(run_id, transition, &key).await;
                }
                Ok(value)
            }
            Err(err) => {
                let duration = start.elapsed();
                let record = ProviderCallRecord {
                    id: Uuid::new_v4(),
                    run_id,
                    operation: operation.to_string(),
                    provider: provider.to_string(),
                    model: model.to_string(),
                    request_fingerprint: fingerprint,
                    tokens_in: None,
                    tokens_out: None,
                    cached_tokens: None,
                    cost_cents: None,
                    duration: Some(duration),
                    success: false,
                    error: Some(err.to_string()),
                };
                if let Err(e) = self.store.insert_provider_call(record).await {
                    log::warn!("failed to persist provider call record: {e}");
                }
                self.emit(run_id, kind::PROVIDER_CALL_FAILED, &key).await;
                if let Some(transition) = self.breaker.on_failure(&key).await {
                    self.emit(run_id, transition, &key).await;
                }
                Err(err)
            }
        }
    }

    async fn emit(&self, run_id: Uuid, event_type: &'static str, key: &(String, String, String)) {
        let data = Event::payload([
            ("operation", serde_json::json!(key.0)),
            ("provider", serde_json::json!(key.1)),
            ("model", serde_json::json!(key.2)),
        ]);
        self.sink
            .try_emit(run_id, event_type, data, CorrelationIds::default());
    }
}

fn fingerprint(input: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(input.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Dispatches to the right `pricing` estimator by the operation's namespace
/// prefix (`llm.`/`stt.`/`tts.`). Unknown namespaces record no cost.
fn compute_cost_cents(
    operation: &str,
    provider: &str,
    model: &str,
    outcome: &CallOutcome,
) -> Option<i64> {
    if operation.starts_with("llm.") {
        Some(pricing::estimate_llm_cost_cents(
            Some(provider),
            Some(model),
            outcome.tokens_in,
            outcome.tokens_out,
        ))
    } else if operation.starts_with("stt.") {
        Some(pricing::estimate_stt_cost_cents(
            Some(provider),
            Some(model),
            outcome.audio_duration_ms,
        ))
    } else if operation.starts_with("tts.") {
        Some(pricing::estimate_tts_cost_cents(
            Some(provider),
            Some(model),
            outcome.text_length,
        ))
    } else {
        None
    }
}
