//! The Run Controller (§4.7): the ten-step lifecycle that takes a request
//! from acceptance through a terminal, persisted outcome.
//!
//! Grounded on
//! `original_source/backend/app/ai/stageflow/pipeline.py`'s
//! `ChatPipelineRunner`/`VoicePipelineRunner` lifecycle, unified here into
//! one controller parameterized by topology name rather than one class per
//! channel, per `SPEC_FULL.md` §4.7's unification note.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::Value;
use uuid::Uuid;

use crate::applier::AgentOutputApplier;
use crate::cancellation::CancellationRegistry;
use crate::config::KernelConfig;
use crate::context::ContextSnapshot;
use crate::context::RunContext;
use crate::dlq::DeadLetterQueue;
use crate::error::KernelError;
use crate::event::{kind, CorrelationIds, Event, EventSink};
use crate::gateway::ProviderCallGateway;
use crate::pipeline::Pipeline;
use crate::stage::{StageOutput, StagePorts, StageRegistry, StageStatus};
use crate::store::{RunRecord, Store};
use crate::streaming::{ClientFrame, StreamingBridge};

/// Everything needed to start one run. Constructed by the embedding
/// application from an inbound chat or voice request.
pub struct RunRequest {
    pub topology: String,
    pub principal_id: Uuid,
    pub tenant_id: Uuid,
    pub session_id: Uuid,
    pub input_text: Option<String>,
    pub input_audio: Option<Arc<[u8]>>,
    /// When the caller supplies the same id twice, a terminal run's cached
    /// summary is returned instead of re-executing the pipeline (§4.7's
    /// idempotent retry behavior). `None` always mints a fresh id.
    pub run_id: Option<Uuid>,
    /// Per-run streaming sink. When set, stages forward `ClientFrame`s onto
    /// it (§4.8); the embedding application owns the receiving end and the
    /// transport that forwards frames to the client.
    pub frame_tx: Option<tokio::sync::mpsc::Sender<crate::streaming::ClientFrame>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    Running,
    Completed,
    Failed,
    Canceled,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Running => "running",
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
            RunStatus::Canceled => "canceled",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        match s {
            "running" => Some(RunStatus::Running),
            "completed" => Some(RunStatus::Completed),
            "failed" => Some(RunStatus::Failed),
            "canceled" => Some(RunStatus::Canceled),
            _ => None,
        }
    }
}

/// The terminal outcome of a run, returned to the caller once the lifecycle
/// completes.
#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub run_id: Uuid,
    pub status: RunStatus,
    pub stage_outputs: HashMap<String, StageOutput>,
    pub error: Option<String>,
}

/// Orchestrates the full lifecycle of a run against a fixed set of named
/// topologies. One controller instance is shared across every run in a
/// process.
pub struct RunController {
    config: KernelConfig,
    store: Arc<dyn Store>,
    sink: Arc<EventSink>,
    guardrails: Arc<crate::policy::GuardrailsRegistry>,
    gateway: Arc<ProviderCallGateway>,
    applier: Arc<AgentOutputApplier>,
    cancellation: Arc<CancellationRegistry>,
    dlq: DeadLetterQueue,
    stage_registry: StageRegistry,
    topologies: HashMap<String, Pipeline>,
    base_ports: StagePorts,
}

impl RunController {
    pub fn new(
        config: KernelConfig,
        store: Arc<dyn Store>,
        sink: Arc<EventSink>,
        guardrails: Arc<crate::policy::GuardrailsRegistry>,
        gateway: Arc<ProviderCallGateway>,
        stage_registry: StageRegistry,
    ) -> Self {
        let applier = Arc::new(AgentOutputApplier::new(
            guardrails.clone(),
            store.clone(),
            sink.clone(),
            config.clone(),
        ));
        Self {
            config,
            dlq: DeadLetterQueue::new(store.clone()),
            store,
            sink,
            guardrails,
            gateway,
            applier,
            cancellation: Arc::new(CancellationRegistry::new()),
            stage_registry,
            topologies: HashMap::new(),
            base_ports: StagePorts::default(),
        }
    }

    pub fn with_topology(mut self, pipeline: Pipeline) -> Self {
        self.topologies.insert(pipeline.topology.clone(), pipeline);
        self
    }

    /// Capabilities shared by every run this controller starts (provider
    /// clients, a `db_lock`, etc). The Provider Call Gateway, the
    /// guardrails registry, the agent output applier, and, when the request
    /// carries one, the per-run streaming bridge, are layered on top per run.
    pub fn with_base_ports(mut self, ports: StagePorts) -> Self {
        self.base_ports = ports;
        self
    }

    pub fn cancel(&self, run_id: Uuid) -> bool {
        self.cancellation.request_cancel(run_id)
    }

    /// Run the full lifecycle: accept (replaying a cached terminal outcome
    /// when the caller retries a known run id), persist, execute, persist
    /// terminal state.
    pub async fn start(&self, request: RunRequest) -> RunOutcome {
        // 1. Accept the request, reusing the caller's run id when given.
        let run_id = request.run_id.unwrap_or_else(Uuid::new_v4);
        if request.run_id.is_some() {
            if let Some(cached) = self.replay_if_terminal(run_id).await {
                return cached;
            }
        }

        let run_ctx = Arc::new(RunContext::new(
            run_id,
            format!("req-{run_id}"),
            request.principal_id,
            request.tenant_id,
        ));
        let correlation = CorrelationIds {
            request_id: Some(run_ctx.request_id.clone()),
            session_id: Some(request.session_id),
            principal_id: Some(request.principal_id),
            tenant_id: Some(request.tenant_id),
        };

        // 2. Persist the initial run record.
        let now = Utc::now();
        let deadline = now + self.deadline_duration(&request.topology);
        self.store
            .insert_run(RunRecord {
                run_id,
                topology: request.topology.clone(),
                status: RunStatus::Running.as_str().to_string(),
                created_at: now,
                updated_at: now,
                deadline,
                output: None,
                error: None,
                total_latency_ms: None,
                time_to_first_token_ms: None,
                time_to_first_audio_ms: None,
                time_to_first_chunk_ms: None,
                tokens_in: None,
                tokens_out: None,
                cost_cents: None,
                stage_summary: None,
            })
            .await
            .ok();

        // 3. Emit pipeline.created.
        self.sink
            .emit(
                run_id,
                kind::PIPELINE_CREATED,
                Event::payload([("topology", serde_json::json!(request.topology))]),
                correlation.clone(),
            )
            .await;

        // 4. Register cancellation.
        let cancellation = self.cancellation.register(run_id);

        let snapshot = match (&request.input_text, &request.input_audio) {
            (Some(text), _) => ContextSnapshot::for_chat(&request.topology, request.session_id, text.clone()),
            (None, Some(audio)) => ContextSnapshot::for_voice(&request.topology, request.session_id, audio.clone()),
            (None, None) => ContextSnapshot::for_chat(&request.topology, request.session_id, ""),
        };

        // 5. Emit pipeline.started. Guardrails checkpoints are evaluated by
        // the stages that sit at them (`pre_llm` in `llm_stream`,
        // `pre_action`/`pre_persist` in the Agent Output Applier wired into
        // `persist`) rather than once here, so a block is attributed to the
        // artifact or call it actually gates.
        self.sink
            .emit(run_id, kind::PIPELINE_STARTED, Value::Null, correlation.clone())
            .await;

        // 6. Build and validate the graph for this topology.
        let pipeline = match self.topologies.get(&request.topology) {
            Some(pipeline) => pipeline,
            None => {
                self.cancellation.deregister(run_id);
                return self
                    .finish(
                        run_id,
                        &request.topology,
                        correlation,
                        RunStatus::Failed,
                        HashMap::new(),
                        Some(format!("unknown topology: {}", request.topology)),
                        &snapshot,
                        None,
                    )
                    .await;
            }
        };
        let graph = match crate::scheduler::UnifiedStageGraph::build(pipeline, &self.stage_registry) {
            Ok(graph) => graph,
            Err(err) => {
                self.cancellation.deregister(run_id);
                return self
                    .finish(
                        run_id,
                        &request.topology,
                        correlation,
                        RunStatus::Failed,
                        HashMap::new(),
                        Some(err.to_string()),
                        &snapshot,
                        None,
                    )
                    .await;
            }
        };

        let mut ports = self
            .base_ports
            .clone()
            .with_call_logger(self.gateway.clone())
            .with_event_sink(self.sink.clone())
            .with_guardrails(self.guardrails.clone())
            .with_applier(self.applier.clone());

        // Stages only ever see the bridge, never the caller's raw channel
        // (§4.8) — a background task drains the bridge and forwards onto the
        // channel the caller actually owns.
        if let Some(app_tx) = request.frame_tx.clone() {
            let (bridge, mut bridge_rx) = StreamingBridge::new(self.config.streaming_buffer_capacity, self.sink.clone());
            let bridge = Arc::new(bridge);
            ports = ports.with_frame_sender(bridge);
            tokio::spawn(async move {
                while let Some(frame) = bridge_rx.recv().await {
                    if app_tx.send(frame).await.is_err() {
                        break;
                    }
                }
            });
        }
        let bridge = ports.frame_tx.clone();

        // 7. Execute the graph under the topology's deadline.
        let deadline_duration = self.deadline_duration(&request.topology);
        let snapshot = Arc::new(snapshot);
        let run_future = graph.run(
            run_ctx.clone(),
            snapshot.clone(),
            ports,
            cancellation.clone(),
            self.sink.clone(),
            self.config.stage_timeout,
        );
        let (status, outputs) = match tokio::time::timeout(deadline_duration, run_future).await {
            Ok(outputs) => {
                if cancellation.is_canceled() {
                    (RunStatus::Canceled, outputs)
                } else if outputs.values().any(|o| o.status == StageStatus::Fail) {
                    (RunStatus::Failed, outputs)
                } else {
                    (RunStatus::Completed, outputs)
                }
            }
            Err(_) => {
                cancellation.cancel();
                (RunStatus::Failed, HashMap::new())
            }
        };
        let error = if status == RunStatus::Failed {
            Some("one or more stages failed or the run timed out".to_string())
        } else {
            None
        };

        // Send exactly one terminal frame so the client knows the stream is
        // done, no matter which of the three terminal states the run landed
        // in (§4.8, §4.9).
        if let Some(bridge) = &bridge {
            match status {
                RunStatus::Completed => {
                    let frame = if snapshot.channel == "voice" {
                        ClientFrame::VoiceComplete { run_id }
                    } else {
                        ClientFrame::ChatComplete { run_id }
                    };
                    bridge.push(frame).await;
                }
                RunStatus::Failed => {
                    let message = error.clone().unwrap_or_else(|| "run failed".to_string());
                    let code = KernelError::Pipeline(message.clone()).error_type().to_string();
                    bridge.push(ClientFrame::Error { run_id, code, message }).await;
                }
                RunStatus::Canceled => {
                    bridge
                        .push(ClientFrame::StatusUpdate {
                            run_id,
                            status: "canceled".to_string(),
                        })
                        .await;
                }
                RunStatus::Running => {}
            }
        }

        self.cancellation.deregister(run_id);
        // 8. Persist terminal state and emit the matching terminal event.
        let input_data = serde_json::json!({
            "input_text": request.input_text,
            "session_id": request.session_id,
        });
        self.finish(run_id, &request.topology, correlation, status, outputs, error, &snapshot, Some(input_data))
            .await
    }

    /// If `run_id` names an already-terminal run, returns its cached summary
    /// without touching the pipeline. Per-stage results aren't faithfully
    /// reconstructable from `RunRecord.output` (which keeps only each
    /// stage's `results` map, not its `status`/`latency`), so a replay
    /// returns an empty `stage_outputs` — the caller already has the output
    /// from its first call; this path exists to make the retry idempotent,
    /// not to replay the full run shape.
    async fn replay_if_terminal(&self, run_id: Uuid) -> Option<RunOutcome> {
        let record = self.store.get_run(run_id).await?;
        let status = RunStatus::parse(&record.status)?;
        if status == RunStatus::Running {
            return None;
        }
        Some(RunOutcome {
            run_id,
            status,
            stage_outputs: HashMap::new(),
            error: record.error,
        })
    }

    fn deadline_duration(&self, topology: &str) -> std::time::Duration {
        self.config.run_deadline(topology)
    }

    async fn finish(
        &self,
        run_id: Uuid,
        topology: &str,
        correlation: CorrelationIds,
        status: RunStatus,
        outputs: HashMap<String, StageOutput>,
        error: Option<String>,
        snapshot: &ContextSnapshot,
        input_data: Option<Value>,
    ) -> RunOutcome {
        let now = Utc::now();
        let output_json = serde_json::to_value(
            outputs
                .iter()
                .map(|(name, output)| (name.clone(), output.results.clone()))
                .collect::<HashMap<_, _>>(),
        )
        .ok();
        let stage_summary = serde_json::to_value(
            outputs
                .iter()
                .map(|(name, output)| {
                    (
                        name.clone(),
                        serde_json::json!({
                            "status": format!("{:?}", output.status),
                            "latency_ms": output.latency.map(|d| d.as_millis() as i64),
                        }),
                    )
                })
                .collect::<HashMap<_, _>>(),
        )
        .ok();

        let provider_calls = self.store.provider_calls_for(run_id).await;
        let (tokens_in, tokens_out, cost_cents) = if provider_calls.is_empty() {
            (None, None, None)
        } else {
            let tokens_in: i64 = provider_calls.iter().filter_map(|r| r.tokens_in).map(|v| v as i64).sum();
            let tokens_out: i64 = provider_calls.iter().filter_map(|r| r.tokens_out).map(|v| v as i64).sum();
            let cost_cents: i64 = provider_calls.iter().filter_map(|r| r.cost_cents).sum();
            (Some(tokens_in), Some(tokens_out), Some(cost_cents))
        };

        // `time_to_first_audio_ms` and `time_to_first_chunk_ms` fold in
        // `voice.audio_chunk`, the durable marker `tts` emits alongside each
        // `VoiceAudioChunk` frame, mirroring how `llm_stream` emits
        // `chat.token` alongside each `ChatToken` frame.
        let events = self.store.events_for(run_id).await;
        let created_at = events.iter().find(|e| e.event_type == kind::PIPELINE_CREATED).map(|e| e.timestamp);
        let first_token_at = events.iter().find(|e| e.event_type == kind::CHAT_TOKEN).map(|e| e.timestamp);
        let first_audio_at = events.iter().find(|e| e.event_type == kind::VOICE_AUDIO_CHUNK).map(|e| e.timestamp);
        let first_chunk_at = [first_token_at, first_audio_at].iter().copied().flatten().min();

        let elapsed_ms = |from: DateTime<Utc>, to: Option<DateTime<Utc>>| to.map(|to| (to - from).num_milliseconds());

        if let Some(mut record) = self.store.get_run(run_id).await {
            let started_at = created_at.unwrap_or(record.created_at);
            record.status = status.as_str().to_string();
            record.updated_at = now;
            record.output = output_json;
            record.error = error.clone();
            record.total_latency_ms = Some((now - record.created_at).num_milliseconds());
            record.time_to_first_token_ms = elapsed_ms(started_at, first_token_at);
            record.time_to_first_audio_ms = elapsed_ms(started_at, first_audio_at);
            record.time_to_first_chunk_ms = elapsed_ms(started_at, first_chunk_at);
            record.tokens_in = tokens_in;
            record.tokens_out = tokens_out;
            record.cost_cents = cost_cents;
            record.stage_summary = stage_summary;
            self.store.update_run(record).await.ok();
        }

        if status == RunStatus::Failed {
            let failed_stage = outputs
                .iter()
                .find(|(_, output)| output.status == StageStatus::Fail)
                .map(|(name, _)| name.clone());
            self.dlq
                .enqueue(
                    run_id,
                    topology,
                    failed_stage,
                    &KernelError::Pipeline(error.clone().unwrap_or_else(|| "run failed".to_string())),
                    snapshot,
                    input_data.unwrap_or(Value::Null),
                )
                .await
                .ok();
        }

        let event_type = match status {
            RunStatus::Completed => kind::PIPELINE_COMPLETED,
            RunStatus::Failed => kind::PIPELINE_FAILED,
            RunStatus::Canceled => kind::PIPELINE_CANCELED,
            RunStatus::Running => kind::PIPELINE_STARTED,
        };
        self.sink
            .emit(
                run_id,
                event_type,
                Event::payload([("topology", serde_json::json!(topology)), ("error", serde_json::json!(error))]),
                correlation,
            )
            .await;

        RunOutcome {
            run_id,
            status,
            stage_outputs: outputs,
            error,
        }
    }
}
