//! The four canonical topologies (§4.5) plus the stub stage bodies needed to
//! exercise the scheduler and this crate's own tests. Stage *logic* (STT,
//! LLM prompting, TTS, persistence, assessment scoring) is out of scope —
//! these bodies only do enough to be observable in tests.
//!
//! Grounded on
//! `original_source/backend/app/ai/stageflow/pipeline.py`'s composition of
//! `user_persist → router → llm_stream → persist`, with `chat_accurate`
//! adding a parallel `assessment` stage that does not gate `persist`.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;
use uuid::Uuid;

use crate::applier::{AgentArtifact, AgentOutputPlan};
use crate::gateway::CallOutcome;
use crate::pipeline::{Pipeline, StageSpec};
use crate::policy::{Checkpoint, Decision, GuardrailsContext};
use crate::stage::registry::SimpleFactory;
use crate::stage::{Stage, StageContext, StageKind, StageOutput, StageRegistry};
use crate::streaming::ClientFrame;

pub const CHAT_FAST: &str = "chat_fast";
pub const CHAT_ACCURATE: &str = "chat_accurate";
pub const VOICE_FAST: &str = "voice_fast";
pub const VOICE_ACCURATE: &str = "voice_accurate";

fn prompt_text(ctx: &StageContext) -> String {
    ctx.snapshot
        .input_text
        .clone()
        .or_else(|| {
            ctx.upstream_result("stt", "text")
                .and_then(|v| v.as_str())
                .map(String::from)
        })
        .unwrap_or_default()
}

#[derive(Default)]
struct UserPersistStage;

#[async_trait]
impl Stage for UserPersistStage {
    fn name(&self) -> &str {
        "user_persist"
    }

    async fn execute(&self, _ctx: &StageContext) -> StageOutput {
        let mut results = HashMap::new();
        results.insert("persisted".to_string(), json!(true));
        StageOutput::ok(results)
    }
}

#[derive(Default)]
struct RouterStage;

#[async_trait]
impl Stage for RouterStage {
    fn name(&self) -> &str {
        "router"
    }

    async fn execute(&self, _ctx: &StageContext) -> StageOutput {
        let mut results = HashMap::new();
        results.insert("route".to_string(), json!("respond"));
        StageOutput::ok(results)
    }
}

#[derive(Default)]
struct SttStage;

#[async_trait]
impl Stage for SttStage {
    fn name(&self) -> &str {
        "stt"
    }

    async fn execute(&self, ctx: &StageContext) -> StageOutput {
        let provider = match &ctx.ports.stt_provider {
            Some(provider) => provider.clone(),
            None => return StageOutput::fail("no stt provider configured"),
        };
        let audio = match &ctx.ports.audio_data {
            Some(audio) => audio.clone(),
            None => return StageOutput::fail("no audio data supplied"),
        };
        let format = ctx.ports.audio_format.clone().unwrap_or_else(|| "pcm16".to_string());

        match provider.transcribe(&audio, &format).await {
            Ok(result) => {
                let mut results = HashMap::new();
                results.insert("text".to_string(), json!(result.text));
                results.insert("audio_duration_ms".to_string(), json!(result.audio_duration_ms));
                StageOutput::ok(results)
            }
            Err(err) => StageOutput::fail(err.to_string()),
        }
    }
}

/// Streams the LLM's reply. Writes `text` (the full reply) and
/// `skip_assessment` (read by the conditional `assessment` stage in
/// `chat_accurate`/`voice_accurate`) into its output.
#[derive(Default)]
struct LlmStreamStage;

#[async_trait]
impl Stage for LlmStreamStage {
    fn name(&self) -> &str {
        "llm_stream"
    }

    async fn execute(&self, ctx: &StageContext) -> StageOutput {
        let provider = match &ctx.ports.llm_provider {
            Some(provider) => provider.clone(),
            None => return StageOutput::fail("no llm provider configured"),
        };
        let prompt = prompt_text(ctx);
        let run_id = ctx.run.run_id;

        if let Some(guardrails) = &ctx.ports.guardrails {
            let guardrails_ctx = GuardrailsContext {
                run_id,
                principal_id: ctx.run.principal_id,
                tenant_id: ctx.run.tenant_id,
                service: ctx.snapshot.topology.clone(),
                intent: "respond".to_string(),
                input_excerpt: prompt.clone(),
            };
            let decision = guardrails.evaluate(Checkpoint::PreLlm, &guardrails_ctx).await;
            if decision.decision == Decision::Block {
                return StageOutput::fail(format!("blocked at pre_llm: {}", decision.reason));
            }
        }

        let response = match &ctx.ports.call_logger {
            Some(gateway) => {
                let gateway = gateway.clone();
                let provider_for_call = provider.clone();
                let prompt_for_call = prompt.clone();
                gateway
                    .call(
                        run_id,
                        "llm.generate",
                        provider.provider_name(),
                        provider.model_name(),
                        &prompt,
                        move || async move {
                            let response = provider_for_call.generate(&prompt_for_call).await?;
                            let outcome = CallOutcome {
                                tokens_in: Some(response.tokens_in),
                                tokens_out: Some(response.tokens_out),
                                cached_tokens: Some(response.cached_tokens),
                                audio_duration_ms: None,
                                text_length: None,
                            };
                            Ok((response, outcome))
                        },
                    )
                    .await
            }
            None => provider.generate(&prompt).await,
        };

        let response = match response {
            Ok(response) => response,
            Err(err) => return StageOutput::fail(err.to_string()),
        };

        for word in response.text.split(' ').filter(|w| !w.is_empty()) {
            let token = format!("{word} ");
            if let Some(bridge) = &ctx.ports.frame_tx {
                bridge.push(ClientFrame::ChatToken { run_id, token: token.clone() }).await;
            }
            if let Some(sink) = &ctx.ports.event_sink {
                sink.try_emit(
                    run_id,
                    crate::event::kind::CHAT_TOKEN,
                    crate::event::Event::payload([("token", json!(token))]),
                    crate::event::CorrelationIds::default(),
                );
            }
        }

        let mut results = HashMap::new();
        results.insert("text".to_string(), json!(response.text));
        results.insert("skip_assessment".to_string(), json!(false));
        results.insert("tokens_in".to_string(), json!(response.tokens_in));
        results.insert("tokens_out".to_string(), json!(response.tokens_out));
        StageOutput::ok(results)
    }
}

#[derive(Default)]
struct PersistStage;

#[async_trait]
impl Stage for PersistStage {
    fn name(&self) -> &str {
        "persist"
    }

    async fn execute(&self, ctx: &StageContext) -> StageOutput {
        let text = ctx
            .upstream_result("llm_stream", "text")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string();

        let applier = match &ctx.ports.applier {
            Some(applier) => applier.clone(),
            None => {
                let mut results = HashMap::new();
                results.insert("persisted_text".to_string(), json!(text));
                return StageOutput::ok(results);
            }
        };

        let plan = AgentOutputPlan {
            assistant_message: text.clone(),
            actions: Vec::new(),
            artifacts: vec![AgentArtifact {
                kind: "assistant_message".to_string(),
                payload: json!({ "text": text }),
            }],
        };
        let outcome = applier
            .apply(
                ctx.run.run_id,
                ctx.run.principal_id,
                ctx.run.tenant_id,
                &ctx.snapshot.topology,
                plan,
            )
            .await;

        if outcome.accepted_artifact_ids.is_empty() {
            let reason = outcome
                .rejected_artifacts
                .first()
                .map(|(_, reason)| reason.clone())
                .unwrap_or_else(|| "artifact rejected".to_string());
            return StageOutput::fail(format!("blocked at pre_persist: {reason}"));
        }

        let mut results = HashMap::new();
        results.insert("persisted_text".to_string(), json!(text));
        results.insert(
            "artifact_ids".to_string(),
            json!(outcome.accepted_artifact_ids.iter().map(Uuid::to_string).collect::<Vec<_>>()),
        );
        StageOutput::ok(results)
    }
}

/// Runs alongside `persist` rather than gating it — neither stage depends
/// on the other, both depend only on `llm_stream`.
#[derive(Default)]
struct AssessmentStage;

#[async_trait]
impl Stage for AssessmentStage {
    fn name(&self) -> &str {
        "assessment"
    }

    async fn execute(&self, ctx: &StageContext) -> StageOutput {
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        let text = ctx
            .upstream_result("llm_stream", "text")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string();
        let mut results = HashMap::new();
        results.insert("assessed_length".to_string(), json!(text.len()));
        StageOutput::ok(results)
    }
}

#[derive(Default)]
struct TtsStage;

#[async_trait]
impl Stage for TtsStage {
    fn name(&self) -> &str {
        "tts"
    }

    async fn execute(&self, ctx: &StageContext) -> StageOutput {
        let provider = match &ctx.ports.tts_provider {
            Some(provider) => provider.clone(),
            None => return StageOutput::fail("no tts provider configured"),
        };
        let text = ctx
            .upstream_result("llm_stream", "text")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string();

        match provider.synthesize(&text).await {
            Ok(result) => {
                if let Some(bridge) = &ctx.ports.frame_tx {
                    use base64::Engine;
                    bridge
                        .push(ClientFrame::VoiceAudioChunk {
                            run_id: ctx.run.run_id,
                            audio_base64: base64::engine::general_purpose::STANDARD.encode(&result.audio),
                        })
                        .await;
                }
                if let Some(sink) = &ctx.ports.event_sink {
                    sink.try_emit(
                        ctx.run.run_id,
                        crate::event::kind::VOICE_AUDIO_CHUNK,
                        crate::event::Event::payload([("audio_bytes", json!(result.audio.len()))]),
                        crate::event::CorrelationIds::default(),
                    );
                }
                let mut results = HashMap::new();
                results.insert("char_count".to_string(), json!(result.char_count));
                results.insert("audio_bytes".to_string(), json!(result.audio.len()));
                StageOutput::ok(results)
            }
            Err(err) => StageOutput::fail(err.to_string()),
        }
    }
}

/// Registers every stub stage body under its canonical name.
pub fn register_stub_stages(registry: &mut StageRegistry) {
    registry.register("user_persist", Box::new(SimpleFactory::<UserPersistStage>::new(StageKind::Work)));
    registry.register("router", Box::new(SimpleFactory::<RouterStage>::new(StageKind::Route)));
    registry.register("stt", Box::new(SimpleFactory::<SttStage>::new(StageKind::Transform)));
    registry.register(
        "llm_stream",
        Box::new(SimpleFactory::<LlmStreamStage>::new(StageKind::Transform)),
    );
    registry.register("persist", Box::new(SimpleFactory::<PersistStage>::new(StageKind::Work)));
    registry.register(
        "assessment",
        Box::new(SimpleFactory::<AssessmentStage>::new(StageKind::Work)),
    );
    registry.register("tts", Box::new(SimpleFactory::<TtsStage>::new(StageKind::Transform)));
}

pub fn chat_fast() -> Pipeline {
    Pipeline::compose(CHAT_FAST)
        .with_stage(StageSpec::new("user_persist", StageKind::Work, vec![]))
        .with_stage(StageSpec::new("router", StageKind::Route, vec!["user_persist".into()]))
        .with_stage(StageSpec::new("llm_stream", StageKind::Transform, vec!["router".into()]))
        .with_stage(StageSpec::new("persist", StageKind::Work, vec!["llm_stream".into()]))
}

pub fn chat_accurate() -> Pipeline {
    Pipeline::compose(CHAT_ACCURATE)
        .with_stage(StageSpec::new("user_persist", StageKind::Work, vec![]))
        .with_stage(StageSpec::new("router", StageKind::Route, vec!["user_persist".into()]))
        .with_stage(StageSpec::new("llm_stream", StageKind::Transform, vec!["router".into()]))
        .with_stage(StageSpec::new("persist", StageKind::Work, vec!["llm_stream".into()]))
        .with_stage(
            StageSpec::new("assessment", StageKind::Work, vec!["llm_stream".into()]).with_condition(Arc::new(
                |_snapshot, upstream| {
                    !upstream
                        .get("llm_stream")
                        .and_then(|o| o.get("skip_assessment"))
                        .and_then(|v| v.as_bool())
                        .unwrap_or(false)
                },
            )),
        )
}

pub fn voice_fast() -> Pipeline {
    Pipeline::compose(VOICE_FAST)
        .with_stage(StageSpec::new("stt", StageKind::Transform, vec![]))
        .with_stage(StageSpec::new("router", StageKind::Route, vec!["stt".into()]))
        .with_stage(StageSpec::new("llm_stream", StageKind::Transform, vec!["router".into()]))
        .with_stage(StageSpec::new("tts", StageKind::Transform, vec!["llm_stream".into()]))
}

pub fn voice_accurate() -> Pipeline {
    Pipeline::compose(VOICE_ACCURATE)
        .with_stage(StageSpec::new("stt", StageKind::Transform, vec![]))
        .with_stage(StageSpec::new("router", StageKind::Route, vec!["stt".into()]))
        .with_stage(StageSpec::new("llm_stream", StageKind::Transform, vec!["router".into()]))
        .with_stage(StageSpec::new("tts", StageKind::Transform, vec!["llm_stream".into()]))
        .with_stage(
            StageSpec::new("assessment", StageKind::Work, vec!["llm_stream".into()]).with_condition(Arc::new(
                |_snapshot, upstream| {
                    !upstream
                        .get("llm_stream")
                        .and_then(|o| o.get("skip_assessment"))
                        .and_then(|v| v.as_bool())
                        .unwrap_or(false)
                },
            )),
        )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cancellation::CancellationRegistry;
    use crate::context::{ContextSnapshot, RunContext};
    use crate::event::EventSink;
    use crate::provider::stub::{FailingLlmProvider, StubLlmProvider};
    use crate::stage::StagePorts;
    use crate::store::MemoryStore;
    use uuid::Uuid;

    fn run_ctx() -> (Arc<RunContext>, CancellationRegistry) {
        let registry = CancellationRegistry::new();
        let run_id = Uuid::new_v4();
        (
            Arc::new(RunContext::new(run_id, "req".into(), Uuid::new_v4(), Uuid::new_v4())),
            registry,
        )
    }

    fn event_sink() -> Arc<EventSink> {
        Arc::new(EventSink::new(Arc::new(MemoryStore::new())))
    }

    #[tokio::test]
    async fn chat_fast_runs_end_to_end_with_a_stub_provider() {
        let mut stage_registry = StageRegistry::new();
        register_stub_stages(&mut stage_registry);
        let pipeline = chat_fast();
        let graph = crate::scheduler::UnifiedStageGraph::build(&pipeline, &stage_registry).unwrap();

        let (run, cancellation_registry) = run_ctx();
        let handle = cancellation_registry.register(run.run_id);
        let snapshot = Arc::new(ContextSnapshot::for_chat(CHAT_FAST, Uuid::new_v4(), "hello there"));
        let ports = StagePorts::default().with_llm_provider(Arc::new(StubLlmProvider {
            provider: "stub".into(),
            model: "stub-1".into(),
            reply: "hi back".into(),
        }));

        let outputs = graph.run(run, snapshot, ports, handle, event_sink(), std::time::Duration::from_secs(5)).await;
        assert_eq!(outputs["persist"].get("persisted_text").unwrap(), "hi back");
    }

    #[tokio::test]
    async fn chat_accurate_runs_assessment_alongside_persist() {
        let mut stage_registry = StageRegistry::new();
        register_stub_stages(&mut stage_registry);
        let pipeline = chat_accurate();
        let graph = crate::scheduler::UnifiedStageGraph::build(&pipeline, &stage_registry).unwrap();

        let (run, cancellation_registry) = run_ctx();
        let handle = cancellation_registry.register(run.run_id);
        let snapshot = Arc::new(ContextSnapshot::for_chat(CHAT_ACCURATE, Uuid::new_v4(), "hello there"));
        let ports = StagePorts::default().with_llm_provider(Arc::new(StubLlmProvider {
            provider: "stub".into(),
            model: "stub-1".into(),
            reply: "hi back".into(),
        }));

        let outputs = graph.run(run, snapshot, ports, handle, event_sink(), std::time::Duration::from_secs(5)).await;
        assert!(outputs.contains_key("persist"));
        assert!(outputs.contains_key("assessment"));
        assert_eq!(outputs["assessment"].status, crate::stage::StageStatus::Ok);
    }

    #[tokio::test]
    async fn llm_failure_stops_chat_fast_before_persist_runs() {
        let mut stage_registry = StageRegistry::new();
        register_stub_stages(&mut stage_registry);
        let pipeline = chat_fast();
        let graph = crate::scheduler::UnifiedStageGraph::build(&pipeline, &stage_registry).unwrap();

        let (run, cancellation_registry) = run_ctx();
        let handle = cancellation_registry.register(run.run_id);
        let snapshot = Arc::new(ContextSnapshot::for_chat(CHAT_FAST, Uuid::new_v4(), "hello there"));
        let ports = StagePorts::default().with_llm_provider(Arc::new(FailingLlmProvider {
            provider: "stub".into(),
            model: "stub-1".into(),
            message: "provider unavailable".into(),
        }));

        let outputs = graph.run(run, snapshot, ports, handle, event_sink(), std::time::Duration::from_secs(5)).await;
        assert_eq!(outputs["llm_stream"].status, crate::stage::StageStatus::Fail);
        assert!(!outputs.contains_key("persist"));
    }
}
