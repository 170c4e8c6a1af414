//! End-to-end scenarios driving `RunController` through real topologies, the
//! way an embedding application would: no internals reached into, only the
//! public `RunController`/`RunRequest` surface plus the store/event log for
//! assertions.

use std::sync::Arc;
use std::time::Duration;

use stageflow_kernel::config::KernelConfig;
use stageflow_kernel::dlq::DeadLetterQueue;
use stageflow_kernel::event::EventSink;
use stageflow_kernel::gateway::{CircuitBreakerConfig, ProviderCallGateway};
use stageflow_kernel::policy::{Checkpoint, Decision, GuardrailsRegistry};
use stageflow_kernel::provider::stub::{FailingLlmProvider, StubLlmProvider};
use stageflow_kernel::stage::{StagePorts, StageRegistry};
use stageflow_kernel::store::{MemoryStore, Store};
use stageflow_kernel::streaming::ClientFrame;
use stageflow_kernel::topology::{self, CHAT_ACCURATE, CHAT_FAST};
use stageflow_kernel::{RunController, RunRequest, RunStatus};
use uuid::Uuid;

fn stub_registry() -> StageRegistry {
    let mut registry = StageRegistry::new();
    topology::register_stub_stages(&mut registry);
    registry
}

fn controller_with(store: Arc<dyn Store>) -> (RunController, Arc<GuardrailsRegistry>) {
    let sink = Arc::new(EventSink::new(store.clone()));
    let guardrails = Arc::new(GuardrailsRegistry::new(sink.clone()));
    let gateway = Arc::new(ProviderCallGateway::new(
        CircuitBreakerConfig::default(),
        Duration::from_secs(5),
        sink.clone(),
        store.clone(),
    ));
    let controller = RunController::new(KernelConfig::default(), store, sink, guardrails.clone(), gateway, stub_registry())
        .with_topology(topology::chat_fast())
        .with_topology(topology::chat_accurate());
    (controller, guardrails)
}

fn chat_request(topology: &str, frame_tx: Option<tokio::sync::mpsc::Sender<ClientFrame>>) -> RunRequest {
    RunRequest {
        topology: topology.to_string(),
        principal_id: Uuid::new_v4(),
        tenant_id: Uuid::new_v4(),
        session_id: Uuid::new_v4(),
        input_text: Some("hello there".to_string()),
        input_audio: None,
        run_id: None,
        frame_tx,
    }
}

/// Scenario 1: happy-path chat fast topology. Stage events appear in
/// dependency order, at least one token streams, and exactly one terminal
/// frame reaches the client.
#[tokio::test]
async fn happy_path_chat_fast_streams_tokens_and_completes() {
    let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
    let (controller, _guardrails) = controller_with(store.clone());
    let controller = controller.with_base_ports(
        StagePorts::default().with_llm_provider(Arc::new(StubLlmProvider {
            provider: "stub".into(),
            model: "stub-1".into(),
            reply: "hi back there".into(),
        })),
    );

    let (tx, mut rx) = tokio::sync::mpsc::channel(64);
    let outcome = controller.start(chat_request(CHAT_FAST, Some(tx))).await;
    assert_eq!(outcome.status, RunStatus::Completed);

    let events = store.events_for(outcome.run_id).await;
    let kinds: Vec<&str> = events.iter().map(|e| e.event_type.as_str()).collect();

    let idx = |needle: &str| kinds.iter().position(|k| *k == needle).unwrap_or_else(|| panic!("missing {needle} in {kinds:?}"));
    let created = idx("pipeline.created");
    let started = idx("pipeline.started");
    let stage_started = idx("stage.started");
    let completed = idx("pipeline.completed");
    assert!(created < started);
    assert!(started < stage_started);
    assert!(stage_started < completed);
    assert!(kinds.iter().filter(|k| **k == "chat.token").count() >= 1, "expected at least one chat.token event");

    let mut frames = Vec::new();
    while let Ok(frame) = rx.try_recv() {
        frames.push(frame);
    }
    let terminal_count = frames.iter().filter(|f| f.is_terminal()).count();
    assert_eq!(terminal_count, 1, "exactly one terminal frame expected");
    assert!(matches!(frames.last(), Some(ClientFrame::ChatComplete { .. })));
}

/// Scenario 2: a failing provider stops the run before `persist`, lands the
/// failure in the dead-letter queue, and never persists an artifact.
#[tokio::test]
async fn llm_failure_stops_the_run_and_lands_in_the_dlq() {
    let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
    let (controller, _guardrails) = controller_with(store.clone());
    let controller = controller.with_base_ports(
        StagePorts::default().with_llm_provider(Arc::new(FailingLlmProvider {
            provider: "stub".into(),
            model: "stub-1".into(),
            message: "provider unavailable".into(),
        })),
    );

    let outcome = controller.start(chat_request(CHAT_FAST, None)).await;
    assert_eq!(outcome.status, RunStatus::Failed);
    assert_eq!(outcome.stage_outputs["llm_stream"].status, stageflow_kernel::StageStatus::Fail);
    assert!(!outcome.stage_outputs.contains_key("persist"));

    let events = store.events_for(outcome.run_id).await;
    assert!(events.iter().any(|e| e.event_type == "stage.failed"));
    assert!(events.iter().any(|e| e.event_type == "pipeline.failed"));

    let dlq = DeadLetterQueue::new(store.clone());
    let pending = dlq.get_pending(10).await;
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].run_id, outcome.run_id);
    assert_eq!(pending[0].service, "chat");
}

/// Scenario 3: canceling a run mid-flight leaves the remaining strata
/// skipped rather than run against a half-finished upstream.
#[tokio::test]
async fn canceling_mid_run_skips_remaining_stages() {
    use async_trait::async_trait;
    use stageflow_kernel::stage::{Stage, StageContext, StageFactory, StageKind, StageOutput};

    struct SlowStage(tokio::sync::mpsc::Sender<Uuid>);

    #[async_trait]
    impl Stage for SlowStage {
        fn name(&self) -> &str {
            "slow"
        }

        async fn execute(&self, ctx: &StageContext) -> StageOutput {
            let _ = self.0.send(ctx.run.run_id).await;
            tokio::time::sleep(Duration::from_millis(200)).await;
            StageOutput::ok(Default::default())
        }
    }

    struct SlowFactory(tokio::sync::mpsc::Sender<Uuid>);
    impl StageFactory for SlowFactory {
        fn build(&self, _ports: &StagePorts) -> Arc<dyn Stage> {
            Arc::new(SlowStage(self.0.clone()))
        }
        fn kind(&self) -> StageKind {
            StageKind::Work
        }
    }

    struct NeverStage;
    #[async_trait]
    impl Stage for NeverStage {
        fn name(&self) -> &str {
            "never"
        }
        async fn execute(&self, _ctx: &StageContext) -> StageOutput {
            StageOutput::ok(Default::default())
        }
    }
    struct NeverFactory;
    impl StageFactory for NeverFactory {
        fn build(&self, _ports: &StagePorts) -> Arc<dyn Stage> {
            Arc::new(NeverStage)
        }
        fn kind(&self) -> StageKind {
            StageKind::Work
        }
    }

    let (run_id_tx, mut run_id_rx) = tokio::sync::mpsc::channel(1);
    let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
    let sink = Arc::new(EventSink::new(store.clone()));
    let guardrails = Arc::new(GuardrailsRegistry::new(sink.clone()));
    let gateway = Arc::new(ProviderCallGateway::new(
        CircuitBreakerConfig::default(),
        Duration::from_secs(5),
        sink.clone(),
        store.clone(),
    ));

    let mut registry = StageRegistry::new();
    registry.register("slow", Box::new(SlowFactory(run_id_tx)));
    registry.register("never", Box::new(NeverFactory));
    let pipeline = stageflow_kernel::pipeline::Pipeline::compose("slow_then_never")
        .with_stage(stageflow_kernel::pipeline::StageSpec::new("slow", stageflow_kernel::stage::StageKind::Work, vec![]))
        .with_stage(stageflow_kernel::pipeline::StageSpec::new(
            "never",
            stageflow_kernel::stage::StageKind::Work,
            vec!["slow".into()],
        ));

    let controller = Arc::new(
        RunController::new(KernelConfig::default(), store.clone(), sink, guardrails, gateway, registry).with_topology(pipeline),
    );

    let controller_clone = controller.clone();
    let run_task = tokio::spawn(async move { controller_clone.start(chat_request("slow_then_never", None)).await });

    let run_id = run_id_rx.recv().await.expect("slow stage should report its run id");
    assert!(controller.cancel(run_id));

    let outcome = run_task.await.unwrap();
    assert_eq!(outcome.status, RunStatus::Canceled);
    assert_eq!(outcome.stage_outputs["slow"].status, stageflow_kernel::StageStatus::Ok);
    assert_eq!(outcome.stage_outputs["never"].status, stageflow_kernel::StageStatus::Skip);
}

/// Scenario 4: the circuit breaker observes failures and transitions state
/// but never refuses a subsequent call through the real run pipeline.
#[tokio::test]
async fn circuit_breaker_observes_without_blocking_the_next_run() {
    let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
    let sink = Arc::new(EventSink::new(store.clone()));
    let guardrails = Arc::new(GuardrailsRegistry::new(sink.clone()));
    let breaker_config = CircuitBreakerConfig {
        failure_threshold: 1,
        open_duration: Duration::from_secs(3600),
        failure_window: Duration::from_secs(60),
        half_open_probe_count: 1,
    };
    let gateway = Arc::new(ProviderCallGateway::new(breaker_config, Duration::from_secs(5), sink.clone(), store.clone()));
    let controller = RunController::new(KernelConfig::default(), store.clone(), sink, guardrails, gateway, stub_registry())
        .with_topology(topology::chat_fast())
        .with_base_ports(StagePorts::default().with_llm_provider(Arc::new(FailingLlmProvider {
            provider: "stub".into(),
            model: "stub-1".into(),
            message: "down".into(),
        })));

    let first = controller.start(chat_request(CHAT_FAST, None)).await;
    assert_eq!(first.status, RunStatus::Failed);
    let first_events = store.events_for(first.run_id).await;
    assert!(first_events.iter().any(|e| e.event_type == "circuit.opened"));

    // The breaker is now open for this (operation, provider, model) key, but
    // the gateway must still attempt (and fail) the next run's call rather
    // than refusing it outright.
    let second = controller.start(chat_request(CHAT_FAST, None)).await;
    assert_eq!(second.status, RunStatus::Failed);
    let second_events = store.events_for(second.run_id).await;
    assert!(
        second_events.iter().any(|e| e.event_type == "provider.call.failed"),
        "gateway must still have attempted the call while the breaker is open"
    );
}

/// Scenario 5: a policy block at `pre_persist` drops an agent's artifact
/// entirely and emits the rejection event, leaving nothing persisted.
#[tokio::test]
async fn pre_persist_policy_block_drops_all_artifacts() {
    let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
    let sink = Arc::new(EventSink::new(store.clone()));
    let mut guardrails = GuardrailsRegistry::new(sink.clone());
    guardrails.force_decision(Checkpoint::PrePersist, Decision::Block);
    let guardrails = Arc::new(guardrails);
    let gateway = Arc::new(ProviderCallGateway::new(
        CircuitBreakerConfig::default(),
        Duration::from_secs(5),
        sink.clone(),
        store.clone(),
    ));
    let controller = RunController::new(KernelConfig::default(), store.clone(), sink, guardrails, gateway, stub_registry())
        .with_topology(topology::chat_fast())
        .with_base_ports(StagePorts::default().with_llm_provider(Arc::new(StubLlmProvider {
            provider: "stub".into(),
            model: "stub-1".into(),
            reply: "hi back there".into(),
        })));

    let outcome = controller.start(chat_request(CHAT_FAST, None)).await;
    assert_eq!(outcome.status, RunStatus::Failed);
    assert_eq!(outcome.stage_outputs["persist"].status, stageflow_kernel::StageStatus::Fail);
    assert!(store.artifacts_for(outcome.run_id).await.is_empty());

    let events = store.events_for(outcome.run_id).await;
    assert!(events.iter().any(|e| e.event_type == "policy.blocked"));
}

/// Scenario 6: the parallel `assessment` stage in `chat_accurate` does not
/// gate `persist` — both complete, and `persist`'s output does not depend on
/// `assessment` having finished first.
#[tokio::test]
async fn parallel_assessment_does_not_block_persist_in_chat_accurate() {
    let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
    let (controller, _guardrails) = controller_with(store.clone());
    let controller = controller.with_base_ports(
        StagePorts::default().with_llm_provider(Arc::new(StubLlmProvider {
            provider: "stub".into(),
            model: "stub-1".into(),
            reply: "a longer reply to assess".into(),
        })),
    );

    let outcome = controller.start(chat_request(CHAT_ACCURATE, None)).await;
    assert_eq!(outcome.status, RunStatus::Completed);
    assert!(outcome.stage_outputs.contains_key("persist"));
    assert!(outcome.stage_outputs.contains_key("assessment"));
    assert_eq!(outcome.stage_outputs["assessment"].status, stageflow_kernel::StageStatus::Ok);
    assert_eq!(outcome.stage_outputs["persist"].status, stageflow_kernel::StageStatus::Ok);
}
