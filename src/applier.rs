//! The Agent Output Applier (§4.10): validates and applies an agent's
//! produced plan against policy and size caps, persisting what survives.

use std::sync::Arc;

use chrono::Utc;
use serde_json::Value;
use uuid::Uuid;

use crate::config::KernelConfig;
use crate::event::{kind, CorrelationIds, Event, EventSink};
use crate::policy::{Checkpoint, GuardrailsContext, GuardrailsRegistry};
use crate::store::{ArtifactRecord, Store};

/// One action the agent asked to perform (a tool call, a side effect).
#[derive(Debug, Clone)]
pub struct AgentAction {
    pub name: String,
    pub payload: Value,
}

/// One artifact the agent produced (a document, an image reference, a
/// structured result) to be persisted alongside the run.
#[derive(Debug, Clone)]
pub struct AgentArtifact {
    pub kind: String,
    pub payload: Value,
}

/// The full plan produced by one agent turn.
#[derive(Debug, Clone)]
pub struct AgentOutputPlan {
    pub assistant_message: String,
    pub actions: Vec<AgentAction>,
    pub artifacts: Vec<AgentArtifact>,
}

/// What made it through policy and cap enforcement.
#[derive(Debug, Clone, Default)]
pub struct ApplyResult {
    pub accepted_actions: Vec<AgentAction>,
    pub rejected_actions: Vec<(AgentAction, String)>,
    pub accepted_artifact_ids: Vec<Uuid>,
    pub rejected_artifacts: Vec<(AgentArtifact, String)>,
}

pub struct AgentOutputApplier {
    guardrails: Arc<GuardrailsRegistry>,
    store: Arc<dyn Store>,
    sink: Arc<EventSink>,
    config: KernelConfig,
}

impl AgentOutputApplier {
    pub fn new(guardrails: Arc<GuardrailsRegistry>, store: Arc<dyn Store>, sink: Arc<EventSink>, config: KernelConfig) -> Self {
        Self {
            guardrails,
            store,
            sink,
            config,
        }
    }

    /// Evaluate every action and artifact against its checkpoint, apply the
    /// artifact caps, and persist what survives.
    pub async fn apply(&self, run_id: Uuid, principal_id: Uuid, tenant_id: Uuid, service: &str, plan: AgentOutputPlan) -> ApplyResult {
        let mut result = ApplyResult::default();

        for action in plan.actions {
            let ctx = GuardrailsContext {
                run_id,
                principal_id,
                tenant_id,
                service: service.to_string(),
                intent: format!("action:{}", action.name),
                input_excerpt: action.payload.to_string(),
            };
            let decision = self.guardrails.evaluate(Checkpoint::PreAction, &ctx).await;
            if decision.decision == crate::policy::Decision::Block {
                result.rejected_actions.push((action, decision.reason));
            } else {
                result.accepted_actions.push(action);
            }
        }

        let mut surviving_artifacts = Vec::new();
        for artifact in plan.artifacts {
            let ctx = GuardrailsContext {
                run_id,
                principal_id,
                tenant_id,
                service: service.to_string(),
                intent: format!("artifact:{}", artifact.kind),
                input_excerpt: artifact.payload.to_string(),
            };
            let decision = self.guardrails.evaluate(Checkpoint::PrePersist, &ctx).await;
            if decision.decision == crate::policy::Decision::Block {
                result.rejected_artifacts.push((artifact, decision.reason));
            } else {
                surviving_artifacts.push(artifact);
            }
        }

        if self.exceeds_caps(&surviving_artifacts) {
            self.sink
                .emit(
                    run_id,
                    kind::AGENT_OUTPUT_ARTIFACTS_REJECTED,
                    Event::payload([
                        ("count", serde_json::json!(surviving_artifacts.len())),
                        ("max_artifacts", serde_json::json!(self.config.max_artifacts)),
                        ("max_artifact_payload_bytes", serde_json::json!(self.config.max_artifact_payload_bytes)),
                    ]),
                    CorrelationIds::default(),
                )
                .await;
            result
                .rejected_artifacts
                .extend(surviving_artifacts.into_iter().map(|a| (a, "artifact_caps_exceeded".to_string())));
            return result;
        }

        if surviving_artifacts.is_empty() {
            return result;
        }

        let now = Utc::now();
        let records: Vec<ArtifactRecord> = surviving_artifacts
            .iter()
            .map(|artifact| ArtifactRecord {
                id: Uuid::new_v4(),
                run_id,
                kind: artifact.kind.clone(),
                payload: artifact.payload.clone(),
                created_at: now,
            })
            .collect();

        match self.store.insert_artifacts(records.clone()).await {
            Ok(()) => {
                result.accepted_artifact_ids = records.into_iter().map(|r| r.id).collect();
            }
            Err(err) => {
                log::warn!("failed to persist {} artifacts for run {run_id}: {err}", records.len());
                result
                    .rejected_artifacts
                    .extend(surviving_artifacts.into_iter().map(|a| (a, "persist_failed".to_string())));
            }
        }

        result
    }

    fn exceeds_caps(&self, artifacts: &[AgentArtifact]) -> bool {
        if artifacts.len() > self.config.max_artifacts {
            return true;
        }
        artifacts
            .iter()
            .any(|a| payload_size(&a.payload) > self.config.max_artifact_payload_bytes)
    }
}

fn payload_size(value: &Value) -> usize {
    serde_json::to_vec(value).map(|bytes| bytes.len()).unwrap_or(0)
}
