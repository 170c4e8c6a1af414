//! The Policy/Guardrails Registry (§4.3).
//!
//! Grounded on
//! `original_source/backend/app/ai/substrate/policy/guardrails.py`'s
//! `GuardrailsStage`, with the decorator-based `@register_guardrails`
//! registration re-architected per `SPEC_FULL.md` §9 Design Notes item 1 into
//! an explicit [`GuardrailsRegistry::register`] call — no import-time side
//! effects.

use std::collections::HashMap;
use std::sync::Arc;

use uuid::Uuid;

use crate::event::{kind, CorrelationIds, Event, EventSink};

/// The three reserved policy checkpoints.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Checkpoint {
    PreLlm,
    PreAction,
    PrePersist,
}

impl Checkpoint {
    pub fn as_str(&self) -> &'static str {
        match self {
            Checkpoint::PreLlm => "pre_llm",
            Checkpoint::PreAction => "pre_action",
            Checkpoint::PrePersist => "pre_persist",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Allow,
    Block,
}

impl Decision {
    pub fn as_str(&self) -> &'static str {
        match self {
            Decision::Allow => "allow",
            Decision::Block => "block",
        }
    }
}

/// Context passed to a policy's evaluation.
#[derive(Debug, Clone)]
pub struct GuardrailsContext {
    pub run_id: Uuid,
    pub principal_id: Uuid,
    pub tenant_id: Uuid,
    pub service: String,
    pub intent: String,
    pub input_excerpt: String,
}

/// A registered policy's verdict.
#[derive(Debug, Clone)]
pub struct GuardrailsResult {
    pub decision: Decision,
    pub reason: String,
}

impl GuardrailsResult {
    pub fn allow(reason: impl Into<String>) -> Self {
        Self {
            decision: Decision::Allow,
            reason: reason.into(),
        }
    }

    pub fn block(reason: impl Into<String>) -> Self {
        Self {
            decision: Decision::Block,
            reason: reason.into(),
        }
    }
}

/// A named policy, consulted at one or more checkpoints.
pub trait Policy: Send + Sync {
    fn evaluate(&self, checkpoint: Checkpoint, ctx: &GuardrailsContext) -> GuardrailsResult;
}

struct RegisteredPolicy {
    checkpoints: Vec<Checkpoint>,
    policy: Arc<dyn Policy>,
    enabled: bool,
}

/// The checkpoint-keyed registry of named policies, with forced-decision
/// overrides for tests and kill-switches.
pub struct GuardrailsRegistry {
    policies: HashMap<String, RegisteredPolicy>,
    forced_decisions: HashMap<Checkpoint, Decision>,
    sink: Arc<EventSink>,
}

impl GuardrailsRegistry {
    pub fn new(sink: Arc<EventSink>) -> Self {
        Self {
            policies: HashMap::new(),
            forced_decisions: HashMap::new(),
            sink,
        }
    }

    /// Explicit registration — no decorator, no import-time side effects.
    pub fn register(&mut self, name: impl Into<String>, checkpoints: Vec<Checkpoint>, policy: Arc<dyn Policy>) {
        self.policies.insert(
            name.into(),
            RegisteredPolicy {
                checkpoints,
                policy,
                enabled: true,
            },
        );
    }

    /// Disable a registered policy by name; disabled policies always
    /// evaluate to `allow` with reason `"disabled"`.
    pub fn disable(&mut self, name: &str) {
        if let Some(entry) = self.policies.get_mut(name) {
            entry.enabled = false;
        }
    }

    /// Force a decision at a checkpoint regardless of registered policies.
    /// Used in tests and to kill-switch a capability.
    pub fn force_decision(&mut self, checkpoint: Checkpoint, decision: Decision) {
        self.forced_decisions.insert(checkpoint, decision);
    }

    pub fn clear_forced_decision(&mut self, checkpoint: Checkpoint) {
        self.forced_decisions.remove(&checkpoint);
    }

    /// Evaluate every policy registered for `checkpoint`, honoring forced
    /// overrides first, and emit `policy.decision` (plus `policy.blocked` on
    /// block) before returning.
    pub async fn evaluate(&self, checkpoint: Checkpoint, ctx: &GuardrailsContext) -> GuardrailsResult {
        let result = if let Some(forced) = self.forced_decisions.get(&checkpoint) {
            GuardrailsResult {
                decision: *forced,
                reason: "forced".to_string(),
            }
        } else {
            self.evaluate_registered(checkpoint, ctx)
        };

        self.emit_decision(checkpoint, ctx, &result).await;
        result
    }

    fn evaluate_registered(&self, checkpoint: Checkpoint, ctx: &GuardrailsContext) -> GuardrailsResult {
        for entry in self.policies.values() {
            if !entry.checkpoints.contains(&checkpoint) {
                continue;
            }
            if !entry.enabled {
                return GuardrailsResult::allow("disabled");
            }
            let result = entry.policy.evaluate(checkpoint, ctx);
            if result.decision == Decision::Block {
                return result;
            }
        }
        GuardrailsResult::allow("default_allow")
    }

    async fn emit_decision(&self, checkpoint: Checkpoint, ctx: &GuardrailsContext, result: &GuardrailsResult) {
        let data = Event::payload([
            ("checkpoint", serde_json::json!(checkpoint.as_str())),
            ("decision", serde_json::json!(result.decision.as_str())),
            ("reason", serde_json::json!(result.reason)),
        ]);
        self.sink
            .emit(ctx.run_id, kind::POLICY_DECISION, data.clone(), CorrelationIds::default())
            .await;
        if result.decision == Decision::Block {
            self.sink
                .emit(ctx.run_id, kind::POLICY_BLOCKED, data, CorrelationIds::default())
                .await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{MemoryStore, Store};

    fn registry() -> (GuardrailsRegistry, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        let sink = Arc::new(EventSink::new(store.clone()));
        (GuardrailsRegistry::new(sink), store)
    }

    fn ctx(run_id: Uuid) -> GuardrailsContext {
        GuardrailsContext {
            run_id,
            principal_id: Uuid::new_v4(),
            tenant_id: Uuid::new_v4(),
            service: "chat".into(),
            intent: "respond".into(),
            input_excerpt: "hello".into(),
        }
    }

    #[tokio::test]
    async fn defaults_to_allow_with_no_registered_policy() {
        let (registry, _store) = registry();
        let run_id = Uuid::new_v4();
        let result = registry.evaluate(Checkpoint::PreLlm, &ctx(run_id)).await;
        assert_eq!(result.decision, Decision::Allow);
        assert_eq!(result.reason, "default_allow");
    }

    #[tokio::test]
    async fn forced_decision_overrides_registered_policy() {
        let (mut registry, store) = registry();
        struct AlwaysAllow;
        impl Policy for AlwaysAllow {
            fn evaluate(&self, _checkpoint: Checkpoint, _ctx: &GuardrailsContext) -> GuardrailsResult {
                GuardrailsResult::allow("looks fine")
            }
        }
        registry.register("default", vec![Checkpoint::PrePersist], Arc::new(AlwaysAllow));
        registry.force_decision(Checkpoint::PrePersist, Decision::Block);

        let run_id = Uuid::new_v4();
        let result = registry.evaluate(Checkpoint::PrePersist, &ctx(run_id)).await;
        assert_eq!(result.decision, Decision::Block);

        let events = store.events_for(run_id).await;
        assert!(events.iter().any(|e| e.event_type == "policy.decision"));
        assert!(events.iter().any(|e| e.event_type == "policy.blocked"));
    }
}
