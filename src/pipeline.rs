//! Pipeline composition (§4.5): a named DAG of stage names, declared once
//! and handed to the [`scheduler`](crate::scheduler) for stratification and
//! execution.
//!
//! Grounded on
//! `original_source/backend/app/ai/substrate/stages/pipeline.py`'s
//! `PipelineBuilder.add_stage`, translated from a fluent Python builder into
//! a consuming `with_stage` chain matching `orchestration.rs`'s builder
//! style.

use std::collections::HashMap;
use std::sync::Arc;

use crate::context::ContextSnapshot;
use crate::stage::{StageKind, StageOutput};

/// A predicate deciding whether a conditionally-included stage runs, given
/// the run-wide snapshot and every upstream stage's output so far (e.g. a
/// `skip_assessment` flag written by an earlier stage). `None` means the
/// stage always runs.
pub type StageCondition = Arc<dyn Fn(&ContextSnapshot, &HashMap<String, StageOutput>) -> bool + Send + Sync>;

/// One node in a pipeline's DAG: a stage name, its upstream dependencies by
/// name, and an optional inclusion predicate.
#[derive(Clone)]
pub struct StageSpec {
    pub name: String,
    pub kind: StageKind,
    pub dependencies: Vec<String>,
    pub conditional: Option<StageCondition>,
}

impl StageSpec {
    pub fn new(name: impl Into<String>, kind: StageKind, dependencies: Vec<String>) -> Self {
        Self {
            name: name.into(),
            kind,
            dependencies,
            conditional: None,
        }
    }

    pub fn with_condition(mut self, condition: StageCondition) -> Self {
        self.conditional = Some(condition);
        self
    }

    pub fn should_run(&self, snapshot: &ContextSnapshot, upstream: &HashMap<String, StageOutput>) -> bool {
        match &self.conditional {
            Some(predicate) => predicate(snapshot, upstream),
            None => true,
        }
    }
}

/// A named, composed pipeline: an ordered set of [`StageSpec`]s forming a
/// DAG. Stage order within `stages` is irrelevant to execution — the
/// scheduler derives strata from `dependencies` — but is kept stable for
/// deterministic iteration in tests and logs.
#[derive(Clone)]
pub struct Pipeline {
    pub topology: String,
    pub stages: Vec<StageSpec>,
}

impl Pipeline {
    pub fn compose(topology: impl Into<String>) -> Self {
        Self {
            topology: topology.into(),
            stages: Vec::new(),
        }
    }

    pub fn with_stage(mut self, spec: StageSpec) -> Self {
        self.stages.push(spec);
        self
    }

    pub fn stage_names(&self) -> Vec<&str> {
        self.stages.iter().map(|s| s.name.as_str()).collect()
    }

    pub fn spec(&self, name: &str) -> Option<&StageSpec> {
        self.stages.iter().find(|s| s.name == name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compose_preserves_declaration_order() {
        let pipeline = Pipeline::compose("chat_fast")
            .with_stage(StageSpec::new("stt", StageKind::Transform, vec![]))
            .with_stage(StageSpec::new("llm", StageKind::Transform, vec!["stt".into()]));

        assert_eq!(pipeline.stage_names(), vec!["stt", "llm"]);
        assert_eq!(pipeline.spec("llm").unwrap().dependencies, vec!["stt".to_string()]);
    }

    #[test]
    fn unconditional_stage_always_runs() {
        let spec = StageSpec::new("stt", StageKind::Transform, vec![]);
        let snapshot = ContextSnapshot::for_chat("chat_fast", uuid::Uuid::new_v4(), "hi");
        assert!(spec.should_run(&snapshot, &HashMap::new()));
    }

    #[test]
    fn conditional_stage_reads_an_upstream_flag() {
        let spec = StageSpec::new("assessment", StageKind::Work, vec!["llm".into()]).with_condition(Arc::new(
            |_snapshot, upstream| {
                !upstream
                    .get("llm")
                    .and_then(|o| o.get("skip_assessment"))
                    .and_then(|v| v.as_bool())
                    .unwrap_or(false)
            },
        ));
        let snapshot = ContextSnapshot::for_chat("chat_accurate", uuid::Uuid::new_v4(), "hi");

        let mut upstream = HashMap::new();
        let mut results = HashMap::new();
        results.insert("skip_assessment".to_string(), serde_json::json!(true));
        upstream.insert("llm".to_string(), StageOutput::ok(results));
        assert!(!spec.should_run(&snapshot, &upstream));
    }
}
