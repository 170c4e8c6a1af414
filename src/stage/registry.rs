//! The Stage Registry (§4.4): name-keyed stage construction.
//!
//! Grounded on
//! `original_source/backend/app/ai/substrate/stages/pipeline.py`'s
//! `StageRegistry.build`, minus the reflective binding step described in
//! `ports.rs`'s module doc.

use std::collections::HashMap;
use std::sync::Arc;

use super::{Stage, StageKind, StagePorts};

/// Builds one named stage from the injected [`StagePorts`]. Implementations
/// read only the fields they need.
pub trait StageFactory: Send + Sync {
    fn build(&self, ports: &StagePorts) -> Arc<dyn Stage>;
    fn kind(&self) -> StageKind;
}

/// Blanket factory for stages with no port dependencies and a `Default`
/// constructor — most `ENRICH`/`ROUTE` stages fit this.
pub struct SimpleFactory<S: Stage + Default + 'static> {
    kind: StageKind,
    _marker: std::marker::PhantomData<S>,
}

impl<S: Stage + Default + 'static> SimpleFactory<S> {
    pub fn new(kind: StageKind) -> Self {
        Self {
            kind,
            _marker: std::marker::PhantomData,
        }
    }
}

impl<S: Stage + Default + 'static> StageFactory for SimpleFactory<S> {
    fn build(&self, _ports: &StagePorts) -> Arc<dyn Stage> {
        Arc::new(S::default())
    }

    fn kind(&self) -> StageKind {
        self.kind
    }
}

/// Name-keyed table of stage factories, consulted by [`crate::pipeline`]
/// when composing a topology.
#[derive(Default)]
pub struct StageRegistry {
    factories: HashMap<String, Box<dyn StageFactory>>,
}

impl StageRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, name: impl Into<String>, factory: Box<dyn StageFactory>) {
        self.factories.insert(name.into(), factory);
    }

    pub fn build(&self, name: &str, ports: &StagePorts) -> Option<Arc<dyn Stage>> {
        self.factories.get(name).map(|factory| factory.build(ports))
    }

    pub fn kind_of(&self, name: &str) -> Option<StageKind> {
        self.factories.get(name).map(|factory| factory.kind())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stage::{StageContext, StageOutput};
    use async_trait::async_trait;

    #[derive(Default)]
    struct NoopStage;

    #[async_trait]
    impl Stage for NoopStage {
        fn name(&self) -> &str {
            "noop"
        }

        async fn execute(&self, _ctx: &StageContext) -> StageOutput {
            StageOutput::ok(Default::default())
        }
    }

    #[test]
    fn registry_builds_a_registered_stage_by_name() {
        let mut registry = StageRegistry::new();
        registry.register("noop", Box::new(SimpleFactory::<NoopStage>::new(StageKind::Enrich)));

        assert!(registry.contains("noop"));
        assert_eq!(registry.kind_of("noop"), Some(StageKind::Enrich));
        let stage = registry.build("noop", &StagePorts::default()).unwrap();
        assert_eq!(stage.name(), "noop");
    }

    #[test]
    fn unknown_stage_name_builds_nothing() {
        let registry = StageRegistry::new();
        assert!(registry.build("missing", &StagePorts::default()).is_none());
    }
}
