//! The Stage contract (§6) and Stage Registry & Port Injection (§4.4).
//!
//! `Stage` mirrors the object-safe async-trait pattern the teacher uses for
//! `ClientWrapper` (`client_wrapper.rs`); `Stage::run` wraps `execute` with
//! timing and exception-to-`fail` conversion the way the source's
//! `Stage.run()` wraps `execute()`
//! (`original_source/project/app/application/pipelines/stages/base.py`).

pub mod kind;
pub mod output;
pub mod ports;
pub mod registry;

pub use kind::StageKind;
pub use output::{StageOutput, StageStatus};
pub use ports::StagePorts;
pub use registry::{StageFactory, StageRegistry};

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;

use crate::cancellation::CancellationHandle;
use crate::context::{ContextSnapshot, RunContext};

/// The per-stage view passed into `execute`: the immutable run-wide
/// snapshot, already-completed upstream outputs by name, the injected
/// ports, and a cancellation probe.
///
/// Every field is `Arc`-backed or cheaply `Clone`, rather than borrowed, so
/// the scheduler can hand one `StageContext` to each `tokio::spawn`ed stage
/// within a stratum without fighting lifetimes.
#[derive(Clone)]
pub struct StageContext {
    pub run: Arc<RunContext>,
    pub snapshot: Arc<ContextSnapshot>,
    pub upstream: Arc<HashMap<String, StageOutput>>,
    pub ports: StagePorts,
    pub cancellation: CancellationHandle,
}

impl StageContext {
    /// Convenience accessor mirroring `StageOutput::get` for an upstream
    /// stage's result map.
    pub fn upstream_result(&self, stage_name: &str, key: &str) -> Option<&serde_json::Value> {
        self.upstream.get(stage_name).and_then(|output| output.get(key))
    }
}

/// A named unit of work within a run.
///
/// Implementations never throw to signal policy outcomes — they return
/// [`StageOutput::skip`]. Unhandled panics inside `execute` are not caught by
/// [`Stage::run`] (Rust has no general exception mechanism to intercept);
/// instead, fallible logic within a stage should return
/// [`StageOutput::fail`] explicitly, mirroring the source's
/// exception-to-`StageResult` conversion without relying on `catch_unwind`.
#[async_trait]
pub trait Stage: Send + Sync {
    fn name(&self) -> &str;

    async fn execute(&self, ctx: &StageContext) -> StageOutput;

    /// Hook called before `execute`. No-op by default.
    async fn before_execute(&self, _ctx: &StageContext) {}

    /// Hook called after `execute`. No-op by default.
    async fn after_execute(&self, _ctx: &StageContext, _output: &StageOutput) {}

    /// Run the stage with timing and the before/after hooks, matching the
    /// source's `Stage.run()` wrapper.
    async fn run(&self, ctx: &StageContext) -> StageOutput {
        let start = Instant::now();
        self.before_execute(ctx).await;
        let mut output = self.execute(ctx).await;
        self.after_execute(ctx, &output).await;
        output.latency = Some(start.elapsed());
        output
    }
}
