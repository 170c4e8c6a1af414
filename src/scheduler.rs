//! The Unified Stage Graph scheduler (§4.6): topological stratification plus
//! per-stratum concurrent execution.
//!
//! Grounded on `orchestration.rs`'s `execute_parallel` — fan out a stratum's
//! stages with `tokio::spawn`, collect the `JoinHandle`s, `join` them all
//! before moving to the next stratum. Stratification itself is a textbook
//! Kahn's-algorithm level assignment; the scheduler additionally propagates
//! `Skip`/`Fail` through dependents the way a cancelled upstream leaves its
//! downstream work moot rather than running it against missing inputs.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use crate::cancellation::CancellationHandle;
use crate::context::{ContextSnapshot, RunContext};
use crate::error::KernelError;
use crate::event::{kind, CorrelationIds, Event, EventSink};
use crate::pipeline::Pipeline;
use crate::stage::{StageContext, StageOutput, StagePorts, StageRegistry, StageStatus};

/// A DAG, already bound to a concrete stage registry, ready to run.
pub struct UnifiedStageGraph<'a> {
    pipeline: &'a Pipeline,
    registry: &'a StageRegistry,
    strata: Vec<Vec<String>>,
}

impl<'a> UnifiedStageGraph<'a> {
    /// Validate `pipeline` against `registry` and compute its execution
    /// strata. Fails if a dependency name is unknown or the graph has a
    /// cycle.
    pub fn build(pipeline: &'a Pipeline, registry: &'a StageRegistry) -> Result<Self, KernelError> {
        for spec in &pipeline.stages {
            if !registry.contains(&spec.name) {
                return Err(KernelError::Pipeline(format!(
                    "pipeline {} references unregistered stage {}",
                    pipeline.topology, spec.name
                )));
            }
            for dep in &spec.dependencies {
                if pipeline.spec(dep).is_none() {
                    return Err(KernelError::Pipeline(format!(
                        "stage {} depends on unknown stage {}",
                        spec.name, dep
                    )));
                }
            }
        }

        let strata = stratify(pipeline)?;
        Ok(Self {
            pipeline,
            registry,
            strata,
        })
    }

    pub fn strata(&self) -> &[Vec<String>] {
        &self.strata
    }

    /// Run every stratum in order, fanning stages within a stratum out to
    /// concurrent tasks. Returns the accumulated outputs keyed by stage
    /// name.
    ///
    /// Per the error propagation policy: the first `fail` observed in a
    /// stratum flips the cancellation handle (so any sibling stage in the
    /// same stratum that checks it cooperatively winds down) and stops the
    /// scheduler from advancing to further strata. A `skip` only propagates
    /// to stages whose `conditional` reads the skipped stage's output, or
    /// whose dependency chain passes through it.
    pub async fn run(
        &self,
        run: Arc<RunContext>,
        snapshot: Arc<ContextSnapshot>,
        ports: StagePorts,
        cancellation: CancellationHandle,
        sink: Arc<EventSink>,
        stage_timeout: Duration,
    ) -> HashMap<String, StageOutput> {
        let mut outputs: HashMap<String, StageOutput> = HashMap::new();
        let correlation = CorrelationIds {
            request_id: Some(run.request_id.clone()),
            session_id: Some(snapshot.session_id),
            principal_id: Some(run.principal_id),
            tenant_id: Some(run.tenant_id),
        };

        for stratum in &self.strata {
            if cancellation.is_canceled() {
                for name in stratum {
                    outputs.insert(name.clone(), StageOutput::skip("canceled"));
                }
                continue;
            }

            let mut handles = Vec::with_capacity(stratum.len());
            for name in stratum {
                let spec = self.pipeline.spec(name).expect("validated at build()");

                if spec
                    .dependencies
                    .iter()
                    .any(|dep| matches!(outputs.get(dep).map(|o| &o.status), Some(StageStatus::Skip)))
                {
                    outputs.insert(name.clone(), StageOutput::skip("upstream_skipped"));
                    continue;
                }
                if !spec.should_run(&snapshot, &outputs) {
                    outputs.insert(name.clone(), StageOutput::skip("condition_not_met"));
                    continue;
                }

                let stage = self.registry.build(name, &ports).expect("validated at build()");
                let ctx = StageContext {
                    run: run.clone(),
                    snapshot: snapshot.clone(),
                    upstream: Arc::new(outputs.clone()),
                    ports: ports.clone(),
                    cancellation: cancellation.clone(),
                };
                let name = name.clone();
                let run_id = run.run_id;
                let sink = sink.clone();
                let correlation = correlation.clone();
                sink.try_emit(
                    run_id,
                    kind::STAGE_STARTED,
                    Event::payload([("stage", serde_json::json!(name))]),
                    correlation.clone(),
                );
                handles.push(tokio::spawn(async move {
                    let output = match tokio::time::timeout(stage_timeout, stage.run(&ctx)).await {
                        Ok(output) => output,
                        Err(_) => StageOutput::fail(format!(
                            "stage {name} timed out after {stage_timeout:?}"
                        )),
                    };
                    let event_kind = if output.status == StageStatus::Fail {
                        kind::STAGE_FAILED
                    } else {
                        kind::STAGE_COMPLETED
                    };
                    sink.try_emit(
                        run_id,
                        event_kind,
                        Event::payload([("stage", serde_json::json!(name)), ("status", serde_json::json!(format!("{:?}", output.status)))]),
                        correlation,
                    );
                    (name, output)
                }));
            }

            let mut stage_failed = false;
            for handle in handles {
                match handle.await {
                    Ok((name, output)) => {
                        if output.status == StageStatus::Fail {
                            stage_failed = true;
                        }
                        outputs.insert(name, output);
                    }
                    Err(join_err) => {
                        log::error!("stage task panicked: {join_err}");
                        stage_failed = true;
                    }
                }
            }

            if stage_failed {
                // §4.6: a fail cancels the rest of the run cooperatively and
                // stops the scheduler from advancing to further strata.
                cancellation.cancel();
                break;
            }
        }

        outputs
    }
}

/// Kahn's algorithm, grouped into levels rather than a flat order: every
/// stage in level N depends only on stages in levels `< N`, and all stages
/// in the same level can run concurrently.
fn stratify(pipeline: &Pipeline) -> Result<Vec<Vec<String>>, KernelError> {
    let mut indegree: HashMap<&str, usize> = HashMap::new();
    let mut dependents: HashMap<&str, Vec<&str>> = HashMap::new();

    for spec in &pipeline.stages {
        indegree.insert(&spec.name, spec.dependencies.len());
        for dep in &spec.dependencies {
            dependents.entry(dep.as_str()).or_default().push(&spec.name);
        }
    }

    let mut strata = Vec::new();
    let mut frontier: VecDeque<&str> = indegree
        .iter()
        .filter(|(_, &count)| count == 0)
        .map(|(name, _)| *name)
        .collect();
    let mut remaining = indegree.clone();
    let mut visited: HashSet<&str> = HashSet::new();

    while !frontier.is_empty() {
        let mut level: Vec<String> = frontier.drain(..).map(|s| s.to_string()).collect();
        level.sort();
        for name in &level {
            visited.insert(pipeline.spec(name).unwrap().name.as_str());
        }

        let mut next_frontier = Vec::new();
        for name in &level {
            if let Some(deps) = dependents.get(name.as_str()) {
                for dependent in deps {
                    let count = remaining.get_mut(dependent).unwrap();
                    *count -= 1;
                    if *count == 0 {
                        next_frontier.push(*dependent);
                    }
                }
            }
        }
        strata.push(level);
        frontier.extend(next_frontier);
    }

    if visited.len() != pipeline.stages.len() {
        return Err(KernelError::Pipeline(format!(
            "pipeline {} has a dependency cycle",
            pipeline.topology
        )));
    }

    Ok(strata)
}
