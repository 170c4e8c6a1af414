//! Kernel configuration.
//!
//! Mirrors the teacher crate's minimal, hand-constructed configuration
//! style: no TOML/YAML parsing, no file watching. The embedding application
//! builds a [`KernelConfig`] programmatically, typically once at startup.

use std::time::Duration;

use crate::gateway::CircuitBreakerConfig;

/// Global configuration for the stage orchestration kernel.
///
/// # Example
///
/// ```rust
/// use stageflow_kernel::config::KernelConfig;
///
/// let config = KernelConfig::default();
/// assert_eq!(config.provider_call_timeout, std::time::Duration::from_secs(60));
/// ```
#[derive(Debug, Clone)]
pub struct KernelConfig {
    /// Default timeout applied to any single Provider Call Gateway invocation
    /// unless the operation overrides it.
    pub provider_call_timeout: Duration,
    /// Default timeout applied to a single stage's `execute` call.
    pub stage_timeout: Duration,
    /// Default per-run wall-clock budget, keyed by topology name via
    /// [`KernelConfig::run_deadline`]; this is the fallback when a topology
    /// has no explicit entry.
    pub default_run_deadline: Duration,
    /// Per-topology wall-clock budget overrides.
    pub run_deadlines: Vec<(String, Duration)>,
    /// Circuit breaker tunables, shared by every `(operation, provider,
    /// model)` key tracked by the gateway.
    pub circuit_breaker: CircuitBreakerConfig,
    /// Bounded capacity of each Streaming Bridge queue (tokens, audio
    /// chunks) before the oldest frame is dropped.
    pub streaming_buffer_capacity: usize,
    /// Maximum number of artifacts an Agent Output Applier will accept from
    /// a single agent output before dropping all of them.
    pub max_artifacts: usize,
    /// Maximum payload size, in bytes, of a single artifact.
    pub max_artifact_payload_bytes: usize,
}

impl KernelConfig {
    /// Resolve the wall-clock deadline for a named topology, falling back to
    /// [`KernelConfig::default_run_deadline`] when no override exists.
    pub fn run_deadline(&self, topology: &str) -> Duration {
        self.run_deadlines
            .iter()
            .find(|(name, _)| name == topology)
            .map(|(_, d)| *d)
            .unwrap_or(self.default_run_deadline)
    }
}

impl Default for KernelConfig {
    /// Conservative defaults matching §5's stated timeouts (60s per
    /// provider call, 120s per stage) and §4.8's bounded-queue backpressure.
    fn default() -> Self {
        Self {
            provider_call_timeout: Duration::from_secs(60),
            stage_timeout: Duration::from_secs(120),
            default_run_deadline: Duration::from_secs(180),
            run_deadlines: Vec::new(),
            circuit_breaker: CircuitBreakerConfig::default(),
            streaming_buffer_capacity: 256,
            max_artifacts: 10,
            max_artifact_payload_bytes: 1_000_000,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn falls_back_to_default_deadline_for_unknown_topology() {
        let config = KernelConfig::default();
        assert_eq!(config.run_deadline("voice_fast"), config.default_run_deadline);
    }

    #[test]
    fn topology_override_takes_precedence() {
        let mut config = KernelConfig::default();
        config
            .run_deadlines
            .push(("voice_accurate".into(), Duration::from_secs(300)));
        assert_eq!(config.run_deadline("voice_accurate"), Duration::from_secs(300));
        assert_eq!(config.run_deadline("chat_fast"), config.default_run_deadline);
    }
}
