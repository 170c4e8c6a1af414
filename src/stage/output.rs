//! Stage Output (§3, §4.6).
//!
//! Shape grounded on
//! `original_source/project/app/application/pipelines/stages/base.py`'s
//! `StageResult`, translated from an exception-catching dataclass into a
//! tagged status union per `SPEC_FULL.md` §9 Design Notes item 4: stages
//! never throw to signal policy outcomes, they return `Skip`.

use std::collections::HashMap;
use std::time::Duration;

use serde_json::Value;

use crate::event::Event;

/// The outcome of one stage's `execute` call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StageStatus {
    Ok,
    Fail,
    Skip,
}

/// Transient, in-memory result of one stage invocation. Downstream stages
/// read upstream outputs by stage name via the results map built by the
/// scheduler.
#[derive(Debug, Clone)]
pub struct StageOutput {
    pub status: StageStatus,
    pub results: HashMap<String, Value>,
    pub error: Option<String>,
    /// Events a stage author wants flushed to the sink on completion, in
    /// addition to whatever it already emitted durably/fire-and-forget
    /// during `execute`.
    pub events: Vec<Event>,
    pub latency: Option<Duration>,
}

impl StageOutput {
    pub fn ok(results: HashMap<String, Value>) -> Self {
        Self {
            status: StageStatus::Ok,
            results,
            error: None,
            events: Vec::new(),
            latency: None,
        }
    }

    pub fn fail(error: impl Into<String>) -> Self {
        Self {
            status: StageStatus::Fail,
            results: HashMap::new(),
            error: Some(error.into()),
            events: Vec::new(),
            latency: None,
        }
    }

    pub fn skip(reason: impl Into<String>) -> Self {
        let mut results = HashMap::new();
        results.insert("skip_reason".to_string(), Value::String(reason.into()));
        Self {
            status: StageStatus::Skip,
            results,
            error: None,
            events: Vec::new(),
            latency: None,
        }
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.results.get(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn skip_records_a_reason_result() {
        let output = StageOutput::skip("canceled");
        assert_eq!(output.status, StageStatus::Skip);
        assert_eq!(output.get("skip_reason").unwrap(), "canceled");
    }

    #[test]
    fn fail_carries_error_string() {
        let output = StageOutput::fail("timeout");
        assert_eq!(output.status, StageStatus::Fail);
        assert_eq!(output.error.as_deref(), Some("timeout"));
    }
}
