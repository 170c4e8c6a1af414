//! Stage kind tags (§4.4).

/// The four stage kinds the Stage Registry classifies every stage under.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageKind {
    /// Rewrites or augments context (e.g. STT, LLM stream).
    Transform,
    /// Fetches or computes auxiliary data.
    Enrich,
    /// Chooses a downstream branch or parameter.
    Route,
    /// Side-effectful (persistence, assessment, telemetry).
    Work,
}

impl StageKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            StageKind::Transform => "TRANSFORM",
            StageKind::Enrich => "ENRICH",
            StageKind::Route => "ROUTE",
            StageKind::Work => "WORK",
        }
    }
}
