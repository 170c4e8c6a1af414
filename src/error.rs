//! Kernel-wide error hierarchy.
//!
//! Every failure that crosses a component boundary is eventually converted
//! into a [`KernelError`]. Component-specific errors (e.g. scheduler join
//! failures, gateway timeouts) implement `From<T> for KernelError` rather
//! than being matched individually by callers.

use std::error::Error;
use std::fmt;

/// The error kinds enumerated in the kernel's error handling design.
///
/// # Example
///
/// ```rust
/// use stageflow_kernel::error::KernelError;
///
/// let err = KernelError::NotFound("run 1234".into());
/// assert_eq!(err.to_string(), "not found: run 1234");
/// ```
#[derive(Debug, Clone)]
pub enum KernelError {
    /// Resource missing; not retryable.
    NotFound(String),
    /// Invalid input; not retryable.
    Validation(String),
    /// Principal/tenant mismatch; not retryable.
    Authorization(String),
    /// External provider failure. `retryable` mirrors whether a single retry
    /// is worth attempting; `retry_after` carries a rate-limit hint when the
    /// provider supplied one.
    Provider {
        message: String,
        retryable: bool,
        retry_after: Option<std::time::Duration>,
    },
    /// A guardrails checkpoint blocked the operation. Not an error from the
    /// scheduler's point of view, but surfaced here so stages and callers
    /// that need a `Result` can represent it uniformly.
    Policy { checkpoint: String, reason: String },
    /// Stage failed, pipeline timed out, or pipeline was canceled.
    Pipeline(String),
}

impl fmt::Display for KernelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KernelError::NotFound(msg) => write!(f, "not found: {}", msg),
            KernelError::Validation(msg) => write!(f, "validation error: {}", msg),
            KernelError::Authorization(msg) => write!(f, "authorization error: {}", msg),
            KernelError::Provider { message, .. } => write!(f, "provider error: {}", message),
            KernelError::Policy { checkpoint, reason } => {
                write!(f, "policy blocked at {}: {}", checkpoint, reason)
            }
            KernelError::Pipeline(msg) => write!(f, "pipeline error: {}", msg),
        }
    }
}

impl Error for KernelError {}

impl KernelError {
    /// Construct a non-retryable provider error.
    pub fn provider(message: impl Into<String>) -> Self {
        KernelError::Provider {
            message: message.into(),
            retryable: false,
            retry_after: None,
        }
    }

    /// Construct a retryable provider error, optionally carrying a
    /// rate-limit hint.
    pub fn provider_retryable(
        message: impl Into<String>,
        retry_after: Option<std::time::Duration>,
    ) -> Self {
        KernelError::Provider {
            message: message.into(),
            retryable: true,
            retry_after,
        }
    }

    /// The error's stable class name, used as `error_type` in Dead-Letter
    /// Queue entries and as the `code` in terminal `error` client frames.
    pub fn error_type(&self) -> &'static str {
        match self {
            KernelError::NotFound(_) => "NotFound",
            KernelError::Validation(_) => "Validation",
            KernelError::Authorization(_) => "Authorization",
            KernelError::Provider { .. } => "Provider",
            KernelError::Policy { .. } => "Policy",
            KernelError::Pipeline(_) => "Pipeline",
        }
    }
}
