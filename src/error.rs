//! Error types for gnomestep.
//!
//! Errors are strongly typed using thiserror. Failures raised by a simulation
//! handle stay narrow (`ModelError`) until the orchestrator classifies them into
//! the caller-facing taxonomy of `GnomeError`.

use std::fmt;

use serde::Serialize;
use thiserror::Error;

use crate::model::ModelId;

/// Validation errors that occur during configuration or input validation.
#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("Invalid orchestrator configuration: {reason}")]
    InvalidConfig {
        reason: String,
    },

    #[error("Invalid model configuration: {reason}")]
    InvalidModelConfig {
        reason: String,
    },

    #[error("Invalid session id '{value}'")]
    InvalidSessionId {
        value: String,
    },
}

/// Failures reported across the boundary between the orchestrator and a
/// simulation handle (or one of its uncertain replicas).
#[derive(Debug, Error)]
pub enum ModelError {
    #[error("Model has no further steps")]
    Exhausted,

    #[error("Step failed: {message}")]
    StepFailed {
        message: String,
    },

    #[error("Rewind failed: {message}")]
    RewindFailed {
        message: String,
    },

    #[error("Model panicked{}: {message}", at_location(.location.as_deref()))]
    Panicked {
        message: String,
        location: Option<String>,
        backtrace: Option<String>,
    },

    #[error("Failed to establish uncertain models: {message}")]
    ReplicaSetup {
        message: String,
    },

    #[error("Uncertain model {index} failed: {source}")]
    ReplicaFailed {
        index: usize,
        #[source]
        source: Box<ModelError>,
    },

    #[error("Uncertain model {index} worker disconnected")]
    ReplicaLost {
        index: usize,
    },

    #[error("Uncertain models did not respond within {duration_ms}ms")]
    ReplicaTimeout {
        duration_ms: u64,
    },

    #[error("Uncertain models are unavailable after an earlier failure; rewind required")]
    ReplicasUnavailable,
}

impl ModelError {
    /// Creates a step failure.
    #[must_use]
    pub fn step_failed(message: impl Into<String>) -> Self {
        Self::StepFailed {
            message: message.into(),
        }
    }

    /// Creates a rewind failure.
    #[must_use]
    pub fn rewind_failed(message: impl Into<String>) -> Self {
        Self::RewindFailed {
            message: message.into(),
        }
    }

    /// Returns true if the handle signalled the end of its run.
    #[must_use]
    pub const fn is_exhausted(&self) -> bool {
        matches!(self, Self::Exhausted)
    }
}

fn at_location(location: Option<&str>) -> String {
    location.map(|l| format!(" at {l}")).unwrap_or_default()
}

/// Errors raised while folding replica outputs into bands.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum AggregationError {
    #[error("Uncertain model {index} is missing field '{field}'")]
    MissingField {
        index: usize,
        field: String,
    },

    #[error("Uncertain model {index} produced no '{channel}' output")]
    MissingChannel {
        index: usize,
        channel: String,
    },

    #[error("Output channel '{channel}' collides with a response field")]
    ReservedChannel {
        channel: String,
    },
}

/// Phase of a step or rewind in which a failure occurred.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StepPhase {
    /// Establishing the uncertain set before the first step.
    Initialize,
    /// Advancing the nominal model.
    Nominal,
    /// Advancing the uncertain replicas.
    Uncertain,
    /// Folding replica outputs into bands.
    Aggregate,
    /// Rewinding the nominal model.
    Rewind,
}

impl fmt::Display for StepPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Initialize => "initialize",
            Self::Nominal => "nominal",
            Self::Uncertain => "uncertain",
            Self::Aggregate => "aggregate",
            Self::Rewind => "rewind",
        };
        f.write_str(s)
    }
}

/// Diagnostic detail attached to an unprocessable step or rewind.
///
/// `trace` is the error source chain, outermost first. `stack` holds the
/// backtrace lines of a handle panic and is empty otherwise.
#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Diagnostic {
    pub phase: StepPhase,
    pub model_id: ModelId,
    pub time_step: i64,
    pub message: String,
    pub trace: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub stack: Vec<String>,
}

impl Diagnostic {
    /// Builds a diagnostic from an error and its source chain.
    #[must_use]
    pub fn from_error(
        phase: StepPhase,
        model_id: ModelId,
        time_step: i64,
        err: &(dyn std::error::Error + 'static),
    ) -> Self {
        let mut trace = Vec::new();
        let mut stack = Vec::new();
        let mut current: Option<&(dyn std::error::Error + 'static)> = Some(err);
        while let Some(e) = current {
            trace.push(e.to_string());
            if let Some(ModelError::Panicked {
                backtrace: Some(backtrace),
                ..
            }) = e.downcast_ref::<ModelError>()
            {
                if stack.is_empty() {
                    stack = backtrace.lines().map(|l| l.trim_end().to_string()).collect();
                }
            }
            current = e.source();
        }
        Self {
            phase,
            model_id,
            time_step,
            message: err.to_string(),
            trace,
            stack,
        }
    }
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} phase of model {} at time step {}: {}",
            self.phase, self.model_id, self.time_step, self.message
        )
    }
}

/// Top-level error type for gnomestep.
#[derive(Debug, Error)]
pub enum GnomeError {
    #[error("No active model for this session")]
    PreconditionFailed,

    #[error("Model {model_id} has no further steps; rewind required")]
    NotFound {
        model_id: ModelId,
    },

    #[error("Unprocessable: {0}")]
    Unprocessable(Box<Diagnostic>),

    #[error("Operation timed out after {duration_ms}ms")]
    Timeout {
        duration_ms: u64,
    },

    #[error("Session limit reached (max: {max})")]
    SessionLimit {
        max: usize,
    },

    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("Internal error: {message}")]
    Internal {
        message: String,
    },
}

impl GnomeError {
    /// Creates an internal error.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Creates an unprocessable error from a model-boundary failure.
    #[must_use]
    pub fn unprocessable(
        phase: StepPhase,
        model_id: ModelId,
        time_step: i64,
        err: &(dyn std::error::Error + 'static),
    ) -> Self {
        Self::Unprocessable(Box::new(Diagnostic::from_error(phase, model_id, time_step, err)))
    }

    /// Converts a `Duration` into a timeout error.
    #[must_use]
    pub fn timeout(duration: std::time::Duration) -> Self {
        Self::Timeout {
            duration_ms: u64::try_from(duration.as_millis()).unwrap_or(u64::MAX),
        }
    }

    /// Returns the diagnostic for unprocessable errors.
    #[must_use]
    pub fn diagnostic(&self) -> Option<&Diagnostic> {
        match self {
            Self::Unprocessable(d) => Some(d),
            _ => None,
        }
    }

    /// Returns true if no active model exists for the session.
    #[must_use]
    pub const fn is_precondition_failed(&self) -> bool {
        matches!(self, Self::PreconditionFailed)
    }

    /// Returns true if the model has run out of steps.
    #[must_use]
    pub const fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    /// Returns true if the operation failed while executing.
    #[must_use]
    pub const fn is_unprocessable(&self) -> bool {
        matches!(self, Self::Unprocessable(_))
    }

    /// Returns true if this is a timeout.
    #[must_use]
    pub const fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }

    /// Returns true if the model stays unusable until a rewind.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    /// Returns true if this error is retryable without corrective action.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::Timeout { .. } | Self::SessionLimit { .. })
    }
}

/// Result type alias for gnomestep operations.
pub type GnomeResult<T> = Result<T, GnomeError>;
