//! Error types for the job engine.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

/// Top-level error type for the engine.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("job {name:?} is already registered")]
    NameConflict { name: String },

    #[error("job {name:?} does not exist")]
    JobNotFound { name: String },

    #[error("channel {channel:?} of job {job:?} already exists")]
    ChannelConflict { job: String, channel: String },

    #[error(transparent)]
    Validation(#[from] ValidationFailure),

    #[error("schema compilation failed: {message}")]
    SchemaCompilation { message: String },

    /// A work function failed; the error is propagated verbatim.
    #[error(transparent)]
    Handler(#[from] anyhow::Error),
}

impl Error {
    /// Shorthand for a validation failure at a given boundary.
    pub fn validation(
        boundary: ValidationBoundary,
        job: impl Into<String>,
        faults: Vec<ValidationFault>,
    ) -> Self {
        Self::Validation(ValidationFailure {
            boundary,
            job: job.into(),
            faults,
        })
    }

    /// Wrap this error for fan-out to multiple stream observers.
    pub fn shared(self) -> SharedError {
        Arc::new(self)
    }
}

/// Which schema boundary rejected a value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValidationBoundary {
    Argument,
    Input,
    Output,
    Channel,
}

impl std::fmt::Display for ValidationBoundary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Argument => "argument",
            Self::Input => "input",
            Self::Output => "output",
            Self::Channel => "channel",
        };
        write!(f, "{s}")
    }
}

/// A single fault reported by a validator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationFault {
    /// Path into the rejected value (empty for the root).
    pub path: String,
    /// Human-readable description of the fault.
    pub message: String,
}

impl ValidationFault {
    /// Create a fault at a given path.
    pub fn new(path: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            message: message.into(),
        }
    }

    /// Create a fault at the root of the value.
    pub fn root(message: impl Into<String>) -> Self {
        Self::new("", message)
    }
}

/// Structured schema rejection at one of the job boundaries.
#[derive(Debug, Clone, thiserror::Error, Serialize, Deserialize)]
#[error("{boundary} validation failed for job {job:?}: {}", fault_summary(.faults))]
pub struct ValidationFailure {
    /// The boundary that rejected the value.
    pub boundary: ValidationBoundary,
    /// Name of the job the value was addressed to.
    pub job: String,
    /// The faults reported by the validator.
    pub faults: Vec<ValidationFault>,
}

fn fault_summary(faults: &[ValidationFault]) -> String {
    if faults.is_empty() {
        return "no details".to_string();
    }
    faults
        .iter()
        .map(|f| {
            if f.path.is_empty() {
                f.message.clone()
            } else {
                format!("{}: {}", f.path, f.message)
            }
        })
        .collect::<Vec<_>>()
        .join("; ")
}

/// Result type alias for the engine.
pub type Result<T> = std::result::Result<T, Error>;

/// An error shared across every observer of a multicast stream.
pub type SharedError = Arc<Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validation_failure_display() {
        let err = Error::validation(
            ValidationBoundary::Output,
            "build",
            vec![
                ValidationFault::new("size", "expected number"),
                ValidationFault::root("missing field"),
            ],
        );
        let text = err.to_string();
        assert!(text.contains("output validation failed"));
        assert!(text.contains("size: expected number"));
        assert!(text.contains("missing field"));
    }

    #[test]
    fn handler_error_is_verbatim() {
        let err: Error = anyhow::anyhow!("disk on fire").into();
        assert!(err.to_string().contains("disk on fire"));
    }

    #[test]
    fn boundary_serde_roundtrip() {
        let json = serde_json::to_string(&ValidationBoundary::Argument).unwrap();
        assert_eq!(json, "\"argument\"");
        let parsed: ValidationBoundary = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, ValidationBoundary::Argument);
    }
}
