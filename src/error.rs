//! Error types for the scheduler and the compute engine boundary

use serde::Serialize;
use thiserror::Error;

use crate::scheduler::RequestId;

/// Errors reported by a compute engine primitive
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Model not loaded")]
    ModelNotLoaded,

    #[error("Context exhausted: {0}")]
    ContextExhausted(String),

    #[error("Decode failed: {0}")]
    Decode(String),

    #[error("Model load interrupted")]
    Interrupted,

    #[error("Unsupported operation: {0}")]
    Unsupported(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors returned synchronously by scheduler operations
///
/// Failures that happen while a queued request is executing are never
/// returned here; they are delivered through the request's final outcome.
#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("A model load is already in progress")]
    AlreadyLoading,

    #[error("Model not loaded")]
    ModelNotLoaded,

    #[error("Resource busy: {0}")]
    ResourceBusy(String),

    #[error("Context exhausted: {0}")]
    ContextExhausted(String),

    #[error("Decode error: {0}")]
    Decode(String),

    #[error("Model load interrupted")]
    Interrupted,

    #[error("Unknown request id: {0}")]
    UnknownRequestId(RequestId),

    #[error("Scheduler has been shut down")]
    ShutDown,

    #[error("Engine error: {0}")]
    Engine(EngineError),
}

impl SchedulerError {
    /// Stable error tag for the host binding layer
    pub fn error_type(&self) -> &'static str {
        match self {
            SchedulerError::Configuration(_) => "configuration_error",
            SchedulerError::AlreadyLoading => "already_loading",
            SchedulerError::ModelNotLoaded => "model_not_loaded",
            SchedulerError::ResourceBusy(_) => "resource_busy",
            SchedulerError::ContextExhausted(_) => "context_exhausted",
            SchedulerError::Decode(_) => "decode_error",
            SchedulerError::Interrupted => "interrupted",
            SchedulerError::UnknownRequestId(_) => "unknown_request_id",
            SchedulerError::ShutDown => "shut_down",
            SchedulerError::Engine(_) => "engine_error",
        }
    }

    pub(crate) fn config(msg: impl Into<String>) -> Self {
        SchedulerError::Configuration(msg.into())
    }
}

impl From<EngineError> for SchedulerError {
    fn from(err: EngineError) -> Self {
        match err {
            EngineError::ModelNotLoaded => SchedulerError::ModelNotLoaded,
            EngineError::ContextExhausted(msg) => SchedulerError::ContextExhausted(msg),
            EngineError::Decode(msg) => SchedulerError::Decode(msg),
            EngineError::Interrupted => SchedulerError::Interrupted,
            other => SchedulerError::Engine(other),
        }
    }
}

/// Failure tag carried by a failed request outcome
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    ModelNotLoaded,
    ContextExhausted,
    DecodeError,
    Configuration,
}

impl FailureKind {
    /// Classify an engine error raised while a request was executing
    pub fn from_engine(err: &EngineError) -> Self {
        match err {
            EngineError::ModelNotLoaded => FailureKind::ModelNotLoaded,
            EngineError::ContextExhausted(_) => FailureKind::ContextExhausted,
            EngineError::Unsupported(_) => FailureKind::Configuration,
            EngineError::Decode(_) | EngineError::Interrupted | EngineError::Io(_) => {
                FailureKind::DecodeError
            }
        }
    }

    /// Rebuild the synchronous error for a failed outcome
    pub fn into_error(self, message: impl Into<String>) -> SchedulerError {
        let message = message.into();
        match self {
            FailureKind::ModelNotLoaded => SchedulerError::ModelNotLoaded,
            FailureKind::ContextExhausted => SchedulerError::ContextExhausted(message),
            FailureKind::DecodeError => SchedulerError::Decode(message),
            FailureKind::Configuration => SchedulerError::Configuration(message),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_engine_errors_map_onto_taxonomy() {
        assert!(matches!(
            SchedulerError::from(EngineError::ModelNotLoaded),
            SchedulerError::ModelNotLoaded
        ));
        assert!(matches!(
            SchedulerError::from(EngineError::ContextExhausted("kv".into())),
            SchedulerError::ContextExhausted(_)
        ));
        assert!(matches!(
            SchedulerError::from(EngineError::Interrupted),
            SchedulerError::Interrupted
        ));
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        assert!(matches!(
            SchedulerError::from(EngineError::Io(io)),
            SchedulerError::Engine(EngineError::Io(_))
        ));
    }

    #[test]
    fn test_failure_kind_classification() {
        assert_eq!(
            FailureKind::from_engine(&EngineError::Decode("nan".into())),
            FailureKind::DecodeError
        );
        assert_eq!(
            FailureKind::from_engine(&EngineError::ContextExhausted("full".into())),
            FailureKind::ContextExhausted
        );
        assert_eq!(
            SchedulerError::ResourceBusy("x".into()).error_type(),
            "resource_busy"
        );
    }

    #[test]
    fn test_failure_kind_back_to_error() {
        assert!(matches!(
            FailureKind::DecodeError.into_error("nan"),
            SchedulerError::Decode(msg) if msg == "nan"
        ));
        assert!(matches!(
            FailureKind::ModelNotLoaded.into_error("ignored"),
            SchedulerError::ModelNotLoaded
        ));
    }
}
