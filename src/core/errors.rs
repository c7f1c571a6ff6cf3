// Error types for the compositing pipeline
//
// Using thiserror for typed, matchable failures:
// - One request-level taxonomy (InfuseError) that the HTTP layer maps to responses
// - Sampler failures kept separate so exhaustion can be told apart from bugs
// - Configuration failures surfaced once at startup

use thiserror::Error;

/// HTTP-agnostic classification of a request failure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// The request itself was unusable; resubmitting it unchanged will fail again
    Client,
    /// The server could not complete a valid request
    Server,
}

/// Request pipeline errors
#[derive(Debug, Error)]
pub enum InfuseError {
    #[error("Invalid transform: {0}")]
    InvalidTransform(String),

    #[error("Failed to decode {field}: {reason}")]
    ImageDecode { field: &'static str, reason: String },

    #[error("Placement does not overlap the canvas (bbox {x1},{y1} -> {x2},{y2})")]
    DegenerateBoundingBox { x1: i64, y1: i64, x2: i64, y2: i64 },

    #[error("batch_count must be between 1 and {max}, got {value}")]
    InvalidBatchCount { value: i64, max: usize },

    #[error("step_count must be between 1 and {max}, got {value}")]
    InvalidStepCount { value: i64, max: u32 },

    #[error("Malformed request: {0}")]
    MalformedRequest(String),

    #[error("Sampler resources exhausted, retry later")]
    SamplerExhausted(String),

    #[error("Request cancelled before sampling finished")]
    Cancelled,

    #[error("Internal error: {0}")]
    Internal(String),
}

impl InfuseError {
    pub fn class(&self) -> ErrorClass {
        match self {
            InfuseError::InvalidTransform(_)
            | InfuseError::ImageDecode { .. }
            | InfuseError::DegenerateBoundingBox { .. }
            | InfuseError::InvalidBatchCount { .. }
            | InfuseError::InvalidStepCount { .. }
            | InfuseError::MalformedRequest(_)
            | InfuseError::Cancelled => ErrorClass::Client,
            InfuseError::SamplerExhausted(_) | InfuseError::Internal(_) => ErrorClass::Server,
        }
    }

    /// Whether a client may resubmit the same request after backing off
    pub fn retryable(&self) -> bool {
        matches!(self, InfuseError::SamplerExhausted(_))
    }

    /// Short stable name used for metrics labels and logs
    pub fn kind(&self) -> &'static str {
        match self {
            InfuseError::InvalidTransform(_) => "invalid_transform",
            InfuseError::ImageDecode { .. } => "image_decode",
            InfuseError::DegenerateBoundingBox { .. } => "degenerate_bbox",
            InfuseError::InvalidBatchCount { .. } => "invalid_batch_count",
            InfuseError::InvalidStepCount { .. } => "invalid_step_count",
            InfuseError::MalformedRequest(_) => "malformed_request",
            InfuseError::SamplerExhausted(_) => "sampler_exhausted",
            InfuseError::Cancelled => "cancelled",
            InfuseError::Internal(_) => "internal",
        }
    }

    /// Message safe to return to clients. Internal details stay in the logs.
    pub fn public_message(&self) -> String {
        match self {
            InfuseError::Internal(_) => "Internal server error".to_string(),
            other => other.to_string(),
        }
    }
}

/// Sampler failures
#[derive(Debug, Error)]
pub enum SamplerError {
    #[error("Device resources exhausted: {0}")]
    Exhausted(String),

    #[error("Sampling cancelled")]
    Cancelled,

    #[error("Sampler backend failed: {0}")]
    Backend(String),

    #[error("Sampler output shape mismatch: expected {expected}, got {actual}")]
    ShapeMismatch { expected: String, actual: String },

    #[error("Sampler is shutting down")]
    Unavailable,
}

impl SamplerError {
    /// Classify a raw backend failure, promoting allocation failures to `Exhausted`
    pub fn from_backend(message: impl Into<String>) -> Self {
        let message = message.into();
        let lower = message.to_lowercase();
        let exhausted = ["out of memory", "failed to allocate", "cuda_error_out_of_memory"]
            .iter()
            .any(|needle| lower.contains(needle));

        if exhausted {
            SamplerError::Exhausted(message)
        } else {
            SamplerError::Backend(message)
        }
    }
}

impl From<ort::Error> for SamplerError {
    fn from(err: ort::Error) -> Self {
        SamplerError::from_backend(err.to_string())
    }
}

impl From<SamplerError> for InfuseError {
    fn from(err: SamplerError) -> Self {
        match err {
            SamplerError::Exhausted(msg) => InfuseError::SamplerExhausted(msg),
            SamplerError::Cancelled => InfuseError::Cancelled,
            other => InfuseError::Internal(other.to_string()),
        }
    }
}

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Canvas size must be a multiple of 8 in 64..=2048, got {0}")]
    InvalidCanvasSize(u32),

    #[error("COORDINATE_SCALE_FACTOR must be 1 or 0.5, got {0}")]
    InvalidCoordinateScale(String),

    #[error("Unknown BBOX_POLICY '{0}' (expected nested-half or centered)")]
    InvalidBboxPolicy(String),

    #[error("Invalid sampler config: {0}")]
    InvalidSamplerConfig(String),

    #[error("Invalid server config: {0}")]
    InvalidServerConfig(String),
}

pub type InfuseResult<T> = Result<T, InfuseError>;
pub type SamplerResult<T> = Result<T, SamplerError>;
pub type ConfigResult<T> = Result<T, ConfigError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classification() {
        assert_eq!(InfuseError::InvalidTransform("x".into()).class(), ErrorClass::Client);
        assert_eq!(
            InfuseError::DegenerateBoundingBox { x1: 0, y1: 0, x2: 0, y2: 0 }.class(),
            ErrorClass::Client
        );
        assert_eq!(InfuseError::SamplerExhausted("oom".into()).class(), ErrorClass::Server);
        assert!(InfuseError::SamplerExhausted("oom".into()).retryable());
        assert!(!InfuseError::Internal("boom".into()).retryable());
    }

    #[test]
    fn test_internal_message_hidden() {
        let err = InfuseError::Internal("tensor at 0x7ffe dropped".into());
        assert_eq!(err.public_message(), "Internal server error");
    }

    #[test]
    fn test_backend_oom_promoted() {
        let err = SamplerError::from_backend("CUDA failure 2: out of memory");
        assert!(matches!(err, SamplerError::Exhausted(_)));

        let err = SamplerError::from_backend("Invalid input name: sample");
        assert!(matches!(err, SamplerError::Backend(_)));

        let mapped: InfuseError = SamplerError::Cancelled.into();
        assert!(matches!(mapped, InfuseError::Cancelled));
    }
}
