use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Failures surfaced by the voice capture pipeline.
///
/// Only `DeviceUnavailable` is fatal to a session. Everything else is logged
/// and the tick loop keeps running.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
pub enum CallError {
    #[error("Microphone unavailable: {0}")]
    DeviceUnavailable(String),
    #[error("Recording could not start: {0}")]
    TransientCaptureFailure(String),
    #[error("Audio dispatch failed: {0}")]
    DispatchFailure(String),
    #[error("Audio dispatch timed out after {0}ms")]
    DispatchTimeout(u64),
    #[error("Audio encoding failed: {0}")]
    Encoding(String),
}

impl CallError {
    /// Whether the enclosing session has to be closed.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::DeviceUnavailable(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let e1 = CallError::DeviceUnavailable("permission denied".to_string());
        assert_eq!(e1.to_string(), "Microphone unavailable: permission denied");

        let e2 = CallError::DispatchTimeout(15000);
        assert_eq!(e2.to_string(), "Audio dispatch timed out after 15000ms");
    }

    #[test]
    fn test_only_device_unavailable_is_fatal() {
        assert!(CallError::DeviceUnavailable("x".into()).is_fatal());
        assert!(!CallError::TransientCaptureFailure("x".into()).is_fatal());
        assert!(!CallError::DispatchFailure("x".into()).is_fatal());
        assert!(!CallError::Encoding("x".into()).is_fatal());
    }
}
