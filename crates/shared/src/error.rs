use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::ids::ConversationKey;

/// Wire tag for a terminal generation failure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum GenerationErrorKind {
    LanguageModelUnavailable,
    LanguageModelCreationFailed,
    QuotaExceeded,
    NetworkError,
    ImageProcessingError,
    SessionNotFound,
    DeliveryFailed,
    Generic,
}

/// Failures raised by the worker's session store. None of these are retried.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GenerationError {
    #[error("Language model is not available on this device")]
    LanguageModelUnavailable,

    #[error("Failed to create language model session: {0}")]
    LanguageModelCreationFailed(String),

    #[error("Quota exceeded: {usage}/{limit}")]
    QuotaExceeded {
        usage: u64,
        limit: u64,
        partial: Option<String>,
    },

    #[error("Network error: {0}")]
    NetworkError(String),

    #[error("Image processing failed: {0}")]
    ImageProcessingError(String),

    #[error("No session for conversation {0}")]
    SessionNotFound(ConversationKey),

    #[error("Generation failed: {0}")]
    Generic(String),
}

impl GenerationError {
    pub fn kind(&self) -> GenerationErrorKind {
        match self {
            GenerationError::LanguageModelUnavailable => GenerationErrorKind::LanguageModelUnavailable,
            GenerationError::LanguageModelCreationFailed(_) => {
                GenerationErrorKind::LanguageModelCreationFailed
            }
            GenerationError::QuotaExceeded { .. } => GenerationErrorKind::QuotaExceeded,
            GenerationError::NetworkError(_) => GenerationErrorKind::NetworkError,
            GenerationError::ImageProcessingError(_) => GenerationErrorKind::ImageProcessingError,
            GenerationError::SessionNotFound(_) => GenerationErrorKind::SessionNotFound,
            GenerationError::Generic(_) => GenerationErrorKind::Generic,
        }
    }

    /// Text generated before a mid-stream abort, if any
    pub fn partial(&self) -> Option<&str> {
        match self {
            GenerationError::QuotaExceeded {
                partial: Some(text),
                ..
            } if !text.is_empty() => Some(text),
            _ => None,
        }
    }
}

/// A hop between contexts failed. Eligible for the one-shot retry.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("Could not establish connection. Receiving end does not exist.")]
    NoReceiver,

    #[error("Message channel closed before a response was received")]
    ChannelClosed,

    #[error("{what} timed out after {after:?}")]
    Timeout { what: &'static str, after: Duration },
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DeliveryError {
    #[error("Worker context unavailable after {attempts} readiness probes")]
    WorkerUnavailable { attempts: u32 },

    #[error("Delivery failed: {cause}")]
    DeliveryFailed {
        #[source]
        cause: TransportError,
    },
}

/// The host refused to create or close a worker context
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Worker host error: {0}")]
pub struct HostError(pub String);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_only_for_non_empty_quota_text() {
        let with_text = GenerationError::QuotaExceeded {
            usage: 10,
            limit: 10,
            partial: Some("Half an answer".into()),
        };
        assert_eq!(with_text.partial(), Some("Half an answer"));

        let empty = GenerationError::QuotaExceeded {
            usage: 10,
            limit: 10,
            partial: Some(String::new()),
        };
        assert_eq!(empty.partial(), None);
        assert_eq!(GenerationError::LanguageModelUnavailable.partial(), None);
    }

    #[test]
    fn test_delivery_failed_keeps_cause() {
        let err = DeliveryError::DeliveryFailed {
            cause: TransportError::NoReceiver,
        };
        assert!(err.to_string().contains("Receiving end does not exist"));
    }
}
