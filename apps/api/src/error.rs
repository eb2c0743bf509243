//! Error handling for the Prysmalight synchronization layer
//!
//! Every failure that reaches a Device Service caller is a [`DeviceError`].
//! Broker-level failures are converted at the service boundary so the
//! resolver layer only ever sees this taxonomy.

use thiserror::Error;

use crate::broker::BrokerError;
use crate::models::MessageError;

/// Main error type surfaced by the Device Service
#[derive(Error, Debug)]
pub enum DeviceError {
    // ========== Bus Errors ==========
    /// No usable broker connection at call time (or it dropped mid-call)
    #[error("message broker unavailable: {0}")]
    BrokerUnavailable(String),

    /// The bus rejected a subscribe attempt
    #[error("failed to subscribe to '{topic}': {reason}")]
    SubscribeError { topic: String, reason: String },

    /// No reply arrived before the deadline
    #[error("no reply on '{topic}' within {timeout_ms}ms")]
    Timeout { topic: String, timeout_ms: u64 },

    // ========== Device Errors ==========
    /// A device payload failed validation at the parse boundary
    #[error("malformed device message: {0}")]
    MalformedEvent(String),

    /// The operation referenced a light that is not registered
    #[error("light not found: {0}")]
    UnknownDevice(String),

    /// The light is already registered
    #[error("light already exists: {0}")]
    AlreadyExists(String),

    /// The device answered the command with an error
    #[error("light '{id}' rejected the command: {reason}")]
    DeviceRejected { id: String, reason: String },

    /// Caller-supplied input is invalid
    #[error("invalid input: {0}")]
    InvalidInput(String),

    // ========== Store Errors ==========
    /// Redis operation failed
    #[error("store error: {0}")]
    Store(#[from] redis::RedisError),

    /// Stored data could not be decoded
    #[error("corrupt stored state for '{id}': {reason}")]
    CorruptState { id: String, reason: String },

    // ========== Internal Errors ==========
    /// JSON serialization/deserialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl DeviceError {
    /// Get the error code string for client-side handling
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::BrokerUnavailable(_) => "BROKER_UNAVAILABLE",
            Self::SubscribeError { .. } => "SUBSCRIBE_ERROR",
            Self::Timeout { .. } => "TIMEOUT",
            Self::MalformedEvent(_) => "MALFORMED_EVENT",
            Self::UnknownDevice(_) => "UNKNOWN_DEVICE",
            Self::AlreadyExists(_) => "ALREADY_EXISTS",
            Self::DeviceRejected { .. } => "DEVICE_REJECTED",
            Self::InvalidInput(_) => "INVALID_INPUT",
            Self::Store(_) => "STORE_ERROR",
            Self::CorruptState { .. } => "CORRUPT_STATE",
            Self::Serialization(_) => "SERIALIZATION_ERROR",
        }
    }

    /// Whether retrying the same operation later could succeed
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::BrokerUnavailable(_) | Self::Timeout { .. } | Self::Store(_)
        )
    }

    /// Create an unknown-device error
    pub fn unknown(id: impl Into<String>) -> Self {
        Self::UnknownDevice(id.into())
    }

    /// Create a subscribe error for a topic
    pub fn subscribe(topic: impl Into<String>, reason: impl std::fmt::Display) -> Self {
        Self::SubscribeError {
            topic: topic.into(),
            reason: reason.to_string(),
        }
    }

    /// Log the error with a severity matching who is at fault
    pub fn log(&self) {
        match self {
            Self::BrokerUnavailable(_)
            | Self::SubscribeError { .. }
            | Self::Store(_)
            | Self::CorruptState { .. }
            | Self::Serialization(_) => {
                tracing::error!(error = %self, code = self.error_code(), "Light operation failed");
            }
            Self::Timeout { .. } | Self::DeviceRejected { .. } | Self::MalformedEvent(_) => {
                tracing::warn!(error = %self, code = self.error_code(), "Light did not comply");
            }
            Self::UnknownDevice(_) | Self::AlreadyExists(_) | Self::InvalidInput(_) => {
                tracing::debug!(error = %self, code = self.error_code(), "Client error");
            }
        }
    }
}

/// Result type alias for Device Service operations
pub type DeviceResult<T> = Result<T, DeviceError>;

// ========== Conversion Implementations ==========

impl From<BrokerError> for DeviceError {
    fn from(err: BrokerError) -> Self {
        match err {
            BrokerError::Subscribe { filter, reason } => Self::SubscribeError {
                topic: filter,
                reason,
            },
            BrokerError::InvalidTopic(topic) => {
                Self::InvalidInput(format!("invalid topic '{}'", topic))
            }
            other => Self::BrokerUnavailable(other.to_string()),
        }
    }
}

impl From<MessageError> for DeviceError {
    fn from(err: MessageError) -> Self {
        Self::MalformedEvent(err.to_string())
    }
}
