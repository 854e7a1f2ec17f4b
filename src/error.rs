//! Error types for the CDC bridge
//!
//! Splits failures into transient errors (routed through the configured
//! error policy) and structural errors that always terminate the process.

use thiserror::Error;

/// Bridge-wide errors
#[derive(Error, Debug)]
pub enum BridgeError {
    /// Configuration error (invalid flags, missing conninfo)
    #[error("Configuration error: {0}")]
    Config(String),

    /// Replication protocol error (connection, keepalive, slot management)
    #[error("Replication error: {0}")]
    Replication(String),

    /// Change-frame decoding error
    #[error("Frame error: {0}")]
    Frame(String),

    /// Kafka driver error other than queue-full
    #[error("Kafka error: {0}")]
    Kafka(String),

    /// Kafka reported a failed delivery for an enqueued message
    #[error("Message delivery to topic {topic} failed: {reason}")]
    Delivery { topic: String, reason: String },

    /// Message encoding error
    #[error("Encoding error for topic {topic}: {reason}")]
    Encoding { topic: String, reason: String },

    /// Schema registry error
    #[error("Schema registry error: {0}")]
    Registry(String),

    /// Avro schema error
    #[error("Schema error: {0}")]
    Schema(String),

    /// Internal invariant violation (xid mismatch, snapshot out of place)
    #[error("Invariant violation: {0}")]
    Invariant(String),

    /// Graceful shutdown requested mid-operation
    #[error("shutting down")]
    Shutdown,

    /// JSON error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// I/O error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl BridgeError {
    /// Create a new configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a new replication error
    pub fn replication(msg: impl Into<String>) -> Self {
        Self::Replication(msg.into())
    }

    /// Create a new frame error
    pub fn frame(msg: impl Into<String>) -> Self {
        Self::Frame(msg.into())
    }

    /// Create a new Kafka error
    pub fn kafka(msg: impl Into<String>) -> Self {
        Self::Kafka(msg.into())
    }

    /// Create a new delivery error
    pub fn delivery(topic: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Delivery {
            topic: topic.into(),
            reason: reason.into(),
        }
    }

    /// Create a new encoding error
    pub fn encoding(topic: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Encoding {
            topic: topic.into(),
            reason: reason.into(),
        }
    }

    /// Create a new registry error
    pub fn registry(msg: impl Into<String>) -> Self {
        Self::Registry(msg.into())
    }

    /// Create a new schema error
    pub fn schema(msg: impl Into<String>) -> Self {
        Self::Schema(msg.into())
    }

    /// Create a new invariant violation
    pub fn invariant(msg: impl Into<String>) -> Self {
        Self::Invariant(msg.into())
    }

    /// Whether this error terminates the process regardless of the
    /// configured error policy.
    ///
    /// Transient errors (delivery failures, encoding errors, frame-reader
    /// client errors) are subject to the policy; everything structural is
    /// fatal.
    pub fn is_fatal(&self) -> bool {
        match self {
            Self::Delivery { .. } | Self::Encoding { .. } | Self::Frame(_) | Self::Kafka(_) => {
                false
            }
            Self::Config(_)
            | Self::Replication(_)
            | Self::Registry(_)
            | Self::Schema(_)
            | Self::Invariant(_)
            | Self::Shutdown
            | Self::Json(_)
            | Self::Io(_) => true,
        }
    }
}

/// Result type for bridge operations
pub type Result<T> = std::result::Result<T, BridgeError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = BridgeError::delivery("users", "broker down");
        assert!(err.to_string().contains("users"));
        assert!(err.to_string().contains("broker down"));

        let err = BridgeError::invariant("xid mismatch");
        assert!(err.to_string().contains("Invariant"));
    }

    #[test]
    fn test_fatal_split() {
        assert!(BridgeError::config("x").is_fatal());
        assert!(BridgeError::replication("x").is_fatal());
        assert!(BridgeError::invariant("x").is_fatal());
        assert!(BridgeError::Shutdown.is_fatal());

        assert!(!BridgeError::delivery("t", "x").is_fatal());
        assert!(!BridgeError::encoding("t", "x").is_fatal());
        assert!(!BridgeError::frame("x").is_fatal());
        assert!(!BridgeError::kafka("x").is_fatal());
    }
}
