//! Error types for the natsq worker.

use thiserror::Error;

/// Error that can occur in natsq worker operations.
#[derive(Debug, Error)]
pub enum NatsqError {
    /// Invalid worker configuration
    #[error("Configuration error: {0}")]
    Config(String),

    /// NATS connection error
    #[error("NATS connection error: {0}")]
    Connection(String),

    /// Publish error
    #[error("Publish error: {0}")]
    Publish(String),

    /// Subscription registration error
    #[error("Subscribe error: {0}")]
    Subscribe(String),

    /// Unsubscribe error
    #[error("Unsubscribe error: {0}")]
    Unsubscribe(String),

    /// Error while closing the connection
    #[error("Close error: {0}")]
    Close(String),

    /// Payload could not be encoded
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Message has no reply subject to acknowledge on
    #[error("Message is not bound to an acknowledgeable subscription")]
    NotBound,

    /// Message was already acked or naked
    #[error("Message was already acknowledged")]
    AlreadyAcknowledged,
}

impl NatsqError {
    /// Whether the error comes from the broker connection rather than local input.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            NatsqError::Connection(_)
                | NatsqError::Publish(_)
                | NatsqError::Subscribe(_)
                | NatsqError::Unsubscribe(_)
                | NatsqError::Close(_)
        )
    }

    /// Returns a short stable label (snake_case) for use in logs/metrics.
    pub fn as_label(&self) -> &'static str {
        match self {
            NatsqError::Config(_) => "config",
            NatsqError::Connection(_) => "connection",
            NatsqError::Publish(_) => "publish",
            NatsqError::Subscribe(_) => "subscribe",
            NatsqError::Unsubscribe(_) => "unsubscribe",
            NatsqError::Close(_) => "close",
            NatsqError::Serialization(_) => "serialization",
            NatsqError::NotBound => "not_bound",
            NatsqError::AlreadyAcknowledged => "already_acknowledged",
        }
    }

    /// Create a configuration error.
    pub fn config_error(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a connection error from a client error.
    pub fn connection_error(error: impl std::fmt::Display) -> Self {
        Self::Connection(error.to_string())
    }

    /// Create a publish error from a client error.
    pub fn publish_error(error: impl std::fmt::Display) -> Self {
        Self::Publish(error.to_string())
    }

    /// Create a subscribe error from a client error.
    pub fn subscribe_error(error: impl std::fmt::Display) -> Self {
        Self::Subscribe(error.to_string())
    }

    /// Create an unsubscribe error from a client error.
    pub fn unsubscribe_error(error: impl std::fmt::Display) -> Self {
        Self::Unsubscribe(error.to_string())
    }

    /// Create a close error from a client error.
    pub fn close_error(error: impl std::fmt::Display) -> Self {
        Self::Close(error.to_string())
    }
}
