//! Error types for the pull consumer.

use thiserror::Error;

/// Error that can occur in consumer, producer or broker operations.
///
/// None of these is fatal to a running worker pool: the worker loop logs them
/// and either retries (connection, subscribe, fetch) or leaves the message to
/// the broker's redelivery policy (acknowledgment).
#[derive(Debug, Error)]
pub enum ConsumerError {
    /// Invalid configuration, rejected at construction
    #[error("Configuration error: {0}")]
    Config(String),

    /// Initial connection to the broker could not be established
    #[error("NATS connection error: {0}")]
    Connection(String),

    /// Durable pull subscription could not be created
    #[error("Subscribe error: {0}")]
    Subscribe(String),

    /// Fetch failed with something other than a timeout
    #[error("Fetch error: {0}")]
    Fetch(#[from] FetchError),

    /// Ack/Nak/Term call to the broker failed
    #[error("Acknowledgment error: {0}")]
    Acknowledgment(String),

    /// Publish error
    #[error("Publish error: {0}")]
    Publish(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl ConsumerError {
    /// Create a configuration error.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a connection error from any displayable broker error.
    pub fn connection(error: impl std::fmt::Display) -> Self {
        Self::Connection(error.to_string())
    }

    /// Create a subscribe error from any displayable broker error.
    pub fn subscribe(error: impl std::fmt::Display) -> Self {
        Self::Subscribe(error.to_string())
    }

    /// Create an acknowledgment error.
    pub fn acknowledgment(error: impl std::fmt::Display) -> Self {
        Self::Acknowledgment(error.to_string())
    }

    /// Create a publish error.
    pub fn publish(error: impl std::fmt::Display) -> Self {
        Self::Publish(error.to_string())
    }

    /// Whether the worker should throw away its subscription and resubscribe.
    pub fn is_connection_error(&self) -> bool {
        match self {
            ConsumerError::Connection(_) => true,
            ConsumerError::Fetch(e) => e.is_connection_error(),
            _ => false,
        }
    }
}

/// Non-timeout failure of a fetch call.
///
/// A fetch that simply waited out `pull_max_wait` without a message is not an
/// error and never produces one of these.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FetchError {
    /// Closed connection, no responders, or the subscription is gone.
    /// The held subscription must be discarded.
    #[error("connection lost: {0}")]
    Connection(String),

    /// Anything else. The subscription is kept.
    #[error("{0}")]
    Other(String),
}

impl FetchError {
    /// Create a connection-class fetch error.
    pub fn connection(msg: impl Into<String>) -> Self {
        Self::Connection(msg.into())
    }

    /// Create a non-connection fetch error.
    pub fn other(msg: impl Into<String>) -> Self {
        Self::Other(msg.into())
    }

    /// Check whether this error invalidates the subscription.
    pub fn is_connection_error(&self) -> bool {
        matches!(self, FetchError::Connection(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fetch_error_classification() {
        assert!(FetchError::connection("connection closed").is_connection_error());
        assert!(!FetchError::other("bad request").is_connection_error());
    }

    #[test]
    fn test_consumer_error_connection_class() {
        assert!(ConsumerError::connection("refused").is_connection_error());
        assert!(ConsumerError::from(FetchError::connection("no responders")).is_connection_error());
        assert!(!ConsumerError::from(FetchError::other("oops")).is_connection_error());
        assert!(!ConsumerError::subscribe("stream not found").is_connection_error());
        assert!(!ConsumerError::config("subject is required").is_connection_error());
    }

    #[test]
    fn test_error_display() {
        let err = ConsumerError::config("nats_url is required");
        assert_eq!(err.to_string(), "Configuration error: nats_url is required");

        let err = ConsumerError::from(FetchError::connection("connection closed"));
        assert_eq!(err.to_string(), "Fetch error: connection lost: connection closed");
    }
}
