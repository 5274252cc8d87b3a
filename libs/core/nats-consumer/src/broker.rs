//! Broker abstraction used by the worker pool.
//!
//! The consumer never talks to NATS directly; it goes through these traits so
//! the same worker loop runs against JetStream ([`crate::nats`]) and against
//! the in-memory broker ([`crate::memory`]) used in tests.
//!
//! ```text
//! Connector ──connect──▶ Broker ──subscribe──▶ Subscription ──fetch──▶ Delivery
//!  (once per start)     (shared)             (one per worker)        (ack/nak/term)
//! ```

use crate::error::{ConsumerError, FetchError};
use crate::handler::Message;
use async_trait::async_trait;
use std::time::Duration;

/// Establishes the shared broker connection.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    type Broker: Broker;

    /// Connect to the broker at `url`.
    async fn connect(&self, url: &str) -> Result<Self::Broker, ConsumerError>;
}

/// Shared broker connection.
///
/// Workers only use it to create their own subscriptions.
#[async_trait]
pub trait Broker: Send + Sync + 'static {
    type Subscription: Subscription;

    /// Create a pull subscription bound to `(subject, durable_name)` with
    /// manual acknowledgment.
    async fn subscribe(
        &self,
        subject: &str,
        durable_name: &str,
    ) -> Result<Self::Subscription, ConsumerError>;

    /// Flush pending I/O and release the connection.
    async fn drain(&self) -> Result<(), ConsumerError>;
}

/// Pull subscription owned by exactly one worker.
#[async_trait]
pub trait Subscription: Send + 'static {
    type Delivery: Delivery;

    /// Whether the subscription is still usable. Checked before every fetch.
    fn is_valid(&self) -> bool;

    /// Fetch at most one message, waiting up to `max_wait`.
    ///
    /// `Ok(None)` means the wait elapsed with no message.
    async fn fetch(&mut self, max_wait: Duration) -> Result<Option<Self::Delivery>, FetchError>;

    /// Release the subscription.
    async fn unsubscribe(self) -> Result<(), ConsumerError>
    where
        Self: Sized;
}

/// A fetched message together with its acknowledgment handle.
///
/// Every resolution method consumes the delivery, so a delivery attempt can
/// only be resolved once.
#[async_trait]
pub trait Delivery: Send + 'static {
    fn message(&self) -> &Message;

    /// Acknowledge (successful processing).
    async fn ack(self) -> Result<(), ConsumerError>
    where
        Self: Sized;

    /// Negative acknowledge (request redelivery).
    async fn nak(self) -> Result<(), ConsumerError>
    where
        Self: Sized;

    /// Terminate (never redeliver).
    async fn term(self) -> Result<(), ConsumerError>
    where
        Self: Sized;
}
