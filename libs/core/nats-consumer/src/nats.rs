//! JetStream implementation of the broker traits.

use crate::broker::{Broker, Connector, Delivery, Subscription};
use crate::error::{ConsumerError, FetchError};
use crate::handler::{Message, MessageMetadata};
use async_nats::connection::State;
use async_nats::jetstream::consumer::{pull, AckPolicy, Consumer};
use async_nats::jetstream::{self, AckKind};
use async_nats::{Client, ConnectOptions};
use async_trait::async_trait;
use futures::StreamExt;
use std::fmt::Display;
use std::time::Duration;
use tracing::{debug, warn};

/// Connects to a NATS server with JetStream enabled.
#[derive(Debug, Clone, Default)]
pub struct NatsConnector {
    client_name: Option<String>,
}

impl NatsConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Client name reported to the server.
    pub fn with_client_name(mut self, name: impl Into<String>) -> Self {
        self.client_name = Some(name.into());
        self
    }
}

#[async_trait]
impl Connector for NatsConnector {
    type Broker = NatsBroker;

    async fn connect(&self, url: &str) -> Result<NatsBroker, ConsumerError> {
        let mut options = ConnectOptions::new();
        if let Some(name) = &self.client_name {
            options = options.name(name);
        }

        let client = options.connect(url).await.map_err(ConsumerError::connection)?;
        debug!(url, "Connected to NATS");
        Ok(NatsBroker::new(client))
    }
}

/// Shared NATS connection plus its JetStream context.
#[derive(Clone)]
pub struct NatsBroker {
    client: Client,
    jetstream: jetstream::Context,
}

impl NatsBroker {
    pub fn new(client: Client) -> Self {
        let jetstream = jetstream::new(client.clone());
        Self { client, jetstream }
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    pub fn jetstream(&self) -> &jetstream::Context {
        &self.jetstream
    }
}

#[async_trait]
impl Broker for NatsBroker {
    type Subscription = NatsSubscription;

    /// Binds to the durable on whichever stream captures `subject`, creating
    /// the durable if it does not exist yet.
    async fn subscribe(
        &self,
        subject: &str,
        durable_name: &str,
    ) -> Result<NatsSubscription, ConsumerError> {
        let stream_name = self
            .jetstream
            .stream_by_subject(subject)
            .await
            .map_err(ConsumerError::subscribe)?;

        let stream = self
            .jetstream
            .get_stream(&stream_name)
            .await
            .map_err(ConsumerError::subscribe)?;

        let consumer = stream
            .get_or_create_consumer(
                durable_name,
                pull::Config {
                    durable_name: Some(durable_name.to_string()),
                    name: Some(durable_name.to_string()),
                    filter_subject: subject.to_string(),
                    ack_policy: AckPolicy::Explicit,
                    ..Default::default()
                },
            )
            .await
            .map_err(ConsumerError::subscribe)?;

        debug!(stream = %stream_name, durable = durable_name, "Bound pull consumer");
        Ok(NatsSubscription {
            consumer,
            client: self.client.clone(),
        })
    }

    /// Flush, then drain: remaining subscriptions are drained and the
    /// connection is closed.
    async fn drain(&self) -> Result<(), ConsumerError> {
        self.client.flush().await.map_err(ConsumerError::connection)?;
        self.client.drain().await.map_err(ConsumerError::connection)?;
        debug!("NATS connection drained");
        Ok(())
    }
}

/// Pull subscription on a durable JetStream consumer.
pub struct NatsSubscription {
    consumer: Consumer<pull::Config>,
    client: Client,
}

impl NatsSubscription {
    fn classify(&self, error: impl Display) -> FetchError {
        let message = error.to_string();
        if !self.is_valid() || is_connection_failure(&message) {
            FetchError::connection(message)
        } else {
            FetchError::other(message)
        }
    }
}

#[async_trait]
impl Subscription for NatsSubscription {
    type Delivery = NatsDelivery;

    fn is_valid(&self) -> bool {
        matches!(self.client.connection_state(), State::Connected)
    }

    async fn fetch(&mut self, max_wait: Duration) -> Result<Option<NatsDelivery>, FetchError> {
        let mut batch = match self
            .consumer
            .fetch()
            .max_messages(1)
            .expires(max_wait)
            .messages()
            .await
        {
            Ok(batch) => batch,
            Err(e) if is_timeout(&e.to_string()) => return Ok(None),
            Err(e) => return Err(self.classify(e)),
        };

        match batch.next().await {
            None => Ok(None),
            Some(Ok(message)) => Ok(Some(NatsDelivery::new(message))),
            Some(Err(e)) if is_timeout(&e.to_string()) => Ok(None),
            Some(Err(e)) => Err(self.classify(e)),
        }
    }

    async fn unsubscribe(self) -> Result<(), ConsumerError> {
        // pull consumers hold no server-side interest between fetches
        Ok(())
    }
}

/// A JetStream message awaiting acknowledgment.
pub struct NatsDelivery {
    message: Message,
    inner: jetstream::Message,
}

impl NatsDelivery {
    fn new(inner: jetstream::Message) -> Self {
        let (delivered, stream_sequence) = match inner.info() {
            Ok(info) => (
                u64::try_from(info.delivered).unwrap_or(1).max(1),
                info.stream_sequence,
            ),
            Err(e) => {
                warn!(error = %e, "Failed to read message info, assuming first delivery");
                (1, 0)
            }
        };

        let message = Message::new(
            inner.payload.to_vec(),
            MessageMetadata {
                subject: inner.subject.to_string(),
                delivered,
                stream_sequence,
            },
        );
        Self { message, inner }
    }
}

#[async_trait]
impl Delivery for NatsDelivery {
    fn message(&self) -> &Message {
        &self.message
    }

    async fn ack(self) -> Result<(), ConsumerError> {
        self.inner.ack().await.map_err(ConsumerError::acknowledgment)
    }

    async fn nak(self) -> Result<(), ConsumerError> {
        self.inner
            .ack_with(AckKind::Nak(None))
            .await
            .map_err(ConsumerError::acknowledgment)
    }

    async fn term(self) -> Result<(), ConsumerError> {
        self.inner
            .ack_with(AckKind::Term)
            .await
            .map_err(ConsumerError::acknowledgment)
    }
}

fn is_timeout(message: &str) -> bool {
    let message = message.to_lowercase();
    message.contains("timed out") || message.contains("timeout")
}

/// Errors after which the subscription should be recreated.
fn is_connection_failure(message: &str) -> bool {
    const MARKERS: [&str; 7] = [
        "connection closed",
        "disconnected",
        "not connected",
        "no responders",
        "consumer deleted",
        "consumer not found",
        "stream not found",
    ];
    let message = message.to_lowercase();
    MARKERS.iter().any(|marker| message.contains(marker))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timeout_classification() {
        assert!(is_timeout("request timed out"));
        assert!(is_timeout("Timeout"));
        assert!(!is_timeout("connection closed"));
    }

    #[test]
    fn test_connection_failure_classification() {
        assert!(is_connection_failure("Connection closed by server"));
        assert!(is_connection_failure("no responders"));
        assert!(is_connection_failure("consumer not found"));
        assert!(is_connection_failure("Consumer deleted"));
        assert!(!is_connection_failure("invalid status code 409"));
    }
}
