//! Core NATS producer for publishing replies.

use crate::config::ProducerConfig;
use crate::error::ConsumerError;
use async_nats::Client;
use async_trait::async_trait;
use serde::Serialize;
use tracing::debug;

/// Publishes raw payloads to a subject.
///
/// Handlers take this rather than a concrete producer so they can be driven
/// by the in-memory broker in tests.
#[async_trait]
pub trait Publisher: Send + Sync + 'static {
    async fn publish(&self, subject: &str, payload: Vec<u8>) -> Result<(), ConsumerError>;
}

/// Producer for publishing messages over a plain NATS connection.
#[derive(Clone)]
pub struct NatsProducer {
    client: Option<Client>,
    subject: String,
}

impl NatsProducer {
    /// Connect using the given configuration.
    pub async fn connect(config: &ProducerConfig) -> Result<Self, ConsumerError> {
        config.validate()?;

        let client = async_nats::connect(&config.nats_url)
            .await
            .map_err(ConsumerError::connection)?;

        debug!(url = %config.nats_url, subject = %config.subject, "NATS producer connected");
        Ok(Self::from_client(client, config.subject.clone()))
    }

    /// Wrap an existing connection.
    pub fn from_client(client: Client, subject: impl Into<String>) -> Self {
        Self {
            client: Some(client),
            subject: subject.into(),
        }
    }

    /// Get the default subject.
    pub fn subject(&self) -> &str {
        &self.subject
    }

    pub fn is_closed(&self) -> bool {
        self.client.is_none()
    }

    /// Publish to the default subject.
    pub async fn send(&self, payload: impl Into<Vec<u8>>) -> Result<(), ConsumerError> {
        self.publish_to(&self.subject, payload.into()).await
    }

    /// Serialize `value` as JSON and publish it to the default subject.
    pub async fn send_json<T: Serialize>(&self, value: &T) -> Result<(), ConsumerError> {
        let payload = serde_json::to_vec(value)?;
        self.publish_to(&self.subject, payload).await
    }

    /// Publish to an explicit subject.
    pub async fn publish_to(&self, subject: &str, payload: Vec<u8>) -> Result<(), ConsumerError> {
        let client = self
            .client
            .as_ref()
            .ok_or_else(|| ConsumerError::publish("NATS connection is not initialized"))?;

        let bytes = payload.len();
        client
            .publish(subject.to_string(), payload.into())
            .await
            .map_err(ConsumerError::publish)?;

        debug!(subject, bytes, "Published message");
        Ok(())
    }

    /// Flush buffered messages, then drain and close the connection.
    ///
    /// Clones share the connection, so closing one closes them all.
    pub async fn close(&mut self) -> Result<(), ConsumerError> {
        if let Some(client) = self.client.take() {
            client.flush().await.map_err(ConsumerError::publish)?;
            client.drain().await.map_err(ConsumerError::connection)?;
            debug!(subject = %self.subject, "NATS producer closed");
        }
        Ok(())
    }
}

#[async_trait]
impl Publisher for NatsProducer {
    async fn publish(&self, subject: &str, payload: Vec<u8>) -> Result<(), ConsumerError> {
        self.publish_to(subject, payload).await
    }
}
