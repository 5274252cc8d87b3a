//! NATS test infrastructure
//!
//! Provides a `TestNats` helper that creates a NATS container with JetStream for testing.

use async_nats::Client;
use async_nats::jetstream::{self, consumer, stream};
use testcontainers::runners::AsyncRunner;
use testcontainers::{ContainerAsync, ImageExt};
use testcontainers_modules::nats::Nats;

// Re-export so tests can iterate subscriptions and fetch batches
pub use futures::StreamExt;

/// Test NATS wrapper that ensures proper cleanup
///
/// The container is automatically stopped and removed when this struct is dropped.
/// JetStream is enabled for stream-based testing.
///
/// # Example
///
/// ```no_run
/// use test_utils::TestNats;
///
/// # async fn example() {
/// let nats = TestNats::new().await;
///
/// nats.create_work_queue("ORDERS", "orders.created").await;
/// let seq = nats.publish("orders.created", b"{}".to_vec()).await;
/// assert_eq!(seq, 1);
/// # }
/// ```
pub struct TestNats {
    container: ContainerAsync<Nats>,
    client: Client,
    pub connection_string: String,
}

impl TestNats {
    /// Create a new test NATS instance with JetStream enabled
    pub async fn new() -> Self {
        let nats_image = Nats::default().with_tag("latest").with_cmd(["-js"]);

        let container = nats_image
            .start()
            .await
            .expect("Failed to start NATS container");

        let host_port = container
            .get_host_port_ipv4(4222)
            .await
            .expect("Failed to get NATS port");

        let connection_string = format!("nats://127.0.0.1:{}", host_port);

        let client = async_nats::connect(&connection_string)
            .await
            .expect("Failed to connect to NATS");

        tracing::info!(port = host_port, "Test NATS ready with JetStream");

        Self {
            container,
            client,
            connection_string,
        }
    }

    /// Get a cloned client
    pub fn client(&self) -> Client {
        self.client.clone()
    }

    /// Get a JetStream context for stream operations
    pub fn jetstream(&self) -> jetstream::Context {
        jetstream::new(self.client.clone())
    }

    /// Get the connection string for the code under test
    pub fn connection_string(&self) -> &str {
        &self.connection_string
    }

    /// Create a work-queue stream capturing `subject`
    pub async fn create_work_queue(&self, stream_name: &str, subject: &str) -> stream::Stream {
        self.jetstream()
            .create_stream(stream::Config {
                name: stream_name.to_string(),
                subjects: vec![subject.to_string()],
                retention: stream::RetentionPolicy::WorkQueue,
                ..Default::default()
            })
            .await
            .expect("Failed to create stream")
    }

    /// Create a plain (non-work-queue) stream capturing `subjects`
    pub async fn create_stream(&self, stream_name: &str, subjects: &[&str]) -> stream::Stream {
        self.jetstream()
            .create_stream(stream::Config {
                name: stream_name.to_string(),
                subjects: subjects.iter().map(|s| s.to_string()).collect(),
                ..Default::default()
            })
            .await
            .expect("Failed to create stream")
    }

    /// Publish through JetStream and wait for the ack; returns the stream sequence
    pub async fn publish(&self, subject: &str, payload: Vec<u8>) -> u64 {
        self.jetstream()
            .publish(subject.to_string(), payload.into())
            .await
            .expect("Failed to publish")
            .await
            .expect("Failed to get publish ack")
            .sequence
    }

    /// Current state of a durable consumer
    pub async fn consumer_info(&self, stream_name: &str, durable: &str) -> consumer::Info {
        let stream = self
            .jetstream()
            .get_stream(stream_name)
            .await
            .expect("Failed to get stream");
        let mut consumer: consumer::PullConsumer = stream
            .get_consumer(durable)
            .await
            .expect("Failed to get consumer");
        consumer
            .info()
            .await
            .expect("Failed to get consumer info")
            .clone()
    }

    /// Number of messages still stored in a stream
    pub async fn stream_messages(&self, stream_name: &str) -> u64 {
        let mut stream = self
            .jetstream()
            .get_stream(stream_name)
            .await
            .expect("Failed to get stream");
        stream
            .info()
            .await
            .expect("Failed to get stream info")
            .state
            .messages
    }

    /// Stop the server, e.g. to observe reconnect behaviour
    pub async fn stop(&self) {
        self.container
            .stop()
            .await
            .expect("Failed to stop NATS container");
    }
}

// Container is automatically cleaned up when TestNats is dropped
impl Drop for TestNats {
    fn drop(&mut self) {
        tracing::debug!("Cleaning up test NATS container");
    }
}
