//! Prometheus-style metrics for the consumer.
//!
//! Recorded through the `metrics` facade; nothing is exported unless the
//! application installs a recorder (see `bot_worker`'s health server).

use crate::handler::HandleResult;
use metrics::{counter, gauge, histogram};
use std::time::Duration;

/// Metrics handle labelled with subject and consumer name.
#[derive(Debug, Clone)]
pub struct ConsumerMetrics {
    subject: String,
    consumer: String,
}

impl ConsumerMetrics {
    pub fn new(subject: &str, consumer: &str) -> Self {
        Self {
            subject: subject.to_string(),
            consumer: consumer.to_string(),
        }
    }

    /// Record a message fetched.
    pub fn message_received(&self) {
        counter!(
            "nats_consumer_messages_received_total",
            "subject" => self.subject.clone(),
            "consumer" => self.consumer.clone()
        )
        .increment(1);
    }

    /// Record the disposition a message was resolved with.
    pub fn message_resolved(&self, result: HandleResult) {
        counter!(
            "nats_consumer_messages_resolved_total",
            "subject" => self.subject.clone(),
            "consumer" => self.consumer.clone(),
            "result" => result.as_str()
        )
        .increment(1);
    }

    /// Record how long the handler ran.
    pub fn handler_duration(&self, duration: Duration) {
        histogram!(
            "nats_consumer_handler_duration_seconds",
            "subject" => self.subject.clone(),
            "consumer" => self.consumer.clone()
        )
        .record(duration.as_secs_f64());
    }

    /// Record a handler panic.
    pub fn handler_panicked(&self) {
        counter!(
            "nats_consumer_handler_panics_total",
            "subject" => self.subject.clone(),
            "consumer" => self.consumer.clone()
        )
        .increment(1);
    }

    /// Record a failed subscribe attempt.
    pub fn subscribe_failed(&self) {
        counter!(
            "nats_consumer_subscribe_failures_total",
            "subject" => self.subject.clone(),
            "consumer" => self.consumer.clone()
        )
        .increment(1);
    }

    /// Record a subscription being dropped and recreated.
    pub fn resubscribed(&self) {
        counter!(
            "nats_consumer_resubscriptions_total",
            "subject" => self.subject.clone(),
            "consumer" => self.consumer.clone()
        )
        .increment(1);
    }

    /// Record a non-timeout fetch error.
    pub fn fetch_failed(&self, connection: bool) {
        counter!(
            "nats_consumer_fetch_errors_total",
            "subject" => self.subject.clone(),
            "consumer" => self.consumer.clone(),
            "kind" => if connection { "connection" } else { "other" }
        )
        .increment(1);
    }

    /// Record a failed Ack/Nak/Term call.
    pub fn acknowledgment_failed(&self, result: HandleResult) {
        counter!(
            "nats_consumer_ack_failures_total",
            "subject" => self.subject.clone(),
            "consumer" => self.consumer.clone(),
            "result" => result.as_str()
        )
        .increment(1);
    }

    /// Update the running workers gauge.
    pub fn active_workers(&self, count: usize) {
        gauge!(
            "nats_consumer_active_workers",
            "subject" => self.subject.clone(),
            "consumer" => self.consumer.clone()
        )
        .set(count as f64);
    }
}
