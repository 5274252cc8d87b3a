//! Worker pull loop.
//!
//! Each worker owns one subscription and processes strictly one message at a
//! time:
//!
//! ```text
//! NO_SUB ─▶ SUBSCRIBING ─▶ SUBSCRIBED ⇄ FETCHING ─▶ DISPATCHING ─▶ FETCHING
//!    ▲            │                          │
//!    │      (fail: 2s backoff)     (invalid / connection error)
//!    └────────────┴──────────────────────────┘
//! ```
//!
//! Cancellation is only observed at the top of an iteration and right before
//! a fetch. A running fetch or handler is never interrupted.

use crate::broker::{Broker, Delivery, Subscription};
use crate::config::ConsumerConfig;
use crate::error::ConsumerError;
use crate::handler::{HandleResult, Handler, HandlerContext, HandlerSlot, Message, MessageMetadata};
use crate::metrics::ConsumerMetrics;
use futures::FutureExt;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::{debug, error, info, warn, Instrument, Span};

/// Fixed sleep after a failed subscribe attempt.
pub const RESUBSCRIBE_BACKOFF: Duration = Duration::from_secs(2);

type DeliveryOf<B> = <<B as Broker>::Subscription as Subscription>::Delivery;

/// One member of the consumer's worker pool.
pub(crate) struct Worker<B: Broker> {
    pub(crate) id: usize,
    pub(crate) broker: Arc<B>,
    pub(crate) config: Arc<ConsumerConfig>,
    pub(crate) handler: HandlerSlot,
    pub(crate) metrics: ConsumerMetrics,
    pub(crate) active: Arc<AtomicUsize>,
    pub(crate) span: Span,
}

impl<B: Broker> Worker<B> {
    /// Run until cancelled. Returns the worker id.
    pub(crate) async fn run(self, mut shutdown: watch::Receiver<bool>) -> usize {
        let active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.metrics.active_workers(active);
        info!("Consumer worker started");

        let max_wait = self.config.pull_max_wait();
        let mut subscription: Option<B::Subscription> = None;

        loop {
            if is_cancelled(&shutdown) {
                info!("Consumer worker stopping");
                break;
            }

            if subscription.as_ref().is_some_and(|sub| !sub.is_valid()) {
                warn!("Subscription is invalid, recreating");
                self.metrics.resubscribed();
                subscription = None;
            }

            if subscription.is_none() {
                match self
                    .broker
                    .subscribe(&self.config.subject, &self.config.consumer_name)
                    .await
                {
                    Ok(sub) => {
                        info!(
                            subject = %self.config.subject,
                            consumer = %self.config.consumer_name,
                            "Subscribed to subject"
                        );
                        subscription = Some(sub);
                    }
                    Err(e) => {
                        error!(error = %e, "Failed to subscribe to subject");
                        self.metrics.subscribe_failed();
                        backoff(&mut shutdown).await;
                        continue;
                    }
                }
            }

            let Some(sub) = subscription.as_mut() else {
                continue;
            };

            if is_cancelled(&shutdown) {
                info!("Consumer worker stopping");
                break;
            }

            match sub.fetch(max_wait).await {
                Ok(Some(delivery)) => self.dispatch(delivery).await,
                Ok(None) => debug!("No messages received, continuing"),
                Err(e) => {
                    let err = ConsumerError::from(e);
                    let connection = err.is_connection_error();
                    error!(error = %err, "Failed to fetch messages");
                    self.metrics.fetch_failed(connection);

                    if connection {
                        warn!(error = %err, "Bad subscription, will recreate");
                        self.metrics.resubscribed();
                        subscription = None;
                    }
                }
            }
        }

        if let Some(sub) = subscription.take() {
            match sub.unsubscribe().await {
                Ok(()) => info!("Unsubscribed from subject"),
                Err(e) => error!(error = %e, "Failed to unsubscribe from subject"),
            }
        }

        let active = self.active.fetch_sub(1, Ordering::SeqCst) - 1;
        self.metrics.active_workers(active);
        info!("Consumer worker stopped");
        self.id
    }

    /// Decide the disposition of one delivery and tell the broker.
    async fn dispatch(&self, delivery: DeliveryOf<B>) {
        self.metrics.message_received();

        let result = match self.handler.current().await {
            Some(handler) => {
                let message = delivery.message();
                self.invoke(handler.as_ref(), message).await
            }
            None => {
                warn!("No handler set, message will be requeued");
                HandleResult::Nak
            }
        };

        let metadata = delivery.message().metadata.clone();
        match resolve(delivery, result).await {
            Ok(()) => {
                self.metrics.message_resolved(result);
                debug!(
                    result = %result,
                    delivered = metadata.delivered,
                    sequence = metadata.stream_sequence,
                    "Message resolved"
                );
            }
            Err(e) => {
                self.metrics.acknowledgment_failed(result);
                error!(error = %e, result = %result, "Failed to resolve message");
            }
        }
    }

    /// Failure-isolating invocation: a panic becomes a Nak.
    async fn invoke(&self, handler: &dyn Handler, message: &Message) -> HandleResult {
        log_delivery(&message.metadata);

        let ctx = HandlerContext {
            worker_id: self.id,
            metadata: message.metadata.clone(),
            span: self.span.clone(),
        };

        let start = Instant::now();
        let outcome = AssertUnwindSafe(handler.handle(&ctx, message).instrument(self.span.clone()))
            .catch_unwind()
            .await;
        self.metrics.handler_duration(start.elapsed());

        match outcome {
            Ok(result) => result,
            Err(panic) => {
                error!(panic = %panic_message(panic.as_ref()), "Recovered from panic");
                self.metrics.handler_panicked();
                HandleResult::Nak
            }
        }
    }
}

/// Map a disposition onto the broker's acknowledgment primitive.
pub(crate) async fn resolve<D: Delivery>(
    delivery: D,
    result: HandleResult,
) -> Result<(), ConsumerError> {
    match result {
        HandleResult::Ack => delivery.ack().await,
        HandleResult::Nak => delivery.nak().await,
        HandleResult::Term => delivery.term().await,
    }
}

fn log_delivery(metadata: &MessageMetadata) {
    if metadata.is_redelivery() {
        debug!(
            subject = %metadata.subject,
            delivered = metadata.delivered,
            sequence = metadata.stream_sequence,
            "Processing redelivered message"
        );
    } else {
        debug!(
            subject = %metadata.subject,
            sequence = metadata.stream_sequence,
            "Processing message"
        );
    }
}

/// Cancelled, or the supervisor went away without closing.
fn is_cancelled(shutdown: &watch::Receiver<bool>) -> bool {
    *shutdown.borrow() || shutdown.has_changed().is_err()
}

/// Sleep the resubscribe backoff, waking early on cancellation.
async fn backoff(shutdown: &mut watch::Receiver<bool>) {
    tokio::select! {
        _ = tokio::time::sleep(RESUBSCRIBE_BACKOFF) => {}
        _ = shutdown.wait_for(|stop| *stop) => {}
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(msg) = panic.downcast_ref::<&str>() {
        (*msg).to_string()
    } else if let Some(msg) = panic.downcast_ref::<String>() {
        msg.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::Connector;
    use crate::memory::MemoryBroker;

    async fn fetch_one(broker: &MemoryBroker) -> DeliveryOf<MemoryBroker> {
        let mut sub = broker.subscribe("test.subject", "TEST_CONSUMER").await.unwrap();
        sub.fetch(Duration::from_millis(100)).await.unwrap().unwrap()
    }

    #[tokio::test]
    async fn test_resolve_maps_each_result() {
        let broker = MemoryBroker::new();
        let connected = broker.connect("memory://").await.unwrap();
        let ack = connected.enqueue("test.subject", b"ack".to_vec());
        let nak = connected.enqueue("test.subject", b"nak".to_vec());
        let term = connected.enqueue("test.subject", b"term".to_vec());

        resolve(fetch_one(&connected).await, HandleResult::Ack).await.unwrap();
        resolve(fetch_one(&connected).await, HandleResult::Nak).await.unwrap();
        resolve(fetch_one(&connected).await, HandleResult::Term).await.unwrap();

        let stats = connected.stats();
        assert_eq!(stats.acks.get(&ack), Some(&1));
        assert_eq!(stats.naks.get(&nak), Some(&1));
        assert_eq!(stats.terms.get(&term), Some(&1));
        // the nak-ed message is back in the queue, the others are gone
        assert_eq!(connected.pending("TEST_CONSUMER"), 1);
    }

    #[tokio::test]
    async fn test_resolve_reports_ack_failure() {
        let broker = MemoryBroker::new();
        broker.enqueue("test.subject", b"x".to_vec());
        broker.fail_acks(true);

        let delivery = fetch_one(&broker).await;
        let err = resolve(delivery, HandleResult::Ack).await.unwrap_err();
        assert!(matches!(err, ConsumerError::Acknowledgment(_)));

        // unresolved delivery goes back to the broker
        assert_eq!(broker.pending("TEST_CONSUMER"), 1);
    }

    #[test]
    fn test_panic_message() {
        let payload: Box<dyn Any + Send> = Box::new("boom");
        assert_eq!(panic_message(payload.as_ref()), "boom");

        let payload: Box<dyn Any + Send> = Box::new(String::from("kaboom"));
        assert_eq!(panic_message(payload.as_ref()), "kaboom");

        let payload: Box<dyn Any + Send> = Box::new(42u8);
        assert_eq!(panic_message(payload.as_ref()), "unknown panic payload");
    }

    #[tokio::test]
    async fn test_is_cancelled() {
        let (tx, rx) = watch::channel(false);
        assert!(!is_cancelled(&rx));

        tx.send_replace(true);
        assert!(is_cancelled(&rx));

        let (tx, rx) = watch::channel(false);
        drop(tx);
        assert!(is_cancelled(&rx));
    }

    #[tokio::test(start_paused = true)]
    async fn test_backoff_wakes_on_cancel() {
        let (tx, mut rx) = watch::channel(false);
        let start = tokio::time::Instant::now();

        let handle = tokio::spawn(async move {
            backoff(&mut rx).await;
        });
        tokio::time::sleep(Duration::from_millis(100)).await;
        tx.send_replace(true);
        handle.await.unwrap();

        assert!(start.elapsed() < RESUBSCRIBE_BACKOFF);
    }
}
