//! In-memory broker.
//!
//! Work-queue semantics per durable consumer, explicit acknowledgment and
//! per-attempt delivery counts, plus fault injection so the worker pool can
//! be exercised without a NATS server. Clones share state.

use crate::broker::{Broker, Connector, Delivery, Subscription};
use crate::error::{ConsumerError, FetchError};
use crate::handler::{HandleResult, Message, MessageMetadata};
use crate::producer::Publisher;
use async_trait::async_trait;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::{timeout_at, Instant};

#[derive(Default)]
struct Shared {
    state: Mutex<State>,
    notify: Notify,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

struct Stored {
    subject: String,
    payload: Vec<u8>,
}

struct Durable {
    filter: String,
    pending: VecDeque<u64>,
    in_flight: HashSet<u64>,
}

#[derive(Default)]
struct State {
    messages: Vec<Stored>,
    durables: HashMap<String, Durable>,
    deliveries: HashMap<u64, u64>,
    stats: MemoryStats,

    generation: u64,
    refuse_connections: bool,
    failing_subscribes: usize,
    fetch_failures: VecDeque<FetchError>,
    fail_acks: bool,
    drained: bool,
}

impl State {
    fn append(&mut self, subject: &str, payload: Vec<u8>) -> u64 {
        self.messages.push(Stored {
            subject: subject.to_string(),
            payload,
        });
        let sequence = self.messages.len() as u64;

        for durable in self.durables.values_mut() {
            if subject_matches(&durable.filter, subject) {
                durable.pending.push_back(sequence);
            }
        }
        sequence
    }

    fn ensure_durable(&mut self, name: &str, filter: &str) {
        let messages = &self.messages;
        self.durables.entry(name.to_string()).or_insert_with(|| {
            // a new durable sees the whole stream
            let pending = messages
                .iter()
                .enumerate()
                .filter(|(_, m)| subject_matches(filter, &m.subject))
                .map(|(i, _)| i as u64 + 1)
                .collect();
            Durable {
                filter: filter.to_string(),
                pending,
                in_flight: HashSet::new(),
            }
        });
    }

    fn take_next(&mut self, durable: &str) -> Option<(u64, Message)> {
        let sequence = {
            let durable = self.durables.get_mut(durable)?;
            let sequence = durable.pending.pop_front()?;
            durable.in_flight.insert(sequence);
            sequence
        };

        let delivered = self.deliveries.entry(sequence).or_insert(0);
        *delivered += 1;
        let delivered = *delivered;

        let stored = &self.messages[(sequence - 1) as usize];
        let message = Message::new(
            stored.payload.clone(),
            MessageMetadata {
                subject: stored.subject.clone(),
                delivered,
                stream_sequence: sequence,
            },
        );
        Some((sequence, message))
    }
}

/// NATS-style subject match supporting `*` and a trailing `>`.
fn subject_matches(filter: &str, subject: &str) -> bool {
    let mut filter = filter.split('.');
    let mut subject = subject.split('.');
    loop {
        match (filter.next(), subject.next()) {
            (Some(">"), Some(_)) => return true,
            (Some("*"), Some(_)) => {}
            (Some(f), Some(s)) if f == s => {}
            (None, None) => return true,
            _ => return false,
        }
    }
}

/// Counters observed by tests.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MemoryStats {
    /// Ack count by stream sequence
    pub acks: HashMap<u64, usize>,
    /// Nak count by stream sequence
    pub naks: HashMap<u64, usize>,
    /// Term count by stream sequence
    pub terms: HashMap<u64, usize>,
    pub connections: usize,
    pub subscribe_attempts: usize,
    pub fetches: usize,
    pub unsubscribes: usize,
    pub drains: usize,
    /// Set if anything touched the broker after it was drained
    pub used_after_drain: bool,
}

impl MemoryStats {
    pub fn total_acks(&self) -> usize {
        self.acks.values().sum()
    }

    pub fn total_naks(&self) -> usize {
        self.naks.values().sum()
    }

    pub fn total_terms(&self) -> usize {
        self.terms.values().sum()
    }
}

/// In-memory broker; implements both [`Connector`] and [`Broker`].
#[derive(Clone, Default)]
pub struct MemoryBroker {
    shared: Arc<Shared>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Publish a message, returning its stream sequence.
    pub fn enqueue(&self, subject: &str, payload: impl Into<Vec<u8>>) -> u64 {
        let sequence = self.shared.lock().append(subject, payload.into());
        self.shared.notify.notify_one();
        sequence
    }

    /// Snapshot of the counters.
    pub fn stats(&self) -> MemoryStats {
        self.shared.lock().stats.clone()
    }

    /// How many times a message has been handed out.
    pub fn delivery_count(&self, sequence: u64) -> u64 {
        self.shared
            .lock()
            .deliveries
            .get(&sequence)
            .copied()
            .unwrap_or(0)
    }

    /// Messages waiting to be fetched by `durable`.
    pub fn pending(&self, durable: &str) -> usize {
        self.shared
            .lock()
            .durables
            .get(durable)
            .map_or(0, |d| d.pending.len())
    }

    /// Messages fetched by `durable` but not yet resolved.
    pub fn in_flight(&self, durable: &str) -> usize {
        self.shared
            .lock()
            .durables
            .get(durable)
            .map_or(0, |d| d.in_flight.len())
    }

    /// Payloads published on `subject`, in order.
    pub fn published(&self, subject: &str) -> Vec<Vec<u8>> {
        self.shared
            .lock()
            .messages
            .iter()
            .filter(|m| m.subject == subject)
            .map(|m| m.payload.clone())
            .collect()
    }

    pub fn is_drained(&self) -> bool {
        self.shared.lock().drained
    }

    /// Make `connect` fail.
    pub fn refuse_connections(&self, refuse: bool) {
        self.shared.lock().refuse_connections = refuse;
    }

    /// Make the next `count` subscribe attempts fail.
    pub fn fail_next_subscribes(&self, count: usize) {
        self.shared.lock().failing_subscribes = count;
    }

    /// Queue an error for the next fetch.
    pub fn fail_next_fetch(&self, error: FetchError) {
        self.shared.lock().fetch_failures.push_back(error);
        self.shared.notify.notify_waiters();
    }

    /// Make ack/nak/term calls fail.
    pub fn fail_acks(&self, fail: bool) {
        self.shared.lock().fail_acks = fail;
    }

    /// Invalidate every outstanding subscription, as a connection drop would.
    pub fn invalidate_subscriptions(&self) {
        self.shared.lock().generation += 1;
        self.shared.notify.notify_waiters();
    }
}

#[async_trait]
impl Connector for MemoryBroker {
    type Broker = MemoryBroker;

    async fn connect(&self, _url: &str) -> Result<MemoryBroker, ConsumerError> {
        let mut state = self.shared.lock();
        if state.refuse_connections {
            return Err(ConsumerError::connection("connection refused"));
        }
        state.stats.connections += 1;
        state.drained = false;
        Ok(self.clone())
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    type Subscription = MemorySubscription;

    async fn subscribe(
        &self,
        subject: &str,
        durable_name: &str,
    ) -> Result<MemorySubscription, ConsumerError> {
        let mut state = self.shared.lock();
        state.stats.subscribe_attempts += 1;

        if state.drained {
            state.stats.used_after_drain = true;
            return Err(ConsumerError::subscribe("connection closed"));
        }
        if state.failing_subscribes > 0 {
            state.failing_subscribes -= 1;
            return Err(ConsumerError::subscribe("stream not available"));
        }

        state.ensure_durable(durable_name, subject);
        Ok(MemorySubscription {
            shared: Arc::clone(&self.shared),
            durable: durable_name.to_string(),
            generation: state.generation,
        })
    }

    async fn drain(&self) -> Result<(), ConsumerError> {
        {
            let mut state = self.shared.lock();
            if state.drained {
                state.stats.used_after_drain = true;
            }
            state.drained = true;
            state.stats.drains += 1;
        }
        self.shared.notify.notify_waiters();
        Ok(())
    }
}

#[async_trait]
impl Publisher for MemoryBroker {
    async fn publish(&self, subject: &str, payload: Vec<u8>) -> Result<(), ConsumerError> {
        if self.is_drained() {
            return Err(ConsumerError::publish("connection closed"));
        }
        self.enqueue(subject, payload);
        Ok(())
    }
}

/// Subscription handed out by [`MemoryBroker`].
pub struct MemorySubscription {
    shared: Arc<Shared>,
    durable: String,
    generation: u64,
}

#[async_trait]
impl Subscription for MemorySubscription {
    type Delivery = MemoryDelivery;

    fn is_valid(&self) -> bool {
        let state = self.shared.lock();
        !state.drained && state.generation == self.generation
    }

    async fn fetch(&mut self, max_wait: Duration) -> Result<Option<MemoryDelivery>, FetchError> {
        let deadline = Instant::now() + max_wait;
        self.shared.lock().stats.fetches += 1;

        loop {
            {
                let mut state = self.shared.lock();
                if state.drained {
                    state.stats.used_after_drain = true;
                    return Err(FetchError::connection("connection closed"));
                }
                if let Some(error) = state.fetch_failures.pop_front() {
                    return Err(error);
                }
                if state.generation != self.generation {
                    return Err(FetchError::connection("subscription invalidated"));
                }
                if let Some((sequence, message)) = state.take_next(&self.durable) {
                    return Ok(Some(MemoryDelivery {
                        shared: Arc::clone(&self.shared),
                        durable: self.durable.clone(),
                        sequence,
                        message,
                        resolved: false,
                    }));
                }
            }

            if timeout_at(deadline, self.shared.notify.notified()).await.is_err() {
                return Ok(None);
            }
        }
    }

    async fn unsubscribe(self) -> Result<(), ConsumerError> {
        let mut state = self.shared.lock();
        if state.drained {
            state.stats.used_after_drain = true;
        }
        state.stats.unsubscribes += 1;
        Ok(())
    }
}

/// Delivery handed out by [`MemorySubscription`].
///
/// Dropping it unresolved puts the message back at the head of the queue.
pub struct MemoryDelivery {
    shared: Arc<Shared>,
    durable: String,
    sequence: u64,
    message: Message,
    resolved: bool,
}

impl MemoryDelivery {
    fn settle(&mut self, result: HandleResult) -> Result<(), ConsumerError> {
        {
            let mut state = self.shared.lock();
            if state.drained {
                state.stats.used_after_drain = true;
            }
            if state.fail_acks {
                return Err(ConsumerError::acknowledgment(format!(
                    "failed to {} message {}",
                    result, self.sequence
                )));
            }

            if let Some(durable) = state.durables.get_mut(&self.durable) {
                durable.in_flight.remove(&self.sequence);
                if result == HandleResult::Nak {
                    durable.pending.push_back(self.sequence);
                }
            }

            let counts = match result {
                HandleResult::Ack => &mut state.stats.acks,
                HandleResult::Nak => &mut state.stats.naks,
                HandleResult::Term => &mut state.stats.terms,
            };
            *counts.entry(self.sequence).or_insert(0) += 1;
        }

        self.resolved = true;
        if result == HandleResult::Nak {
            self.shared.notify.notify_one();
        }
        Ok(())
    }
}

#[async_trait]
impl Delivery for MemoryDelivery {
    fn message(&self) -> &Message {
        &self.message
    }

    async fn ack(mut self) -> Result<(), ConsumerError> {
        self.settle(HandleResult::Ack)
    }

    async fn nak(mut self) -> Result<(), ConsumerError> {
        self.settle(HandleResult::Nak)
    }

    async fn term(mut self) -> Result<(), ConsumerError> {
        self.settle(HandleResult::Term)
    }
}

impl Drop for MemoryDelivery {
    fn drop(&mut self) {
        if self.resolved {
            return;
        }
        {
            let mut state = self.shared.lock();
            if let Some(durable) = state.durables.get_mut(&self.durable) {
                if durable.in_flight.remove(&self.sequence) {
                    durable.pending.push_front(self.sequence);
                }
            }
        }
        self.shared.notify.notify_one();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_subject_matches() {
        assert!(subject_matches("a.b", "a.b"));
        assert!(subject_matches("a.*", "a.b"));
        assert!(subject_matches("a.>", "a.b.c"));
        assert!(!subject_matches("a.>", "a"));
        assert!(!subject_matches("a.*", "a.b.c"));
        assert!(!subject_matches("a.b", "a.c"));
    }

    #[tokio::test]
    async fn test_durable_sees_earlier_messages() {
        let broker = MemoryBroker::new();
        broker.enqueue("orders.new", b"1".to_vec());
        broker.enqueue("orders.other", b"skip".to_vec());

        let mut sub = broker.subscribe("orders.new", "d").await.unwrap();
        broker.enqueue("orders.new", b"2".to_vec());

        let first = sub.fetch(Duration::from_millis(10)).await.unwrap().unwrap();
        assert_eq!(first.message().payload, b"1");
        first.ack().await.unwrap();

        let second = sub.fetch(Duration::from_millis(10)).await.unwrap().unwrap();
        assert_eq!(second.message().payload, b"2");
        assert_eq!(second.message().metadata.stream_sequence, 3);
        second.ack().await.unwrap();

        assert!(sub.fetch(Duration::from_millis(10)).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_nak_redelivers_with_incremented_count() {
        let broker = MemoryBroker::new();
        let seq = broker.enqueue("s", b"x".to_vec());
        let mut sub = broker.subscribe("s", "d").await.unwrap();

        let delivery = sub.fetch(Duration::from_millis(10)).await.unwrap().unwrap();
        assert_eq!(delivery.message().delivered(), 1);
        delivery.nak().await.unwrap();

        let delivery = sub.fetch(Duration::from_millis(10)).await.unwrap().unwrap();
        assert_eq!(delivery.message().delivered(), 2);
        delivery.term().await.unwrap();

        assert_eq!(broker.delivery_count(seq), 2);
        assert_eq!(broker.pending("d"), 0);
        assert_eq!(broker.in_flight("d"), 0);
    }

    #[tokio::test]
    async fn test_dropped_delivery_is_requeued() {
        let broker = MemoryBroker::new();
        broker.enqueue("s", b"x".to_vec());
        let mut sub = broker.subscribe("s", "d").await.unwrap();

        let delivery = sub.fetch(Duration::from_millis(10)).await.unwrap().unwrap();
        assert_eq!(broker.in_flight("d"), 1);
        drop(delivery);

        assert_eq!(broker.in_flight("d"), 0);
        assert_eq!(broker.pending("d"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fetch_wakes_on_publish() {
        let broker = MemoryBroker::new();
        let mut sub = broker.subscribe("s", "d").await.unwrap();

        let publisher = broker.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            publisher.enqueue("s", b"late".to_vec());
        });

        let delivery = sub.fetch(Duration::from_secs(5)).await.unwrap().unwrap();
        assert_eq!(delivery.message().payload, b"late");
    }

    #[tokio::test]
    async fn test_invalidation_and_faults() {
        let broker = MemoryBroker::new();
        let mut sub = broker.subscribe("s", "d").await.unwrap();
        assert!(sub.is_valid());

        broker.fail_next_fetch(FetchError::other("boom"));
        let err = sub.fetch(Duration::from_millis(10)).await.err().unwrap();
        assert!(!err.is_connection_error());

        broker.invalidate_subscriptions();
        assert!(!sub.is_valid());
        let err = sub.fetch(Duration::from_millis(10)).await.err().unwrap();
        assert!(err.is_connection_error());

        broker.fail_next_subscribes(1);
        assert!(broker.subscribe("s", "d").await.is_err());
        assert!(broker.subscribe("s", "d").await.unwrap().is_valid());

        broker.refuse_connections(true);
        assert!(broker.connect("memory://").await.is_err());
    }

    #[tokio::test]
    async fn test_drain_marks_later_use() {
        let broker = MemoryBroker::new();
        let sub = broker.subscribe("s", "d").await.unwrap();
        broker.drain().await.unwrap();
        assert!(broker.is_drained());
        assert!(!broker.stats().used_after_drain);

        sub.unsubscribe().await.unwrap();
        assert!(broker.stats().used_after_drain);
    }
}
