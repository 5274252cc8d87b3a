//! Consumer supervisor: owns the connection and the worker pool.

use crate::broker::{Broker, Connector};
use crate::config::ConsumerConfig;
use crate::error::ConsumerError;
use crate::handler::{Handler, HandlerSlot};
use crate::metrics::ConsumerMetrics;
use crate::nats::NatsConnector;
use crate::worker::Worker;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, error, info, info_span, warn, Instrument, Span};

/// Consumer backed by NATS JetStream.
pub type NatsConsumer = Consumer<NatsConnector>;

struct Running<B> {
    broker: Arc<B>,
    shutdown: watch::Sender<bool>,
    workers: JoinSet<usize>,
}

/// Pull consumer with a fixed-size worker pool.
///
/// Lifecycle is `new` → `start` → `close`. Between `start` and `close`
/// exactly `concurrency` workers run, each owning one subscription and
/// processing one message at a time. Messages are acknowledged explicitly,
/// so delivery is at-least-once.
///
/// # Example
///
/// ```rust,ignore
/// let mut consumer = NatsConsumer::nats(ConsumerConfig::new(
///     "nats://localhost:4222",
///     "wechat.message.received",
///     "bot-worker",
/// ))?;
///
/// consumer.set_handler(MyHandler::new()).await;
/// consumer.run_until(shutdown_signal()).await?;
/// ```
pub struct Consumer<C: Connector = NatsConnector> {
    config: Arc<ConsumerConfig>,
    connector: C,
    handler: HandlerSlot,
    metrics: ConsumerMetrics,
    active: Arc<AtomicUsize>,
    span: Span,
    running: Option<Running<C::Broker>>,
}

impl Consumer<NatsConnector> {
    /// Create a consumer that connects to NATS JetStream.
    ///
    /// The connection reports the durable name as its client name.
    pub fn nats(config: ConsumerConfig) -> Result<Self, ConsumerError> {
        let connector = NatsConnector::new().with_client_name(config.consumer_name.clone());
        Self::new(config, connector)
    }
}

impl<C: Connector> Consumer<C> {
    /// Validate `config` and create a stopped consumer.
    pub fn new(mut config: ConsumerConfig, connector: C) -> Result<Self, ConsumerError> {
        config.validate()?;

        let span = consumer_span(&Span::current(), &config);
        let metrics = ConsumerMetrics::new(&config.subject, &config.consumer_name);

        Ok(Self {
            config: Arc::new(config),
            connector,
            handler: HandlerSlot::new(),
            metrics,
            active: Arc::new(AtomicUsize::new(0)),
            span,
            running: None,
        })
    }

    /// Nest the consumer's span (and every worker span) under `parent`.
    pub fn with_span(mut self, parent: &Span) -> Self {
        self.span = consumer_span(parent, &self.config);
        self
    }

    pub fn config(&self) -> &ConsumerConfig {
        &self.config
    }

    pub fn span(&self) -> &Span {
        &self.span
    }

    /// Install or replace the message handler.
    ///
    /// May be called before or after [`start`](Self::start). Messages
    /// dispatched while no handler is installed are Nak-ed.
    pub async fn set_handler(&self, handler: impl Handler) {
        self.handler.set(handler).await;
        self.span.in_scope(|| info!("Handler function set for consumer"));
    }

    /// Shared handle to the handler slot.
    pub fn handler_slot(&self) -> HandlerSlot {
        self.handler.clone()
    }

    pub fn is_running(&self) -> bool {
        self.running.is_some()
    }

    /// Number of worker loops currently running.
    pub fn active_workers(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    /// Connect and spawn the worker pool.
    ///
    /// Fails only if the connection cannot be established; subscription
    /// problems are retried inside each worker. Calling `start` on a running
    /// consumer logs a warning and does nothing.
    pub async fn start(&mut self) -> Result<(), ConsumerError> {
        let span = self.span.clone();
        self.start_workers().instrument(span).await
    }

    async fn start_workers(&mut self) -> Result<(), ConsumerError> {
        if self.running.is_some() {
            warn!("Consumer is already started, skipping start");
            return Ok(());
        }

        let broker = self
            .connector
            .connect(&self.config.nats_url)
            .await
            .inspect_err(|e| error!(error = %e, url = %self.config.nats_url, "Failed to connect to NATS"))?;
        let broker = Arc::new(broker);
        info!(url = %self.config.nats_url, "Connected to NATS");

        let (shutdown, shutdown_rx) = watch::channel(false);
        let mut workers = JoinSet::new();

        for id in 0..self.config.concurrency {
            info!(worker_id = id, "Starting consumer worker");
            let span = info_span!(parent: &self.span, "worker", worker_id = id);

            let worker = Worker {
                id,
                broker: Arc::clone(&broker),
                config: Arc::clone(&self.config),
                handler: self.handler.clone(),
                metrics: self.metrics.clone(),
                active: Arc::clone(&self.active),
                span: span.clone(),
            };
            workers.spawn(worker.run(shutdown_rx.clone()).instrument(span));
        }

        info!(
            concurrency = self.config.concurrency,
            "Started {} consumer workers", self.config.concurrency
        );

        self.running = Some(Running {
            broker,
            shutdown,
            workers,
        });
        Ok(())
    }

    /// Stop the worker pool and release the connection.
    ///
    /// Signals cancellation, waits for every worker to finish its current
    /// message, then drains the connection exactly once. Calling `close` on a
    /// consumer that is not running does nothing.
    pub async fn close(&mut self) {
        let span = self.span.clone();
        self.stop_workers().instrument(span).await
    }

    async fn stop_workers(&mut self) {
        let Some(mut running) = self.running.take() else {
            debug!("Consumer is not running, nothing to close");
            return;
        };

        info!("Closing consumer");
        running.shutdown.send_replace(true);

        while let Some(joined) = running.workers.join_next().await {
            match joined {
                Ok(id) => debug!(worker_id = id, "Consumer worker joined"),
                Err(e) => error!(error = %e, "Consumer worker task failed"),
            }
        }
        info!("All consumer workers have stopped");

        match running.broker.drain().await {
            Ok(()) => info!("Consumer closed successfully"),
            Err(e) => error!(error = %e, "Failed to drain NATS connection"),
        }
    }

    /// Start, wait for `signal`, then close.
    pub async fn run_until<F>(&mut self, signal: F) -> Result<(), ConsumerError>
    where
        F: Future<Output = ()>,
    {
        self.start().await?;
        signal.await;
        self.span.in_scope(|| info!("Shutdown signal received"));
        self.close().await;
        Ok(())
    }
}

impl<C: Connector> Drop for Consumer<C> {
    fn drop(&mut self) {
        // Without close: workers still stop after their current message, but
        // the connection is not drained.
        if let Some(mut running) = self.running.take() {
            running.shutdown.send_replace(true);
            running.workers.detach_all();
        }
    }
}

fn consumer_span(parent: &Span, config: &ConsumerConfig) -> Span {
    info_span!(
        parent: parent,
        "consumer",
        consumer_name = %config.consumer_name,
        subject = %config.subject
    )
}
