//! At-least-once pull consumer engine for NATS JetStream.
//!
//! A [`Consumer`] binds to a durable consumer on a subject and runs a fixed
//! pool of workers. Each worker pulls one message at a time, hands it to the
//! installed [`Handler`] and acknowledges it according to the returned
//! [`HandleResult`].
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────┐  connect  ┌──────────────┐  subscribe  ┌──────────────┐
//! │   Consumer   │──────────▶│    Broker    │◀────────────│  Worker × N  │
//! │ (supervisor) │           │ (JetStream)  │   fetch(1)  │ (pull loop)  │
//! └──────────────┘           └──────────────┘             └──────┬───────┘
//!                                    ▲                           │ handle
//!                                    │    ack / nak / term       ▼
//!                                    └────────────────── ┌──────────────┐
//!                                                        │   Handler    │
//!                                                        └──────────────┘
//! ```
//!
//! # Key Features
//!
//! - **Explicit acknowledgment**: Ack, Nak (redeliver) or Term (discard)
//! - **Self-healing workers**: invalid subscriptions are recreated, failed
//!   subscribes are retried after a fixed backoff
//! - **Panic isolation**: a panicking handler Naks its message, the worker
//!   keeps running
//! - **Graceful shutdown**: workers finish their current message before the
//!   connection is drained
//!
//! # Example
//!
//! ```rust,ignore
//! use nats_consumer::{handler_fn, ConsumerConfig, HandleResult, NatsConsumer};
//!
//! let mut consumer = NatsConsumer::nats(
//!     ConsumerConfig::new("nats://localhost:4222", "orders.created", "order-worker")
//!         .with_concurrency(4),
//! )?;
//!
//! consumer
//!     .set_handler(handler_fn(|_ctx, message| async move {
//!         match message.json::<Order>() {
//!             Ok(order) => process(order).await,
//!             Err(_) => HandleResult::Term,
//!         }
//!     }))
//!     .await;
//!
//! consumer.run_until(shutdown_signal()).await?;
//! ```

pub mod broker;
mod config;
mod consumer;
mod error;
mod handler;
pub mod memory;
pub mod metrics;
mod nats;
mod predicate;
mod producer;
mod worker;

pub use config::{ConsumerConfig, ProducerConfig, DEFAULT_CONCURRENCY, DEFAULT_PULL_MAX_WAIT_MS};
pub use consumer::{Consumer, NatsConsumer};
pub use error::{ConsumerError, FetchError};
pub use handler::{
    handler_fn, HandleResult, Handler, HandlerContext, HandlerFn, HandlerSlot, Message,
    MessageMetadata,
};
pub use nats::{NatsBroker, NatsConnector, NatsDelivery, NatsSubscription};
pub use predicate::{FieldPattern, Filtered, PayloadPattern, Predicate};
pub use producer::{NatsProducer, Publisher};
pub use worker::RESUBSCRIBE_BACKOFF;

// Re-export for handler implementations
pub use async_trait::async_trait;
