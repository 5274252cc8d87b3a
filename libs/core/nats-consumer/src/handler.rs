//! Handler contract: messages in, dispositions out.

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Disposition a handler produces for one delivery attempt.
///
/// | Result | Broker effect |
/// |--------|---------------|
/// | `Ack`  | removed, never redelivered |
/// | `Nak`  | immediately eligible for redelivery, delivery count increments |
/// | `Term` | removed, never redelivered (dead-lettered) |
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HandleResult {
    /// Processed successfully
    Ack,
    /// Transient failure, retry desired
    Nak,
    /// Permanent failure, discard
    Term,
}

impl HandleResult {
    pub fn as_str(&self) -> &'static str {
        match self {
            HandleResult::Ack => "ACK",
            HandleResult::Nak => "NAK",
            HandleResult::Term => "TERM",
        }
    }
}

impl fmt::Display for HandleResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Read-only delivery metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MessageMetadata {
    /// Subject the message was published on
    pub subject: String,
    /// Delivery attempt, starting at 1
    pub delivered: u64,
    /// Stream sequence number (0 when unknown)
    pub stream_sequence: u64,
}

impl MessageMetadata {
    /// Check if this is a redelivery.
    pub fn is_redelivery(&self) -> bool {
        self.delivered > 1
    }
}

/// A fetched message as the handler sees it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub payload: Vec<u8>,
    pub metadata: MessageMetadata,
}

impl Message {
    pub fn new(payload: impl Into<Vec<u8>>, metadata: MessageMetadata) -> Self {
        Self {
            payload: payload.into(),
            metadata,
        }
    }

    /// Payload as UTF-8, if it is.
    pub fn payload_str(&self) -> Option<&str> {
        std::str::from_utf8(&self.payload).ok()
    }

    /// Deserialize the payload as JSON.
    pub fn json<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_slice(&self.payload)
    }

    pub fn subject(&self) -> &str {
        &self.metadata.subject
    }

    pub fn delivered(&self) -> u64 {
        self.metadata.delivered
    }
}

/// Per-call context passed to the handler.
///
/// `span` is the logging handle: it carries `worker_id`, `consumer_name` and
/// `subject`, and the handler future already runs inside it.
#[derive(Debug, Clone)]
pub struct HandlerContext {
    pub worker_id: usize,
    pub metadata: MessageMetadata,
    pub span: tracing::Span,
}

/// Message handler.
///
/// Invoked concurrently from distinct workers, so implementations must be
/// `Send + Sync`. A panic inside `handle` is caught by the worker and the
/// message is resolved as [`HandleResult::Nak`].
///
/// # Example
///
/// ```rust,ignore
/// struct EchoHandler;
///
/// #[async_trait]
/// impl Handler for EchoHandler {
///     async fn handle(&self, ctx: &HandlerContext, message: &Message) -> HandleResult {
///         tracing::info!(worker_id = ctx.worker_id, bytes = message.payload.len(), "Received message");
///         HandleResult::Ack
///     }
/// }
/// ```
#[async_trait]
pub trait Handler: Send + Sync + 'static {
    async fn handle(&self, ctx: &HandlerContext, message: &Message) -> HandleResult;
}

#[async_trait]
impl<H: Handler + ?Sized> Handler for Arc<H> {
    async fn handle(&self, ctx: &HandlerContext, message: &Message) -> HandleResult {
        (**self).handle(ctx, message).await
    }
}

/// Handler backed by an async closure taking owned arguments.
pub struct HandlerFn<F> {
    f: F,
}

/// Wrap an async closure as a [`Handler`].
///
/// ```rust,ignore
/// consumer.set_handler(handler_fn(|_ctx, message| async move {
///     if message.payload.is_empty() { HandleResult::Term } else { HandleResult::Ack }
/// })).await;
/// ```
pub fn handler_fn<F, Fut>(f: F) -> HandlerFn<F>
where
    F: Fn(HandlerContext, Message) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HandleResult> + Send + 'static,
{
    HandlerFn { f }
}

#[async_trait]
impl<F, Fut> Handler for HandlerFn<F>
where
    F: Fn(HandlerContext, Message) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HandleResult> + Send + 'static,
{
    async fn handle(&self, ctx: &HandlerContext, message: &Message) -> HandleResult {
        (self.f)(ctx.clone(), message.clone()).await
    }
}

/// Shared installation point for the handler.
///
/// Cloned into every worker; installing or replacing a handler takes effect
/// on the next dispatched message.
#[derive(Clone, Default)]
pub struct HandlerSlot {
    inner: Arc<RwLock<Option<Arc<dyn Handler>>>>,
}

impl HandlerSlot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install (or replace) the handler.
    pub async fn set(&self, handler: impl Handler) {
        *self.inner.write().await = Some(Arc::new(handler));
    }

    /// Remove the handler. Subsequent messages are Nak-ed.
    pub async fn clear(&self) {
        *self.inner.write().await = None;
    }

    /// Snapshot of the current handler.
    pub async fn current(&self) -> Option<Arc<dyn Handler>> {
        self.inner.read().await.clone()
    }
}

impl fmt::Debug for HandlerSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerSlot").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message(payload: &str, delivered: u64) -> Message {
        Message::new(
            payload.as_bytes(),
            MessageMetadata {
                subject: "test.subject".to_string(),
                delivered,
                stream_sequence: 7,
            },
        )
    }

    fn context() -> HandlerContext {
        HandlerContext {
            worker_id: 0,
            metadata: message("", 1).metadata,
            span: tracing::Span::none(),
        }
    }

    #[test]
    fn test_handle_result_strings() {
        assert_eq!(HandleResult::Ack.to_string(), "ACK");
        assert_eq!(HandleResult::Nak.to_string(), "NAK");
        assert_eq!(HandleResult::Term.to_string(), "TERM");
        assert_eq!(serde_json::to_string(&HandleResult::Term).unwrap(), r#""TERM""#);
        assert_eq!(
            serde_json::from_str::<HandleResult>(r#""NAK""#).unwrap(),
            HandleResult::Nak
        );
    }

    #[test]
    fn test_message_accessors() {
        let msg = message(r#"{"id":"1"}"#, 2);
        assert_eq!(msg.payload_str(), Some(r#"{"id":"1"}"#));
        assert_eq!(msg.subject(), "test.subject");
        assert!(msg.metadata.is_redelivery());

        let value: serde_json::Value = msg.json().unwrap();
        assert_eq!(value["id"], "1");

        let bad = Message::new(vec![0xff, 0xfe], message("", 1).metadata);
        assert!(bad.payload_str().is_none());
        assert!(!bad.metadata.is_redelivery());
    }

    #[tokio::test]
    async fn test_handler_fn() {
        let handler = handler_fn(|_ctx, msg: Message| async move {
            if msg.payload.is_empty() {
                HandleResult::Term
            } else {
                HandleResult::Ack
            }
        });

        assert_eq!(handler.handle(&context(), &message("x", 1)).await, HandleResult::Ack);
        assert_eq!(handler.handle(&context(), &message("", 1)).await, HandleResult::Term);
    }

    #[tokio::test]
    async fn test_handler_slot_replace_and_clear() {
        let slot = HandlerSlot::new();
        assert!(slot.current().await.is_none());

        slot.set(handler_fn(|_, _| async { HandleResult::Ack })).await;
        let current = slot.current().await.unwrap();
        assert_eq!(current.handle(&context(), &message("x", 1)).await, HandleResult::Ack);

        slot.set(handler_fn(|_, _| async { HandleResult::Nak })).await;
        let current = slot.clone().current().await.unwrap();
        assert_eq!(current.handle(&context(), &message("x", 1)).await, HandleResult::Nak);

        slot.clear().await;
        assert!(slot.current().await.is_none());
    }
}
