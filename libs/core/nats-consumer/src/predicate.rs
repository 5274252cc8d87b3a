//! Message predicates and the filtering handler wrapper.

use crate::error::ConsumerError;
use crate::handler::{HandleResult, Handler, HandlerContext, Message};
use async_trait::async_trait;
use regex::Regex;
use tracing::debug;

/// Decides whether a message should reach a handler.
pub trait Predicate: Send + Sync + 'static {
    fn matches(&self, message: &Message) -> bool;
}

impl<F> Predicate for F
where
    F: Fn(&Message) -> bool + Send + Sync + 'static,
{
    fn matches(&self, message: &Message) -> bool {
        self(message)
    }
}

/// Regular expression over the UTF-8 payload.
///
/// Non-UTF-8 payloads never match.
#[derive(Debug, Clone)]
pub struct PayloadPattern {
    regex: Regex,
}

impl PayloadPattern {
    pub fn compile(expr: &str) -> Result<Self, ConsumerError> {
        let regex = Regex::new(expr)
            .map_err(|e| ConsumerError::config(format!("invalid payload pattern {expr:?}: {e}")))?;
        Ok(Self { regex })
    }

    pub fn as_str(&self) -> &str {
        self.regex.as_str()
    }
}

impl Predicate for PayloadPattern {
    fn matches(&self, message: &Message) -> bool {
        message
            .payload_str()
            .is_some_and(|payload| self.regex.is_match(payload))
    }
}

/// Regular expression over one field of a JSON payload.
///
/// The field is addressed with a JSON pointer (`/sender/name`). Strings are
/// matched as-is, numbers and booleans by their JSON text. Missing fields,
/// objects, arrays, nulls and non-JSON payloads never match.
#[derive(Debug, Clone)]
pub struct FieldPattern {
    pointer: String,
    regex: Regex,
}

impl FieldPattern {
    pub fn compile(pointer: &str, expr: &str) -> Result<Self, ConsumerError> {
        if !pointer.is_empty() && !pointer.starts_with('/') {
            return Err(ConsumerError::config(format!(
                "invalid field pointer {pointer:?}: must start with '/'"
            )));
        }
        let regex = Regex::new(expr)
            .map_err(|e| ConsumerError::config(format!("invalid field pattern {expr:?}: {e}")))?;

        Ok(Self {
            pointer: pointer.to_string(),
            regex,
        })
    }

    pub fn pointer(&self) -> &str {
        &self.pointer
    }
}

impl Predicate for FieldPattern {
    fn matches(&self, message: &Message) -> bool {
        let Ok(value) = message.json::<serde_json::Value>() else {
            return false;
        };

        match value.pointer(&self.pointer) {
            Some(serde_json::Value::String(s)) => self.regex.is_match(s),
            Some(v @ (serde_json::Value::Number(_) | serde_json::Value::Bool(_))) => {
                self.regex.is_match(&v.to_string())
            }
            _ => false,
        }
    }
}

/// Handler wrapper that only lets matching messages through.
///
/// A message the predicate rejects is acknowledged without reaching the
/// inner handler, so it is not redelivered.
pub struct Filtered<H, P> {
    inner: H,
    predicate: P,
}

impl<H: Handler, P: Predicate> Filtered<H, P> {
    pub fn new(inner: H, predicate: P) -> Self {
        Self { inner, predicate }
    }
}

#[async_trait]
impl<H: Handler, P: Predicate> Handler for Filtered<H, P> {
    async fn handle(&self, ctx: &HandlerContext, message: &Message) -> HandleResult {
        if !self.predicate.matches(message) {
            debug!(
                sequence = message.metadata.stream_sequence,
                "Message does not match filter, skipping"
            );
            return HandleResult::Ack;
        }
        self.inner.handle(ctx, message).await
    }
}
