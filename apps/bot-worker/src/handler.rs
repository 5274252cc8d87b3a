//! Chat message handler.
//!
//! Decodes a received chat message and answers it through the reply
//! producer. Malformed payloads and messages not sent by a friend are
//! terminated, a failed reply is retried through redelivery.

use crate::config::ReplyFilterConfig;
use eyre::{Result, WrapErr};
use nats_consumer::{
    async_trait, FieldPattern, Filtered, HandleResult, Handler, HandlerContext, Message,
    Predicate, Publisher,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Attribute of messages the bot answers.
pub const FRIEND_ATTR: &str = "friend";

/// Message received from the chat gateway.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReceivedMessage {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: String,
    /// Origin of the message, only `friend` is answered
    pub attr: String,
    pub content: String,
    pub sender: String,
    pub sender_remark: String,
}

impl ReceivedMessage {
    pub fn is_from_friend(&self) -> bool {
        self.attr == FRIEND_ATTR
    }
}

/// Reply published back to the chat gateway.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendMessage {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub reply_to_msg_id: String,
    pub send_to_chat: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub at: Vec<String>,
    #[serde(default)]
    pub exact: bool,
    pub content: String,
}

impl SendMessage {
    /// Reply to `message` in the sender's chat, mentioning the sender.
    pub fn reply_to(message: &ReceivedMessage, content: String) -> Self {
        Self {
            reply_to_msg_id: message.id.clone(),
            send_to_chat: message.sender.clone(),
            at: vec![message.sender.clone()],
            exact: true,
            content,
        }
    }
}

pub struct ReplyHandler {
    publisher: Option<Arc<dyn Publisher>>,
    reply_subject: String,
    prefix: String,
}

impl ReplyHandler {
    pub fn new(
        publisher: Option<Arc<dyn Publisher>>,
        reply_subject: impl Into<String>,
        prefix: impl Into<String>,
    ) -> Self {
        Self {
            publisher,
            reply_subject: reply_subject.into(),
            prefix: prefix.into(),
        }
    }

    fn reply_content(&self, message: &ReceivedMessage) -> String {
        format!("{}{}", self.prefix, message.content)
    }
}

#[async_trait]
impl Handler for ReplyHandler {
    async fn handle(&self, ctx: &HandlerContext, message: &Message) -> HandleResult {
        let received: ReceivedMessage = match message.json() {
            Ok(received) => received,
            Err(e) => {
                warn!(error = %e, sequence = ctx.metadata.stream_sequence, "Failed to decode message");
                return HandleResult::Term;
            }
        };

        if !received.is_from_friend() {
            debug!(id = %received.id, attr = %received.attr, "Ignoring message not sent by a friend");
            return HandleResult::Term;
        }

        let Some(publisher) = &self.publisher else {
            debug!(id = %received.id, "No reply producer configured");
            return HandleResult::Ack;
        };

        let reply = SendMessage::reply_to(&received, self.reply_content(&received));
        let payload = match serde_json::to_vec(&reply) {
            Ok(payload) => payload,
            Err(e) => {
                warn!(error = %e, id = %received.id, "Failed to encode reply");
                return HandleResult::Term;
            }
        };

        if let Err(e) = publisher.publish(&self.reply_subject, payload).await {
            warn!(error = %e, id = %received.id, "Failed to publish reply, message will be redelivered");
            return HandleResult::Nak;
        }

        info!(id = %received.id, sender = %received.sender, "Reply sent");
        HandleResult::Ack
    }
}

/// Applies the reply filter to friend messages only.
///
/// Undecodable payloads and non-friend messages pass through so the handler
/// terminates them instead of the filter acknowledging them.
struct ReplyGate {
    field: FieldPattern,
}

impl Predicate for ReplyGate {
    fn matches(&self, message: &Message) -> bool {
        match message.json::<ReceivedMessage>() {
            Ok(received) if received.is_from_friend() => self.field.matches(message),
            _ => true,
        }
    }
}

/// Build the service handler, gated by the reply filter when configured.
pub fn build(
    filter: Option<&ReplyFilterConfig>,
    publisher: Option<Arc<dyn Publisher>>,
    reply_subject: &str,
    prefix: &str,
) -> Result<Arc<dyn Handler>> {
    let handler = ReplyHandler::new(publisher, reply_subject, prefix);

    match filter {
        Some(filter) => {
            let field = FieldPattern::compile(&filter.field, &filter.pattern)
                .wrap_err("Invalid reply_filter")?;
            info!(field = %filter.field, pattern = %filter.pattern, "Reply filter enabled");
            Ok(Arc::new(Filtered::new(handler, ReplyGate { field })))
        }
        None => Ok(Arc::new(handler)),
    }
}
