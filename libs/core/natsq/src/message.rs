//! Outbound and inbound message types.

use crate::error::NatsqError;
use async_nats::HeaderMap;
use async_trait::async_trait;
use bytes::Bytes;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Header carrying the publish id of a message.
pub const HEADER_PUBLISH_ID: &str = "publish-id";

/// A message as sent to or received from the broker.
#[derive(Debug, Clone)]
pub struct Message {
    /// Subject (topic) of the message
    pub subject: String,
    /// Message headers
    pub headers: HeaderMap,
    /// Raw payload bytes
    pub payload: Bytes,
    /// Reply subject, used by the broker for acknowledgements
    pub reply: Option<String>,
}

impl Message {
    /// Create a message without headers.
    pub fn new(subject: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self {
            subject: subject.into(),
            headers: HeaderMap::new(),
            payload: payload.into(),
            reply: None,
        }
    }

    /// Set a header value.
    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        self.headers.insert(name, value);
        self
    }

    /// Set the reply subject.
    pub fn with_reply(mut self, reply: impl Into<String>) -> Self {
        self.reply = Some(reply.into());
        self
    }

    /// Get a header value.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).map(|value| value.as_str())
    }

    /// Publish id carried in the headers, if any.
    pub fn publish_id(&self) -> Option<&str> {
        self.header(HEADER_PUBLISH_ID)
    }
}

impl From<async_nats::Message> for Message {
    fn from(message: async_nats::Message) -> Self {
        Self {
            subject: message.subject.to_string(),
            headers: message.headers.unwrap_or_default(),
            payload: message.payload,
            reply: message.reply.map(|reply| reply.to_string()),
        }
    }
}

/// Acknowledgement sent back to the broker for a delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckKind {
    /// Processing finished, do not redeliver
    Ack,
    /// Processing failed, request redelivery
    Nak,
}

impl From<AckKind> for async_nats::jetstream::AckKind {
    fn from(kind: AckKind) -> Self {
        match kind {
            AckKind::Ack => async_nats::jetstream::AckKind::Ack,
            AckKind::Nak => async_nats::jetstream::AckKind::Nak(None),
        }
    }
}

impl fmt::Display for AckKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AckKind::Ack => write!(f, "ack"),
            AckKind::Nak => write!(f, "nak"),
        }
    }
}

/// Sends acknowledgements for inbound messages back to the broker.
#[async_trait]
pub trait Acknowledger: Send + Sync {
    /// Acknowledge `message` with the given kind.
    async fn acknowledge(&self, message: &Message, kind: AckKind) -> Result<(), NatsqError>;
}

/// An inbound message together with its acknowledgement channel.
///
/// Clones share the acknowledgement state: once any clone acked or naked,
/// every further attempt fails with [`NatsqError::AlreadyAcknowledged`].
#[derive(Clone)]
pub struct Delivery {
    message: Message,
    acker: Arc<dyn Acknowledger>,
    acknowledged: Arc<AtomicBool>,
}

impl Delivery {
    /// Wrap an inbound message.
    pub fn new(message: Message, acker: Arc<dyn Acknowledger>) -> Self {
        Self {
            message,
            acker,
            acknowledged: Arc::new(AtomicBool::new(false)),
        }
    }

    /// The received message.
    pub fn message(&self) -> &Message {
        &self.message
    }

    /// Subject the message was received on.
    pub fn subject(&self) -> &str {
        &self.message.subject
    }

    /// Raw payload bytes.
    pub fn payload(&self) -> &Bytes {
        &self.message.payload
    }

    /// Publish id carried in the headers, if any.
    pub fn publish_id(&self) -> Option<&str> {
        self.message.publish_id()
    }

    /// Whether an ack or nak was already attempted.
    pub fn is_acknowledged(&self) -> bool {
        self.acknowledged.load(Ordering::SeqCst)
    }

    /// Positively acknowledge the message.
    pub async fn ack(&self) -> Result<(), NatsqError> {
        self.acknowledge(AckKind::Ack).await
    }

    /// Negatively acknowledge the message, requesting redelivery.
    pub async fn nak(&self) -> Result<(), NatsqError> {
        self.acknowledge(AckKind::Nak).await
    }

    async fn acknowledge(&self, kind: AckKind) -> Result<(), NatsqError> {
        if self.acknowledged.swap(true, Ordering::SeqCst) {
            return Err(NatsqError::AlreadyAcknowledged);
        }
        self.acker.acknowledge(&self.message, kind).await
    }
}

impl fmt::Debug for Delivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Delivery")
            .field("message", &self.message)
            .field("acknowledged", &self.is_acknowledged())
            .finish()
    }
}
