//! NATS implementation of the transport traits.

use super::{Connection, Subscription, Transport};
use crate::config::WorkerConfig;
use crate::error::NatsqError;
use crate::message::{AckKind, Acknowledger, Delivery, Message};
use async_nats::connection::State;
use async_nats::{jetstream, Client, ConnectOptions, Event, Subscriber};
use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{error, trace, warn};

/// Transport that connects to a NATS server with `async-nats`.
///
/// Reconnection after a dropped connection is left to the client's built-in
/// reconnect logic; the event hooks only log.
#[derive(Debug, Clone, Copy, Default)]
pub struct NatsTransport;

#[async_trait]
impl Transport for NatsTransport {
    async fn connect(&self, config: &WorkerConfig) -> Result<Arc<dyn Connection>, NatsqError> {
        let url = config.server_url();

        let mut options = ConnectOptions::new()
            .connection_timeout(config.connection_timeout)
            .event_callback(|event| async move {
                match event {
                    Event::Disconnected => warn!("Disconnected from NATS server"),
                    Event::Connected => trace!("Reconnected to NATS server"),
                    Event::ClientError(err) => error!(error = %err, "NATS client error"),
                    other => trace!(event = %other, "NATS connection event"),
                }
            });

        if !config.auth_token.is_empty() {
            options = options.token(config.auth_token.clone());
        }
        if let Some(name) = &config.connection_name {
            options = options.name(name);
        }

        let client = options
            .connect(url.as_str())
            .await
            .map_err(NatsqError::connection_error)?;

        Ok(Arc::new(NatsConnection {
            client,
            closed: AtomicBool::new(false),
        }))
    }
}

struct NatsConnection {
    client: Client,
    closed: AtomicBool,
}

#[async_trait]
impl Connection for NatsConnection {
    fn is_connected(&self) -> bool {
        !self.closed.load(Ordering::SeqCst)
            && matches!(self.client.connection_state(), State::Connected)
    }

    async fn publish(&self, message: Message) -> Result<(), NatsqError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(NatsqError::publish_error("connection closed"));
        }

        let Message {
            subject,
            headers,
            payload,
            reply,
        } = message;

        match reply {
            Some(reply) => self
                .client
                .publish_with_reply_and_headers(subject, reply, headers, payload)
                .await
                .map_err(NatsqError::publish_error),
            None => self
                .client
                .publish_with_headers(subject, headers, payload)
                .await
                .map_err(NatsqError::publish_error),
        }
    }

    async fn queue_subscribe(
        &self,
        topic: &str,
        queue_group: &str,
    ) -> Result<Box<dyn Subscription>, NatsqError> {
        let subscriber = self
            .client
            .queue_subscribe(topic.to_string(), queue_group.to_string())
            .await
            .map_err(NatsqError::subscribe_error)?;

        Ok(Box::new(NatsSubscription {
            subscriber,
            acker: Arc::new(NatsAcknowledger {
                client: self.client.clone(),
            }),
        }))
    }

    async fn close(&self) -> Result<(), NatsqError> {
        self.closed.store(true, Ordering::SeqCst);
        self.client.drain().await.map_err(NatsqError::close_error)
    }
}

struct NatsSubscription {
    subscriber: Subscriber,
    acker: Arc<NatsAcknowledger>,
}

#[async_trait]
impl Subscription for NatsSubscription {
    async fn next(&mut self) -> Option<Delivery> {
        let message = self.subscriber.next().await?;
        Some(Delivery::new(Message::from(message), self.acker.clone()))
    }

    async fn unsubscribe(&mut self) -> Result<(), NatsqError> {
        self.subscriber
            .unsubscribe()
            .await
            .map_err(NatsqError::unsubscribe_error)
    }
}

/// Acks by replying with the JetStream ack payload on the message reply
/// subject, which is what JetStream push consumers expect. Core NATS messages without a reply
/// subject cannot be acknowledged.
struct NatsAcknowledger {
    client: Client,
}

#[async_trait]
impl Acknowledger for NatsAcknowledger {
    async fn acknowledge(&self, message: &Message, kind: AckKind) -> Result<(), NatsqError> {
        let reply = message.reply.as_ref().ok_or(NatsqError::NotBound)?;
        self.client
            .publish(reply.clone(), Bytes::from(jetstream::AckKind::from(kind)))
            .await
            .map_err(NatsqError::publish_error)
    }
}
