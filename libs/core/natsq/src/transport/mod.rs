//! Transport abstraction the worker is built on.
//!
//! The worker never talks to a broker client directly; it goes through these
//! traits so the NATS client can be swapped for the in-memory broker in tests
//! and local development.
//!
//! - [`NatsTransport`]: production transport backed by `async-nats`
//! - [`MemoryTransport`]: in-process broker with queue groups and recorded acks

mod memory;
mod nats;

pub use memory::{AckRecord, MemoryTransport};
pub use nats::NatsTransport;

use crate::config::WorkerConfig;
use crate::error::NatsqError;
use crate::message::{Delivery, Message};
use async_trait::async_trait;
use std::sync::Arc;

/// Establishes broker connections.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Open a new connection.
    ///
    /// Disconnect and reconnect events are handled by the implementation;
    /// the worker only asks for a fresh connection when the current one is gone.
    async fn connect(&self, config: &WorkerConfig) -> Result<Arc<dyn Connection>, NatsqError>;
}

/// A live broker connection, shared between publishers and subscriptions.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Connection: Send + Sync {
    /// Whether the connection is currently usable.
    fn is_connected(&self) -> bool;

    /// Publish a fully constructed message.
    async fn publish(&self, message: Message) -> Result<(), NatsqError>;

    /// Join `queue_group` on `topic`; the broker load-balances deliveries
    /// among all members of the group.
    async fn queue_subscribe(
        &self,
        topic: &str,
        queue_group: &str,
    ) -> Result<Box<dyn Subscription>, NatsqError>;

    /// Close the connection.
    async fn close(&self) -> Result<(), NatsqError>;
}

/// A stream of deliveries for one subscription.
#[async_trait]
pub trait Subscription: Send {
    /// Next delivery, or `None` once the subscription is closed.
    async fn next(&mut self) -> Option<Delivery>;

    /// Stop receiving deliveries.
    async fn unsubscribe(&mut self) -> Result<(), NatsqError>;
}
