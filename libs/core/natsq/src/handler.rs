//! Pluggable policy for panic reporting and the final publish hand-off.

use crate::context::Context;
use crate::error::NatsqError;
use crate::message::Message;
use crate::transport::Connection;
use async_trait::async_trait;
use tracing::error;

/// Policy hooks invoked by the [`Worker`](crate::Worker).
///
/// # Example
///
/// ```rust,ignore
/// use natsq::{Context, Connection, Handler, Message, NatsqError};
/// use async_trait::async_trait;
///
/// struct OutboxHandler { outbox: Outbox }
///
/// #[async_trait]
/// impl Handler for OutboxHandler {
///     fn on_subscribe_panic(&self, _: &Context, topic: &str, _: &[u8], value: Option<&str>, _: &str) {
///         alerting::page(topic, value);
///     }
///
///     async fn publish(&self, _: &Context, conn: &dyn Connection, message: Message) -> Result<(), NatsqError> {
///         self.outbox.record(&message).await;
///         conn.publish(message).await
///     }
/// }
/// ```
#[async_trait]
pub trait Handler: Send + Sync {
    /// Called once for every subscription callback that did not finish
    /// normally.
    ///
    /// `value` is the panic payload when it could be rendered as text, and
    /// `None` when the callback was cancelled or panicked with a non-string
    /// payload. Must not panic.
    fn on_subscribe_panic(
        &self,
        ctx: &Context,
        topic: &str,
        data: &[u8],
        value: Option<&str>,
        stack: &str,
    );

    /// Send a fully constructed message over `conn`.
    ///
    /// The result is returned unchanged to the caller of
    /// [`Worker::publish`](crate::Worker::publish).
    async fn publish(
        &self,
        ctx: &Context,
        conn: &dyn Connection,
        message: Message,
    ) -> Result<(), NatsqError>;
}

/// Default handler: logs panics and publishes unchanged.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogHandler;

#[async_trait]
impl Handler for LogHandler {
    fn on_subscribe_panic(
        &self,
        ctx: &Context,
        topic: &str,
        data: &[u8],
        value: Option<&str>,
        stack: &str,
    ) {
        error!(
            topic = %topic,
            publish_id = ctx.publish_id().unwrap_or_default(),
            data = %String::from_utf8_lossy(data),
            caused_by = value.unwrap_or("<unknown>"),
            stack = %stack,
            "Panic occurred on handling subscription"
        );
    }

    async fn publish(
        &self,
        _ctx: &Context,
        conn: &dyn Connection,
        message: Message,
    ) -> Result<(), NatsqError> {
        conn.publish(message).await
    }
}
