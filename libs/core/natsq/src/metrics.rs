//! Prometheus metrics for the natsq worker.

use crate::context::Context;
use crate::error::NatsqError;
use crate::handler::{Handler, LogHandler};
use crate::message::Message;
use crate::transport::Connection;
use async_trait::async_trait;
use metrics::{counter, histogram};
use std::time::Instant;

/// Handler decorator that records metrics before delegating to `inner`.
///
/// Metrics:
/// - `natsq_messages_published_total{topic}`
/// - `natsq_publish_failures_total{topic, error}`
/// - `natsq_publish_duration_seconds{topic}`
/// - `natsq_subscription_panics_total{topic}`
#[derive(Debug, Clone, Default)]
pub struct MetricsHandler<H = LogHandler> {
    inner: H,
}

impl<H: Handler> MetricsHandler<H> {
    /// Wrap an existing handler.
    pub fn new(inner: H) -> Self {
        Self { inner }
    }

    /// Get the wrapped handler.
    pub fn inner(&self) -> &H {
        &self.inner
    }
}

#[async_trait]
impl<H: Handler> Handler for MetricsHandler<H> {
    fn on_subscribe_panic(
        &self,
        ctx: &Context,
        topic: &str,
        data: &[u8],
        value: Option<&str>,
        stack: &str,
    ) {
        counter!("natsq_subscription_panics_total", "topic" => topic.to_string()).increment(1);
        self.inner.on_subscribe_panic(ctx, topic, data, value, stack);
    }

    async fn publish(
        &self,
        ctx: &Context,
        conn: &dyn Connection,
        message: Message,
    ) -> Result<(), NatsqError> {
        let topic = message.subject.clone();
        let start = Instant::now();
        let result = self.inner.publish(ctx, conn, message).await;

        match &result {
            Ok(()) => {
                counter!("natsq_messages_published_total", "topic" => topic.clone())
                    .increment(1);
                histogram!("natsq_publish_duration_seconds", "topic" => topic)
                    .record(start.elapsed().as_secs_f64());
            }
            Err(e) => {
                counter!(
                    "natsq_publish_failures_total",
                    "topic" => topic,
                    "error" => e.as_label()
                )
                .increment(1);
            }
        }

        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::MockConnection;

    #[tokio::test]
    async fn test_metrics_handler_delegates() {
        let mut conn = MockConnection::new();
        conn.expect_publish().times(1).returning(|_| Ok(()));

        let handler = MetricsHandler::new(LogHandler);
        let result = handler
            .publish(&Context::new(), &conn, Message::new("orders", "{}"))
            .await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_metrics_handler_keeps_error() {
        let mut conn = MockConnection::new();
        conn.expect_publish()
            .times(1)
            .returning(|_| Err(NatsqError::publish_error("timeout")));

        let handler = MetricsHandler::<LogHandler>::default();
        let err = handler
            .publish(&Context::new(), &conn, Message::new("orders", "{}"))
            .await
            .unwrap_err();
        assert_eq!(err.as_label(), "publish");
    }
}
