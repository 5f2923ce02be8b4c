//! Adapter from the simplified worker callback to the native ack/nak protocol.

use crate::context::Context;
use crate::message::Delivery;
use bytes::Bytes;
use futures::future::BoxFuture;
use futures::FutureExt;
use std::future::Future;
use std::sync::Arc;

/// Native subscription callback: receives the delivery and decides itself
/// whether and how to acknowledge it.
pub type SubscriberHandler = Arc<dyn Fn(Context, Delivery) -> BoxFuture<'static, ()> + Send + Sync>;

/// Wrap a `(ctx, topic, payload) -> no_retry` callback into a native one.
///
/// `no_retry == true` acks the delivery, `false` naks it so the broker
/// redelivers. Ack/nak failures are ignored; the broker's redelivery policy
/// takes over from there.
pub fn wrap_worker<F, Fut>(handler: F) -> SubscriberHandler
where
    F: Fn(Context, String, Bytes) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = bool> + Send + 'static,
{
    let handler = Arc::new(handler);
    Arc::new(move |ctx: Context, delivery: Delivery| -> BoxFuture<'static, ()> {
        let handler = handler.clone();
        async move {
            let no_retry =
                handler(ctx, delivery.subject().to_string(), delivery.payload().clone()).await;

            if !no_retry {
                let _ = delivery.nak().await;
                return;
            }

            let _ = delivery.ack().await;
        }
        .boxed()
    })
}
