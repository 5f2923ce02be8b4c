//! Queue messaging worker: connection lifecycle, publishing and supervised
//! subscriptions.

use crate::config::WorkerConfig;
use crate::context::{new_publish_id, Context};
use crate::error::NatsqError;
use crate::handler::Handler;
use crate::message::{Delivery, Message, HEADER_PUBLISH_ID};
use crate::options::InitOptions;
use crate::recovery::Invocation;
use crate::transport::{Connection, Subscription, Transport};
use crate::worker_handler::{wrap_worker, SubscriberHandler};
use bytes::Bytes;
use chrono::Utc;
use futures::future::BoxFuture;
use futures::FutureExt;
use serde::Serialize;
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Instant;
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;
use tracing::{error, instrument, trace, warn};

type UnsubscribeReply = oneshot::Sender<Result<(), NatsqError>>;
type Registry = Mutex<HashMap<String, SubscriptionEntry>>;

/// Queue messaging adapter over a single broker connection.
///
/// The connection is created lazily on first use and re-created whenever it
/// is no longer connected. Every subscription joins a queue group named after
/// its topic, so several workers sharing a topic split the deliveries between
/// them.
///
/// # Example
///
/// ```rust,ignore
/// use natsq::{Context, Worker, WorkerConfig};
///
/// let worker = Worker::new(WorkerConfig::new("localhost", 4222, "token"))?;
///
/// worker
///     .subscribe("orders", |ctx, _topic, payload| async move {
///         tracing::info!(publish_id = ?ctx.publish_id(), "order received");
///         process(&payload).await.is_ok()
///     })
///     .await?;
///
/// worker.publish(&Context::new(), "orders", &order).await?;
/// worker.close().await;
/// ```
pub struct Worker {
    config: WorkerConfig,
    handler: Arc<dyn Handler>,
    transport: Arc<dyn Transport>,
    client: Mutex<Option<Arc<dyn Connection>>>,
    subs: Arc<Registry>,
    next_subscription: AtomicU64,
}

impl Worker {
    /// Create a worker that connects to NATS with the default handler.
    pub fn new(config: WorkerConfig) -> Result<Self, NatsqError> {
        Self::with_options(config, InitOptions::default())
    }

    /// Create a worker with custom options.
    ///
    /// The configuration is validated here; no connection is made until the
    /// first operation that needs one.
    pub fn with_options(config: WorkerConfig, options: InitOptions) -> Result<Self, NatsqError> {
        config.validate()?;

        Ok(Self {
            config,
            handler: options.handler().clone(),
            transport: options.transport().clone(),
            client: Mutex::new(None),
            subs: Arc::new(Mutex::new(HashMap::new())),
            next_subscription: AtomicU64::new(0),
        })
    }

    /// Get the worker configuration.
    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    /// Get the configured handler.
    pub fn handler(&self) -> &Arc<dyn Handler> {
        &self.handler
    }

    /// Return the current connection, connecting first if there is none or
    /// it is no longer connected.
    pub async fn client(&self) -> Result<Arc<dyn Connection>, NatsqError> {
        let mut client = self.client.lock().await;
        if let Some(conn) = client.as_ref() {
            if conn.is_connected() {
                return Ok(conn.clone());
            }
        }

        trace!(host = %self.config.server_url(), "Initiating connection to server");
        let conn = self.transport.connect(&self.config).await?;
        trace!(host = %self.config.server_url(), "Connected");

        *client = Some(conn.clone());
        Ok(conn)
    }

    /// Unsubscribe every topic and close the connection.
    ///
    /// Unsubscribe failures are logged and do not stop the remaining
    /// cleanup. Afterwards the worker is back in its initial state and the
    /// next operation reconnects.
    pub async fn close(&self) {
        let subs: Vec<(String, SubscriptionEntry)> = self.subs.lock().await.drain().collect();
        for (topic, entry) in subs {
            match entry.unsubscribe().await {
                Ok(()) => trace!(topic = %topic, "Success unsubscribed"),
                Err(e) => warn!(topic = %topic, error = %e, "Failed to unsubscribe"),
            }
        }

        if let Some(conn) = self.client.lock().await.take() {
            if let Err(e) = conn.close().await {
                warn!(error = %e, "Failed to close NATS connection");
            }
        }
        trace!("NATS connection has been closed");
    }

    /// Topics with an active subscription.
    ///
    /// A subscription the transport ended on its own (for example after the
    /// connection dropped) is removed from the registry once its delivery
    /// loop notices.
    pub async fn subscribed_topics(&self) -> Vec<String> {
        let mut topics: Vec<String> = self.subs.lock().await.keys().cloned().collect();
        topics.sort();
        topics
    }

    /// Serialize `payload` to JSON and publish it on `topic`.
    ///
    /// The message carries a `publish-id` header: the ambient request id of
    /// `ctx` when there is one, a freshly generated id otherwise. The final
    /// send goes through [`Handler::publish`] and its result is returned
    /// unchanged.
    #[instrument(skip_all, fields(topic = %topic))]
    pub async fn publish<T>(&self, ctx: &Context, topic: &str, payload: &T) -> Result<(), NatsqError>
    where
        T: Serialize + ?Sized,
    {
        let (ctx, publish_id) = new_publish_id(ctx);

        let data = serde_json::to_vec(payload).map_err(|e| {
            error!(publish_id = %publish_id, error = %e, "Failed to serialize payload to json");
            NatsqError::from(e)
        })?;

        let message = Message::new(topic, data).with_header(HEADER_PUBLISH_ID, &publish_id);

        let conn = self.client().await.map_err(|e| {
            error!(error = %e, "Failed to initiate NATS client");
            e
        })?;

        trace!(publish_id = %publish_id, "Publishing message");
        self.handler.publish(&ctx, conn.as_ref(), message).await
    }

    /// Publish a fully constructed message directly on the connection,
    /// bypassing publish-id generation and the handler.
    #[instrument(skip_all, fields(subject = %message.subject))]
    pub async fn publish_msg(&self, message: Message) -> Result<(), NatsqError> {
        let conn = self.client().await.map_err(|e| {
            error!(error = %e, "Failed to initiate NATS client");
            e
        })?;
        conn.publish(message).await
    }

    /// Like [`publish`](Self::publish), but panics on failure.
    ///
    /// For call sites that have no way to recover from a failed publish.
    pub async fn must_publish<T>(&self, ctx: &Context, topic: &str, payload: &T)
    where
        T: Serialize + ?Sized,
    {
        if let Err(e) = self.publish(ctx, topic, payload).await {
            panic!("natsq: failed to publish to {topic}: {e}");
        }
    }

    /// Subscribe with a `(ctx, topic, payload) -> no_retry` callback.
    ///
    /// Returning `true` acks the message, `false` naks it for redelivery.
    pub async fn subscribe<F, Fut>(&self, topic: &str, handler: F) -> Result<(), NatsqError>
    where
        F: Fn(Context, String, Bytes) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = bool> + Send + 'static,
    {
        self.register(topic, wrap_worker(handler)).await
    }

    /// Like [`subscribe`](Self::subscribe), but panics on failure.
    pub async fn must_subscribe<F, Fut>(&self, topic: &str, handler: F)
    where
        F: Fn(Context, String, Bytes) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = bool> + Send + 'static,
    {
        if let Err(e) = self.subscribe(topic, handler).await {
            panic!("natsq: failed to subscribe to {topic}: {e}");
        }
    }

    /// Subscribe with a native callback that receives the [`Delivery`] and
    /// acknowledges it itself.
    pub async fn subscribe_msg<F, Fut>(&self, topic: &str, handler: F) -> Result<(), NatsqError>
    where
        F: Fn(Context, Delivery) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let callback: SubscriberHandler =
            Arc::new(move |ctx: Context, delivery: Delivery| -> BoxFuture<'static, ()> {
                handler(ctx, delivery).boxed()
            });
        self.register(topic, callback).await
    }

    #[instrument(skip_all, fields(topic = %topic))]
    async fn register(&self, topic: &str, callback: SubscriberHandler) -> Result<(), NatsqError> {
        let conn = self.client().await.map_err(|e| {
            error!(error = %e, "Failed to initiate NATS client");
            e
        })?;

        let subscription = conn.queue_subscribe(topic, topic).await.map_err(|e| {
            error!(error = %e, "Failed to subscribe");
            e
        })?;

        let dispatcher = Dispatcher {
            topic: Arc::from(topic),
            handler: self.handler.clone(),
            callback,
        };
        let id = self.next_subscription.fetch_add(1, Ordering::Relaxed);
        let (control, requests) = oneshot::channel();

        // The pump only touches the registry after this insert.
        let replaced = {
            let mut subs = self.subs.lock().await;
            let task = tokio::spawn(pump(
                subscription,
                requests,
                dispatcher,
                Arc::downgrade(&self.subs),
                id,
            ));
            subs.insert(topic.to_string(), SubscriptionEntry { id, control, task })
        };

        if let Some(previous) = replaced {
            if let Err(e) = previous.unsubscribe().await {
                warn!(error = %e, "Failed to unsubscribe replaced subscription");
            }
        }

        trace!("Subscription started");
        Ok(())
    }
}

/// Registry entry: a handle to the task driving one subscription.
struct SubscriptionEntry {
    id: u64,
    control: oneshot::Sender<UnsubscribeReply>,
    task: JoinHandle<()>,
}

impl SubscriptionEntry {
    async fn unsubscribe(self) -> Result<(), NatsqError> {
        let (reply, result) = oneshot::channel();
        if self.control.send(reply).is_err() {
            return Err(NatsqError::unsubscribe_error("subscription already closed"));
        }

        let result = result
            .await
            .unwrap_or_else(|_| Err(NatsqError::unsubscribe_error("subscription task stopped")));
        let _ = self.task.await;
        result
    }
}

enum PumpEvent {
    Unsubscribe(Option<UnsubscribeReply>),
    Delivery(Option<Delivery>),
}

/// Drive a subscription: hand every delivery to its own task until asked to
/// unsubscribe or the subscription closes.
async fn pump(
    mut subscription: Box<dyn Subscription>,
    mut requests: oneshot::Receiver<UnsubscribeReply>,
    dispatcher: Dispatcher,
    registry: Weak<Registry>,
    id: u64,
) {
    loop {
        let event = tokio::select! {
            request = &mut requests => PumpEvent::Unsubscribe(request.ok()),
            delivery = subscription.next() => PumpEvent::Delivery(delivery),
        };

        match event {
            PumpEvent::Delivery(Some(delivery)) => {
                tokio::spawn(dispatcher.clone().dispatch(delivery));
            }
            PumpEvent::Delivery(None) => {
                trace!(topic = %dispatcher.topic, "Subscription closed by transport");
                forget(&registry, &dispatcher.topic, id).await;
                return;
            }
            PumpEvent::Unsubscribe(reply) => {
                let result = subscription.unsubscribe().await;
                if let Some(reply) = reply {
                    let _ = reply.send(result);
                }
                return;
            }
        }
    }
}

/// Drop the registry entry for `topic` if it still belongs to subscription `id`.
async fn forget(registry: &Weak<Registry>, topic: &str, id: u64) {
    let Some(registry) = registry.upgrade() else {
        return;
    };
    let mut subs = registry.lock().await;
    if subs.get(topic).is_some_and(|entry| entry.id == id) {
        subs.remove(topic);
    }
}

#[derive(Clone)]
struct Dispatcher {
    topic: Arc<str>,
    handler: Arc<dyn Handler>,
    callback: SubscriberHandler,
}

impl Dispatcher {
    async fn dispatch(self, delivery: Delivery) {
        let start = Instant::now();
        let publish_id = delivery.publish_id().unwrap_or_default().to_string();

        let mut ctx = Context::new()
            .with_started_at(Utc::now())
            .with_publish_id(publish_id.clone());
        if !publish_id.is_empty() {
            ctx = ctx.with_request_id(publish_id.clone());
        }
        trace!(topic = %self.topic, publish_id = %publish_id, "Received message for subscription");

        let callback = self.callback.clone();
        let callback_ctx = ctx.clone();
        let callback_delivery = delivery.clone();
        let outcome = Invocation::new(self.handler.as_ref(), &ctx, &self.topic, &delivery)
            .run(async move { callback(callback_ctx, callback_delivery).await })
            .await;

        trace!(
            topic = %self.topic,
            publish_id = %publish_id,
            completed = outcome.is_completed(),
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Handling subscription done"
        );
    }
}
