//! Resilient NATS pub/sub worker adapter.
//!
//! `natsq` sits between an application and the NATS client. It owns a single
//! lazily created connection, keeps track of active subscriptions, and runs
//! every subscription callback under supervision:
//!
//! - **Panic isolation**: a panicking callback never takes down the delivery
//!   loop; it is reported to the [`Handler`] exactly once and the message is
//!   naked so the broker redelivers it.
//! - **Ack/Nak retry**: the simplified callback returns `no_retry`; `true`
//!   acks, `false` naks.
//! - **Publish-id tracing**: every published message carries a `publish-id`
//!   header (the caller's request id, or a fresh UUID) that shows up in the
//!   subscriber's [`Context`].
//! - **Load balancing**: subscriptions join a queue group named after the
//!   topic, so worker replicas share deliveries.
//!
//! # Architecture
//!
//! ```text
//! ┌────────────┐  publish   ┌──────────────┐  Handler::publish  ┌─────────────┐
//! │ Your code  │──────────▶│    Worker    │──────────────────▶│  Transport  │
//! └────────────┘            │ (connection, │                    │ (NATS or    │
//!       ▲                   │  registry)   │◀──────────────────│  in-memory) │
//!       │ callback          └──────────────┘     deliveries     └─────────────┘
//!       │                          │
//!       └──── Invocation (catch_unwind, report, nak) ◀──┘
//! ```
//!
//! # Example
//!
//! ```rust,ignore
//! use natsq::{Context, Worker, WorkerConfig};
//!
//! let worker = Worker::new(WorkerConfig::from_env()?)?;
//!
//! worker
//!     .subscribe("orders", |_ctx, _topic, payload| async move {
//!         let order: Order = match serde_json::from_slice(&payload) {
//!             Ok(order) => order,
//!             Err(_) => return true, // malformed, do not retry
//!         };
//!         fulfil(order).await.is_ok()
//!     })
//!     .await?;
//!
//! worker.publish(&Context::new(), "orders", &order).await?;
//! ```

mod config;
mod context;
mod error;
mod handler;
mod message;
pub mod metrics;
mod options;
mod recovery;
pub mod transport;
mod worker;
mod worker_handler;

pub use config::WorkerConfig;
pub use context::{new_publish_id, Context};
pub use error::NatsqError;
pub use handler::{Handler, LogHandler};
pub use message::{AckKind, Acknowledger, Delivery, Message, HEADER_PUBLISH_ID};
pub use crate::metrics::MetricsHandler;
pub use options::InitOptions;
pub use recovery::Outcome;
pub use transport::{
    AckRecord, Connection, MemoryTransport, NatsTransport, Subscription, Transport,
};
pub use worker::Worker;
pub use worker_handler::{wrap_worker, SubscriberHandler};
