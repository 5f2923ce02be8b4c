//! In-process broker used by tests and local development.
//!
//! Mirrors the parts of NATS the worker relies on: exact-subject queue-group
//! subscriptions with round-robin delivery inside a group, reply subjects for
//! acknowledgements, and connections that can be closed or dropped. Every
//! published message and every ack/nak is recorded so callers can assert on
//! what reached the broker. Failures can be injected per operation.

use super::{Connection, Subscription, Transport};
use crate::config::WorkerConfig;
use crate::error::NatsqError;
use crate::message::{AckKind, Acknowledger, Delivery, Message};
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::{mpsc, Notify};
use tracing::trace;

/// An acknowledgement observed by the in-memory broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AckRecord {
    /// Subject of the acknowledged message
    pub subject: String,
    /// Publish id header of the acknowledged message
    pub publish_id: Option<String>,
    /// Payload of the acknowledged message
    pub payload: Bytes,
    /// Ack or nak
    pub kind: AckKind,
}

/// In-memory [`Transport`].
///
/// Cloning shares the same broker, so a test can keep a handle for
/// assertions while the worker owns another.
#[derive(Clone, Default)]
pub struct MemoryTransport {
    broker: Arc<Broker>,
}

#[derive(Default)]
struct Broker {
    state: Mutex<BrokerState>,
    acked: Notify,
}

#[derive(Default)]
struct BrokerState {
    next_id: u64,
    connects: usize,
    connections: HashMap<u64, Arc<AtomicBool>>,
    subscriptions: Vec<MemberSlot>,
    cursors: HashMap<(String, String), usize>,
    published: Vec<Message>,
    acks: Vec<AckRecord>,
    fail_connect: bool,
    fail_publish: bool,
    fail_unsubscribe: HashSet<String>,
}

struct MemberSlot {
    id: u64,
    connection_id: u64,
    topic: String,
    queue_group: String,
    sender: mpsc::UnboundedSender<Message>,
}

impl Broker {
    fn state(&self) -> MutexGuard<'_, BrokerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl MemoryTransport {
    /// Create an empty broker.
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every following connect attempt fail (or succeed again).
    pub fn set_connect_failure(&self, fail: bool) {
        self.broker.state().fail_connect = fail;
    }

    /// Make every following publish fail (or succeed again).
    pub fn set_publish_failure(&self, fail: bool) {
        self.broker.state().fail_publish = fail;
    }

    /// Make unsubscribing from `topic` fail.
    pub fn fail_unsubscribe(&self, topic: impl Into<String>) {
        self.broker.state().fail_unsubscribe.insert(topic.into());
    }

    /// Drop every open connection as if the server went away.
    pub fn simulate_disconnect(&self) {
        let mut state = self.broker.state();
        for live in state.connections.values() {
            live.store(false, Ordering::SeqCst);
        }
        state.connections.clear();
        state.subscriptions.clear();
    }

    /// Number of successful connects so far.
    pub fn connect_count(&self) -> usize {
        self.broker.state().connects
    }

    /// Number of connections currently open.
    pub fn open_connections(&self) -> usize {
        self.broker.state().connections.len()
    }

    /// Number of live subscriptions on `topic`.
    pub fn subscription_count(&self, topic: &str) -> usize {
        self.broker
            .state()
            .subscriptions
            .iter()
            .filter(|slot| slot.topic == topic)
            .count()
    }

    /// Every message that reached the broker, in publish order.
    pub fn published(&self) -> Vec<Message> {
        self.broker.state().published.clone()
    }

    /// Every ack/nak received, in arrival order.
    pub fn acks(&self) -> Vec<AckRecord> {
        self.broker.state().acks.clone()
    }

    /// Wait until at least `count` acks/naks arrived or `timeout` elapsed,
    /// then return all recorded acks.
    pub async fn wait_for_acks(&self, count: usize, timeout: Duration) -> Vec<AckRecord> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let notified = self.broker.acked.notified();
            let acks = self.acks();
            if acks.len() >= count {
                return acks;
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return self.acks();
            }
        }
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn connect(&self, config: &WorkerConfig) -> Result<Arc<dyn Connection>, NatsqError> {
        let mut state = self.broker.state();
        if state.fail_connect {
            return Err(NatsqError::connection_error(format!(
                "connection refused: {}",
                config.server_url()
            )));
        }

        state.next_id += 1;
        state.connects += 1;
        let id = state.next_id;
        let live = Arc::new(AtomicBool::new(true));
        state.connections.insert(id, live.clone());
        trace!(connection_id = id, "Memory connection opened");

        Ok(Arc::new(MemoryConnection {
            id,
            broker: self.broker.clone(),
            live,
        }))
    }
}

struct MemoryConnection {
    id: u64,
    broker: Arc<Broker>,
    live: Arc<AtomicBool>,
}

impl MemoryConnection {
    fn ensure_live(&self) -> Result<(), NatsqError> {
        if self.live.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(NatsqError::connection_error("connection closed"))
        }
    }
}

#[async_trait]
impl Connection for MemoryConnection {
    fn is_connected(&self) -> bool {
        self.live.load(Ordering::SeqCst)
    }

    async fn publish(&self, message: Message) -> Result<(), NatsqError> {
        self.ensure_live()
            .map_err(|_| NatsqError::publish_error("connection closed"))?;

        let mut state = self.broker.state();
        if state.fail_publish {
            return Err(NatsqError::publish_error("publish rejected by broker"));
        }

        state.published.push(message.clone());
        let sequence = state.published.len();

        let mut groups: Vec<String> = state
            .subscriptions
            .iter()
            .filter(|slot| slot.topic == message.subject)
            .map(|slot| slot.queue_group.clone())
            .collect();
        groups.sort();
        groups.dedup();

        for group in groups {
            let members: Vec<usize> = state
                .subscriptions
                .iter()
                .enumerate()
                .filter(|(_, slot)| slot.topic == message.subject && slot.queue_group == group)
                .map(|(index, _)| index)
                .collect();

            let cursor = state
                .cursors
                .entry((message.subject.clone(), group))
                .or_insert(0);
            let member = members[*cursor % members.len()];
            *cursor += 1;

            let delivered = message
                .clone()
                .with_reply(format!("_MEM.ACK.{}.{}", message.subject, sequence));
            let _ = state.subscriptions[member].sender.send(delivered);
        }

        Ok(())
    }

    async fn queue_subscribe(
        &self,
        topic: &str,
        queue_group: &str,
    ) -> Result<Box<dyn Subscription>, NatsqError> {
        self.ensure_live()
            .map_err(|_| NatsqError::subscribe_error("connection closed"))?;

        let (sender, receiver) = mpsc::unbounded_channel();
        let mut state = self.broker.state();
        state.next_id += 1;
        let id = state.next_id;
        state.subscriptions.push(MemberSlot {
            id,
            connection_id: self.id,
            topic: topic.to_string(),
            queue_group: queue_group.to_string(),
            sender,
        });

        Ok(Box::new(MemorySubscription {
            id,
            topic: topic.to_string(),
            broker: self.broker.clone(),
            receiver,
            acker: Arc::new(MemoryAcknowledger {
                broker: self.broker.clone(),
            }),
        }))
    }

    async fn close(&self) -> Result<(), NatsqError> {
        self.live.store(false, Ordering::SeqCst);
        let mut state = self.broker.state();
        state.connections.remove(&self.id);
        state
            .subscriptions
            .retain(|slot| slot.connection_id != self.id);
        trace!(connection_id = self.id, "Memory connection closed");
        Ok(())
    }
}

struct MemorySubscription {
    id: u64,
    topic: String,
    broker: Arc<Broker>,
    receiver: mpsc::UnboundedReceiver<Message>,
    acker: Arc<MemoryAcknowledger>,
}

#[async_trait]
impl Subscription for MemorySubscription {
    async fn next(&mut self) -> Option<Delivery> {
        let message = self.receiver.recv().await?;
        Some(Delivery::new(message, self.acker.clone()))
    }

    async fn unsubscribe(&mut self) -> Result<(), NatsqError> {
        let mut state = self.broker.state();
        if state.fail_unsubscribe.contains(&self.topic) {
            return Err(NatsqError::unsubscribe_error(format!(
                "cannot unsubscribe from {}",
                self.topic
            )));
        }
        state.subscriptions.retain(|slot| slot.id != self.id);
        drop(state);

        self.receiver.close();
        Ok(())
    }
}

struct MemoryAcknowledger {
    broker: Arc<Broker>,
}

#[async_trait]
impl Acknowledger for MemoryAcknowledger {
    async fn acknowledge(&self, message: &Message, kind: AckKind) -> Result<(), NatsqError> {
        if message.reply.is_none() {
            return Err(NatsqError::NotBound);
        }

        self.broker.state().acks.push(AckRecord {
            subject: message.subject.clone(),
            publish_id: message.publish_id().map(str::to_string),
            payload: message.payload.clone(),
            kind,
        });
        self.broker.acked.notify_waiters();
        Ok(())
    }
}
