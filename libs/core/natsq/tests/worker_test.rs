//! Integration tests for the worker against the in-memory broker.

use async_trait::async_trait;
use natsq::{
    AckKind, Connection, Context, Handler, InitOptions, MemoryTransport, Message, NatsqError,
    Worker, WorkerConfig, HEADER_PUBLISH_ID,
};
use serde_json::json;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

const WAIT: Duration = Duration::from_secs(2);

/// Records panic notifications and forwards publishes unchanged.
#[derive(Default)]
struct RecordingHandler {
    panics: Mutex<Vec<PanicReport>>,
    publishes: Mutex<Vec<Option<String>>>,
}

#[derive(Debug, Clone)]
struct PanicReport {
    topic: String,
    data: Vec<u8>,
    value: Option<String>,
    publish_id: Option<String>,
}

impl RecordingHandler {
    fn panics(&self) -> Vec<PanicReport> {
        self.panics.lock().unwrap().clone()
    }
}

#[async_trait]
impl Handler for RecordingHandler {
    fn on_subscribe_panic(
        &self,
        ctx: &Context,
        topic: &str,
        data: &[u8],
        value: Option<&str>,
        _stack: &str,
    ) {
        self.panics.lock().unwrap().push(PanicReport {
            topic: topic.to_string(),
            data: data.to_vec(),
            value: value.map(str::to_string),
            publish_id: ctx.publish_id().map(str::to_string),
        });
    }

    async fn publish(
        &self,
        ctx: &Context,
        conn: &dyn Connection,
        message: Message,
    ) -> Result<(), NatsqError> {
        self.publishes
            .lock()
            .unwrap()
            .push(ctx.publish_id().map(str::to_string));
        conn.publish(message).await
    }
}

struct Harness {
    worker: Worker,
    transport: MemoryTransport,
    handler: Arc<RecordingHandler>,
}

fn harness() -> Harness {
    let transport = MemoryTransport::new();
    let handler = Arc::new(RecordingHandler::default());
    let worker = Worker::with_options(
        WorkerConfig::new("localhost", 4222, "token"),
        InitOptions::new()
            .with_handler(handler.clone())
            .with_transport(Arc::new(transport.clone())),
    )
    .unwrap();

    Harness {
        worker,
        transport,
        handler,
    }
}

mod publish_id_tests {
    use super::*;

    #[tokio::test]
    async fn test_subscriber_sees_header_publish_id() {
        let h = harness();
        let (tx, mut rx) = mpsc::unbounded_channel();

        h.worker
            .subscribe("orders", move |ctx, _topic, _payload| {
                let tx = tx.clone();
                async move {
                    let _ = tx.send((ctx.publish_id().map(str::to_string), ctx.started_at()));
                    true
                }
            })
            .await
            .unwrap();

        h.worker
            .publish(&Context::new(), "orders", &json!({"id": 1}))
            .await
            .unwrap();

        let (seen, started_at) = tokio::time::timeout(WAIT, rx.recv()).await.unwrap().unwrap();
        let published = h.transport.published();
        let header = published[0].publish_id().map(str::to_string);

        assert!(header.is_some());
        assert_eq!(seen, header);
        assert!(started_at.is_some());
        assert_eq!(*h.handler.publishes.lock().unwrap(), vec![header]);
    }

    #[tokio::test]
    async fn test_ambient_request_id_is_reused() {
        let h = harness();
        let ctx = Context::new().with_request_id("trace-123");

        h.worker.publish(&ctx, "orders", &json!({})).await.unwrap();

        let published = h.transport.published();
        assert_eq!(published[0].publish_id(), Some("trace-123"));
    }

    #[tokio::test]
    async fn test_generated_ids_are_distinct() {
        let h = harness();

        h.worker.publish(&Context::new(), "orders", &json!({})).await.unwrap();
        h.worker.publish(&Context::new(), "orders", &json!({})).await.unwrap();

        let published = h.transport.published();
        let first = published[0].publish_id().unwrap();
        let second = published[1].publish_id().unwrap();
        assert_ne!(first, second);
    }

    #[tokio::test]
    async fn test_publish_msg_bypasses_handler() {
        let h = harness();
        let message = Message::new("orders", "raw").with_header(HEADER_PUBLISH_ID, "custom");

        h.worker.publish_msg(message).await.unwrap();

        let published = h.transport.published();
        assert_eq!(published[0].publish_id(), Some("custom"));
        assert!(h.handler.publishes.lock().unwrap().is_empty());
    }
}

mod ack_tests {
    use super::*;

    #[tokio::test]
    async fn test_no_retry_true_acks() {
        let h = harness();
        h.worker
            .subscribe("orders", |_, _, _| async { true })
            .await
            .unwrap();

        h.worker.publish(&Context::new(), "orders", &json!({})).await.unwrap();

        let acks = h.transport.wait_for_acks(1, WAIT).await;
        assert_eq!(acks.len(), 1);
        assert_eq!(acks[0].kind, AckKind::Ack);
        assert!(h.handler.panics().is_empty());
    }

    #[tokio::test]
    async fn test_no_retry_false_naks() {
        let h = harness();
        h.worker
            .subscribe("orders", |_, _, _| async { false })
            .await
            .unwrap();

        h.worker.publish(&Context::new(), "orders", &json!({})).await.unwrap();

        let acks = h.transport.wait_for_acks(1, WAIT).await;
        assert_eq!(acks.len(), 1);
        assert_eq!(acks[0].kind, AckKind::Nak);
        assert!(h.handler.panics().is_empty());
    }

    #[tokio::test]
    async fn test_panicking_callback_reports_once_and_naks() {
        let h = harness();
        h.worker
            .subscribe("orders", |_, _, _| async {
                panic!("handler exploded");
            })
            .await
            .unwrap();

        h.worker.publish(&Context::new(), "orders", &json!({"id": 7})).await.unwrap();

        let acks = h.transport.wait_for_acks(1, WAIT).await;
        // Give a stray second ack the chance to show up.
        tokio::time::sleep(Duration::from_millis(50)).await;
        let acks_after = h.transport.acks();

        assert_eq!(acks.len(), 1);
        assert_eq!(acks_after.len(), 1);
        assert_eq!(acks[0].kind, AckKind::Nak);

        let panics = h.handler.panics();
        assert_eq!(panics.len(), 1);
        assert_eq!(panics[0].topic, "orders");
        assert_eq!(panics[0].value.as_deref(), Some("handler exploded"));
        assert_eq!(panics[0].data, br#"{"id":7}"#.to_vec());
        assert_eq!(panics[0].publish_id, acks[0].publish_id);
    }

    #[tokio::test]
    async fn test_native_callback_panic_naks_unacknowledged_delivery() {
        let h = harness();
        h.worker
            .subscribe_msg("orders", |_ctx, _delivery| async {
                panic!("native failure");
            })
            .await
            .unwrap();

        h.worker.publish(&Context::new(), "orders", &json!({})).await.unwrap();

        let acks = h.transport.wait_for_acks(1, WAIT).await;
        assert_eq!(acks.len(), 1);
        assert_eq!(acks[0].kind, AckKind::Nak);
        assert_eq!(h.handler.panics().len(), 1);
    }

    #[tokio::test]
    async fn test_native_callback_acking_itself() {
        let h = harness();
        h.worker
            .subscribe_msg("orders", |_ctx, delivery| async move {
                delivery.ack().await.unwrap();
            })
            .await
            .unwrap();

        h.worker.publish(&Context::new(), "orders", &json!({})).await.unwrap();

        let acks = h.transport.wait_for_acks(1, WAIT).await;
        assert_eq!(acks.len(), 1);
        assert_eq!(acks[0].kind, AckKind::Ack);
        assert!(h.handler.panics().is_empty());
    }

    #[tokio::test]
    async fn test_panic_after_ack_is_reported_without_nak() {
        let h = harness();
        h.worker
            .subscribe_msg("orders", |_ctx, delivery| async move {
                delivery.ack().await.unwrap();
                panic!("failed after ack");
            })
            .await
            .unwrap();

        h.worker.publish(&Context::new(), "orders", &json!({})).await.unwrap();

        let acks = h.transport.wait_for_acks(1, WAIT).await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(acks.len(), 1);
        assert_eq!(acks[0].kind, AckKind::Ack);
        assert_eq!(h.transport.acks().len(), 1);
        assert_eq!(h.handler.panics().len(), 1);
    }

    #[tokio::test]
    async fn test_orders_scenario() {
        let h = harness();
        h.worker
            .subscribe("orders", |_ctx, _topic, payload| async move {
                let order: serde_json::Value = serde_json::from_slice(&payload).unwrap();
                if order["bad"] == json!(true) {
                    panic!("bad order");
                }
                true
            })
            .await
            .unwrap();

        h.worker
            .publish(&Context::new().with_request_id("bad-1"), "orders", &json!({"bad": true}))
            .await
            .unwrap();
        let acks = h.transport.wait_for_acks(1, WAIT).await;
        assert_eq!(acks.len(), 1);
        assert_eq!(acks[0].kind, AckKind::Nak);
        assert_eq!(acks[0].publish_id.as_deref(), Some("bad-1"));
        assert_eq!(h.handler.panics().len(), 1);

        h.worker
            .publish(&Context::new().with_request_id("good-1"), "orders", &json!({"bad": false}))
            .await
            .unwrap();
        let acks = h.transport.wait_for_acks(2, WAIT).await;
        assert_eq!(acks.len(), 2);
        assert_eq!(acks[1].kind, AckKind::Ack);
        assert_eq!(acks[1].publish_id.as_deref(), Some("good-1"));
        assert_eq!(h.handler.panics().len(), 1);
    }

    #[tokio::test]
    async fn test_deliveries_run_concurrently() {
        let h = harness();
        let barrier = Arc::new(tokio::sync::Barrier::new(2));

        h.worker
            .subscribe("orders", move |_, _, _| {
                let barrier = barrier.clone();
                async move {
                    barrier.wait().await;
                    true
                }
            })
            .await
            .unwrap();

        h.worker.publish(&Context::new(), "orders", &json!({"n": 1})).await.unwrap();
        h.worker.publish(&Context::new(), "orders", &json!({"n": 2})).await.unwrap();

        let acks = h.transport.wait_for_acks(2, WAIT).await;
        assert_eq!(acks.len(), 2);
        assert!(acks.iter().all(|ack| ack.kind == AckKind::Ack));
    }
}

mod lifecycle_tests {
    use super::*;

    #[tokio::test]
    async fn test_close_shuts_down_handed_out_connection() {
        let h = harness();
        let conn = h.worker.client().await.unwrap();

        h.worker.close().await;

        assert!(!conn.is_connected());
        let err = conn.publish(Message::new("orders", "{}")).await.unwrap_err();
        assert!(err.is_transport());
    }

    #[tokio::test]
    async fn test_workers_on_same_topic_share_queue_group() {
        let transport = MemoryTransport::new();
        let (tx, mut rx) = mpsc::unbounded_channel();

        let mut workers = Vec::new();
        for name in ["worker-a", "worker-b"] {
            let worker = Worker::with_options(
                WorkerConfig::new("localhost", 4222, "").with_connection_name(name),
                InitOptions::new().with_transport(Arc::new(transport.clone())),
            )
            .unwrap();

            let tx = tx.clone();
            worker
                .subscribe("orders", move |_, _, _| {
                    let tx = tx.clone();
                    async move {
                        let _ = tx.send(name);
                        true
                    }
                })
                .await
                .unwrap();
            workers.push(worker);
        }

        workers[0].publish(&Context::new(), "orders", &json!({"n": 1})).await.unwrap();
        workers[0].publish(&Context::new(), "orders", &json!({"n": 2})).await.unwrap();
        transport.wait_for_acks(2, WAIT).await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        let mut handled = Vec::new();
        while let Ok(name) = rx.try_recv() {
            handled.push(name);
        }
        handled.sort();
        assert_eq!(handled, vec!["worker-a", "worker-b"]);
        assert_eq!(transport.acks().len(), 2);
    }

    #[tokio::test]
    async fn test_close_then_publish_reconnects() {
        let h = harness();
        h.worker.publish(&Context::new(), "orders", &json!({})).await.unwrap();
        assert_eq!(h.transport.connect_count(), 1);

        h.worker.close().await;
        assert_eq!(h.transport.open_connections(), 0);

        h.worker.publish(&Context::new(), "orders", &json!({})).await.unwrap();
        assert_eq!(h.transport.connect_count(), 2);
        assert_eq!(h.transport.published().len(), 2);
    }

    #[tokio::test]
    async fn test_close_then_subscribe_reconnects() {
        let h = harness();
        h.worker
            .subscribe("orders", |_, _, _| async { true })
            .await
            .unwrap();
        h.worker.close().await;
        assert!(h.worker.subscribed_topics().await.is_empty());

        h.worker
            .subscribe("orders", |_, _, _| async { true })
            .await
            .unwrap();
        h.worker.publish(&Context::new(), "orders", &json!({})).await.unwrap();

        let acks = h.transport.wait_for_acks(1, WAIT).await;
        assert_eq!(acks.len(), 1);
        assert_eq!(h.transport.connect_count(), 2);
    }

    #[tokio::test]
    async fn test_close_survives_failing_unsubscribe() {
        let h = harness();
        for topic in ["billing", "orders", "shipping"] {
            h.worker
                .subscribe(topic, |_, _, _| async { true })
                .await
                .unwrap();
        }
        h.transport.fail_unsubscribe("orders");

        h.worker.close().await;

        assert!(h.worker.subscribed_topics().await.is_empty());
        assert_eq!(h.transport.open_connections(), 0);
        assert_eq!(h.transport.subscription_count("billing"), 0);
        assert_eq!(h.transport.subscription_count("orders"), 0);
        assert_eq!(h.transport.subscription_count("shipping"), 0);
    }

    #[tokio::test]
    async fn test_subscribed_topics() {
        let h = harness();
        h.worker
            .subscribe("shipping", |_, _, _| async { true })
            .await
            .unwrap();
        h.worker
            .subscribe_msg("billing", |_, _| async {})
            .await
            .unwrap();

        assert_eq!(
            h.worker.subscribed_topics().await,
            vec!["billing".to_string(), "shipping".to_string()]
        );
    }
}

mod error_tests {
    use super::*;

    #[tokio::test]
    async fn test_serialization_failure_sends_nothing() {
        let h = harness();
        let mut payload = HashMap::new();
        payload.insert((1, 2), "tuple keys cannot be json object keys");

        let err = h
            .worker
            .publish(&Context::new(), "orders", &payload)
            .await
            .unwrap_err();

        assert!(matches!(err, NatsqError::Serialization(_)));
        assert!(h.transport.published().is_empty());
        assert_eq!(h.transport.connect_count(), 0);
    }

    #[tokio::test]
    async fn test_connect_failure_is_transport_error() {
        let h = harness();
        h.transport.set_connect_failure(true);

        let err = h
            .worker
            .publish(&Context::new(), "orders", &json!({}))
            .await
            .unwrap_err();
        assert!(err.is_transport());
        assert!(matches!(err, NatsqError::Connection(_)));

        let err = h
            .worker
            .subscribe("orders", |_, _, _| async { true })
            .await
            .unwrap_err();
        assert!(matches!(err, NatsqError::Connection(_)));
        assert!(h.worker.subscribed_topics().await.is_empty());
    }

    #[tokio::test]
    async fn test_handler_publish_error_is_returned_unchanged() {
        let h = harness();
        h.transport.set_publish_failure(true);

        let err = h
            .worker
            .publish(&Context::new(), "orders", &json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, NatsqError::Publish(ref msg) if msg == "publish rejected by broker"));
    }

    #[tokio::test]
    #[should_panic(expected = "natsq: failed to publish to orders")]
    async fn test_must_publish_panics_on_failure() {
        let h = harness();
        h.transport.set_connect_failure(true);
        h.worker.must_publish(&Context::new(), "orders", &json!({})).await;
    }

    #[tokio::test]
    #[should_panic(expected = "natsq: failed to subscribe to orders")]
    async fn test_must_subscribe_panics_on_failure() {
        let h = harness();
        h.transport.set_connect_failure(true);
        h.worker
            .must_subscribe("orders", |_, _, _| async { true })
            .await;
    }
}
