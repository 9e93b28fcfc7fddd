//! MQTT queue tests against the in-process broker.

// Integration tests use expect/unwrap for simplicity - panics are acceptable in tests
#![allow(clippy::expect_used, clippy::unwrap_used)]

use async_trait::async_trait;
use pipconnect::config::ConfigParams;
use pipconnect::messaging::{
    MemoryBroker, MessageEnvelope, MessageHandler, MqttConnection, MqttMessageQueue,
};
use pipconnect::storage::CONNECTION;
use pipconnect::{Context, References};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

const WAIT: Duration = Duration::from_secs(2);

fn config(extra: &[(&str, &str)]) -> ConfigParams {
    let mut config = ConfigParams::from_tuples(&[
        ("topic", "test"),
        ("connection.protocol", "mqtt"),
        ("connection.host", "localhost"),
        ("connection.port", "1883"),
    ]);
    for (key, value) in extra {
        config.set(*key, *value);
    }
    config
}

fn queue(broker: &MemoryBroker, extra: &[(&str, &str)]) -> MqttMessageQueue<MemoryBroker> {
    let mut queue = MqttMessageQueue::new("test", broker.clone());
    queue.configure(&config(extra));
    queue
}

#[tokio::test]
async fn test_send_receive_with_envelope() {
    let broker = MemoryBroker::new();
    let ctx = Context::new("123");
    let queue = queue(
        &broker,
        &[
            ("options.serialize_envelope", "true"),
            ("options.autosubscribe", "true"),
        ],
    );
    queue.open(&ctx).await.unwrap();

    let envelope = MessageEnvelope::new(None, Some("Test"), "Test message");
    queue.send(&ctx, envelope.clone()).await.unwrap();

    let received = queue.receive(&ctx, WAIT).await.unwrap().unwrap();
    assert_eq!(received.message_id, envelope.message_id);
    assert_eq!(received.message_type.as_deref(), Some("Test"));
    assert_eq!(received.trace_id.as_deref(), Some("123"));
    assert_eq!(received.message_as_string(), "Test message");
    assert_eq!(queue.read_message_count(), 0);

    queue.close(&ctx).await.unwrap();
}

#[tokio::test]
async fn test_peek_keeps_message() {
    let broker = MemoryBroker::new();
    let ctx = Context::default();
    let queue = queue(&broker, &[("options.autosubscribe", "true")]);
    queue.open(&ctx).await.unwrap();

    queue
        .send(&ctx, MessageEnvelope::new(None, None, "one"))
        .await
        .unwrap();
    let received = queue.receive(&ctx, WAIT).await.unwrap().unwrap();
    assert_eq!(received.message_as_string(), "one");

    queue
        .send(&ctx, MessageEnvelope::new(None, None, "two"))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    let peeked = queue.peek(&ctx).await.unwrap().unwrap();
    assert_eq!(peeked.message_as_string(), "two");
    assert_eq!(queue.read_message_count(), 1);
    assert_eq!(queue.peek_batch(&ctx, 10).await.unwrap().len(), 1);

    queue.clear(&ctx);
    assert_eq!(queue.read_message_count(), 0);
    queue.close(&ctx).await.unwrap();
}

struct Forward(mpsc::UnboundedSender<String>);

#[async_trait]
impl MessageHandler for Forward {
    async fn receive_message(&self, envelope: MessageEnvelope, _queue: &str) -> pipconnect::Result<()> {
        self.0.send(envelope.message_as_string()).unwrap();
        Ok(())
    }
}

#[tokio::test]
async fn test_listen_and_end_listen() {
    let broker = MemoryBroker::new();
    let ctx = Context::default();
    let queue = queue(&broker, &[]);
    queue.open(&ctx).await.unwrap();

    let (tx, mut rx) = mpsc::unbounded_channel();
    queue.listen(&ctx, Arc::new(Forward(tx))).await.unwrap();
    queue
        .send(&ctx, MessageEnvelope::new(None, None, "hello"))
        .await
        .unwrap();
    let got = tokio::time::timeout(WAIT, rx.recv()).await.unwrap().unwrap();
    assert_eq!(got, "hello");

    queue.end_listen(&ctx);
    queue
        .send(&ctx, MessageEnvelope::new(None, None, "after"))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(rx.try_recv().is_err());
    assert_eq!(queue.read_message_count(), 1);
    queue.close(&ctx).await.unwrap();
}

#[derive(Default)]
struct Collect(Mutex<Vec<String>>);

#[async_trait]
impl MessageHandler for Collect {
    async fn receive_message(&self, envelope: MessageEnvelope, queue: &str) -> pipconnect::Result<()> {
        self.0
            .lock()
            .unwrap()
            .push(format!("{queue}:{}", envelope.message_as_string()));
        Ok(())
    }
}

#[tokio::test]
async fn test_queues_share_one_connection() {
    let broker = MemoryBroker::new();
    let ctx = Context::default();
    let mut connection = MqttConnection::new(broker.clone());
    connection.configure(&config(&[("options.client_id", "shared")]));
    let connection = Arc::new(connection);
    connection.open(&ctx).await.unwrap();
    let references = References::new().with(CONNECTION, Arc::clone(&connection));

    let mut first: MqttMessageQueue<MemoryBroker> = MqttMessageQueue::unbound("first");
    first.configure(&ConfigParams::from_tuples(&[("topic", "events/a")]));
    first.set_references(&references);
    let mut second: MqttMessageQueue<MemoryBroker> = MqttMessageQueue::unbound("second");
    second.configure(&ConfigParams::from_tuples(&[("topic", "events/a")]));
    second.set_references(&references);

    first.open(&ctx).await.unwrap();
    second.open(&ctx).await.unwrap();
    let collected = Arc::new(Collect::default());
    first.listen(&ctx, collected.clone()).await.unwrap();
    second.listen(&ctx, collected.clone()).await.unwrap();
    assert_eq!(broker.subscriptions("shared"), vec!["events/a".to_string()]);

    first
        .send(&ctx, MessageEnvelope::new(None, None, "x"))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    let mut seen = collected.0.lock().unwrap().clone();
    seen.sort();
    assert_eq!(seen, ["first:x", "second:x"]);

    first.close(&ctx).await.unwrap();
    assert_eq!(broker.subscriptions("shared"), vec!["events/a".to_string()]);
    second.close(&ctx).await.unwrap();
    assert!(broker.subscriptions("shared").is_empty());
    assert!(connection.is_open().await);
}

#[tokio::test]
async fn test_retained_message_reaches_late_subscriber() {
    let broker = MemoryBroker::new();
    let ctx = Context::default();
    let publisher = queue(&broker, &[("options.retain", "true")]);
    publisher.open(&ctx).await.unwrap();
    publisher
        .send(&ctx, MessageEnvelope::new(None, None, "state"))
        .await
        .unwrap();

    let subscriber = queue(&broker, &[]);
    subscriber.open(&ctx).await.unwrap();
    let received = subscriber.receive(&ctx, WAIT).await.unwrap().unwrap();
    assert_eq!(received.message_as_string(), "state");
}
