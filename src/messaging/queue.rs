//! Message queue over an MQTT topic.

use super::connection::{MessageListener, MqttConnection};
use super::envelope::MessageEnvelope;
use super::transport::{MqttMessage, MqttTransport};
use crate::config::ConfigParams;
use crate::storage::{CONNECTION, References};
use crate::{Context, Error, ErrorCode, Result};
use async_trait::async_trait;
use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;

/// Handles messages delivered by [`MqttMessageQueue::listen`].
#[async_trait]
pub trait MessageHandler: Send + Sync + 'static {
    /// Processes one message. Errors are logged and do not stop listening.
    async fn receive_message(&self, envelope: MessageEnvelope, queue: &str) -> Result<()>;
}

/// Buffer of received messages.
struct Inbox {
    queue: String,
    serialize_envelope: AtomicBool,
    buffer: Mutex<VecDeque<MessageEnvelope>>,
    notify: Notify,
}

impl Inbox {
    fn lock(&self) -> MutexGuard<'_, VecDeque<MessageEnvelope>> {
        self.buffer.lock().unwrap_or_else(|poisoned| {
            tracing::warn!(queue = %self.queue, "Queue buffer mutex poisoned, recovering");
            metrics::counter!("mqtt_queue_lock_poison_recovery_total").increment(1);
            poisoned.into_inner()
        })
    }

    async fn recv(&self) -> MessageEnvelope {
        loop {
            let notified = self.notify.notified();
            if let Some(envelope) = self.lock().pop_front() {
                return envelope;
            }
            notified.await;
        }
    }
}

impl MessageListener for Inbox {
    fn on_message(&self, message: &MqttMessage) {
        let envelope = self
            .serialize_envelope
            .load(Ordering::Relaxed)
            .then(|| MessageEnvelope::from_json_bytes(&message.payload))
            .flatten()
            .unwrap_or_else(|| MessageEnvelope::new(None, None, message.payload.clone()));

        tracing::trace!(
            queue = %self.queue,
            topic = %message.topic,
            message_id = %envelope.message_id,
            "Received message"
        );
        metrics::counter!("mqtt_messages_received_total").increment(1);
        self.lock().push_back(envelope);
        self.notify.notify_one();
    }
}

/// Message queue bound to one MQTT topic.
///
/// Configuration:
///
/// | key | default |
/// |-----|---------|
/// | `topic` | queue name |
/// | `options.qos` | 0 |
/// | `options.retain` | false |
/// | `options.serialize_envelope` | false |
/// | `options.autosubscribe` | false |
///
/// Without `autosubscribe` the topic is subscribed on the first `peek`,
/// `receive` or `listen`. MQTT has no acknowledgement, so received messages
/// are removed from the buffer immediately.
pub struct MqttMessageQueue<T: MqttTransport> {
    name: String,
    connection: Option<Arc<MqttConnection<T>>>,
    local_connection: bool,
    topic: String,
    qos: u8,
    retain: bool,
    autosubscribe: bool,
    inbox: Arc<Inbox>,
    subscription: tokio::sync::Mutex<Option<u64>>,
    listener: Mutex<Option<JoinHandle<()>>>,
    opened: AtomicBool,
}

impl<T: MqttTransport> MqttMessageQueue<T> {
    fn build(name: &str, connection: Option<Arc<MqttConnection<T>>>, local: bool) -> Self {
        Self {
            name: name.to_string(),
            connection,
            local_connection: local,
            topic: name.to_string(),
            qos: 0,
            retain: false,
            autosubscribe: false,
            inbox: Arc::new(Inbox {
                queue: name.to_string(),
                serialize_envelope: AtomicBool::new(false),
                buffer: Mutex::new(VecDeque::new()),
                notify: Notify::new(),
            }),
            subscription: tokio::sync::Mutex::new(None),
            listener: Mutex::new(None),
            opened: AtomicBool::new(false),
        }
    }

    /// Creates a queue with its own connection over `transport`.
    #[must_use]
    pub fn new(name: &str, transport: T) -> Self {
        Self::build(name, Some(Arc::new(MqttConnection::new(transport))), true)
    }

    /// Creates a queue on a shared connection.
    #[must_use]
    pub fn with_connection(name: &str, connection: Arc<MqttConnection<T>>) -> Self {
        Self::build(name, Some(connection), false)
    }

    /// Creates a queue wired later through references.
    #[must_use]
    pub fn unbound(name: &str) -> Self {
        Self::build(name, None, false)
    }

    /// Reads topic and delivery options; configures a local connection.
    pub fn configure(&mut self, config: &ConfigParams) {
        self.topic = config.get_as_string_or("topic", &self.name);
        self.qos = u8::try_from(config.get_as_u64_or("options.qos", 0).min(2)).unwrap_or(0);
        self.retain = config.get_as_bool_or("options.retain", false);
        self.autosubscribe = config.get_as_bool_or("options.autosubscribe", false);
        self.inbox.serialize_envelope.store(
            config.get_as_bool_or("options.serialize_envelope", false),
            Ordering::Relaxed,
        );

        if self.local_connection
            && let Some(connection) = self.connection.as_mut().and_then(Arc::get_mut)
        {
            connection.configure(config);
        }
    }

    /// Borrows the shared connection registered as `"connection"`, if any.
    pub fn set_references(&mut self, references: &References) {
        if let Some(connection) = references.get_one_optional::<MqttConnection<T>>(CONNECTION) {
            self.connection = Some(connection);
            self.local_connection = false;
        }
    }

    /// Returns the queue name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the topic.
    #[must_use]
    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Returns true if the queue is open.
    #[must_use]
    pub fn is_open(&self) -> bool {
        self.opened.load(Ordering::SeqCst)
    }

    fn connection(&self) -> Result<&Arc<MqttConnection<T>>> {
        self.connection.as_ref().ok_or_else(|| {
            Error::invalid_state(
                ErrorCode::NoConnection,
                format!("MQTT connection is missing for queue {}", self.name),
            )
        })
    }

    fn check_open(&self) -> Result<()> {
        if self.is_open() {
            Ok(())
        } else {
            Err(Error::invalid_state(
                ErrorCode::NoConnection,
                format!("Queue {} is not opened", self.name),
            ))
        }
    }

    /// Opens the queue and its local connection.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidState`] if no connection is bound,
    /// `CONNECT_FAILED` if a borrowed connection is closed, or the error of
    /// opening the local connection.
    pub async fn open(&self, ctx: &Context) -> Result<()> {
        if self.is_open() {
            return Ok(());
        }
        let connection = self.connection()?;
        if self.local_connection {
            connection.open(ctx).await?;
        } else if !connection.is_open().await {
            return Err(Error::connection(
                ErrorCode::ConnectFailed,
                format!("Shared MQTT connection for queue {} is not opened", self.name),
                None,
            ));
        }
        if self.autosubscribe {
            self.subscribe().await?;
        }
        self.opened.store(true, Ordering::SeqCst);
        tracing::debug!(
            queue = %self.name,
            topic = %self.topic,
            trace_id = ctx.trace_id_or_empty(),
            "Opened queue"
        );
        Ok(())
    }

    /// Stops listening, drops the subscription and closes a local connection.
    ///
    /// # Errors
    ///
    /// Returns the error of unsubscribing or closing the local connection.
    pub async fn close(&self, ctx: &Context) -> Result<()> {
        if !self.is_open() {
            return Ok(());
        }
        self.end_listen(ctx);
        let connection = self.connection()?;
        if let Some(id) = self.subscription.lock().await.take() {
            connection.unsubscribe(id).await?;
        }
        if self.local_connection {
            connection.close(ctx).await?;
        }
        self.opened.store(false, Ordering::SeqCst);
        tracing::debug!(
            queue = %self.name,
            trace_id = ctx.trace_id_or_empty(),
            "Closed queue"
        );
        Ok(())
    }

    async fn subscribe(&self) -> Result<()> {
        let mut subscription = self.subscription.lock().await;
        if subscription.is_none() {
            let listener: Arc<dyn MessageListener> = self.inbox.clone();
            let id = self
                .connection()?
                .subscribe(&self.topic, self.qos, listener)
                .await?;
            *subscription = Some(id);
        }
        Ok(())
    }

    /// Publishes a message to the topic.
    ///
    /// A missing trace id is taken from `ctx`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidState`] if the queue is not open, or the
    /// native publish error.
    pub async fn send(&self, ctx: &Context, mut envelope: MessageEnvelope) -> Result<()> {
        self.check_open()?;
        if envelope.trace_id.is_none() {
            envelope.trace_id = ctx.trace_id().map(ToString::to_string);
        }
        let payload = if self.inbox.serialize_envelope.load(Ordering::Relaxed) {
            envelope.to_json_bytes()?
        } else {
            envelope.message.clone()
        };

        self.connection()?
            .publish(MqttMessage {
                topic: self.topic.clone(),
                payload,
                qos: self.qos,
                retain: self.retain,
            })
            .await?;
        tracing::trace!(
            queue = %self.name,
            message_id = %envelope.message_id,
            trace_id = ctx.trace_id_or_empty(),
            "Sent message"
        );
        metrics::counter!("mqtt_messages_sent_total").increment(1);
        Ok(())
    }

    /// Returns the next message without removing it.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidState`] if the queue is not open.
    pub async fn peek(&self, _ctx: &Context) -> Result<Option<MessageEnvelope>> {
        self.check_open()?;
        self.subscribe().await?;
        Ok(self.inbox.lock().front().cloned())
    }

    /// Returns up to `count` messages without removing them.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidState`] if the queue is not open.
    pub async fn peek_batch(&self, _ctx: &Context, count: usize) -> Result<Vec<MessageEnvelope>> {
        self.check_open()?;
        self.subscribe().await?;
        Ok(self.inbox.lock().iter().take(count).cloned().collect())
    }

    /// Removes and returns the next message, waiting up to `wait`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidState`] if the queue is not open.
    pub async fn receive(&self, _ctx: &Context, wait: Duration) -> Result<Option<MessageEnvelope>> {
        self.check_open()?;
        self.subscribe().await?;
        Ok(tokio::time::timeout(wait, self.inbox.recv()).await.ok())
    }

    /// Returns the number of buffered messages.
    #[must_use]
    pub fn read_message_count(&self) -> usize {
        self.inbox.lock().len()
    }

    /// Delivers every message to `handler` until [`end_listen`](Self::end_listen).
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidState`] if the queue is not open.
    pub async fn listen(&self, ctx: &Context, handler: Arc<dyn MessageHandler>) -> Result<()> {
        self.check_open()?;
        self.subscribe().await?;
        let inbox = Arc::clone(&self.inbox);
        let task = tokio::spawn(async move {
            loop {
                let envelope = inbox.recv().await;
                let message_id = envelope.message_id.clone();
                if let Err(e) = handler.receive_message(envelope, &inbox.queue).await {
                    tracing::warn!(
                        queue = %inbox.queue,
                        message_id = %message_id,
                        error = %e,
                        "Message handler failed"
                    );
                }
            }
        });

        let previous = self.lock_listener().replace(task);
        if let Some(previous) = previous {
            previous.abort();
        }
        tracing::debug!(
            queue = %self.name,
            trace_id = ctx.trace_id_or_empty(),
            "Listening"
        );
        Ok(())
    }

    /// Stops delivering messages to the listener.
    pub fn end_listen(&self, _ctx: &Context) {
        if let Some(task) = self.lock_listener().take() {
            task.abort();
        }
    }

    fn lock_listener(&self) -> MutexGuard<'_, Option<JoinHandle<()>>> {
        self.listener
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Drops all buffered messages.
    pub fn clear(&self, ctx: &Context) {
        let dropped = {
            let mut buffer = self.inbox.lock();
            let dropped = buffer.len();
            buffer.clear();
            dropped
        };
        tracing::debug!(
            queue = %self.name,
            dropped,
            trace_id = ctx.trace_id_or_empty(),
            "Cleared queue"
        );
    }
}

impl<T: MqttTransport> fmt::Debug for MqttMessageQueue<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MqttMessageQueue")
            .field("name", &self.name)
            .field("topic", &self.topic)
            .field("qos", &self.qos)
            .field("retain", &self.retain)
            .field("open", &self.is_open())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messaging::MemoryBroker;

    fn queue(broker: &MemoryBroker, extra: &[(&str, &str)]) -> MqttMessageQueue<MemoryBroker> {
        let mut config = ConfigParams::from_tuples(&[
            ("topic", "test"),
            ("connection.host", "localhost"),
            ("connection.port", "1883"),
        ]);
        for (k, v) in extra {
            config.set(*k, *v);
        }
        let mut queue = MqttMessageQueue::new("test", broker.clone());
        queue.configure(&config);
        queue
    }

    #[tokio::test]
    async fn test_operations_require_open() {
        let queue = queue(&MemoryBroker::new(), &[]);
        let ctx = Context::default();
        let err = queue
            .send(&ctx, MessageEnvelope::new(None, None, "x"))
            .await
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::NoConnection);
    }

    #[tokio::test]
    async fn test_unbound_queue() {
        let queue: MqttMessageQueue<MemoryBroker> = MqttMessageQueue::unbound("q");
        let err = queue.open(&Context::default()).await.unwrap_err();
        assert!(matches!(err, Error::InvalidState { .. }));
    }

    #[tokio::test]
    async fn test_send_receive_raw_payload() {
        let queue = queue(&MemoryBroker::new(), &[("options.autosubscribe", "true")]);
        let ctx = Context::new("t1");
        queue.open(&ctx).await.unwrap();

        queue
            .send(&ctx, MessageEnvelope::new(None, Some("Test"), "hello"))
            .await
            .unwrap();
        let received = queue
            .receive(&ctx, Duration::from_secs(1))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(received.message_as_string(), "hello");
        assert_eq!(received.message_type, None);
        queue.close(&ctx).await.unwrap();
    }

    #[tokio::test]
    async fn test_receive_times_out() {
        let queue = queue(&MemoryBroker::new(), &[]);
        let ctx = Context::default();
        queue.open(&ctx).await.unwrap();
        let received = queue.receive(&ctx, Duration::from_millis(20)).await.unwrap();
        assert!(received.is_none());
    }
}
