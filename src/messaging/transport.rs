//! MQTT client interface and an in-process broker.

use crate::config::ConnectionOptions;
use crate::connect::ComposedConnection;
use crate::driver::{DriverError, DriverResult};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::mpsc;

/// Sink for messages delivered to a client.
pub type MessageSink = mpsc::UnboundedSender<MqttMessage>;

/// One MQTT publication.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MqttMessage {
    /// Topic name.
    pub topic: String,
    /// Raw payload.
    pub payload: Vec<u8>,
    /// Quality of service (0, 1 or 2).
    pub qos: u8,
    /// Whether the broker retains the message.
    pub retain: bool,
}

impl MqttMessage {
    /// Creates a QoS 0, non-retained message.
    #[must_use]
    pub fn new(topic: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
            qos: 0,
            retain: false,
        }
    }
}

/// Connects native MQTT clients.
#[async_trait]
pub trait MqttTransport: Send + Sync + 'static {
    /// Native client type.
    type Client: MqttClient;

    /// Connects a client; inbound messages for its subscriptions go to `sink`.
    ///
    /// # Errors
    ///
    /// Returns a [`DriverError`] if the broker cannot be reached.
    async fn connect(
        &self,
        connection: &ComposedConnection,
        client_id: &str,
        options: &ConnectionOptions,
        sink: MessageSink,
    ) -> DriverResult<Self::Client>;
}

/// Connected native MQTT client.
#[async_trait]
pub trait MqttClient: Send + Sync + 'static {
    /// Subscribes to a topic filter.
    async fn subscribe(&self, filter: &str, qos: u8) -> DriverResult<()>;

    /// Removes a topic filter.
    async fn unsubscribe(&self, filter: &str) -> DriverResult<()>;

    /// Publishes a message.
    async fn publish(&self, message: MqttMessage) -> DriverResult<()>;

    /// Disconnects from the broker.
    async fn disconnect(&self) -> DriverResult<()>;
}

/// Returns true if `topic` matches the subscription `filter`.
///
/// `+` matches one level and a trailing `#` matches any remaining levels,
/// including none.
#[must_use]
pub fn topic_matches(filter: &str, topic: &str) -> bool {
    let mut levels = topic.split('/');
    for part in filter.split('/') {
        match part {
            "#" => return true,
            "+" => {
                if levels.next().is_none() {
                    return false;
                }
            },
            exact => {
                if levels.next() != Some(exact) {
                    return false;
                }
            },
        }
    }
    levels.next().is_none()
}

struct BrokerClient {
    sink: MessageSink,
    filters: Vec<String>,
}

#[derive(Default)]
struct BrokerState {
    clients: HashMap<String, BrokerClient>,
    retained: HashMap<String, MqttMessage>,
}

/// In-process MQTT broker.
///
/// Routes publications to every connected client with a matching filter and
/// keeps the last retained message per topic. A retained message with an
/// empty payload clears the topic.
#[derive(Clone, Default)]
pub struct MemoryBroker {
    state: Arc<Mutex<BrokerState>>,
    unreachable: Arc<AtomicBool>,
}

impl MemoryBroker {
    /// Creates an empty broker.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes new connections fail.
    pub fn set_unreachable(&self, unreachable: bool) {
        self.unreachable.store(unreachable, Ordering::SeqCst);
    }

    /// Returns the number of connected clients.
    #[must_use]
    pub fn client_count(&self) -> usize {
        self.lock().clients.len()
    }

    /// Returns the filters a client is subscribed to.
    #[must_use]
    pub fn subscriptions(&self, client_id: &str) -> Vec<String> {
        self.lock()
            .clients
            .get(client_id)
            .map(|c| c.filters.clone())
            .unwrap_or_default()
    }

    fn lock(&self) -> MutexGuard<'_, BrokerState> {
        self.state.lock().unwrap_or_else(|poisoned| {
            tracing::warn!("Memory broker mutex poisoned, recovering");
            metrics::counter!("mqtt_broker_lock_poison_recovery_total").increment(1);
            poisoned.into_inner()
        })
    }

    fn route(&self, message: &MqttMessage) {
        let mut state = self.lock();
        if message.retain {
            if message.payload.is_empty() {
                state.retained.remove(&message.topic);
            } else {
                state.retained.insert(message.topic.clone(), message.clone());
            }
        }
        for client in state.clients.values() {
            if client.filters.iter().any(|f| topic_matches(f, &message.topic)) {
                let _ = client.sink.send(MqttMessage {
                    retain: false,
                    ..message.clone()
                });
            }
        }
    }
}

#[async_trait]
impl MqttTransport for MemoryBroker {
    type Client = MemoryMqttClient;

    async fn connect(
        &self,
        connection: &ComposedConnection,
        client_id: &str,
        _options: &ConnectionOptions,
        sink: MessageSink,
    ) -> DriverResult<Self::Client> {
        if self.unreachable.load(Ordering::SeqCst) {
            return Err(DriverError::connection(
                "mqtt",
                format!("broker {} is unreachable", connection.target_name()),
            ));
        }
        self.lock().clients.insert(
            client_id.to_string(),
            BrokerClient {
                sink,
                filters: Vec::new(),
            },
        );
        Ok(MemoryMqttClient {
            broker: self.clone(),
            client_id: client_id.to_string(),
        })
    }
}

/// Client of a [`MemoryBroker`].
pub struct MemoryMqttClient {
    broker: MemoryBroker,
    client_id: String,
}

#[async_trait]
impl MqttClient for MemoryMqttClient {
    async fn subscribe(&self, filter: &str, _qos: u8) -> DriverResult<()> {
        let mut state = self.broker.lock();
        let retained: Vec<MqttMessage> = state
            .retained
            .values()
            .filter(|m| topic_matches(filter, &m.topic))
            .cloned()
            .collect();
        let client = state
            .clients
            .get_mut(&self.client_id)
            .ok_or_else(|| DriverError::connection("mqtt", "client is disconnected"))?;
        if !client.filters.iter().any(|f| f == filter) {
            client.filters.push(filter.to_string());
        }
        for message in retained {
            let _ = client.sink.send(message);
        }
        Ok(())
    }

    async fn unsubscribe(&self, filter: &str) -> DriverResult<()> {
        if let Some(client) = self.broker.lock().clients.get_mut(&self.client_id) {
            client.filters.retain(|f| f != filter);
        }
        Ok(())
    }

    async fn publish(&self, message: MqttMessage) -> DriverResult<()> {
        if !self.broker.lock().clients.contains_key(&self.client_id) {
            return Err(DriverError::connection("mqtt", "client is disconnected"));
        }
        self.broker.route(&message);
        Ok(())
    }

    async fn disconnect(&self) -> DriverResult<()> {
        self.broker.lock().clients.remove(&self.client_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connect::{BackendKind, ConnectionComposer};
    use crate::config::ConfigParams;
    use test_case::test_case;

    #[test_case("a/b", "a/b", true; "exact")]
    #[test_case("a/b", "a/c", false; "exact mismatch")]
    #[test_case("a/+", "a/b", true; "single level")]
    #[test_case("a/+", "a/b/c", false; "single level too deep")]
    #[test_case("a/#", "a", true; "multi level matches parent")]
    #[test_case("a/#", "a/b/c", true; "multi level")]
    #[test_case("#", "x/y", true; "everything")]
    #[test_case("a/b", "a", false; "too short")]
    fn test_topic_matches(filter: &str, topic: &str, expected: bool) {
        assert_eq!(topic_matches(filter, topic), expected);
    }

    fn composed() -> ComposedConnection {
        ConnectionComposer::for_backend(BackendKind::Mqtt)
            .resolve(&ConfigParams::from_tuples(&[("connection.host", "localhost")]))
            .unwrap()
    }

    #[tokio::test]
    async fn test_routes_and_retains() {
        let broker = MemoryBroker::new();
        let options = ConnectionOptions::default();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let publisher = broker
            .connect(&composed(), "pub", &options, mpsc::unbounded_channel().0)
            .await
            .unwrap();
        let subscriber = broker.connect(&composed(), "sub", &options, tx).await.unwrap();

        let mut retained = MqttMessage::new("status", "up");
        retained.retain = true;
        publisher.publish(retained).await.unwrap();

        subscriber.subscribe("status", 0).await.unwrap();
        assert_eq!(rx.recv().await.unwrap().payload, b"up".to_vec());

        publisher.publish(MqttMessage::new("status", "down")).await.unwrap();
        publisher.publish(MqttMessage::new("other", "x")).await.unwrap();
        assert_eq!(rx.recv().await.unwrap().payload, b"down".to_vec());
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_unreachable() {
        let broker = MemoryBroker::new();
        broker.set_unreachable(true);
        let result = broker
            .connect(
                &composed(),
                "c",
                &ConnectionOptions::default(),
                mpsc::unbounded_channel().0,
            )
            .await;
        assert!(result.is_err());
    }
}
