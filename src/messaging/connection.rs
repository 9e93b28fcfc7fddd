//! Shared MQTT connection with subscription fan-out.

use super::transport::{MqttClient, MqttMessage, MqttTransport};
use crate::config::{ConfigParams, ConnectionOptions};
use crate::connect::{BackendKind, ComposedConnection, ConnectionComposer};
use crate::storage::generate_id;
use crate::{Context, Error, ErrorCode, Result};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Topic that subscribes to every message.
pub const ANY_TOPIC: &str = "*";

/// Receives messages routed by an [`MqttConnection`].
pub trait MessageListener: Send + Sync {
    /// Called for each message whose topic matches the subscription.
    fn on_message(&self, message: &MqttMessage);
}

struct Subscription {
    id: u64,
    /// Native filter, after `*` mapping.
    filter: String,
    listener: Arc<dyn MessageListener>,
}

type SubscriptionTable = Arc<Mutex<Vec<Subscription>>>;

struct OpenState<C> {
    client: Arc<C>,
    composed: ComposedConnection,
    pump: JoinHandle<()>,
}

/// Maps a queue topic to the native subscription filter.
///
/// A topic containing `*` receives every message.
fn native_filter(topic: &str) -> &str {
    if topic.contains(ANY_TOPIC) { "#" } else { topic }
}

fn lock_table(table: &Mutex<Vec<Subscription>>) -> MutexGuard<'_, Vec<Subscription>> {
    table.lock().unwrap_or_else(|poisoned| {
        tracing::warn!("MQTT subscription table mutex poisoned, recovering");
        metrics::counter!("mqtt_subscription_lock_poison_recovery_total").increment(1);
        poisoned.into_inner()
    })
}

/// One native MQTT client shared by several queues.
///
/// Inbound messages are fanned out to every listener whose filter matches.
/// The native subscription for a filter is made by its first listener and
/// removed with its last.
pub struct MqttConnection<T: MqttTransport> {
    transport: Arc<T>,
    composer: ConnectionComposer,
    config: ConfigParams,
    options: ConnectionOptions,
    client_id: String,
    subscriptions: SubscriptionTable,
    next_id: AtomicU64,
    state: tokio::sync::Mutex<Option<OpenState<T::Client>>>,
}

impl<T: MqttTransport> MqttConnection<T> {
    /// Creates a closed connection.
    #[must_use]
    pub fn new(transport: T) -> Self {
        Self {
            transport: Arc::new(transport),
            composer: ConnectionComposer::for_backend(BackendKind::Mqtt),
            config: ConfigParams::new(),
            options: ConnectionOptions::default(),
            client_id: generate_id(),
            subscriptions: Arc::new(Mutex::new(Vec::new())),
            next_id: AtomicU64::new(1),
            state: tokio::sync::Mutex::new(None),
        }
    }

    /// Stores the configuration; `options.client_id` overrides the
    /// generated client id.
    pub fn configure(&mut self, config: &ConfigParams) {
        self.config = config.clone();
        self.options = ConnectionOptions::default().configure(config);
        if let Some(client_id) = self.options.extra("client_id") {
            self.client_id = client_id.to_string();
        }
    }

    /// Returns the native client id.
    #[must_use]
    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    /// Returns true if the native client is connected.
    pub async fn is_open(&self) -> bool {
        self.state.lock().await.is_some()
    }

    /// Returns the composed connection, or `None` when closed.
    pub async fn composed(&self) -> Option<ComposedConnection> {
        self.state.lock().await.as_ref().map(|s| s.composed.clone())
    }

    /// Connects the native client and restores existing subscriptions.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if the configuration does not validate, or
    /// [`Error::Connection`] with `CONNECT_FAILED` if the broker cannot be
    /// reached within the connect timeout.
    pub async fn open(&self, ctx: &Context) -> Result<()> {
        let mut state = self.state.lock().await;
        if state.is_some() {
            return Ok(());
        }

        let composed = self.composer.resolve(&self.config)?;
        let (sink, inbound) = mpsc::unbounded_channel();
        let connecting = self
            .transport
            .connect(&composed, &self.client_id, &self.options, sink);
        let client = match tokio::time::timeout(self.options.connect_timeout, connecting).await {
            Ok(Ok(client)) => Arc::new(client),
            Ok(Err(e)) => {
                return Err(Error::connection(
                    ErrorCode::ConnectFailed,
                    format!("Connection to MQTT broker {} failed", composed.target_name()),
                    Some(Box::new(e)),
                ));
            },
            Err(elapsed) => {
                return Err(Error::connection(
                    ErrorCode::ConnectFailed,
                    format!("Connection to MQTT broker {} timed out", composed.target_name()),
                    Some(Box::new(elapsed)),
                ));
            },
        };

        let filters: Vec<String> = {
            let table = lock_table(&self.subscriptions);
            let mut filters: Vec<String> = table.iter().map(|s| s.filter.clone()).collect();
            filters.sort();
            filters.dedup();
            filters
        };
        for filter in filters {
            if let Err(e) = client.subscribe(&filter, 0).await {
                let _ = client.disconnect().await;
                return Err(Error::connection(
                    ErrorCode::ConnectFailed,
                    format!("Failed to restore MQTT subscription {filter}"),
                    Some(Box::new(e)),
                ));
            }
        }

        let pump = tokio::spawn(fan_out(inbound, Arc::clone(&self.subscriptions)));
        tracing::debug!(
            backend = "mqtt",
            target = composed.target_name(),
            client_id = %self.client_id,
            trace_id = ctx.trace_id_or_empty(),
            "Connected"
        );
        metrics::counter!("connection_open_total", "backend" => "mqtt").increment(1);
        *state = Some(OpenState {
            client,
            composed,
            pump,
        });
        Ok(())
    }

    /// Disconnects the native client. Subscriptions are kept and restored on
    /// the next `open`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Connection`] with `DISCONNECT_FAILED` if the native
    /// disconnect fails.
    pub async fn close(&self, ctx: &Context) -> Result<()> {
        let Some(state) = self.state.lock().await.take() else {
            return Ok(());
        };
        state.pump.abort();
        state.client.disconnect().await.map_err(|e| {
            Error::connection(
                ErrorCode::DisconnectFailed,
                "Disconnect from MQTT broker failed",
                Some(Box::new(e)),
            )
        })?;
        tracing::debug!(
            backend = "mqtt",
            target = state.composed.target_name(),
            trace_id = ctx.trace_id_or_empty(),
            "Disconnected"
        );
        Ok(())
    }

    async fn client(&self) -> Result<Arc<T::Client>> {
        self.state
            .lock()
            .await
            .as_ref()
            .map(|s| Arc::clone(&s.client))
            .ok_or_else(|| {
                Error::invalid_state(ErrorCode::NoConnection, "MQTT connection is not opened")
            })
    }

    /// Publishes a message.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidState`] if closed, or the native error.
    pub async fn publish(&self, message: MqttMessage) -> Result<()> {
        self.client().await?.publish(message).await?;
        Ok(())
    }

    /// Registers `listener` for `topic` and returns its subscription id.
    ///
    /// A topic containing [`ANY_TOPIC`] receives every message.
    ///
    /// # Errors
    ///
    /// Returns the native error if the broker rejects a new filter. Listeners
    /// registered while closed are subscribed natively on `open`.
    pub async fn subscribe(
        &self,
        topic: &str,
        qos: u8,
        listener: Arc<dyn MessageListener>,
    ) -> Result<u64> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let filter = native_filter(topic);
        let first = {
            let mut table = lock_table(&self.subscriptions);
            let first = !table.iter().any(|s| s.filter == filter);
            table.push(Subscription {
                id,
                filter: filter.to_string(),
                listener,
            });
            first
        };

        if first && let Ok(client) = self.client().await {
            if let Err(e) = client.subscribe(filter, qos).await {
                lock_table(&self.subscriptions).retain(|s| s.id != id);
                return Err(e.into());
            }
        }
        Ok(id)
    }

    /// Removes a subscription; the native filter goes with its last listener.
    ///
    /// # Errors
    ///
    /// Returns the native error if the broker rejects the unsubscribe.
    pub async fn unsubscribe(&self, id: u64) -> Result<()> {
        let last_filter = {
            let mut table = lock_table(&self.subscriptions);
            let Some(position) = table.iter().position(|s| s.id == id) else {
                return Ok(());
            };
            let removed = table.remove(position);
            (!table.iter().any(|s| s.filter == removed.filter)).then_some(removed.filter)
        };

        if let Some(filter) = last_filter
            && let Ok(client) = self.client().await
        {
            client.unsubscribe(&filter).await?;
        }
        Ok(())
    }

    /// Returns the number of registered listeners.
    #[must_use]
    pub fn subscription_count(&self) -> usize {
        lock_table(&self.subscriptions).len()
    }
}

async fn fan_out(mut inbound: mpsc::UnboundedReceiver<MqttMessage>, table: SubscriptionTable) {
    while let Some(message) = inbound.recv().await {
        let listeners: Vec<Arc<dyn MessageListener>> = lock_table(&table)
            .iter()
            .filter(|s| super::transport::topic_matches(&s.filter, &message.topic))
            .map(|s| Arc::clone(&s.listener))
            .collect();
        for listener in listeners {
            listener.on_message(&message);
        }
    }
}

impl<T: MqttTransport> fmt::Debug for MqttConnection<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MqttConnection")
            .field("client_id", &self.client_id)
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}
