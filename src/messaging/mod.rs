//! MQTT messaging.
//!
//! ```text
//! MqttMessageQueue ──► MqttConnection ──► MqttTransport::Client ──► broker
//!        ▲                   │
//!        └─── fan-out ◄──────┘ (one listener per subscribed queue)
//! ```

mod connection;
mod envelope;
mod queue;
mod transport;

pub use connection::{ANY_TOPIC, MessageListener, MqttConnection};
pub use envelope::MessageEnvelope;
pub use queue::{MessageHandler, MqttMessageQueue};
pub use transport::{
    MemoryBroker, MemoryMqttClient, MessageSink, MqttClient, MqttMessage, MqttTransport,
    topic_matches,
};
