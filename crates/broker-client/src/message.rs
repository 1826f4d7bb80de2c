//! Outbound message and AMQP message properties.

use serde::{Deserialize, Serialize};

/// Content type of every notification body.
pub const CONTENT_TYPE_JSON: &str = "application/json";

/// AMQP delivery mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryMode {
    /// Not written to disk by the broker (mode 1).
    Transient,
    /// Written to disk when routed to a durable queue (mode 2).
    Persistent,
}

impl DeliveryMode {
    /// Wire value of the delivery mode.
    pub fn as_u8(self) -> u8 {
        match self {
            DeliveryMode::Transient => 1,
            DeliveryMode::Persistent => 2,
        }
    }

    /// Delivery mode for a persistent-delivery flag.
    pub fn from_persistent(persistent: bool) -> Self {
        if persistent {
            DeliveryMode::Persistent
        } else {
            DeliveryMode::Transient
        }
    }
}

/// Properties attached to every published message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageProperties {
    pub content_type: String,
    pub delivery_mode: DeliveryMode,
    pub app_id: Option<String>,
    /// Seconds since the Unix epoch.
    pub timestamp: u64,
}

impl MessageProperties {
    /// JSON properties stamped with the current time.
    pub fn json(delivery_mode: DeliveryMode, app_id: Option<String>) -> Self {
        Self {
            content_type: CONTENT_TYPE_JSON.to_string(),
            delivery_mode,
            app_id: app_id.filter(|id| !id.is_empty()),
            timestamp: chrono::Utc::now().timestamp().max(0) as u64,
        }
    }
}

impl Default for MessageProperties {
    fn default() -> Self {
        Self::json(DeliveryMode::Persistent, None)
    }
}

/// A message accepted for publication. Never mutated after construction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundMessage {
    pub exchange: String,
    pub routing_key: String,
    pub properties: MessageProperties,
    pub body: Vec<u8>,
}

impl OutboundMessage {
    pub fn new(
        exchange: impl Into<String>,
        routing_key: impl Into<String>,
        properties: MessageProperties,
        body: impl Into<Vec<u8>>,
    ) -> Self {
        Self {
            exchange: exchange.into(),
            routing_key: routing_key.into(),
            properties,
            body: body.into(),
        }
    }
}
