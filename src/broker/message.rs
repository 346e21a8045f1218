use std::fmt;

/// Connection-scoped handle the broker assigns to one delivery.
///
/// Only valid on the channel that received it, and used exactly once to ack or nack.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DeliveryTag(pub u64);

impl fmt::Display for DeliveryTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A message pushed by the broker to a consumer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub tag: DeliveryTag,
    pub body: Vec<u8>,
    /// Set when the message was handed out before and rejected or abandoned.
    pub redelivered: bool,
    pub exchange: String,
    pub routing_key: String,
}

/// Outbound payload captured when a publish is requested.
///
/// Carries no delivery tag: it is new data for the downstream broker, not a
/// forwarded delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingPublish {
    pub body: Vec<u8>,
    pub requested_at_ms: i64,
}

impl PendingPublish {
    pub fn new(body: impl Into<Vec<u8>>) -> Self {
        Self {
            body: body.into(),
            requested_at_ms: chrono::Utc::now().timestamp_millis(),
        }
    }
}

/// Lifecycle of a broker connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Open,
    Closing,
    Closed,
}
