//! The `broker` module is the bridge's view of a message broker.
//!
//! The traits below are the only way the consumer and publisher talk to a
//! broker. `memory` implements them in-process; `amqp` adapts a real AMQP 0-9-1
//! client.

#[cfg(feature = "amqp")]
pub mod amqp;
pub mod memory;
pub mod message;

use std::time::Duration;

use async_trait::async_trait;
use futures::stream::BoxStream;

use crate::config::ConnectionSettings;
use crate::utils::Result;

pub use message::{ConnectionState, Delivery, DeliveryTag, PendingPublish};

/// Deliveries of one `basic_consume`, in broker order. Ends when the
/// connection or channel goes away.
pub type DeliveryStream = BoxStream<'static, Result<Delivery>>;

/// Opens connections to a broker.
#[async_trait]
pub trait Connector: Send + Sync {
    type Connection: Connection;

    async fn connect(&self, settings: &ConnectionSettings) -> Result<Self::Connection>;
}

/// One network session to a broker.
#[async_trait]
pub trait Connection: Send + Sync + 'static {
    type Channel: Channel;

    async fn open_channel(&self) -> Result<Self::Channel>;

    /// Services pending protocol events, heartbeats included, waiting at most
    /// `timeout` for them. `Duration::ZERO` services what is pending and returns.
    ///
    /// Fails once the connection is no longer usable.
    async fn process_events(&self, timeout: Duration) -> Result<()>;

    fn state(&self) -> ConnectionState;

    fn is_open(&self) -> bool {
        self.state() == ConnectionState::Open
    }

    /// Closing an already-closed connection is a no-op.
    async fn close(&self) -> Result<()>;
}

/// A logical session over a `Connection`, owned by a single task.
#[async_trait]
pub trait Channel: Send + Sync + 'static {
    /// Caps unacknowledged deliveries on this channel. 0 means no limit.
    async fn basic_qos(&self, prefetch: u16) -> Result<()>;

    /// Enables publisher confirms for every later `basic_publish`.
    async fn confirm_select(&self) -> Result<()>;

    async fn basic_consume(&self, queue: &str, consumer_tag: &str) -> Result<DeliveryStream>;

    /// In confirm mode, returns once the broker has confirmed the message.
    async fn basic_publish(&self, exchange: &str, routing_key: &str, body: &[u8]) -> Result<()>;

    async fn basic_ack(&self, tag: DeliveryTag) -> Result<()>;

    async fn basic_nack(&self, tag: DeliveryTag, requeue: bool) -> Result<()>;
}
