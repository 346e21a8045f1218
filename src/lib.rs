//! # amqp-bridge
//!
//! `amqp-bridge` consumes messages from a queue on one broker and republishes
//! each one to a fixed exchange and routing key on a second, independent broker.
//!
//! ## Core Modules
//!
//! - `broker`: The traits the bridge uses to talk to a broker, an in-memory broker,
//!   and an AMQP 0-9-1 adapter (feature `amqp`).
//! - `config`: Loads and validates the bridge settings.
//! - `consumer`: The upstream consume loop and its ack/nack policy.
//! - `publisher`: The downstream connection, its heartbeat-servicing run loop, and
//!   the task queue other tasks publish through.
//! - `utils`: Shared error type and logging setup.
//!
//! ## Delivery guarantees
//!
//! At least once, with one known gap: an upstream delivery is acked as soon as its
//! publish is *scheduled* on the publisher loop, not once the downstream broker
//! has confirmed it. If the process dies in between, the message is lost.

pub mod broker;
pub mod config;
pub mod consumer;
pub mod publisher;
pub mod utils;

pub use consumer::Consumer;
pub use publisher::{Publisher, PublisherHandle, PublisherState};
pub use utils::{BridgeError, Result};
