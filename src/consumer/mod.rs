//! Consumer
//!
//! Owns the upstream connection and drives the primary consume loop. Each
//! delivery is decoded, handed to the `Publisher`, and then settled:
//! - acked once the publish is scheduled (not once it is confirmed downstream,
//!   so a publisher crash between the two loses the message)
//! - nacked with requeue when decoding or scheduling fails
//!
//! Prefetch is pinned to 1: the broker holds back the next delivery until the
//! current one is settled.

use std::future::Future;

use futures::StreamExt;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::broker::{Channel, Connection, Connector, Delivery};
use crate::config::{FailurePolicy, Settings, UpstreamSettings};
use crate::publisher::Publisher;
use crate::utils::{BridgeError, Result};

pub const PREFETCH_COUNT: u16 = 1;

type ChannelOf<K> = <<K as Connector>::Connection as Connection>::Channel;

pub struct Consumer<K: Connector> {
    connection: K::Connection,
    channel: ChannelOf<K>,
    queue: String,
    consumer_tag: String,
    on_failure: FailurePolicy,
    publisher: Publisher<K::Connection>,
}

impl<K: Connector> Consumer<K> {
    /// Connects the downstream publisher first, then the upstream side.
    pub async fn connect(connector: &K, settings: &Settings) -> Result<Self> {
        let mut publisher =
            Publisher::connect(connector, &settings.downstream, &settings.publisher).await?;

        let (connection, channel) = match Self::open_upstream(connector, &settings.upstream).await {
            Ok(upstream) => upstream,
            Err(err) => {
                publisher.stop().await;
                return Err(err);
            }
        };

        Ok(Self {
            connection,
            channel,
            queue: settings.upstream.queue.clone(),
            consumer_tag: format!("amqp-bridge-{}", Uuid::new_v4()),
            on_failure: settings.upstream.on_failure,
            publisher,
        })
    }

    async fn open_upstream(
        connector: &K,
        upstream: &UpstreamSettings,
    ) -> Result<(K::Connection, ChannelOf<K>)> {
        let connection = connector.connect(&upstream.connection).await?;
        let channel = connection.open_channel().await?;
        channel.basic_qos(PREFETCH_COUNT).await?;
        info!(
            host = %upstream.connection.host,
            queue = %upstream.queue,
            "consumer connected"
        );
        Ok((connection, channel))
    }

    /// Runs until `shutdown` resolves or the loop fails. `stop` runs on every
    /// exit path; the loop's error is logged and returned afterwards.
    pub async fn start<F>(&mut self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        let outcome = self.consume(shutdown).await;
        if let Err(err) = &outcome {
            error!(error = ?err, "consume loop failed");
        }
        self.stop().await;
        outcome
    }

    async fn consume<F>(&mut self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        let mut deliveries = self
            .channel
            .basic_consume(&self.queue, &self.consumer_tag)
            .await?;
        self.publisher.start()?;
        info!(queue = %self.queue, consumer_tag = %self.consumer_tag, "consuming");

        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                biased;
                () = &mut shutdown => {
                    info!("warm shutdown requested");
                    return Ok(());
                }
                next = deliveries.next() => match next {
                    Some(Ok(delivery)) => self.on_message(delivery).await?,
                    Some(Err(err)) => return Err(err),
                    None => {
                        return Err(BridgeError::ConnectionClosed(
                            "upstream delivery stream ended".to_string(),
                        ));
                    }
                },
            }
        }
    }

    /// Forwards one delivery and settles it exactly once.
    pub async fn on_message(&self, delivery: Delivery) -> Result<()> {
        let Delivery {
            tag,
            body,
            redelivered,
            ..
        } = delivery;

        match self.forward(body) {
            Ok(()) => {
                self.channel.basic_ack(tag).await?;
                debug!(%tag, "delivery acked");
                Ok(())
            }
            Err(err) => {
                // A message that already came back once is not requeued again
                // when failures are isolated, so it cannot spin forever.
                let requeue = !(self.on_failure == FailurePolicy::Isolate && redelivered);
                warn!(%tag, requeue, error = ?err, "forwarding failed, rejecting delivery");
                self.channel.basic_nack(tag, requeue).await?;
                match self.on_failure {
                    FailurePolicy::Fatal => Err(err),
                    FailurePolicy::Isolate => Ok(()),
                }
            }
        }
    }

    fn forward(&self, body: Vec<u8>) -> Result<()> {
        let message = String::from_utf8(body)?;
        info!(message = %message, "received message");
        self.publisher.publish(message)
    }

    /// Closes the upstream connection, then stops the publisher, so no new
    /// delivery can trigger a publish during shutdown.
    pub async fn stop(&mut self) {
        info!("stopping consumer");
        if self.connection.is_open() {
            info!("closing upstream connection");
            if let Err(err) = self.connection.close().await {
                warn!(error = ?err, "failed to close upstream connection");
            }
        }

        self.publisher.stop().await;
        info!("consumer stopped");
    }

    pub fn publisher(&self) -> &Publisher<K::Connection> {
        &self.publisher
    }

    pub fn connection(&self) -> &K::Connection {
        &self.connection
    }

    pub fn consumer_tag(&self) -> &str {
        &self.consumer_tag
    }
}
