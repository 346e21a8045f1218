//! AMQP 0-9-1 adapter over `lapin`.
//!
//! `lapin` answers heartbeats on its own I/O thread, so `process_events` here
//! only waits and then checks that the connection survived; the run-loop
//! contract stays the same for both backends.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use lapin::options::{
    BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicPublishOptions, BasicQosOptions,
    ConfirmSelectOptions,
};
use lapin::types::FieldTable;
use lapin::{BasicProperties, ConnectionProperties};

use super::{
    Channel, Connection, ConnectionState, Connector, Delivery, DeliveryStream, DeliveryTag,
};
use crate::config::ConnectionSettings;
use crate::utils::{BridgeError, Result};

const REPLY_SUCCESS: u16 = 200;

fn broker_error(err: lapin::Error) -> BridgeError {
    BridgeError::Broker(err.to_string())
}

#[derive(Debug, Clone, Copy, Default)]
pub struct AmqpConnector;

#[async_trait]
impl Connector for AmqpConnector {
    type Connection = AmqpConnection;

    async fn connect(&self, settings: &ConnectionSettings) -> Result<AmqpConnection> {
        let inner = lapin::Connection::connect(&settings.uri(), ConnectionProperties::default())
            .await
            .map_err(|err| {
                BridgeError::ConnectionRefused(format!("{}:{} ({err})", settings.host, settings.port))
            })?;
        Ok(AmqpConnection { inner })
    }
}

pub struct AmqpConnection {
    inner: lapin::Connection,
}

#[async_trait]
impl Connection for AmqpConnection {
    type Channel = AmqpChannel;

    async fn open_channel(&self) -> Result<AmqpChannel> {
        let inner = self.inner.create_channel().await.map_err(broker_error)?;
        Ok(AmqpChannel {
            inner,
            confirm: AtomicBool::new(false),
        })
    }

    async fn process_events(&self, timeout: Duration) -> Result<()> {
        if !timeout.is_zero() {
            tokio::time::sleep(timeout).await;
        }
        if self.inner.status().connected() {
            Ok(())
        } else {
            Err(BridgeError::ConnectionClosed(format!(
                "connection is {:?}",
                self.state()
            )))
        }
    }

    fn state(&self) -> ConnectionState {
        match self.inner.status().state() {
            lapin::ConnectionState::Connected => ConnectionState::Open,
            lapin::ConnectionState::Closing => ConnectionState::Closing,
            lapin::ConnectionState::Initial | lapin::ConnectionState::Connecting => {
                ConnectionState::Disconnected
            }
            _ => ConnectionState::Closed,
        }
    }

    async fn close(&self) -> Result<()> {
        if !self.inner.status().connected() {
            return Ok(());
        }
        self.inner
            .close(REPLY_SUCCESS, "bridge shutting down")
            .await
            .map_err(broker_error)
    }
}

pub struct AmqpChannel {
    inner: lapin::Channel,
    confirm: AtomicBool,
}

#[async_trait]
impl Channel for AmqpChannel {
    async fn basic_qos(&self, prefetch: u16) -> Result<()> {
        self.inner
            .basic_qos(prefetch, BasicQosOptions::default())
            .await
            .map_err(broker_error)
    }

    async fn confirm_select(&self) -> Result<()> {
        self.inner
            .confirm_select(ConfirmSelectOptions::default())
            .await
            .map_err(broker_error)?;
        self.confirm.store(true, Ordering::Release);
        Ok(())
    }

    async fn basic_consume(&self, queue: &str, consumer_tag: &str) -> Result<DeliveryStream> {
        let consumer = self
            .inner
            .basic_consume(
                queue,
                consumer_tag,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(broker_error)?;

        Ok(consumer
            .map(|delivery| {
                delivery.map_err(broker_error).map(|delivery| Delivery {
                    tag: DeliveryTag(delivery.delivery_tag),
                    redelivered: delivery.redelivered,
                    exchange: delivery.exchange.as_str().to_owned(),
                    routing_key: delivery.routing_key.as_str().to_owned(),
                    body: delivery.data,
                })
            })
            .boxed())
    }

    async fn basic_publish(&self, exchange: &str, routing_key: &str, body: &[u8]) -> Result<()> {
        let confirm = self
            .inner
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions::default(),
                body,
                BasicProperties::default(),
            )
            .await
            .map_err(broker_error)?;

        if !self.confirm.load(Ordering::Acquire) {
            return Ok(());
        }

        let confirmation = confirm.await.map_err(broker_error)?;
        if confirmation.is_nack() {
            return Err(BridgeError::PublishNotConfirmed {
                exchange: exchange.to_string(),
            });
        }
        Ok(())
    }

    async fn basic_ack(&self, tag: DeliveryTag) -> Result<()> {
        self.inner
            .basic_ack(tag.0, BasicAckOptions::default())
            .await
            .map_err(broker_error)
    }

    async fn basic_nack(&self, tag: DeliveryTag, requeue: bool) -> Result<()> {
        self.inner
            .basic_nack(
                tag.0,
                BasicNackOptions {
                    requeue,
                    ..BasicNackOptions::default()
                },
            )
            .await
            .map_err(broker_error)
    }
}
