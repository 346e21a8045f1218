use std::time::Duration;

use super::{Publisher, PublisherState};
use crate::broker::memory::{BrokerEvent, MemoryBroker, MemoryConnection, MemoryConnector};
use crate::broker::{Connection, ConnectionState};
use crate::config::{ConnectionSettings, DownstreamSettings, PublisherSettings};
use crate::utils::BridgeError;

const EXCHANGE: &str = "bridge.out";
const ROUTING_KEY: &str = "forwarded";
const SINK: &str = "sink";

struct Fixture {
    connector: MemoryConnector,
    broker: MemoryBroker,
    publisher: Publisher<MemoryConnection>,
}

async fn fixture(poll_interval_ms: u64) -> Fixture {
    let connector = MemoryConnector::new();
    let broker = connector.add_broker("downstream");
    broker.bind(SINK, EXCHANGE, ROUTING_KEY);

    let downstream = DownstreamSettings {
        connection: ConnectionSettings::new("downstream").with_heartbeat(10),
        exchange: EXCHANGE.to_string(),
        routing_key: ROUTING_KEY.to_string(),
    };
    let settings = PublisherSettings {
        poll_interval_ms,
        drain_timeout_ms: 2000,
    };
    let publisher = Publisher::connect(&connector, &downstream, &settings)
        .await
        .expect("publisher connect");

    Fixture {
        connector,
        broker,
        publisher,
    }
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

fn published_bodies(connector: &MemoryConnector) -> Vec<Vec<u8>> {
    connector
        .journal()
        .into_iter()
        .filter_map(|entry| match entry.event {
            BrokerEvent::Published { body, .. } => Some(body),
            _ => None,
        })
        .collect()
}

#[tokio::test]
async fn test_publish_returns_before_write_and_write_runs_on_loop_task() {
    let mut f = fixture(20).await;
    f.publisher.start().unwrap();
    let loop_task = f.publisher.loop_task_id().expect("loop task id");

    f.publisher.publish("hello").unwrap();
    assert!(
        published_bodies(&f.connector).is_empty(),
        "publish wrote inline"
    );

    wait_until(|| !published_bodies(&f.connector).is_empty()).await;

    let (exchange, routing_key, body, task) = f
        .connector
        .journal()
        .into_iter()
        .find_map(|entry| match entry.event {
            BrokerEvent::Published {
                exchange,
                routing_key,
                body,
                task,
            } => Some((exchange, routing_key, body, task)),
            _ => None,
        })
        .unwrap();
    assert_eq!(exchange, EXCHANGE);
    assert_eq!(routing_key, ROUTING_KEY);
    assert_eq!(body, b"hello");
    assert_eq!(task, Some(loop_task));

    f.publisher.stop().await;
}

#[tokio::test]
async fn test_publishes_from_another_task_keep_submission_order() {
    let mut f = fixture(20).await;
    f.publisher.start().unwrap();

    let handle = f.publisher.handle();
    tokio::spawn(async move {
        for n in 0..5 {
            handle.publish(format!("msg-{n}")).unwrap();
        }
    })
    .await
    .unwrap();

    wait_until(|| f.broker.ready_messages(SINK).len() == 5).await;
    let expected: Vec<Vec<u8>> = (0..5).map(|n| format!("msg-{n}").into_bytes()).collect();
    assert_eq!(f.broker.ready_messages(SINK), expected);

    f.publisher.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_idle_loop_answers_heartbeats_past_the_interval() {
    let mut f = fixture(1000).await;
    f.publisher.start().unwrap();

    // Longer than one 10s heartbeat, shorter than the 20s deadline.
    tokio::time::sleep(Duration::from_secs(15)).await;
    assert!(f.publisher.connection().is_open());
    assert!(f.publisher.connection().heartbeats_answered() >= 14);

    // And well past the deadline, with no publishes at all.
    tokio::time::sleep(Duration::from_secs(45)).await;
    assert!(f.publisher.connection().is_open());
    assert!(f.publisher.is_running());

    f.publisher.publish("after idle").unwrap();
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(f.broker.ready_messages(SINK), vec![b"after idle".to_vec()]);

    f.publisher.stop().await;
    assert_eq!(f.publisher.state(), PublisherState::Stopped);
}

#[tokio::test(start_paused = true)]
async fn test_connection_without_run_loop_times_out() {
    let f = fixture(1000).await;

    tokio::time::sleep(Duration::from_secs(25)).await;
    assert_eq!(
        f.publisher.connection().state(),
        ConnectionState::Closed
    );
}

#[tokio::test]
async fn test_connection_loss_ends_loop_and_rejects_publishes() {
    let mut f = fixture(20).await;
    f.publisher.start().unwrap();

    f.broker.kill_connections("broker restart");
    wait_until(|| f.publisher.state() == PublisherState::Stopping).await;
    assert!(!f.publisher.is_running());

    wait_until(|| f.publisher.publish("lost").is_err()).await;
    assert!(matches!(
        f.publisher.publish("lost"),
        Err(BridgeError::PublisherStopped)
    ));

    f.publisher.stop().await;
    assert_eq!(f.publisher.state(), PublisherState::Stopped);
}

#[tokio::test]
async fn test_negative_confirm_ends_loop() {
    let mut f = fixture(20).await;
    f.broker.set_nack_publishes(true);
    f.publisher.start().unwrap();

    f.publisher.publish("refused").unwrap();
    wait_until(|| f.publisher.state() == PublisherState::Stopping).await;
    assert!(f.broker.ready_messages(SINK).is_empty());

    f.publisher.stop().await;
}

#[tokio::test]
async fn test_stop_drains_already_queued_publishes() {
    let mut f = fixture(20).await;
    f.publisher.start().unwrap();

    for body in ["a", "b", "c"] {
        f.publisher.publish(body).unwrap();
    }
    f.publisher.stop().await;

    assert_eq!(
        f.broker.ready_messages(SINK),
        vec![b"a".to_vec(), b"b".to_vec(), b"c".to_vec()]
    );
    assert_eq!(f.publisher.connection().state(), ConnectionState::Closed);
    assert!(matches!(
        f.publisher.publish("late"),
        Err(BridgeError::PublisherStopped)
    ));
}

#[tokio::test]
async fn test_stop_is_idempotent_on_closed_connection() {
    let mut f = fixture(20).await;
    f.publisher.start().unwrap();
    f.publisher.connection().close().await.unwrap();

    f.publisher.stop().await;
    f.publisher.stop().await;

    assert_eq!(f.publisher.state(), PublisherState::Stopped);
    assert_eq!(f.broker.open_connections(), 0);
}

#[tokio::test]
async fn test_stop_without_start_closes_connection() {
    let mut f = fixture(20).await;
    f.publisher.publish("never sent").unwrap();

    f.publisher.stop().await;

    assert_eq!(f.publisher.connection().state(), ConnectionState::Closed);
    assert!(published_bodies(&f.connector).is_empty());
    assert!(f.publisher.publish("again").is_err());
}

#[tokio::test]
async fn test_publisher_cannot_restart() {
    let mut f = fixture(20).await;
    f.publisher.start().unwrap();
    assert!(matches!(
        f.publisher.start(),
        Err(BridgeError::InvalidState(_))
    ));

    f.publisher.stop().await;
    assert!(matches!(
        f.publisher.start(),
        Err(BridgeError::InvalidState(_))
    ));
}
