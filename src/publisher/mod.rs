//! Publisher
//!
//! Owns the downstream connection and a dedicated run-loop task, the only place
//! that ever touches the downstream channel. The loop:
//! - services protocol events (heartbeats) with a bounded wait per iteration
//! - executes publishes scheduled from other tasks, in submission order
//! - checks a cooperative stop flag between iterations
//!
//! `publish` only schedules; it never writes to the network itself and never
//! reports write failures. A failed write or a dead connection ends the loop,
//! after which `publish` fails with `PublisherStopped`.
//!
//! State machine: `Created -> Running -> Stopping -> Stopped`, no restart.

pub mod scheduler;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::broker::{Channel, Connection, Connector, PendingPublish};
use crate::config::{DownstreamSettings, PublisherSettings};
use crate::utils::{BridgeError, Result};
use scheduler::{TaskReceiver, TaskSender, task_queue};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublisherState {
    Created,
    Running,
    Stopping,
    Stopped,
}

#[derive(Debug, Clone)]
struct PublishTarget {
    exchange: String,
    routing_key: String,
}

/// Schedules publishes onto a publisher's run loop. Cheap to clone and safe to
/// use from any task.
#[derive(Debug, Clone)]
pub struct PublisherHandle {
    tasks: TaskSender<PendingPublish>,
}

impl PublisherHandle {
    /// Queues `message` for the run loop and returns immediately.
    ///
    /// An `Ok` means the write was scheduled, not that it was sent.
    pub fn publish(&self, message: impl Into<Vec<u8>>) -> Result<()> {
        let request = PendingPublish::new(message);
        info!(bytes = request.body.len(), "publish requested");
        self.tasks.schedule(request)
    }
}

pub struct Publisher<C: Connection> {
    connection: Arc<C>,
    channel: Option<C::Channel>,
    tasks: TaskSender<PendingPublish>,
    receiver: Option<TaskReceiver<PendingPublish>>,
    target: PublishTarget,
    settings: PublisherSettings,
    running: Arc<AtomicBool>,
    state: Arc<Mutex<PublisherState>>,
    run_loop: Option<JoinHandle<()>>,
}

impl<C: Connection> Publisher<C> {
    /// Opens the downstream connection and a channel in confirm mode.
    /// The run loop does not start until `start`.
    pub async fn connect<K>(
        connector: &K,
        downstream: &DownstreamSettings,
        settings: &PublisherSettings,
    ) -> Result<Self>
    where
        K: Connector<Connection = C>,
    {
        let connection = connector.connect(&downstream.connection).await?;
        let channel = connection.open_channel().await?;
        channel.confirm_select().await?;
        info!(
            host = %downstream.connection.host,
            exchange = %downstream.exchange,
            routing_key = %downstream.routing_key,
            "publisher connected"
        );

        let (tasks, receiver) = task_queue();
        Ok(Self {
            connection: Arc::new(connection),
            channel: Some(channel),
            tasks,
            receiver: Some(receiver),
            target: PublishTarget {
                exchange: downstream.exchange.clone(),
                routing_key: downstream.routing_key.clone(),
            },
            settings: *settings,
            running: Arc::new(AtomicBool::new(false)),
            state: Arc::new(Mutex::new(PublisherState::Created)),
            run_loop: None,
        })
    }

    /// Spawns the run loop. Only valid once, from `Created`.
    pub fn start(&mut self) -> Result<()> {
        let state = self.state();
        let (Some(channel), Some(tasks), PublisherState::Created) =
            (self.channel.take(), self.receiver.take(), state)
        else {
            return Err(BridgeError::InvalidState(format!(
                "publisher cannot start from {state:?}"
            )));
        };

        self.running.store(true, Ordering::Release);
        set_state(&self.state, PublisherState::Running);

        let run_loop = RunLoop {
            connection: self.connection.clone(),
            channel,
            tasks,
            target: self.target.clone(),
            poll_interval: self.settings.poll_interval(),
            running: self.running.clone(),
            state: self.state.clone(),
        };
        self.run_loop = Some(tokio::spawn(run_loop.run()));
        info!(
            poll_interval_ms = self.settings.poll_interval_ms,
            "publisher started"
        );
        Ok(())
    }

    pub fn handle(&self) -> PublisherHandle {
        PublisherHandle {
            tasks: self.tasks.clone(),
        }
    }

    /// See `PublisherHandle::publish`.
    pub fn publish(&self, message: impl Into<Vec<u8>>) -> Result<()> {
        self.handle().publish(message)
    }

    pub fn state(&self) -> PublisherState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire) && self.state() == PublisherState::Running
    }

    pub fn connection(&self) -> &C {
        &self.connection
    }

    /// Id of the run-loop task, once started.
    pub fn loop_task_id(&self) -> Option<tokio::task::Id> {
        self.run_loop.as_ref().map(JoinHandle::id)
    }

    /// Raises the stop flag, gives the run loop up to `drain_timeout` to finish
    /// what is already queued, then closes the connection if it is still open.
    ///
    /// Best effort: anything scheduled after the loop's final drain is lost.
    pub async fn stop(&mut self) {
        if self.state() == PublisherState::Stopped {
            debug!("publisher already stopped");
            return;
        }
        info!("stopping publisher");
        self.running.store(false, Ordering::Release);
        set_state(&self.state, PublisherState::Stopping);

        if let Some(mut run_loop) = self.run_loop.take() {
            match tokio::time::timeout(self.settings.drain_timeout(), &mut run_loop).await {
                Ok(Ok(())) => debug!("publisher loop drained"),
                Ok(Err(err)) => error!(error = ?err, "publisher loop panicked"),
                Err(_) => {
                    warn!(
                        drain_timeout_ms = self.settings.drain_timeout_ms,
                        "publisher loop did not drain in time, aborting it"
                    );
                    run_loop.abort();
                }
            }
        }

        // Never started: whatever was queued is dropped with the receiver.
        self.receiver = None;
        self.channel = None;

        if self.connection.is_open() {
            match self.connection.close().await {
                Ok(()) => info!("downstream connection closed"),
                Err(err) => warn!(error = ?err, "failed to close downstream connection"),
            }
        }

        set_state(&self.state, PublisherState::Stopped);
        info!("publisher stopped");
    }
}

impl<C: Connection> Drop for Publisher<C> {
    fn drop(&mut self) {
        self.running.store(false, Ordering::Release);
    }
}

fn set_state(state: &Mutex<PublisherState>, to: PublisherState) {
    *state.lock().unwrap_or_else(PoisonError::into_inner) = to;
}

enum Wake {
    Task(Option<PendingPublish>),
    Idle,
}

struct RunLoop<C: Connection> {
    connection: Arc<C>,
    channel: C::Channel,
    tasks: TaskReceiver<PendingPublish>,
    target: PublishTarget,
    poll_interval: Duration,
    running: Arc<AtomicBool>,
    state: Arc<Mutex<PublisherState>>,
}

impl<C: Connection> RunLoop<C> {
    async fn run(mut self) {
        debug!("publisher loop running");
        if let Err(err) = self.serve().await {
            error!(error = ?err, "publisher loop terminated");
            self.running.store(false, Ordering::Release);
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            if *state == PublisherState::Running {
                *state = PublisherState::Stopping;
            }
        }
        debug!("publisher loop exited");
    }

    async fn serve(&mut self) -> Result<()> {
        while self.running.load(Ordering::Acquire) {
            let wake = tokio::select! {
                biased;
                task = self.tasks.next() => Wake::Task(task),
                events = self.connection.process_events(self.poll_interval) => {
                    events?;
                    Wake::Idle
                }
            };

            match wake {
                Wake::Task(Some(request)) => {
                    self.write(request).await?;
                    self.drain().await?;
                }
                // Every sender is gone: the publisher itself was dropped.
                Wake::Task(None) => return Ok(()),
                Wake::Idle => {}
            }
        }

        self.drain().await
    }

    /// Writes everything already queued, then services pending events.
    async fn drain(&mut self) -> Result<()> {
        while let Some(request) = self.tasks.try_next() {
            self.write(request).await?;
        }
        self.connection.process_events(Duration::ZERO).await
    }

    async fn write(&mut self, request: PendingPublish) -> Result<()> {
        info!(
            exchange = %self.target.exchange,
            routing_key = %self.target.routing_key,
            bytes = request.body.len(),
            queued_ms = chrono::Utc::now().timestamp_millis() - request.requested_at_ms,
            "publishing"
        );
        self.channel
            .basic_publish(&self.target.exchange, &self.target.routing_key, &request.body)
            .await
    }
}

#[cfg(test)]
mod tests;
