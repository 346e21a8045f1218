use std::time::Duration;

use serde::Deserialize;

use crate::utils::{BridgeError, Result};

/// Top-level configuration for the bridge.
///
/// Built once at process start and handed to the `Consumer`, which passes the
/// downstream half on to its `Publisher`.
#[derive(Debug, Clone)]
pub struct Settings {
    pub upstream: UpstreamSettings,
    pub downstream: DownstreamSettings,
    pub publisher: PublisherSettings,
}

/// Parameters for one broker connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionSettings {
    pub host: String,
    pub port: u16,
    pub vhost: String,
    pub username: String,
    pub password: String,
    /// Heartbeat interval negotiated with the broker; 0 disables heartbeats.
    pub heartbeat_secs: u16,
}

/// The queue the bridge consumes from.
#[derive(Debug, Clone)]
pub struct UpstreamSettings {
    pub connection: ConnectionSettings,
    pub queue: String,
    pub on_failure: FailurePolicy,
}

/// The fixed exchange/routing key every message is republished to.
#[derive(Debug, Clone)]
pub struct DownstreamSettings {
    pub connection: ConnectionSettings,
    pub exchange: String,
    pub routing_key: String,
}

/// Cadence of the publisher run loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PublisherSettings {
    pub poll_interval_ms: u64,
    pub drain_timeout_ms: u64,
}

/// What the consumer does after rejecting a delivery it failed to forward.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FailurePolicy {
    /// Nack with requeue, then terminate the consume loop.
    #[default]
    Fatal,
    /// Nack and keep consuming. A delivery that fails again after redelivery is
    /// rejected without requeue.
    Isolate,
}

/// Partial configuration loaded from files or environment.
///
/// Every key is optional here; `load_config` fills the gaps from defaults and
/// reports required keys that are still missing.
#[derive(Debug, Default, Deserialize)]
pub struct PartialSettings {
    pub upstream: Option<PartialUpstreamSettings>,
    pub downstream: Option<PartialDownstreamSettings>,
    pub publisher: Option<PartialPublisherSettings>,
}

/// Connection keys shared by the upstream and downstream tables.
#[derive(Debug, Default, Clone)]
pub struct PartialConnectionSettings {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub vhost: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub heartbeat_secs: Option<u16>,
}

// No `#[serde(flatten)]` for the connection keys: values behind it skip the
// string coercion of `config`.
#[derive(Debug, Default, Deserialize)]
pub struct PartialUpstreamSettings {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub vhost: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub heartbeat_secs: Option<u16>,
    pub queue: Option<String>,
    pub on_failure: Option<FailurePolicy>,
}

#[derive(Debug, Default, Deserialize)]
pub struct PartialDownstreamSettings {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub vhost: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub heartbeat_secs: Option<u16>,
    pub exchange: Option<String>,
    pub routing_key: Option<String>,
}

impl PartialUpstreamSettings {
    pub fn connection(&self) -> PartialConnectionSettings {
        PartialConnectionSettings {
            host: self.host.clone(),
            port: self.port,
            vhost: self.vhost.clone(),
            username: self.username.clone(),
            password: self.password.clone(),
            heartbeat_secs: self.heartbeat_secs,
        }
    }
}

impl PartialDownstreamSettings {
    pub fn connection(&self) -> PartialConnectionSettings {
        PartialConnectionSettings {
            host: self.host.clone(),
            port: self.port,
            vhost: self.vhost.clone(),
            username: self.username.clone(),
            password: self.password.clone(),
            heartbeat_secs: self.heartbeat_secs,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct PartialPublisherSettings {
    pub poll_interval_ms: Option<u64>,
    pub drain_timeout_ms: Option<u64>,
}

impl ConnectionSettings {
    pub const DEFAULT_PORT: u16 = 5672;

    /// Connection to `host` with the broker's stock credentials.
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port: Self::DEFAULT_PORT,
            vhost: "/".to_string(),
            username: "guest".to_string(),
            password: "guest".to_string(),
            heartbeat_secs: 60,
        }
    }

    pub fn with_heartbeat(mut self, secs: u16) -> Self {
        self.heartbeat_secs = secs;
        self
    }

    /// `None` when heartbeats are disabled.
    pub fn heartbeat(&self) -> Option<Duration> {
        (self.heartbeat_secs > 0).then(|| Duration::from_secs(u64::from(self.heartbeat_secs)))
    }

    /// AMQP URI for this connection, heartbeat included.
    pub fn uri(&self) -> String {
        let vhost = self.vhost.replace('/', "%2f");
        format!(
            "amqp://{}:{}@{}:{}/{}?heartbeat={}",
            self.username, self.password, self.host, self.port, vhost, self.heartbeat_secs
        )
    }

    pub(crate) fn merge(
        partial: Option<&PartialConnectionSettings>,
        host_key: &'static str,
        default_heartbeat: u16,
    ) -> Result<Self> {
        let host = partial
            .and_then(|c| c.host.clone())
            .ok_or(BridgeError::MissingSetting(host_key))?;
        let default = Self::new(host).with_heartbeat(default_heartbeat);

        Ok(Self {
            port: partial.and_then(|c| c.port).unwrap_or(default.port),
            vhost: partial
                .and_then(|c| c.vhost.clone())
                .unwrap_or(default.vhost.clone()),
            username: partial
                .and_then(|c| c.username.clone())
                .unwrap_or(default.username.clone()),
            password: partial
                .and_then(|c| c.password.clone())
                .unwrap_or(default.password.clone()),
            heartbeat_secs: partial
                .and_then(|c| c.heartbeat_secs)
                .unwrap_or(default.heartbeat_secs),
            host: default.host,
        })
    }
}

impl PublisherSettings {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_millis(self.drain_timeout_ms)
    }
}

/// One-second polling matches the cadence the heartbeat interval is expressed in.
impl Default for PublisherSettings {
    fn default() -> Self {
        Self {
            poll_interval_ms: 1000,
            drain_timeout_ms: 2000,
        }
    }
}

impl Settings {
    /// Default upstream heartbeat, in seconds.
    pub const UPSTREAM_HEARTBEAT_SECS: u16 = 60;
    /// Default downstream heartbeat, in seconds. Kept low so a publisher loop
    /// that stops answering heartbeats is noticed quickly.
    pub const DOWNSTREAM_HEARTBEAT_SECS: u16 = 10;

    /// Fails fast on values that would only surface later as broker errors.
    pub fn validate(&self) -> Result<()> {
        let checks: [(&'static str, &str); 4] = [
            ("upstream.host", &self.upstream.connection.host),
            ("downstream.host", &self.downstream.connection.host),
            ("upstream.queue", &self.upstream.queue),
            ("downstream.exchange", &self.downstream.exchange),
        ];
        for (key, value) in checks {
            if value.trim().is_empty() {
                return Err(BridgeError::InvalidSetting {
                    key,
                    reason: "must not be empty".to_string(),
                });
            }
        }

        if self.publisher.poll_interval_ms == 0 {
            return Err(BridgeError::InvalidSetting {
                key: "publisher.poll_interval_ms",
                reason: "must be greater than zero".to_string(),
            });
        }

        // The loop must come back around well inside the heartbeat window.
        if let Some(heartbeat) = self.downstream.connection.heartbeat() {
            if self.publisher.poll_interval() >= heartbeat {
                return Err(BridgeError::InvalidSetting {
                    key: "publisher.poll_interval_ms",
                    reason: format!(
                        "must be shorter than the downstream heartbeat ({}s)",
                        heartbeat.as_secs()
                    ),
                });
            }
        }

        Ok(())
    }
}
