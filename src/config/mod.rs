mod settings;

use std::env;
use std::path::Path;

use config::{Config, ConfigBuilder, Environment, File, builder::DefaultState};

use crate::utils::{BridgeError, Result};
use settings::PartialSettings;

pub use settings::{
    ConnectionSettings, DownstreamSettings, FailurePolicy, PublisherSettings, Settings,
    UpstreamSettings,
};

/// Environment variables read verbatim, for deployments that predate the
/// `BRIDGE_` prefix. They take precedence over every other source.
const LEGACY_VARIABLES: [(&str, &str); 5] = [
    ("UPSTREAM_HOST", "upstream.host"),
    ("DOWNSTREAM_HOST", "downstream.host"),
    ("UPSTREAM_QUEUE", "upstream.queue"),
    ("DOWNSTREAM_EXCHANGE", "downstream.exchange"),
    ("DOWNSTREAM_ROUTING_KEY", "downstream.routing_key"),
];

/// Loads the configuration from `config/default` (if present) and the environment.
/// Merges the configuration with default values.
pub fn load_config() -> Result<Settings> {
    let builder =
        Config::builder().add_source(File::with_name("config/default").required(false));
    build(builder)
}

/// Same as `load_config`, reading the file layer from an explicit path.
pub fn load_config_from(path: &Path) -> Result<Settings> {
    let builder = Config::builder().add_source(File::from(path));
    build(builder)
}

fn build(builder: ConfigBuilder<DefaultState>) -> Result<Settings> {
    let mut builder = builder.add_source(
        Environment::with_prefix("BRIDGE")
            .prefix_separator("_")
            .separator("__"),
    );
    for (variable, key) in LEGACY_VARIABLES {
        builder = builder.set_override_option(key, env::var(variable).ok())?;
    }

    let config = builder.build()?;

    // Try to deserialize what is available
    let partial: PartialSettings = config.try_deserialize()?;

    merge(partial)
}

/// Fills the gaps of `partial` with defaults. Required keys have no default.
fn merge(partial: PartialSettings) -> Result<Settings> {
    let default_publisher = PublisherSettings::default();

    let upstream = partial.upstream.as_ref();
    let downstream = partial.downstream.as_ref();

    Ok(Settings {
        upstream: UpstreamSettings {
            connection: ConnectionSettings::merge(
                upstream.map(|u| u.connection()).as_ref(),
                "upstream.host",
                Settings::UPSTREAM_HEARTBEAT_SECS,
            )?,
            queue: upstream
                .and_then(|u| u.queue.clone())
                .ok_or(BridgeError::MissingSetting("upstream.queue"))?,
            on_failure: upstream.and_then(|u| u.on_failure).unwrap_or_default(),
        },
        downstream: DownstreamSettings {
            connection: ConnectionSettings::merge(
                downstream.map(|d| d.connection()).as_ref(),
                "downstream.host",
                Settings::DOWNSTREAM_HEARTBEAT_SECS,
            )?,
            exchange: downstream
                .and_then(|d| d.exchange.clone())
                .ok_or(BridgeError::MissingSetting("downstream.exchange"))?,
            routing_key: downstream
                .and_then(|d| d.routing_key.clone())
                .ok_or(BridgeError::MissingSetting("downstream.routing_key"))?,
        },
        publisher: PublisherSettings {
            poll_interval_ms: partial
                .publisher
                .as_ref()
                .and_then(|p| p.poll_interval_ms)
                .unwrap_or(default_publisher.poll_interval_ms),
            drain_timeout_ms: partial
                .publisher
                .as_ref()
                .and_then(|p| p.drain_timeout_ms)
                .unwrap_or(default_publisher.drain_timeout_ms),
        },
    })
}

#[cfg(test)]
mod tests;
