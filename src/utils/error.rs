//! The `error` module defines the error type shared by every component of the bridge.
//!
//! Message-level failures (`Decode`, `PublisherStopped`) are resolved where a delivery
//! is handled; connection-level failures (`ConnectionClosed`, `Channel`, `Broker`)
//! terminate the loop that owns the connection.

use std::string::FromUtf8Error;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("missing required setting `{0}`")]
    MissingSetting(&'static str),

    #[error("invalid setting `{key}`: {reason}")]
    InvalidSetting { key: &'static str, reason: String },

    #[error("connection refused by `{0}`")]
    ConnectionRefused(String),

    #[error("connection closed: {0}")]
    ConnectionClosed(String),

    #[error("channel error {code}: {text}")]
    Channel { code: u16, text: String },

    #[error("publish to exchange `{exchange}` was negatively confirmed")]
    PublishNotConfirmed { exchange: String },

    #[error("publisher is not running")]
    PublisherStopped,

    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("failed to decode message body: {0}")]
    Decode(#[from] FromUtf8Error),

    #[error("broker client error: {0}")]
    Broker(String),
}

pub type Result<T> = std::result::Result<T, BridgeError>;
