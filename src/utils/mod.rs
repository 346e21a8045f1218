//! The `utils` module holds what every other module of the bridge shares:
//! the error type and logging setup.

pub mod error;
pub mod logging;

pub use error::{BridgeError, Result};

#[cfg(test)]
mod tests {
    use super::error::BridgeError;
    use super::logging;

    #[test]
    fn logging_init_accepts_levels() {
        // Should not panic
        logging::init("info");
        logging::init("debug");
        logging::init("warn");
    }

    #[test]
    fn decode_errors_convert_into_bridge_error() {
        let err = String::from_utf8(vec![0xff, 0xfe]).unwrap_err();
        let bridge: BridgeError = err.into();
        assert!(matches!(bridge, BridgeError::Decode(_)));
        assert!(bridge.to_string().starts_with("failed to decode message body"));
    }
}
