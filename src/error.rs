//! Defines error handling constructs for kameo_gateway.
//!
//! Failures in this crate are scoped: a failure local to one message never takes down its connection, and a
//! failure local to one connection never takes down the message center. The variants below are what crosses those
//! boundaries.

use std::{error, io};

use thiserror::Error;

use crate::gateway::GatewayAddress;

/// A dyn boxed error.
pub type BoxError = Box<dyn error::Error + Send + Sync + 'static>;

/// Errors produced by the gateway messaging layer.
#[derive(Debug, Error)]
pub enum GatewayError {
    /// A socket operation failed.
    #[error("network error: {0}")]
    Network(#[from] io::Error),

    /// A connection attempt did not complete within the configured timeout.
    #[error("connection timeout")]
    Timeout,

    /// The configuration is invalid.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// A frame or header could not be decoded.
    #[error("malformed frame: {0}")]
    MalformedFrame(String),

    /// A frame declared a header or body larger than allowed.
    #[error("message too large: {size} bytes (max: {max})")]
    MessageTooLarge {
        /// Declared size.
        size: usize,
        /// Configured maximum.
        max: usize,
    },

    /// The body serializer failed.
    #[error("serialization error: {0}")]
    Serialization(BoxError),

    /// The connection preamble could not be exchanged.
    #[error("handshake failed: {0}")]
    HandshakeFailed(String),

    /// The connection to the gateway has been declared dead.
    #[error("gateway {0} is dead")]
    GatewayDead(GatewayAddress),

    /// No live gateway is known.
    #[error("no gateways available")]
    NoGateways,

    /// The gateway directory failed to list gateways.
    #[error("gateway directory error: {0}")]
    Directory(BoxError),

    /// The message center has been stopped.
    #[error("message center shutdown")]
    Shutdown,
}

/// Result type alias for kameo_gateway.
pub type Result<T> = std::result::Result<T, GatewayError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gateway_error_display() {
        let errors = vec![
            GatewayError::Network(io::Error::new(
                io::ErrorKind::ConnectionRefused,
                "connection refused",
            )),
            GatewayError::Timeout,
            GatewayError::InvalidConfig("bucket_count must be > 0".to_string()),
            GatewayError::MalformedFrame("negative header length".to_string()),
            GatewayError::MessageTooLarge {
                size: 2048,
                max: 1024,
            },
            GatewayError::Serialization("boom".into()),
            GatewayError::HandshakeFailed("eof".to_string()),
            GatewayError::GatewayDead("127.0.0.1:30000".parse().unwrap()),
            GatewayError::NoGateways,
            GatewayError::Directory("unreachable".into()),
            GatewayError::Shutdown,
        ];

        for error in errors {
            assert!(!format!("{error}").is_empty());
            assert!(!format!("{error:?}").is_empty());
        }
    }

    #[test]
    fn test_io_error_converts() {
        let err: GatewayError = io::Error::from(io::ErrorKind::BrokenPipe).into();
        assert!(matches!(err, GatewayError::Network(_)));
    }
}
