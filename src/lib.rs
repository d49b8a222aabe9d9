#![doc = include_str!("../README.md")]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(rust_2018_idioms)]
#![warn(missing_debug_implementations)]
#![deny(unused_must_use)]
#![cfg_attr(docsrs, feature(doc_auto_cfg))]

pub mod buffer;
pub mod config;
pub mod connection;
pub mod error;
pub mod framing;
pub mod gateway;
pub mod message;
pub mod router;
pub mod stats;

#[cfg(any(test, feature = "test-helpers", debug_assertions))]
pub mod test_helpers;

pub use config::GatewayClientConfig;
pub use error::{GatewayError, Result};
pub use gateway::{GatewayAddress, GatewayDirectory, StaticGatewayDirectory};
pub use message::{Body, Category, GrainId, Message};
pub use router::{GatewayMessageCenter, GatewayMessageCenterBuilder};
