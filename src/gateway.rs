//! Gateway discovery and liveness tracking.
//!
//! A [`GatewayDirectory`] lists the gateways registered with the cluster. The [`GatewayManager`] polls it, accepts
//! pushed updates from directories that support them, and keeps the live list the router picks connections from.
//! Gateways whose connections die are excluded for the directory's staleness window, since the directory itself may
//! take a while to notice.

mod address;
mod directory;
mod manager;

pub use address::GatewayAddress;
pub use directory::{GatewayDirectory, GatewayListListener, StaticGatewayDirectory};
pub use manager::GatewayManager;
