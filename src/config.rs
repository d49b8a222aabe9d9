//! Configuration for the gateway messaging layer.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{GatewayError, Result};

/// Default size of a pooled buffer in bytes
pub const DEFAULT_BUFFER_SIZE: usize = 4 * 1024;

/// Default maximum number of idle buffers retained by the pool
pub const DEFAULT_MAX_POOLED_BUFFERS: usize = 4096;

/// Default size the receive buffer shrinks back to after servicing a large message
pub const DEFAULT_RECEIVE_BUFFER_SUSTAINED_SIZE: usize = 64 * 1024;

/// Receive buffer capacity doubles until it reaches this size
pub const DEFAULT_RECEIVE_BUFFER_GROW_MAX: usize = 1024 * 1024;

/// Past `grow_max`, receive buffer capacity grows in blocks of this size
pub const DEFAULT_RECEIVE_BUFFER_GROW_BLOCK: usize = 256 * 1024;

/// Default number of connection attempts before a gateway connection is declared dead
pub const DEFAULT_CONNECT_RETRY_COUNT: usize = 2;

/// Default minimum delay between two connection attempts to the same gateway
pub const DEFAULT_MIN_INTERCONNECT_DELAY_MS: u64 = 100;

/// Default gateway list refresh period in seconds
pub const DEFAULT_GATEWAY_LIST_REFRESH_SECS: u64 = 60;

/// Default number of routing buckets
pub const DEFAULT_BUCKET_COUNT: usize = 8192;

/// Configuration for the gateway messaging layer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayClientConfig {
    /// Size of every pooled buffer in bytes
    pub buffer_size: usize,
    /// Maximum number of idle buffers kept by the pool (`None` = unbounded)
    pub max_pooled_buffers: Option<usize>,
    /// Receive buffer capacity kept between messages
    pub receive_buffer_sustained_size: usize,
    /// Receive buffer doubles up to this capacity
    pub receive_buffer_grow_max: usize,
    /// Receive buffer grows in increments of this size past `receive_buffer_grow_max`
    pub receive_buffer_grow_block: usize,
    /// Largest header a frame may declare
    pub max_header_size: usize,
    /// Largest body a frame may declare
    pub max_body_size: usize,
    /// Copy decoded bodies out of the receive buffer instead of referencing it
    pub forwarding_reads: bool,
    /// Connection attempts before a gateway connection is declared dead
    pub connect_retry_count: usize,
    /// Minimum delay between two connection attempts
    pub min_interconnect_delay: Duration,
    /// Timeout applied to a single connection attempt
    pub connect_timeout: Duration,
    /// Interval between gateway list refreshes
    pub gateway_list_refresh_period: Duration,
    /// Size of the routing bucket table
    pub bucket_count: usize,
    /// Times a message may be rerouted before it is rejected
    pub max_reroute_attempts: u32,
}

impl Default for GatewayClientConfig {
    fn default() -> Self {
        Self {
            buffer_size: DEFAULT_BUFFER_SIZE,
            max_pooled_buffers: Some(DEFAULT_MAX_POOLED_BUFFERS),
            receive_buffer_sustained_size: DEFAULT_RECEIVE_BUFFER_SUSTAINED_SIZE,
            receive_buffer_grow_max: DEFAULT_RECEIVE_BUFFER_GROW_MAX,
            receive_buffer_grow_block: DEFAULT_RECEIVE_BUFFER_GROW_BLOCK,
            max_header_size: 64 * 1024,
            max_body_size: 100 * 1024 * 1024, // 100MB
            forwarding_reads: false,
            connect_retry_count: DEFAULT_CONNECT_RETRY_COUNT,
            min_interconnect_delay: Duration::from_millis(DEFAULT_MIN_INTERCONNECT_DELAY_MS),
            connect_timeout: Duration::from_secs(5),
            gateway_list_refresh_period: Duration::from_secs(DEFAULT_GATEWAY_LIST_REFRESH_SECS),
            bucket_count: DEFAULT_BUCKET_COUNT,
            max_reroute_attempts: 3,
        }
    }
}

impl GatewayClientConfig {
    /// Checks the configuration for values the messaging layer cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.buffer_size < 8 {
            return Err(GatewayError::InvalidConfig(format!(
                "buffer_size must be at least 8 bytes, got {}",
                self.buffer_size
            )));
        }
        if self.max_pooled_buffers == Some(0) {
            return Err(GatewayError::InvalidConfig(
                "max_pooled_buffers must be > 0 when set".to_string(),
            ));
        }
        if self.receive_buffer_sustained_size < self.buffer_size {
            return Err(GatewayError::InvalidConfig(format!(
                "receive_buffer_sustained_size ({}) must be >= buffer_size ({})",
                self.receive_buffer_sustained_size, self.buffer_size
            )));
        }
        if self.receive_buffer_grow_max < self.receive_buffer_sustained_size {
            return Err(GatewayError::InvalidConfig(
                "receive_buffer_grow_max must be >= receive_buffer_sustained_size".to_string(),
            ));
        }
        if self.receive_buffer_grow_block < self.buffer_size {
            return Err(GatewayError::InvalidConfig(
                "receive_buffer_grow_block must be >= buffer_size".to_string(),
            ));
        }
        if self.max_header_size > i32::MAX as usize || self.max_body_size > i32::MAX as usize {
            return Err(GatewayError::InvalidConfig(
                "frame size limits must fit in an i32".to_string(),
            ));
        }
        if self.connect_retry_count == 0 {
            return Err(GatewayError::InvalidConfig(
                "connect_retry_count must be > 0".to_string(),
            ));
        }
        if self.bucket_count == 0 {
            return Err(GatewayError::InvalidConfig(
                "bucket_count must be > 0".to_string(),
            ));
        }
        if self.gateway_list_refresh_period.is_zero() {
            return Err(GatewayError::InvalidConfig(
                "gateway_list_refresh_period must be non-zero".to_string(),
            ));
        }
        Ok(())
    }
}
