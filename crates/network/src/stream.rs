//! Per-peer P2P stream configuration.

use capmesh_config as config;
use serde::{Deserialize, Serialize};

/// Token-bucket rate limiter parameters.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TokenBucketParams {
    /// Sustained rate, per second.
    pub rate: f64,
    /// Burst capacity.
    pub capacity: u64,
}

/// Transport configuration applied to the streams of one peer.
///
/// A value object, not owned by any entity; applied uniformly to all peers
/// unless overridden.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamConfig {
    pub incoming_message_buffer_size: usize,
    pub outgoing_message_buffer_size: usize,
    pub max_message_len_bytes: usize,
    pub message_rate_limiter: TokenBucketParams,
    pub bytes_rate_limiter: TokenBucketParams,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            incoming_message_buffer_size: config::DEFAULT_INCOMING_BUFFER_BYTES,
            outgoing_message_buffer_size: config::DEFAULT_OUTGOING_BUFFER_BYTES,
            max_message_len_bytes: config::DEFAULT_MAX_MESSAGE_LEN_BYTES,
            message_rate_limiter: TokenBucketParams {
                rate: config::DEFAULT_MESSAGE_RATE_PER_SEC,
                capacity: config::DEFAULT_MESSAGE_BURST,
            },
            bytes_rate_limiter: TokenBucketParams {
                rate: config::DEFAULT_BYTES_RATE_PER_SEC,
                capacity: config::DEFAULT_BYTES_BURST,
            },
        }
    }
}
