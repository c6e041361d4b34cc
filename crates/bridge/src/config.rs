use std::time::Duration;

use crate::codec::DEFAULT_MAX_FRAME_BYTES;

pub const DEFAULT_QUEUE_CAPACITY: usize = 64;
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(300);
pub const DEFAULT_TICK_INTERVAL: Duration = Duration::from_millis(10);
pub const DEFAULT_DRAIN_BUDGET: usize = 4;
pub const DEFAULT_MAX_CONNECTIONS: usize = 64;

/// Tunables shared by the bridge, the main loop, and the dispatcher.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BridgeConfig {
    pub queue_capacity: usize,
    pub request_timeout: Duration,
    pub tick_interval: Duration,
    pub drain_budget: usize,
    pub max_frame_bytes: usize,
    pub max_connections: usize,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            tick_interval: DEFAULT_TICK_INTERVAL,
            drain_budget: DEFAULT_DRAIN_BUDGET,
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
            max_connections: DEFAULT_MAX_CONNECTIONS,
        }
    }
}
