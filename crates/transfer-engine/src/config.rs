//! Engine configuration

use std::time::Duration;

use net_transport::{AdaptiveConfig, ChannelLimits};

/// Tunables for one engine instance.
///
/// Every interval that gates a state change is configurable so tests can
/// shrink them; the defaults suit desktop links.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Budget for each handshake round trip: key answer, accept, verify
    pub handshake_timeout: Duration,
    /// No chunk progress for this long triggers the relay fallback
    pub stall_timeout: Duration,
    /// Ping cadence on the control channel while chunks flow
    pub metrics_interval: Duration,
    /// Cadence of receive-side progress reports back to the sender
    pub feedback_interval: Duration,
    /// Data channels granted when accepting a transfer
    pub data_channels: u8,
    /// Largest file the receive side will take
    pub max_file_size: u64,
    /// Watermarks applied to every data channel
    pub limits: ChannelLimits,
    /// Chunk-size and channel-count controller settings
    pub adaptive: AdaptiveConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            handshake_timeout: Duration::from_secs(30),
            stall_timeout: Duration::from_secs(10),
            metrics_interval: Duration::from_millis(500),
            feedback_interval: Duration::from_millis(500),
            data_channels: 2,
            max_file_size: 16 * 1024 * 1024 * 1024,
            limits: ChannelLimits::default(),
            adaptive: AdaptiveConfig::default(),
        }
    }
}
