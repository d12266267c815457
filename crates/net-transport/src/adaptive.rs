//! Adaptive chunk sizing and channel scaling

use parking_lot::RwLock;
use std::collections::VecDeque;
use std::time::{Duration, Instant};

use wire_protocol::{MAX_CHUNK_SIZE, MAX_DATA_CHANNELS, MIN_CHUNK_SIZE};

/// RTT sample
#[derive(Debug, Clone, Copy)]
struct RttSample {
    rtt: Duration,
    timestamp: Instant,
}

/// One link measurement fed to the controller
#[derive(Debug, Clone, Copy)]
pub struct MetricSample {
    /// Path round-trip time
    pub rtt: Duration,
    /// Packet loss over the sampling interval, 0.0 to 1.0
    pub loss: f64,
    /// Bytes queued across all send channels
    pub buffered_bytes: usize,
}

/// Adaptive controller configuration
#[derive(Debug, Clone)]
pub struct AdaptiveConfig {
    /// Smallest chunk the controller will select
    pub min_chunk_size: usize,
    /// Largest chunk the controller will select
    pub max_chunk_size: usize,
    /// Chunk size before any samples arrive
    pub initial_chunk_size: usize,
    /// Fewest data channels to keep
    pub min_channels: u8,
    /// Most data channels to request
    pub max_channels: u8,
    /// Data channels before any samples arrive
    pub initial_channels: u8,
    /// Minimum time between parameter adjustments
    pub adjustment_interval: Duration,
    /// Send backlog that counts as congestion on its own
    pub congested_buffer_bytes: usize,
}

impl Default for AdaptiveConfig {
    fn default() -> Self {
        Self {
            min_chunk_size: MIN_CHUNK_SIZE,
            max_chunk_size: MAX_CHUNK_SIZE,
            initial_chunk_size: 64 * 1024,
            min_channels: 1,
            max_channels: MAX_DATA_CHANNELS as u8,
            initial_channels: 2,
            adjustment_interval: Duration::from_millis(500),
            congested_buffer_bytes: 8 * 1024 * 1024,
        }
    }
}

/// Current transfer parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferParams {
    /// Plaintext bytes per chunk
    pub chunk_size: usize,
    /// Data channels to run; applies to the next negotiation, a live
    /// transfer keeps the channels it opened
    pub channel_count: u8,
}

/// Adaptive controller state
pub struct AdaptiveChunkController {
    config: AdaptiveConfig,
    current_params: RwLock<TransferParams>,
    rtt_samples: RwLock<VecDeque<RttSample>>,
    smoothed_rtt: RwLock<Duration>,
    rtt_variance: RwLock<Duration>,
    smoothed_loss: RwLock<f64>,
    last_buffered: RwLock<usize>,
    last_adjustment: RwLock<Instant>,
}

impl AdaptiveChunkController {
    /// Create a new controller
    pub fn new(config: AdaptiveConfig) -> Self {
        let initial_params = TransferParams {
            chunk_size: config.initial_chunk_size,
            channel_count: config.initial_channels,
        };

        Self {
            config,
            current_params: RwLock::new(initial_params),
            rtt_samples: RwLock::new(VecDeque::with_capacity(100)),
            smoothed_rtt: RwLock::new(Duration::from_millis(50)),
            rtt_variance: RwLock::new(Duration::from_millis(10)),
            smoothed_loss: RwLock::new(0.0),
            last_buffered: RwLock::new(0),
            last_adjustment: RwLock::new(Instant::now()),
        }
    }

    /// Record a new link measurement
    pub fn record(&self, sample: MetricSample) {
        let entry = RttSample {
            rtt: sample.rtt,
            timestamp: Instant::now(),
        };

        let mut samples = self.rtt_samples.write();
        samples.push_back(entry);

        // Keep only samples from the last 2 seconds
        let cutoff = Instant::now() - Duration::from_secs(2);
        while samples.front().is_some_and(|s| s.timestamp < cutoff) {
            samples.pop_front();
        }

        // Update smoothed values using exponential moving averages
        let alpha = 0.125;
        let beta = 0.25;

        let mut smoothed = self.smoothed_rtt.write();
        let mut variance = self.rtt_variance.write();
        let mut loss = self.smoothed_loss.write();

        let diff = if sample.rtt > *smoothed {
            sample.rtt - *smoothed
        } else {
            *smoothed - sample.rtt
        };

        *variance = Duration::from_secs_f64(
            (1.0 - beta) * variance.as_secs_f64() + beta * diff.as_secs_f64(),
        );

        *smoothed = Duration::from_secs_f64(
            (1.0 - alpha) * smoothed.as_secs_f64() + alpha * sample.rtt.as_secs_f64(),
        );

        *loss = (1.0 - alpha) * *loss + alpha * sample.loss;

        drop(smoothed);
        drop(variance);
        drop(loss);
        drop(samples);

        *self.last_buffered.write() = sample.buffered_bytes;

        self.adjust_params();
    }

    /// Adjust transfer parameters based on network conditions
    fn adjust_params(&self) {
        let mut last_adj = self.last_adjustment.write();

        // Don't adjust too frequently
        if last_adj.elapsed() < self.config.adjustment_interval {
            return;
        }
        *last_adj = Instant::now();
        drop(last_adj);

        let smoothed_rtt = *self.smoothed_rtt.read();
        let rtt_ms = smoothed_rtt.as_millis() as u64;
        let loss = *self.smoothed_loss.read();
        let buffered = *self.last_buffered.read();

        let chunk_size = chunk_size_for(rtt_ms, loss)
            .clamp(self.config.min_chunk_size, self.config.max_chunk_size);

        let mut params = self.current_params.write();
        params.chunk_size = chunk_size;

        let congested =
            loss > 0.05 || rtt_ms > 150 || buffered > self.config.congested_buffer_bytes;
        if congested {
            params.channel_count = params
                .channel_count
                .saturating_sub(1)
                .max(self.config.min_channels);
            tracing::debug!(
                rtt_ms,
                loss,
                buffered,
                chunk_size = params.chunk_size,
                channels = params.channel_count,
                "reduced transfer params on congestion"
            );
        } else if rtt_ms < 50 && loss < 0.02 {
            params.channel_count = (params.channel_count + 1).min(self.config.max_channels);
            tracing::trace!(
                rtt_ms,
                chunk_size = params.chunk_size,
                channels = params.channel_count,
                "increased transfer params"
            );
        }
    }

    /// Get current transfer parameters
    pub fn current_params(&self) -> TransferParams {
        *self.current_params.read()
    }

    /// Get smoothed RTT
    pub fn smoothed_rtt(&self) -> Duration {
        *self.smoothed_rtt.read()
    }

    /// Get RTT variance
    pub fn rtt_variance(&self) -> Duration {
        *self.rtt_variance.read()
    }

    /// Get smoothed packet loss
    pub fn smoothed_loss(&self) -> f64 {
        *self.smoothed_loss.read()
    }

    /// Force a specific chunk size (for testing or manual override)
    pub fn set_chunk_size(&self, chunk_size: usize) {
        let mut params = self.current_params.write();
        params.chunk_size =
            chunk_size.clamp(self.config.min_chunk_size, self.config.max_chunk_size);
    }

    /// Force a specific channel count (for testing or manual override)
    pub fn set_channel_count(&self, channels: u8) {
        let mut params = self.current_params.write();
        params.channel_count = channels.clamp(self.config.min_channels, self.config.max_channels);
    }

    /// Get recent RTT statistics
    pub fn rtt_stats(&self) -> RttStats {
        let samples = self.rtt_samples.read();

        if samples.is_empty() {
            return RttStats::default();
        }

        let rtts: Vec<Duration> = samples.iter().map(|s| s.rtt).collect();
        let sum: Duration = rtts.iter().sum();
        let avg = sum / rtts.len() as u32;

        let min = rtts.iter().min().copied().unwrap_or_default();
        let max = rtts.iter().max().copied().unwrap_or_default();

        // Calculate jitter (average deviation)
        let jitter: Duration = if rtts.len() > 1 {
            let total_diff: Duration = rtts
                .windows(2)
                .map(|w| {
                    if w[1] > w[0] {
                        w[1] - w[0]
                    } else {
                        w[0] - w[1]
                    }
                })
                .sum();
            total_diff / (rtts.len() - 1) as u32
        } else {
            Duration::ZERO
        };

        RttStats {
            average: avg,
            min,
            max,
            jitter,
            sample_count: rtts.len(),
        }
    }
}

/// The chunk-size ladder: larger chunks only on links that can carry
/// them without turning one loss into a large retransmit
fn chunk_size_for(rtt_ms: u64, loss: f64) -> usize {
    if rtt_ms < 10 && loss < 0.01 {
        4 * 1024 * 1024
    } else if rtt_ms < 50 && loss < 0.05 {
        128 * 1024
    } else if rtt_ms < 100 && loss < 0.10 {
        64 * 1024
    } else if rtt_ms < 200 {
        32 * 1024
    } else {
        16 * 1024
    }
}

/// RTT statistics summary
#[derive(Debug, Clone, Default)]
pub struct RttStats {
    pub average: Duration,
    pub min: Duration,
    pub max: Duration,
    pub jitter: Duration,
    pub sample_count: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(rtt_ms: u64, loss: f64, buffered: usize) -> MetricSample {
        MetricSample {
            rtt: Duration::from_millis(rtt_ms),
            loss,
            buffered_bytes: buffered,
        }
    }

    #[test]
    fn ideal_link_reaches_largest_chunks() {
        let controller = AdaptiveChunkController::new(AdaptiveConfig::default());

        // The smoothed RTT starts at 50ms; it needs this many samples to
        // settle under the 10ms band.
        for _ in 0..30 {
            controller.record(sample(5, 0.0, 0));
            std::thread::sleep(Duration::from_millis(100));
        }

        let params = controller.current_params();
        assert_eq!(params.chunk_size, 4 * 1024 * 1024);
        assert_eq!(params.channel_count, MAX_DATA_CHANNELS as u8);
    }

    #[test]
    fn lossy_slow_link_falls_to_smallest_chunks() {
        let controller = AdaptiveChunkController::new(AdaptiveConfig::default());

        for _ in 0..20 {
            controller.record(sample(250, 0.15, 0));
            std::thread::sleep(Duration::from_millis(100));
        }

        let params = controller.current_params();
        assert_eq!(params.chunk_size, 16 * 1024);
        assert_eq!(params.channel_count, 1);
    }

    #[test]
    fn moderate_link_lands_mid_ladder() {
        let controller = AdaptiveChunkController::new(AdaptiveConfig::default());

        for _ in 0..20 {
            controller.record(sample(60, 0.02, 0));
            std::thread::sleep(Duration::from_millis(100));
        }

        assert_eq!(controller.current_params().chunk_size, 64 * 1024);
    }

    #[test]
    fn send_backlog_sheds_channels() {
        let controller = AdaptiveChunkController::new(AdaptiveConfig::default());

        for _ in 0..20 {
            controller.record(sample(20, 0.0, 16 * 1024 * 1024));
            std::thread::sleep(Duration::from_millis(100));
        }

        assert_eq!(controller.current_params().channel_count, 1);
    }

    #[test]
    fn back_to_back_samples_do_not_thrash_params() {
        let controller = AdaptiveChunkController::new(AdaptiveConfig::default());
        let initial = controller.current_params();

        controller.record(sample(250, 0.2, 0));
        controller.record(sample(5, 0.0, 0));

        assert_eq!(controller.current_params(), initial);
    }

    #[test]
    fn rtt_stats_report_jitter() {
        let controller = AdaptiveChunkController::new(AdaptiveConfig::default());
        for rtt_ms in [10, 20, 10, 20] {
            controller.record(sample(rtt_ms, 0.0, 0));
        }

        let stats = controller.rtt_stats();
        assert_eq!(stats.sample_count, 4);
        assert_eq!(stats.min, Duration::from_millis(10));
        assert_eq!(stats.max, Duration::from_millis(20));
        assert_eq!(stats.average, Duration::from_millis(15));
        assert_eq!(stats.jitter, Duration::from_millis(10));
    }
}
