//! Transfer measurement and bottleneck classification
//!
//! Every transfer carries a benchmark that samples throughput in short
//! windows, collects RTT and loss from the control channel, and counts
//! how often the sender hit the channel watermarks. At the end the
//! samples are folded into a [`TransferReport`] naming the dominant
//! limit on the run.

use std::time::{Duration, Instant};

/// Throughput window width for peak detection
const PEAK_WINDOW: Duration = Duration::from_millis(250);

/// Windows shorter than this are ignored for the peak; dividing by a
/// near-zero span would read a single chunk as an absurd burst
const MIN_WINDOW: Duration = Duration::from_millis(10);

/// Dominant limit on a finished transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BottleneckKind {
    /// Round trips dominated; more channels would help, a fatter pipe not
    Latency,
    /// Retransmission losses held throughput down
    Loss,
    /// The pipe itself was full; the sender sat at the watermark
    Bandwidth,
    /// The network had headroom the source never filled
    LocalIo,
    /// Not enough samples to tell
    Inconclusive,
}

/// Final numbers for one transfer
#[derive(Debug, Clone)]
pub struct TransferReport {
    pub bytes_moved: u64,
    pub chunks_moved: u32,
    pub elapsed: Duration,
    pub mean_throughput_bps: f64,
    pub peak_throughput_bps: f64,
    pub rtt_average: Duration,
    pub rtt_jitter: Duration,
    pub loss: f64,
    pub relay_used: bool,
    pub bottleneck: BottleneckKind,
}

/// Collects samples while a transfer runs.
///
/// Classification needs RTT samples, which only the pinging side
/// collects; the receive side's report keeps its throughput numbers but
/// always classifies as [`BottleneckKind::Inconclusive`].
pub struct TransferBenchmark {
    started: Instant,
    window_started: Instant,
    last_record: Instant,
    window_bytes: u64,
    bytes: u64,
    chunks: u32,
    sends: u32,
    backpressure_hits: u32,
    peak_bps: f64,
    rtt_sum: Duration,
    rtt_count: u32,
    rtt_last: Option<Duration>,
    jitter_sum: Duration,
    loss: f64,
    relay_used: bool,
}

impl TransferBenchmark {
    pub fn new() -> Self {
        let now = Instant::now();
        Self {
            started: now,
            window_started: now,
            last_record: now,
            window_bytes: 0,
            bytes: 0,
            chunks: 0,
            sends: 0,
            backpressure_hits: 0,
            peak_bps: 0.0,
            rtt_sum: Duration::ZERO,
            rtt_count: 0,
            rtt_last: None,
            jitter_sum: Duration::ZERO,
            loss: 0.0,
            relay_used: false,
        }
    }

    /// Record one chunk moved; `backpressured` marks a send that found
    /// the channels at or past the high watermark
    pub fn record_chunk(&mut self, bytes: u64, backpressured: bool) {
        let now = Instant::now();
        if now.duration_since(self.window_started) >= PEAK_WINDOW {
            self.fold_window();
            self.window_started = now;
            self.window_bytes = 0;
        }
        self.window_bytes += bytes;
        self.bytes += bytes;
        self.chunks += 1;
        self.sends += 1;
        if backpressured {
            self.backpressure_hits += 1;
        }
        self.last_record = now;
    }

    pub fn record_rtt(&mut self, rtt: Duration) {
        self.rtt_sum += rtt;
        self.rtt_count += 1;
        if let Some(last) = self.rtt_last {
            self.jitter_sum += rtt.abs_diff(last);
        }
        self.rtt_last = Some(rtt);
    }

    /// Latest smoothed loss fraction in `0.0..=1.0`
    pub fn record_loss(&mut self, loss: f64) {
        self.loss = loss.clamp(0.0, 1.0);
    }

    pub fn mark_relay(&mut self) {
        self.relay_used = true;
    }

    pub fn relay_used(&self) -> bool {
        self.relay_used
    }

    /// Fold the samples into a report
    pub fn finalize(&mut self) -> TransferReport {
        self.fold_window();
        let elapsed = self.started.elapsed();
        let mean_bps = if elapsed > Duration::ZERO {
            self.bytes as f64 * 8.0 / elapsed.as_secs_f64()
        } else {
            0.0
        };
        let peak_bps = self.peak_bps.max(mean_bps);
        let rtt_average = if self.rtt_count > 0 {
            self.rtt_sum / self.rtt_count
        } else {
            Duration::ZERO
        };
        let rtt_jitter = if self.rtt_count > 1 {
            self.jitter_sum / (self.rtt_count - 1)
        } else {
            Duration::ZERO
        };
        TransferReport {
            bytes_moved: self.bytes,
            chunks_moved: self.chunks,
            elapsed,
            mean_throughput_bps: mean_bps,
            peak_throughput_bps: peak_bps,
            rtt_average,
            rtt_jitter,
            loss: self.loss,
            relay_used: self.relay_used,
            bottleneck: self.classify(mean_bps, peak_bps, rtt_average),
        }
    }

    fn fold_window(&mut self) {
        let span = self.last_record.duration_since(self.window_started);
        if span >= MIN_WINDOW && self.window_bytes > 0 {
            let bps = self.window_bytes as f64 * 8.0 / span.as_secs_f64();
            if bps > self.peak_bps {
                self.peak_bps = bps;
            }
        }
    }

    // Thresholds, checked in order: loss at or past 2% dominates
    // everything; mean RTT at or past 100 ms points at latency; sends
    // blocked on the watermark half the time point at the pipe; a peak
    // more than twice the mean means the source fed the pipe in bursts
    // and the local side was the limit.
    fn classify(
        &self,
        mean_bps: f64,
        peak_bps: f64,
        rtt_average: Duration,
    ) -> BottleneckKind {
        if self.chunks == 0 || self.rtt_count == 0 {
            return BottleneckKind::Inconclusive;
        }
        if self.loss >= 0.02 {
            return BottleneckKind::Loss;
        }
        if rtt_average >= Duration::from_millis(100) {
            return BottleneckKind::Latency;
        }
        if self.backpressure_hits as f64 >= 0.5 * self.sends as f64 {
            return BottleneckKind::Bandwidth;
        }
        if mean_bps > 0.0 && peak_bps > 2.0 * mean_bps {
            return BottleneckKind::LocalIo;
        }
        BottleneckKind::Inconclusive
    }
}

impl Default for TransferBenchmark {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread::sleep;

    #[test]
    fn empty_run_is_inconclusive() {
        let mut bench = TransferBenchmark::new();
        let report = bench.finalize();
        assert_eq!(report.bottleneck, BottleneckKind::Inconclusive);
        assert_eq!(report.bytes_moved, 0);
        assert_eq!(report.mean_throughput_bps, 0.0);
    }

    #[test]
    fn totals_accumulate() {
        let mut bench = TransferBenchmark::new();
        bench.record_chunk(1000, false);
        bench.record_chunk(1000, false);
        bench.record_chunk(500, true);
        bench.record_rtt(Duration::from_millis(5));
        let report = bench.finalize();
        assert_eq!(report.bytes_moved, 2500);
        assert_eq!(report.chunks_moved, 3);
        assert!(report.mean_throughput_bps > 0.0);
    }

    #[test]
    fn loss_dominates_other_signals() {
        let mut bench = TransferBenchmark::new();
        bench.record_chunk(64 * 1024, true);
        bench.record_rtt(Duration::from_millis(150));
        bench.record_loss(0.05);
        let report = bench.finalize();
        assert_eq!(report.bottleneck, BottleneckKind::Loss);
    }

    #[test]
    fn high_rtt_reads_as_latency() {
        let mut bench = TransferBenchmark::new();
        bench.record_chunk(64 * 1024, false);
        bench.record_rtt(Duration::from_millis(120));
        bench.record_rtt(Duration::from_millis(140));
        bench.record_loss(0.001);
        let report = bench.finalize();
        assert_eq!(report.bottleneck, BottleneckKind::Latency);
        assert!(report.rtt_average >= Duration::from_millis(120));
    }

    #[test]
    fn watermark_pressure_reads_as_bandwidth() {
        let mut bench = TransferBenchmark::new();
        for _ in 0..4 {
            bench.record_chunk(64 * 1024, true);
        }
        bench.record_rtt(Duration::from_millis(5));
        let report = bench.finalize();
        assert_eq!(report.bottleneck, BottleneckKind::Bandwidth);
    }

    #[test]
    fn bursty_source_reads_as_local_io() {
        let mut bench = TransferBenchmark::new();
        for _ in 0..4 {
            bench.record_chunk(256 * 1024, false);
            sleep(Duration::from_millis(5));
        }
        bench.record_rtt(Duration::from_millis(5));
        // Idle tail: the network sat unused while nothing was produced
        sleep(Duration::from_millis(120));
        let report = bench.finalize();
        assert_eq!(report.bottleneck, BottleneckKind::LocalIo);
        assert!(report.peak_throughput_bps > 2.0 * report.mean_throughput_bps);
    }

    #[test]
    fn jitter_averages_rtt_deltas() {
        let mut bench = TransferBenchmark::new();
        bench.record_chunk(1024, false);
        bench.record_rtt(Duration::from_millis(10));
        bench.record_rtt(Duration::from_millis(30));
        bench.record_rtt(Duration::from_millis(10));
        let report = bench.finalize();
        assert_eq!(report.rtt_jitter, Duration::from_millis(20));
        assert!(report.rtt_average > Duration::from_millis(15));
    }
}
