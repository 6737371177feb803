//! # Interval Statistics
//!
//! The streaming statistics model behind every interval report.
//!
//! A worker owns one [`StatsAccumulator`] and feeds it per read, write or
//! datagram. At each interval boundary the accumulator closes the interval
//! into an immutable [`IntervalStats`] snapshot and starts a new one; at the
//! end of the test it produces a final snapshot covering the whole run.
//! [`DerivedMetrics::compute`] turns a snapshot into the reported
//! quantities: bandwidth, loss, transit mean/stdev, the Little's-Law queue
//! depth and the net-power score.
//!
//! Transit variance uses Welford's online algorithm so long runs stay
//! numerically stable without keeping samples. Guarded formulas never fail;
//! they return [`Metric::Undefined`] or [`Metric::OutOfBounds`].

use crate::config::Protocol;
use hdrhistogram::Histogram;
use serde::{Deserialize, Serialize};
use std::time::Instant;
use tracing::{trace, warn};

/// Scale factor of the net-power metric.
pub const NETPOWER_CONSTANT: f64 = 1e-6;

/// Queue depths below this are the product of desynchronized clocks.
pub const LLAW_LOWER_BOUND: f64 = -1e7;

/// Net-power values below this are the product of desynchronized clocks.
pub const NETPWR_LOWER_BOUND: f64 = -1e7;

/// Intervals ending before this many seconds report no bandwidth.
pub const SMALLEST_INTERVAL_SEC: f64 = 0.005;

/// Number of bins in the read-size histogram.
pub const READ_BINS: usize = 8;

/// Largest forward jump in datagram sequence numbers counted as loss.
/// Larger jumps come from corrupt or foreign frames.
pub const MAX_SEQ_JUMP: i64 = 1 << 24;

/// A derived value or the reason it could not be computed
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum Metric {
    Value(f64),
    /// An input made the formula meaningless (e.g. a zero divisor)
    Undefined,
    /// The result fell below the sanity floor
    OutOfBounds,
}

impl Metric {
    pub fn value(self) -> Option<f64> {
        match self {
            Metric::Value(v) => Some(v),
            _ => None,
        }
    }
}

impl std::fmt::Display for Metric {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Metric::Value(v) => match f.precision() {
                Some(p) => write!(f, "{:.*}", p, v),
                None => write!(f, "{:.0}", v),
            },
            Metric::Undefined => write!(f, "NAN"),
            Metric::OutOfBounds => write!(f, "OBL"),
        }
    }
}

/// Percentile value pair
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PercentileValue {
    pub percentile: f64,
    pub value_us: u64,
}

/// Running transit-time aggregate (seconds)
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct TransitStats {
    count: u64,
    sum: f64,
    mean: f64,
    m2: f64,
    min: f64,
    max: f64,
}

impl TransitStats {
    /// Fold one sample into the aggregate.
    pub fn record(&mut self, sample: f64) {
        self.count += 1;
        self.sum += sample;
        if self.count == 1 {
            self.min = sample;
            self.max = sample;
        } else {
            self.min = self.min.min(sample);
            self.max = self.max.max(sample);
        }
        let delta = sample - self.mean;
        self.mean += delta / self.count as f64;
        self.m2 += delta * (sample - self.mean);
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    pub fn sum(&self) -> f64 {
        self.sum
    }

    pub fn min(&self) -> f64 {
        self.min
    }

    pub fn max(&self) -> f64 {
        self.max
    }

    /// Sum of squared deviations from the running mean.
    pub fn m2(&self) -> f64 {
        self.m2
    }

    /// Mean transit, 0 with no samples.
    pub fn mean(&self) -> f64 {
        if self.count > 0 {
            self.sum / self.count as f64
        } else {
            0.0
        }
    }

    /// Sample variance, 0 with fewer than two samples.
    pub fn variance(&self) -> f64 {
        if self.count < 2 {
            0.0
        } else {
            self.m2 / (self.count - 1) as f64
        }
    }

    pub fn stdev(&self) -> f64 {
        self.variance().sqrt()
    }
}

/// RFC 3550 interarrival jitter estimate
#[derive(Debug, Clone, Copy, Default)]
pub struct JitterEstimator {
    last_transit: Option<f64>,
    jitter: f64,
}

impl JitterEstimator {
    /// Update with a transit sample and return the new estimate (seconds).
    pub fn update(&mut self, transit: f64) -> f64 {
        if let Some(last) = self.last_transit {
            let delta = (transit - last).abs();
            self.jitter += (delta - self.jitter) / 16.0;
        }
        self.last_transit = Some(transit);
        self.jitter
    }

    pub fn jitter(&self) -> f64 {
        self.jitter
    }
}

/// Isochronous frame counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IsochStats {
    pub frames: u64,
    pub frames_missed: u64,
    pub slips: u64,
}

/// Read call counter with a histogram of read sizes
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReadStats {
    pub count: u64,
    pub bins: [u64; READ_BINS],
}

impl ReadStats {
    /// Count a read of `n` bytes against a buffer of `buf_len` bytes.
    pub fn record(&mut self, n: usize, buf_len: usize) {
        let width = (buf_len / READ_BINS).max(1);
        let bin = (n / width).min(READ_BINS - 1);
        self.count += 1;
        self.bins[bin] += 1;
    }
}

/// Write call counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriteStats {
    pub count: u64,
    pub errors: u64,
}

/// Immutable snapshot of one reporting interval
#[derive(Debug, Clone, Serialize)]
pub struct IntervalStats {
    pub transfer_id: u64,
    pub protocol: Protocol,
    /// Interval start, seconds since the test began
    pub start: f64,
    /// Interval end, seconds since the test began
    pub end: f64,
    pub bytes: u64,
    pub datagrams: u64,
    pub errors: u64,
    pub out_of_order: u64,
    /// Seconds
    pub jitter: f64,
    pub transit: TransitStats,
    pub ipg_count: u64,
    /// Sum of inter-packet gaps, seconds
    pub ipg_sum: f64,
    pub isoch: IsochStats,
    pub reads: ReadStats,
    pub writes: WriteStats,
    pub is_final: bool,
    #[serde(skip)]
    pub transit_histogram: Option<Histogram<u64>>,
}

impl IntervalStats {
    /// An empty snapshot for the given stream and window.
    pub fn empty(transfer_id: u64, protocol: Protocol, start: f64, end: f64) -> Self {
        Self {
            transfer_id,
            protocol,
            start,
            end,
            bytes: 0,
            datagrams: 0,
            errors: 0,
            out_of_order: 0,
            jitter: 0.0,
            transit: TransitStats::default(),
            ipg_count: 0,
            ipg_sum: 0.0,
            isoch: IsochStats::default(),
            reads: ReadStats::default(),
            writes: WriteStats::default(),
            is_final: false,
            transit_histogram: None,
        }
    }

    pub fn duration(&self) -> f64 {
        self.end - self.start
    }

    /// Bytes per second over the interval.
    pub fn bytes_per_second(&self) -> f64 {
        let bytes = if self.end < SMALLEST_INTERVAL_SEC {
            0
        } else {
            self.bytes
        };
        let duration = self.duration();
        if duration > 0.0 {
            bytes as f64 / duration
        } else {
            0.0
        }
    }

    /// Transit percentiles in microseconds from the interval histogram.
    pub fn transit_percentiles(&self, percentiles: &[f64]) -> Vec<PercentileValue> {
        match &self.transit_histogram {
            Some(hist) if !hist.is_empty() => percentiles
                .iter()
                .map(|&p| PercentileValue {
                    percentile: p,
                    value_us: hist.value_at_percentile(p),
                })
                .collect(),
            _ => Vec::new(),
        }
    }
}

/// Loss ratio in percent.
pub fn loss_percent(errors: u64, datagrams: u64) -> Metric {
    if datagrams == 0 {
        return Metric::Undefined;
    }
    Metric::Value(100.0 * errors as f64 / datagrams as f64)
}

/// Little's-Law queue depth `L = lambda * W`.
pub fn queue_depth(lambda: f64, mean_transit: f64) -> Metric {
    let depth = lambda * mean_transit;
    if depth < LLAW_LOWER_BOUND {
        Metric::OutOfBounds
    } else {
        Metric::Value(depth)
    }
}

/// Queue depth in packets for datagram tests
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PacketQueueDepth {
    pub ipg_count: u64,
    pub depth: i64,
    pub depth_var: i64,
}

/// Little's-Law queue depth in packets with a spread term.
///
/// `lambda` is in packets per second; `stdev` is the transit standard
/// deviation in seconds.
pub fn queue_depth_packets(ipg_count: u64, lambda: i64, mean_transit: f64, stdev: f64) -> PacketQueueDepth {
    let depth = (lambda as f64 * mean_transit).round() as i64;
    let depth_var = if stdev > 0.0 {
        (lambda as f64 * stdev).round() as i64
    } else {
        0
    };
    PacketQueueDepth {
        ipg_count,
        depth,
        depth_var,
    }
}

/// Net power: throughput over latency, scaled by [`NETPOWER_CONSTANT`].
pub fn net_power(bytes: u64, interval_secs: f64, mean_transit: f64) -> Metric {
    if mean_transit == 0.0 || interval_secs <= 0.0 {
        return Metric::Undefined;
    }
    let power = NETPOWER_CONSTANT * (bytes as f64) / interval_secs / mean_transit;
    if power < NETPWR_LOWER_BOUND {
        Metric::OutOfBounds
    } else {
        Metric::Value(power)
    }
}

/// Plausible range for the minimum one-way transit (seconds)
///
/// Outside this range the sender and receiver clocks are assumed to be
/// unsynchronized and latency-derived metrics are suppressed.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LatencyBounds {
    pub min: f64,
    pub max: f64,
}

impl Default for LatencyBounds {
    fn default() -> Self {
        Self {
            min: -0.01,
            max: 60.0,
        }
    }
}

impl LatencyBounds {
    pub fn contains(&self, min_transit: f64) -> bool {
        min_transit >= self.min && min_transit <= self.max
    }
}

/// Queue depth estimate in the unit of the transport
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum QueueDepth {
    Bytes(Metric),
    Packets(PacketQueueDepth),
}

impl std::fmt::Display for QueueDepth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            QueueDepth::Bytes(Metric::Value(v)) => write!(f, "{}", crate::utils::format_bytes_f64(*v)),
            QueueDepth::Bytes(other) => write!(f, "{}", other),
            QueueDepth::Packets(p) => write!(f, "{}/{}({}) pkts", p.ipg_count, p.depth, p.depth_var),
        }
    }
}

/// Latency-derived metrics of an interval with plausible transit times
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LatencySummary {
    pub mean_ms: f64,
    pub min_ms: f64,
    pub max_ms: f64,
    pub stdev_ms: f64,
    pub samples: u64,
    pub queue_depth: QueueDepth,
    pub net_power: Metric,
}

/// Whether latency metrics are reported for an interval
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum LatencyView {
    /// No samples, or samples outside [`LatencyBounds`]
    Suppressed,
    Full(LatencySummary),
}

/// Quantities reported for one interval
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DerivedMetrics {
    pub bytes_per_second: f64,
    pub loss_percent: Metric,
    pub jitter_ms: f64,
    pub packets_per_second: Metric,
    pub latency: LatencyView,
}

impl DerivedMetrics {
    /// Derive the reported quantities from a closed interval.
    pub fn compute(stats: &IntervalStats, bounds: &LatencyBounds) -> Self {
        let packets_per_second = if stats.ipg_count > 0 && stats.ipg_sum > 0.0 {
            Metric::Value(stats.ipg_count as f64 / stats.ipg_sum)
        } else {
            Metric::Undefined
        };
        let no_gaps = stats.protocol == Protocol::Udp && stats.ipg_count == 0;
        let jitter_ms = if no_gaps { 0.0 } else { stats.jitter * 1e3 };

        let plausible = stats.transit.count() > 0 && bounds.contains(stats.transit.min());
        let latency = if no_gaps || !plausible {
            LatencyView::Suppressed
        } else {
            LatencyView::Full(Self::latency_summary(stats))
        };

        Self {
            bytes_per_second: stats.bytes_per_second(),
            loss_percent: loss_percent(stats.errors, stats.datagrams),
            jitter_ms,
            packets_per_second,
            latency,
        }
    }

    fn latency_summary(stats: &IntervalStats) -> LatencySummary {
        let transit = &stats.transit;
        let mean = transit.mean();
        let queue_depth = match stats.protocol {
            Protocol::Tcp => {
                let lambda = if stats.ipg_sum > 0.0 {
                    stats.bytes as f64 / stats.ipg_sum
                } else {
                    0.0
                };
                QueueDepth::Bytes(queue_depth(lambda, mean))
            }
            Protocol::Udp => {
                let lambda = if stats.ipg_sum > 0.0 {
                    (stats.ipg_count as f64 / stats.ipg_sum).round() as i64
                } else {
                    0
                };
                QueueDepth::Packets(queue_depth_packets(stats.ipg_count, lambda, mean, transit.stdev()))
            }
        };
        LatencySummary {
            mean_ms: mean * 1e3,
            min_ms: transit.min() * 1e3,
            max_ms: transit.max() * 1e3,
            stdev_ms: transit.stdev() * 1e3,
            samples: transit.count(),
            queue_depth,
            net_power: net_power(stats.bytes, stats.duration(), mean),
        }
    }
}

/// Mutable counters behind one snapshot
#[derive(Debug, Clone)]
struct Counters {
    bytes: u64,
    datagrams: u64,
    errors: u64,
    out_of_order: u64,
    transit: TransitStats,
    ipg_count: u64,
    ipg_sum: f64,
    isoch: IsochStats,
    reads: ReadStats,
    writes: WriteStats,
    histogram: Option<Histogram<u64>>,
}

impl Counters {
    fn new(with_histogram: bool) -> Self {
        let histogram = if with_histogram {
            match Histogram::<u64>::new(3) {
                Ok(hist) => Some(hist),
                Err(e) => {
                    warn!("transit histogram disabled: {}", e);
                    None
                }
            }
        } else {
            None
        };
        Self {
            bytes: 0,
            datagrams: 0,
            errors: 0,
            out_of_order: 0,
            transit: TransitStats::default(),
            ipg_count: 0,
            ipg_sum: 0.0,
            isoch: IsochStats::default(),
            reads: ReadStats::default(),
            writes: WriteStats::default(),
            histogram,
        }
    }

    fn record_transit(&mut self, sample: f64) {
        self.transit.record(sample);
        if let Some(hist) = &mut self.histogram {
            let micros = (sample * 1e6).max(0.0) as u64;
            hist.saturating_record(micros);
        }
    }

    fn snapshot(&self, transfer_id: u64, protocol: Protocol, start: f64, end: f64, jitter: f64) -> IntervalStats {
        IntervalStats {
            transfer_id,
            protocol,
            start,
            end,
            bytes: self.bytes,
            datagrams: self.datagrams,
            errors: self.errors,
            out_of_order: self.out_of_order,
            jitter,
            transit: self.transit,
            ipg_count: self.ipg_count,
            ipg_sum: self.ipg_sum,
            isoch: self.isoch,
            reads: self.reads,
            writes: self.writes,
            is_final: false,
            transit_histogram: self.histogram.clone(),
        }
    }
}

/// Live per-worker accumulator producing interval snapshots
pub struct StatsAccumulator {
    transfer_id: u64,
    protocol: Protocol,
    buf_len: usize,
    origin: Instant,
    interval_start: f64,
    current: Counters,
    total: Counters,
    jitter: JitterEstimator,
    last_arrival: Option<Instant>,
    next_seq: i64,
}

impl StatsAccumulator {
    /// Start accumulating; `origin` is the instant the timed phase began.
    pub fn new(transfer_id: u64, protocol: Protocol, buf_len: usize, origin: Instant) -> Self {
        Self {
            transfer_id,
            protocol,
            buf_len,
            origin,
            interval_start: 0.0,
            current: Counters::new(true),
            total: Counters::new(true),
            jitter: JitterEstimator::default(),
            last_arrival: None,
            next_seq: 0,
        }
    }

    /// Seconds since the timed phase began.
    pub fn elapsed_at(&self, now: Instant) -> f64 {
        now.saturating_duration_since(self.origin).as_secs_f64()
    }

    fn both(&mut self, f: impl Fn(&mut Counters)) {
        f(&mut self.current);
        f(&mut self.total);
    }

    fn record_gap(&mut self, now: Instant) {
        if let Some(last) = self.last_arrival {
            let gap = now.saturating_duration_since(last).as_secs_f64();
            self.both(|c| {
                c.ipg_count += 1;
                c.ipg_sum += gap;
            });
        }
        self.last_arrival = Some(now);
    }

    /// Count a successful read of `n` bytes.
    pub fn record_read(&mut self, n: usize, now: Instant) {
        let buf_len = self.buf_len;
        self.both(|c| {
            c.bytes += n as u64;
            c.reads.record(n, buf_len);
        });
        self.record_gap(now);
    }

    /// Count a write of `n` bytes.
    pub fn record_write(&mut self, n: usize) {
        self.both(|c| {
            c.bytes += n as u64;
            c.writes.count += 1;
        });
    }

    pub fn record_write_error(&mut self) {
        self.both(|c| c.writes.errors += 1);
    }

    /// Count a received datagram with sequence number `seq` and one-way
    /// transit `transit` seconds.
    ///
    /// A sequence number more than [`MAX_SEQ_JUMP`] ahead of the expected
    /// one only adds its bytes; loss, ordering and latency ignore it.
    pub fn record_datagram(&mut self, n: usize, seq: i64, transit: f64, now: Instant) {
        self.both(|c| c.bytes += n as u64);
        let seq = match seq.checked_abs() {
            Some(seq) if seq - self.next_seq <= MAX_SEQ_JUMP => seq,
            _ => {
                trace!(
                    "stream {} ignoring sequence {} (expected {})",
                    self.transfer_id,
                    seq,
                    self.next_seq
                );
                return;
            }
        };
        self.both(|c| c.datagrams += 1);
        if seq >= self.next_seq {
            let lost = (seq - self.next_seq) as u64;
            if lost > 0 {
                self.both(|c| {
                    c.errors += lost;
                    c.datagrams += lost;
                });
            }
            self.next_seq = seq.saturating_add(1);
        } else {
            // a late arrival was already counted as lost
            self.both(|c| {
                c.out_of_order += 1;
                c.errors = c.errors.saturating_sub(1);
                c.datagrams = c.datagrams.saturating_sub(1);
            });
        }
        self.record_gap(now);
        self.record_transit(transit);
        self.jitter.update(transit);
    }

    /// Record a bare transit (or connect time) sample.
    pub fn record_transit(&mut self, sample: f64) {
        self.both(|c| c.record_transit(sample));
    }

    /// Record one sent isochronous frame, the frame slots it overran and
    /// whether it finished outside its own slot.
    pub fn record_frame(&mut self, missed: u64, slipped: bool) {
        self.both(|c| {
            c.isoch.frames += 1;
            c.isoch.frames_missed += missed;
            if slipped {
                c.isoch.slips += 1;
            }
        });
    }

    /// Close the current interval at `now` and start the next one.
    pub fn close_interval(&mut self, now: Instant) -> IntervalStats {
        let end = self.elapsed_at(now);
        let stats = self.current.snapshot(
            self.transfer_id,
            self.protocol,
            self.interval_start,
            end,
            self.jitter.jitter(),
        );
        self.current = Counters::new(true);
        self.interval_start = end;
        stats
    }

    /// Snapshot of the whole run ending at `now`.
    pub fn finish(&self, now: Instant) -> IntervalStats {
        let mut stats = self.total.snapshot(
            self.transfer_id,
            self.protocol,
            0.0,
            self.elapsed_at(now),
            self.jitter.jitter(),
        );
        stats.is_final = true;
        stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{Rng, SeedableRng};
    use std::time::Duration;

    fn direct_variance(samples: &[f64]) -> f64 {
        let n = samples.len() as f64;
        let mean = samples.iter().sum::<f64>() / n;
        samples.iter().map(|x| (x - mean).powi(2)).sum::<f64>() / (n - 1.0)
    }

    #[test]
    fn test_welford_matches_two_pass() {
        let mut rng = rand::rngs::StdRng::seed_from_u64(7);
        for len in [2usize, 3, 17, 1000, 20_000] {
            let samples: Vec<f64> = (0..len).map(|_| 0.05 + rng.gen::<f64>() * 1e-3).collect();
            let mut stats = TransitStats::default();
            samples.iter().for_each(|&s| stats.record(s));
            let expected = direct_variance(&samples);
            let rel = ((stats.variance() - expected) / expected).abs();
            assert!(rel < 1e-9, "len {} rel error {}", len, rel);
        }
    }

    #[test]
    fn test_transit_small_counts() {
        let mut stats = TransitStats::default();
        assert_eq!(stats.mean(), 0.0);
        assert_eq!(stats.variance(), 0.0);
        stats.record(0.002);
        assert_eq!(stats.variance(), 0.0);
        assert_eq!(stats.min(), 0.002);
        assert_eq!(stats.max(), 0.002);
        stats.record(0.004);
        assert!((stats.mean() - 0.003).abs() < 1e-12);
        assert!((stats.variance() - 2e-6).abs() < 1e-15);
        assert_eq!(stats.min(), 0.002);
        assert_eq!(stats.max(), 0.004);
    }

    #[test]
    fn test_loss_guard() {
        assert_eq!(loss_percent(0, 0), Metric::Undefined);
        assert_eq!(loss_percent(5, 0), Metric::Undefined);
        assert_eq!(loss_percent(1, 4), Metric::Value(25.0));
    }

    #[test]
    fn test_queue_depth_guards() {
        assert_eq!(queue_depth(0.0, 123.0), Metric::Value(0.0));
        assert_eq!(queue_depth(0.0, -5e9), Metric::Value(0.0));
        assert_eq!(queue_depth(1e6, -20.0), Metric::OutOfBounds);
        assert_eq!(queue_depth(1000.0, 0.01), Metric::Value(10.0));
    }

    #[test]
    fn test_net_power() {
        assert_eq!(net_power(125_000, 1.0, 0.0), Metric::Undefined);
        let power = net_power(125_000, 1.0, 0.001).value().unwrap();
        assert!((power - NETPOWER_CONSTANT * 125_000.0 / 0.001).abs() < 1e-9);
        assert!((power - 125.0).abs() < 1e-9);
        assert_eq!(net_power(1 << 40, 1.0, -1e-6), Metric::OutOfBounds);
    }

    #[test]
    fn test_packet_queue_depth() {
        let depth = queue_depth_packets(100, 1000, 0.0105, 0.002);
        assert_eq!(depth, PacketQueueDepth { ipg_count: 100, depth: 11, depth_var: 2 });
        let flat = queue_depth_packets(5, 1000, 0.01, 0.0);
        assert_eq!(flat.depth_var, 0);
    }

    #[test]
    fn test_metric_display() {
        assert_eq!(Metric::Undefined.to_string(), "NAN");
        assert_eq!(Metric::OutOfBounds.to_string(), "OBL");
        assert_eq!(Metric::Value(124.6).to_string(), "125");
        assert_eq!(format!("{:.2}", Metric::Value(1.234)), "1.23");
    }

    #[test]
    fn test_read_bins() {
        let mut reads = ReadStats::default();
        reads.record(0, 8192);
        reads.record(1024, 8192);
        reads.record(8192, 8192);
        reads.record(100_000, 8192);
        assert_eq!(reads.count, 4);
        assert_eq!(reads.bins[0], 1);
        assert_eq!(reads.bins[1], 1);
        assert_eq!(reads.bins[7], 2);
    }

    #[test]
    fn test_jitter_estimator() {
        let mut jitter = JitterEstimator::default();
        assert_eq!(jitter.update(0.010), 0.0);
        let j = jitter.update(0.026);
        assert!((j - 0.001).abs() < 1e-12);
    }

    fn udp_stats(min_transit: f64) -> IntervalStats {
        let mut stats = IntervalStats::empty(1, Protocol::Udp, 0.0, 1.0);
        stats.bytes = 125_000;
        stats.datagrams = 100;
        stats.errors = 2;
        stats.ipg_count = 99;
        stats.ipg_sum = 0.99;
        stats.jitter = 0.0005;
        stats.transit.record(min_transit);
        stats.transit.record(min_transit + 0.002);
        stats
    }

    #[test]
    fn test_derived_full_metrics() {
        let derived = DerivedMetrics::compute(&udp_stats(0.001), &LatencyBounds::default());
        assert_eq!(derived.bytes_per_second, 125_000.0);
        assert_eq!(derived.loss_percent, Metric::Value(2.0));
        assert!((derived.jitter_ms - 0.5).abs() < 1e-12);
        match derived.latency {
            LatencyView::Full(summary) => {
                assert!((summary.mean_ms - 2.0).abs() < 1e-9);
                assert_eq!(summary.samples, 2);
                assert!(matches!(summary.queue_depth, QueueDepth::Packets(_)));
                assert!(summary.net_power.value().is_some());
            }
            LatencyView::Suppressed => panic!("expected full latency metrics"),
        }
    }

    #[test]
    fn test_derived_suppresses_unrealistic_latency() {
        let bounds = LatencyBounds::default();
        let skewed = DerivedMetrics::compute(&udp_stats(-3.0), &bounds);
        assert_eq!(skewed.latency, LatencyView::Suppressed);
        assert_eq!(skewed.loss_percent, Metric::Value(2.0));
        let far = DerivedMetrics::compute(&udp_stats(120.0), &bounds);
        assert_eq!(far.latency, LatencyView::Suppressed);
    }

    #[test]
    fn test_derived_without_gaps() {
        let stats = IntervalStats::empty(1, Protocol::Udp, 0.0, 1.0);
        let derived = DerivedMetrics::compute(&stats, &LatencyBounds::default());
        assert_eq!(derived.latency, LatencyView::Suppressed);
        assert_eq!(derived.loss_percent, Metric::Undefined);
        assert_eq!(derived.packets_per_second, Metric::Undefined);
        assert_eq!(derived.jitter_ms, 0.0);
    }

    #[test]
    fn test_tiny_interval_reports_no_bandwidth() {
        let mut stats = IntervalStats::empty(1, Protocol::Tcp, 0.0, 0.001);
        stats.bytes = 10_000;
        assert_eq!(stats.bytes_per_second(), 0.0);
        stats.end = 0.0;
        assert_eq!(stats.bytes_per_second(), 0.0);
    }

    #[test]
    fn test_accumulator_intervals_and_totals() {
        let origin = Instant::now();
        let mut acc = StatsAccumulator::new(9, Protocol::Tcp, 8192, origin);
        acc.record_read(4096, origin + Duration::from_millis(10));
        acc.record_read(8192, origin + Duration::from_millis(20));
        let first = acc.close_interval(origin + Duration::from_secs(1));
        assert_eq!(first.bytes, 12_288);
        assert_eq!(first.reads.count, 2);
        assert_eq!(first.ipg_count, 1);
        assert_eq!(first.start, 0.0);
        assert!((first.end - 1.0).abs() < 1e-9);

        acc.record_read(100, origin + Duration::from_millis(1500));
        let second = acc.close_interval(origin + Duration::from_secs(2));
        assert_eq!(second.bytes, 100);
        assert!((second.start - 1.0).abs() < 1e-9);

        let total = acc.finish(origin + Duration::from_secs(2));
        assert!(total.is_final);
        assert_eq!(total.bytes, 12_388);
        assert_eq!(total.reads.count, 3);
        assert_eq!(total.transfer_id, 9);
    }

    #[test]
    fn test_datagram_loss_and_reordering() {
        let origin = Instant::now();
        let mut acc = StatsAccumulator::new(1, Protocol::Udp, 1470, origin);
        let at = |ms| origin + Duration::from_millis(ms);
        acc.record_datagram(1470, 0, 0.001, at(1));
        acc.record_datagram(1470, 1, 0.001, at(2));
        acc.record_datagram(1470, 4, 0.001, at(3));
        acc.record_datagram(1470, 2, 0.001, at(4));
        let stats = acc.close_interval(at(1000));
        assert_eq!(stats.errors, 1);
        assert_eq!(stats.out_of_order, 1);
        assert_eq!(stats.datagrams, 5);
        assert_eq!(stats.transit.count(), 4);
        assert_eq!(stats.transit_percentiles(&[50.0])[0].percentile, 50.0);
    }

    #[test]
    fn test_frame_counters() {
        let origin = Instant::now();
        let mut acc = StatsAccumulator::new(1, Protocol::Udp, 1470, origin);
        acc.record_frame(0, false);
        acc.record_frame(3, true);
        acc.record_frame(0, true);
        let stats = acc.close_interval(origin + Duration::from_secs(1));
        assert_eq!(stats.isoch, IsochStats { frames: 3, frames_missed: 3, slips: 2 });
        assert_eq!(acc.finish(origin + Duration::from_secs(1)).isoch, stats.isoch);
    }

    #[test]
    fn test_datagram_sequence_extremes() {
        let origin = Instant::now();
        let mut acc = StatsAccumulator::new(1, Protocol::Udp, 100, origin);
        let at = |ms| origin + Duration::from_millis(ms);
        acc.record_datagram(100, 0, 0.001, at(1));
        acc.record_datagram(100, i64::MAX, 0.001, at(2));
        acc.record_datagram(100, i64::MIN, 0.001, at(3));
        acc.record_datagram(100, 1, 0.001, at(4));
        acc.record_datagram(100, 3, 0.001, at(5));
        let stats = acc.finish(at(1000));
        assert_eq!(stats.bytes, 500);
        assert_eq!(stats.errors, 1);
        assert_eq!(stats.datagrams, 4);
        assert_eq!(stats.out_of_order, 0);
        assert_eq!(stats.transit.count(), 3);

        // a jump within the window is still loss
        let mut acc = StatsAccumulator::new(2, Protocol::Udp, 100, origin);
        acc.record_datagram(100, MAX_SEQ_JUMP, 0.001, at(1));
        let stats = acc.finish(at(1000));
        assert_eq!(stats.errors as i64, MAX_SEQ_JUMP);
    }

    #[test]
    fn test_derived_tcp_queue_depth() {
        let mut stats = IntervalStats::empty(1, Protocol::Tcp, 0.0, 1.0);
        stats.bytes = 125_000;
        stats.ipg_count = 99;
        stats.ipg_sum = 0.5;
        stats.transit.record(0.001);
        stats.transit.record(0.003);

        let derived = DerivedMetrics::compute(&stats, &LatencyBounds::default());
        assert_eq!(derived.packets_per_second, Metric::Value(198.0));
        match derived.latency {
            LatencyView::Full(summary) => match summary.queue_depth {
                // 250000 B/s arriving for a mean of 2 ms
                QueueDepth::Bytes(Metric::Value(depth)) => assert!((depth - 500.0).abs() < 1e-6),
                other => panic!("unexpected queue depth {:?}", other),
            },
            LatencyView::Suppressed => panic!("expected full latency metrics"),
        }

        stats.ipg_count = 0;
        stats.ipg_sum = 0.0;
        let derived = DerivedMetrics::compute(&stats, &LatencyBounds::default());
        assert_eq!(derived.packets_per_second, Metric::Undefined);
        match derived.latency {
            LatencyView::Full(summary) => {
                assert_eq!(summary.queue_depth, QueueDepth::Bytes(Metric::Value(0.0)))
            }
            LatencyView::Suppressed => panic!("TCP latency does not depend on gaps"),
        }
    }
}
