//! # Reports and the Reporter Thread
//!
//! Workers hand finished interval snapshots to a [`ReportSink`]. The
//! production sink is a [`ReporterHandle`]: a dedicated thread that owns the
//! receiving end of a crossbeam channel, logs one line per record and
//! optionally streams every record as a JSON line to a file.
//!
//! Parallel streams of one test additionally fold their final totals into a
//! shared [`SumReport`]. Sum reports live in a [`ReportArena`] keyed by
//! group; the arena hands out `Arc` handles and produces the [`SumRecord`]
//! when the last holder releases its handle.

use crate::cli::ReportFormat;
use crate::config::{Protocol, TestConfig, ThreadMode};
use crate::metrics::{loss_percent, DerivedMetrics, IntervalStats, LatencyView, Metric, PercentileValue};
use crate::utils::{format_bitrate, format_bytes, format_bytes_f64};
use anyhow::{Context, Result};
use crossbeam::channel::{unbounded, Receiver, Sender};
use parking_lot::{Condvar, Mutex};
use serde::Serialize;
use std::collections::HashMap;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::PathBuf;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Percentiles attached to final records with plausible transit times.
const REPORTED_PERCENTILES: [f64; 3] = [50.0, 90.0, 99.0];

/// What an interval record measures
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum RecordKind {
    Traffic,
    /// Connect-only test: the transit accumulator holds connect times
    ConnectTimes { attempts: u64, errors: u64 },
}

/// One finished interval of one stream
#[derive(Debug, Clone, Serialize)]
pub struct IntervalRecord {
    pub transfer_id: u64,
    pub group_id: Uuid,
    pub role: ThreadMode,
    /// Stream label, e.g. `[  3]` or `[  3][RX-C]`
    pub tag: String,
    pub kind: RecordKind,
    pub timestamp: chrono::DateTime<chrono::Utc>,
    pub stats: IntervalStats,
    pub derived: DerivedMetrics,
    pub percentiles: Vec<PercentileValue>,
}

/// Label identifying a stream and its direction in report lines.
pub fn stream_tag(config: &TestConfig) -> String {
    let id = format!("[{:>3}]", config.transfer_id);
    let duplex = config.flags.reverse || config.flags.bidir || config.flags.server_reverse;
    if !duplex {
        return id;
    }
    let side = if config.host.is_some() { 'C' } else { 'S' };
    let direction = match config.role {
        ThreadMode::Client => "TX",
        _ => "RX",
    };
    format!("{}[{}-{}]", id, direction, side)
}

impl IntervalRecord {
    /// Wrap a closed interval of the worker running `config`.
    pub fn new(config: &TestConfig, stats: IntervalStats) -> Self {
        let derived = DerivedMetrics::compute(&stats, &config.latency_bounds);
        let percentiles = match derived.latency {
            LatencyView::Full(_) if stats.is_final => stats.transit_percentiles(&REPORTED_PERCENTILES),
            _ => Vec::new(),
        };
        Self {
            transfer_id: config.transfer_id,
            group_id: config.group_id,
            role: config.role,
            tag: stream_tag(config),
            kind: RecordKind::Traffic,
            timestamp: chrono::Utc::now(),
            stats,
            derived,
            percentiles,
        }
    }

    /// Final record of a connect-only test.
    pub fn connect_times(config: &TestConfig, stats: IntervalStats, errors: u64) -> Self {
        let attempts = stats.transit.count() + errors;
        let mut record = Self::new(config, stats);
        record.kind = RecordKind::ConnectTimes { attempts, errors };
        record
    }
}

/// Which aggregate a [`SumReport`] collects
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum SumKind {
    /// All parallel streams of one test
    Group,
    /// Both directions of one full-duplex stream
    Bidir(u64),
}

#[derive(Debug, Clone, Default)]
struct SumTotals {
    streams: u32,
    bytes: u64,
    datagrams: u64,
    errors: u64,
    out_of_order: u64,
    start: Option<f64>,
    end: f64,
    protocol: Option<Protocol>,
}

/// Aggregate shared by the contributing streams of one test
#[derive(Debug)]
pub struct SumReport {
    group_id: Uuid,
    kind: SumKind,
    totals: Mutex<SumTotals>,
}

/// Finished aggregate
#[derive(Debug, Clone, Serialize)]
pub struct SumRecord {
    pub group_id: Uuid,
    pub kind: SumKind,
    pub streams: u32,
    pub start: f64,
    pub end: f64,
    pub bytes: u64,
    pub datagrams: u64,
    pub errors: u64,
    pub out_of_order: u64,
    pub bytes_per_second: f64,
    pub loss_percent: Metric,
    pub protocol: Option<Protocol>,
}

impl SumReport {
    pub fn new(group_id: Uuid, kind: SumKind) -> Self {
        Self {
            group_id,
            kind,
            totals: Mutex::new(SumTotals::default()),
        }
    }

    /// Fold a stream's final snapshot into the aggregate.
    pub fn contribute(&self, stats: &IntervalStats) {
        let mut totals = self.totals.lock();
        totals.streams += 1;
        totals.bytes += stats.bytes;
        totals.datagrams += stats.datagrams;
        totals.errors += stats.errors;
        totals.out_of_order += stats.out_of_order;
        totals.start = Some(totals.start.map_or(stats.start, |s| s.min(stats.start)));
        totals.end = totals.end.max(stats.end);
        totals.protocol.get_or_insert(stats.protocol);
    }

    pub fn record(&self) -> SumRecord {
        let totals = self.totals.lock().clone();
        let start = totals.start.unwrap_or(0.0);
        let duration = totals.end - start;
        SumRecord {
            group_id: self.group_id,
            kind: self.kind,
            streams: totals.streams,
            start,
            end: totals.end,
            bytes: totals.bytes,
            datagrams: totals.datagrams,
            errors: totals.errors,
            out_of_order: totals.out_of_order,
            bytes_per_second: if duration > 0.0 {
                totals.bytes as f64 / duration
            } else {
                0.0
            },
            loss_percent: loss_percent(totals.errors, totals.datagrams),
            protocol: totals.protocol,
        }
    }
}

/// Owner of the live sum reports
#[derive(Debug, Default)]
pub struct ReportArena {
    reports: Mutex<HashMap<(Uuid, SumKind), Arc<SumReport>>>,
}

impl ReportArena {
    pub fn new() -> Self {
        Self::default()
    }

    /// Handle to the report for `group_id`, creating it on first use.
    pub fn acquire(&self, group_id: Uuid, kind: SumKind) -> Arc<SumReport> {
        let mut reports = self.reports.lock();
        Arc::clone(
            reports
                .entry((group_id, kind))
                .or_insert_with(|| Arc::new(SumReport::new(group_id, kind))),
        )
    }

    /// Give back a handle. The last holder gets the finished record.
    ///
    /// ## Returns
    ///
    /// - `Some(SumRecord)`: `report` was the last outstanding handle; the
    ///   report has left the arena
    /// - `None`: other streams still hold the report, or it was already drained
    pub fn release(&self, report: Arc<SumReport>) -> Option<SumRecord> {
        let mut reports = self.reports.lock();
        let key = (report.group_id, report.kind);
        let tracked = reports.get(&key).map_or(false, |r| Arc::ptr_eq(r, &report));
        // one reference is ours, one is the arena's
        if tracked && Arc::strong_count(&report) <= 2 {
            reports.remove(&key);
            debug!("sum report {:?} for {} finalized", report.kind, report.group_id);
            return Some(report.record());
        }
        None
    }

    /// Finalize every report still held by the arena.
    pub fn drain(&self) -> Vec<SumRecord> {
        let mut reports = self.reports.lock();
        reports.drain().map(|(_, report)| report.record()).collect()
    }

    pub fn len(&self) -> usize {
        self.reports.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Consumer of finished records
pub trait ReportSink: Send + Sync {
    fn deliver(&self, record: IntervalRecord);

    fn deliver_sum(&self, record: SumRecord);
}

/// One-shot readiness signal with a tick-based wait
#[derive(Debug, Default)]
pub struct ReadyFlag {
    ready: Mutex<bool>,
    cond: Condvar,
}

impl ReadyFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self) {
        *self.ready.lock() = true;
        self.cond.notify_all();
    }

    pub fn is_set(&self) -> bool {
        *self.ready.lock()
    }

    /// Wait up to `ticks` ticks of length `tick`. Returns whether the flag
    /// was set.
    pub fn wait_ticks(&self, ticks: u32, tick: Duration) -> bool {
        let mut ready = self.ready.lock();
        let mut remaining = ticks;
        while !*ready {
            if remaining == 0 {
                return false;
            }
            let _ = self.cond.wait_for(&mut ready, tick);
            remaining -= 1;
        }
        true
    }
}

/// Counts of what the reporter emitted
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RunSummary {
    pub intervals: usize,
    pub finals: usize,
    pub sums: usize,
    pub total_bytes: u64,
}

/// Reporter thread settings
#[derive(Debug, Clone, Default)]
pub struct ReporterOptions {
    pub format: ReportFormat,
    pub json: Option<PathBuf>,
}

enum ReportMessage {
    Interval(IntervalRecord),
    Sum(SumRecord),
    Shutdown,
}

#[derive(Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum JsonLine<'a> {
    Interval(&'a IntervalRecord),
    Sum(&'a SumRecord),
}

/// Channel end given to workers
#[derive(Clone)]
pub struct ReporterSink {
    tx: Sender<ReportMessage>,
}

impl ReportSink for ReporterSink {
    fn deliver(&self, record: IntervalRecord) {
        if self.tx.send(ReportMessage::Interval(record)).is_err() {
            debug!("reporter gone, interval record dropped");
        }
    }

    fn deliver_sum(&self, record: SumRecord) {
        if self.tx.send(ReportMessage::Sum(record)).is_err() {
            debug!("reporter gone, sum record dropped");
        }
    }
}

/// Handle to the running reporter thread
pub struct ReporterHandle {
    sink: ReporterSink,
    ready: Arc<ReadyFlag>,
    thread: JoinHandle<RunSummary>,
}

impl ReporterHandle {
    pub fn sink(&self) -> Arc<dyn ReportSink> {
        Arc::new(self.sink.clone())
    }

    /// Readiness flag workers wait on before starting traffic.
    pub fn ready(&self) -> Arc<ReadyFlag> {
        Arc::clone(&self.ready)
    }

    /// Flush outstanding records and stop the thread.
    pub fn finish(self) -> Result<RunSummary> {
        let _ = self.sink.tx.send(ReportMessage::Shutdown);
        self.thread
            .join()
            .map_err(|_| anyhow::anyhow!("reporter thread panicked"))
    }
}

/// Formats and streams records on its own thread
pub struct Reporter {
    format: ReportFormat,
    json: Option<BufWriter<File>>,
    summary: RunSummary,
}

impl Reporter {
    pub fn spawn(options: ReporterOptions) -> Result<ReporterHandle> {
        let json = match &options.json {
            Some(path) => {
                let file = File::create(path)
                    .with_context(|| format!("failed to create JSON output {}", path.display()))?;
                info!("Streaming interval records to: {}", path.display());
                Some(BufWriter::new(file))
            }
            None => None,
        };
        let reporter = Reporter {
            format: options.format,
            json,
            summary: RunSummary::default(),
        };

        let (tx, rx) = unbounded();
        let ready = Arc::new(ReadyFlag::new());
        let thread_ready = Arc::clone(&ready);
        let thread = std::thread::Builder::new()
            .name("reporter".into())
            .spawn(move || reporter.run(rx, thread_ready))
            .context("failed to spawn reporter thread")?;

        Ok(ReporterHandle {
            sink: ReporterSink { tx },
            ready,
            thread,
        })
    }

    fn run(mut self, rx: Receiver<ReportMessage>, ready: Arc<ReadyFlag>) -> RunSummary {
        ready.set();
        debug!("reporter ready");
        for message in rx.iter() {
            match message {
                ReportMessage::Interval(record) => self.handle_interval(&record),
                ReportMessage::Sum(record) => self.handle_sum(&record),
                ReportMessage::Shutdown => break,
            }
        }
        if let Some(json) = &mut self.json {
            if let Err(e) = json.flush() {
                warn!("failed to flush JSON output: {}", e);
            }
        }
        self.summary
    }

    fn handle_interval(&mut self, record: &IntervalRecord) {
        if record.stats.is_final {
            self.summary.finals += 1;
            self.summary.total_bytes += record.stats.bytes;
        } else {
            self.summary.intervals += 1;
        }
        info!("{}", format_interval(record, self.format));
        self.write_json(&JsonLine::Interval(record));
    }

    fn handle_sum(&mut self, record: &SumRecord) {
        self.summary.sums += 1;
        info!("{}", format_sum(record, self.format));
        self.write_json(&JsonLine::Sum(record));
    }

    fn write_json(&mut self, line: &JsonLine<'_>) {
        if let Some(json) = &mut self.json {
            let written = serde_json::to_writer(&mut *json, line)
                .map_err(std::io::Error::from)
                .and_then(|_| json.write_all(b"\n"));
            if let Err(e) = written {
                warn!("failed to write JSON record: {}", e);
            }
        }
    }
}

/// Human-readable line for one interval record.
pub fn format_interval(record: &IntervalRecord, format: ReportFormat) -> String {
    let stats = &record.stats;
    let derived = &record.derived;

    if let RecordKind::ConnectTimes { attempts, errors } = record.kind {
        let t = &stats.transit;
        return format!(
            "[ CT] final connect times (min/avg/max/stdev) = {:.3}/{:.3}/{:.3}/{:.3} ms (tot/err) = {}/{}",
            t.min() * 1e3,
            t.mean() * 1e3,
            t.max() * 1e3,
            t.stdev() * 1e3,
            attempts,
            errors
        );
    }

    let mut line = format!(
        "{} {:6.2}-{:<6.2} sec  {:>10}  {}",
        record.tag,
        stats.start,
        stats.end,
        format_bytes(stats.bytes),
        format_bitrate(derived.bytes_per_second, format)
    );

    match stats.protocol {
        Protocol::Tcp => {
            if stats.reads.count > 0 {
                let bins: Vec<String> = stats.reads.bins.iter().map(|b| b.to_string()).collect();
                line.push_str(&format!("  {}    {}", stats.reads.count, bins.join(":")));
            } else if stats.writes.count > 0 {
                line.push_str(&format!("  {}/{}", stats.writes.count, stats.writes.errors));
            }
        }
        Protocol::Udp => {
            line.push_str(&format!(
                "  {:.3} ms  {}/{} ({:.2}%)",
                derived.jitter_ms,
                stats.errors,
                stats.datagrams,
                derived.loss_percent
            ));
            if stats.out_of_order > 0 {
                line.push_str(&format!("  {} OOO", stats.out_of_order));
            }
        }
    }

    if let LatencyView::Full(latency) = &derived.latency {
        line.push_str(&format!(
            "  {:.3}/{:.3}/{:.3}/{:.3} ms  {}  {} pps  {:.2} NetPwr",
            latency.mean_ms,
            latency.min_ms,
            latency.max_ms,
            latency.stdev_ms,
            latency.queue_depth,
            derived.packets_per_second,
            latency.net_power
        ));
    }
    if stats.isoch.frames > 0 {
        line.push_str(&format!(
            "  {}/{}/{} frames (tot/miss/slip)",
            stats.isoch.frames, stats.isoch.frames_missed, stats.isoch.slips
        ));
    }
    if !record.percentiles.is_empty() {
        let p: Vec<String> = record
            .percentiles
            .iter()
            .map(|p| format!("p{}={}us", p.percentile, p.value_us))
            .collect();
        line.push_str(&format!("  ({})", p.join(" ")));
    }
    line
}

/// Human-readable line for one sum record.
pub fn format_sum(record: &SumRecord, format: ReportFormat) -> String {
    let tag = match record.kind {
        SumKind::Group => "[SUM]".to_string(),
        SumKind::Bidir(id) => format!("[SUM-{}][BD]", id),
    };
    let mut line = format!(
        "{} {:6.2}-{:<6.2} sec  {:>10}  {}",
        tag,
        record.start,
        record.end,
        format_bytes(record.bytes),
        format_bitrate(record.bytes_per_second, format)
    );
    if record.protocol == Some(Protocol::Udp) {
        line.push_str(&format!(
            "  {}/{} ({:.2}%)",
            record.errors, record.datagrams, record.loss_percent
        ));
    }
    line
}

/// Settings lines logged when a listener starts.
pub fn listener_banner(config: &TestConfig) -> Vec<String> {
    let mut lines = vec![format!(
        "Server listening on {} port {}",
        config.protocol, config.port
    )];
    if let Some(bind) = &config.bind {
        lines.push(format!("Binding to local address {}", bind));
    }
    lines.push(format!(
        "Read buffer size: {} (Dist bin width={})",
        format_bytes(config.buf_len as u64),
        format_bytes_f64(config.buf_len as f64 / 8.0)
    ));
    if config.flags.single_client {
        match config.protocol {
            Protocol::Udp => lines.push(
                "WARN: Suggested to use lower case -u instead of -U (to avoid serialize & bypass of reporter thread)"
                    .to_string(),
            ),
            Protocol::Tcp => {
                lines.push("Server set to single client traffic mode (serialize traffic tests)".to_string())
            }
        }
    }
    lines
}

/// Settings lines logged when a client starts.
pub fn client_banner(config: &TestConfig) -> Vec<String> {
    let mut lines = vec![format!(
        "Client connecting to {}, {} port {} with {} thread{}",
        config.host.as_deref().unwrap_or("?"),
        config.protocol,
        config.port,
        config.threads,
        if config.threads == 1 { "" } else { "s" }
    )];
    match config.protocol {
        Protocol::Tcp => lines.push(format!("Write buffer size: {}", format_bytes(config.buf_len as u64))),
        Protocol::Udp => lines.push(format!("Sending {} byte datagrams", config.buf_len)),
    }
    if config.flags.bidir {
        lines.push("Full-duplex traffic over one socket (--bidir)".to_string());
    } else if config.flags.reverse {
        lines.push("Reverse mode: server transmits, client receives".to_string());
    } else if config.flags.write_ack {
        lines.push("Write acknowledgements enabled".to_string());
    }
    if let Some(holdback) = config.tx_holdback {
        lines.push(format!("Transmit holdback: {:.3} s", holdback.as_secs_f64()));
    }
    if config.flags.single_client {
        lines.push("WARN: Client set to bypass reporter thread per -U (suggest use lower case -u instead)".to_string());
    }
    if config.flags.connect_only {
        lines.push("TCP three-way-handshake (3WHS) only".to_string());
    }
    lines
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::IntervalStats;
    use std::thread;

    fn final_stats(bytes: u64, start: f64, end: f64) -> IntervalStats {
        let mut stats = IntervalStats::empty(1, Protocol::Tcp, start, end);
        stats.bytes = bytes;
        stats.is_final = true;
        stats
    }

    #[test]
    fn test_arena_last_release_finalizes() {
        let arena = ReportArena::new();
        let group = Uuid::new_v4();
        let a = arena.acquire(group, SumKind::Group);
        let b = arena.acquire(group, SumKind::Group);
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(arena.len(), 1);

        a.contribute(&final_stats(1000, 0.0, 1.0));
        b.contribute(&final_stats(3000, 0.5, 2.0));

        assert!(arena.release(a).is_none());
        let record = arena.release(b).unwrap();
        assert_eq!(record.streams, 2);
        assert_eq!(record.bytes, 4000);
        assert_eq!(record.start, 0.0);
        assert_eq!(record.end, 2.0);
        assert_eq!(record.bytes_per_second, 2000.0);
        assert!(arena.is_empty());
    }

    #[test]
    fn test_arena_keys_are_independent() {
        let arena = ReportArena::new();
        let group = Uuid::new_v4();
        let sum = arena.acquire(group, SumKind::Group);
        let bidir = arena.acquire(group, SumKind::Bidir(7));
        assert!(!Arc::ptr_eq(&sum, &bidir));
        assert_eq!(arena.release(bidir).unwrap().kind, SumKind::Bidir(7));
        assert_eq!(arena.len(), 1);
        assert_eq!(arena.drain().len(), 1);
    }

    #[test]
    fn test_ready_flag() {
        let flag = Arc::new(ReadyFlag::new());
        assert!(!flag.wait_ticks(2, Duration::from_millis(5)));
        let setter = Arc::clone(&flag);
        let handle = thread::spawn(move || setter.set());
        assert!(flag.wait_ticks(100, Duration::from_millis(50)));
        handle.join().unwrap();
        assert!(flag.is_set());
    }

    #[test]
    fn test_stream_tags() {
        let mut config = TestConfig {
            transfer_id: 3,
            host: Some("h".into()),
            ..TestConfig::default()
        };
        assert_eq!(stream_tag(&config), "[  3]");
        config.flags.bidir = true;
        assert_eq!(stream_tag(&config), "[  3][TX-C]");
        config.role = ThreadMode::Server;
        assert_eq!(stream_tag(&config), "[  3][RX-C]");
        config.host = None;
        assert_eq!(stream_tag(&config), "[  3][RX-S]");
    }

    #[test]
    fn test_listener_banner_single_client() {
        let mut config = TestConfig {
            role: ThreadMode::Listener,
            ..TestConfig::default()
        };
        config.flags.single_client = true;
        let tcp = listener_banner(&config);
        assert!(tcp.iter().any(|l| l.contains("serialize traffic tests")));

        config.protocol = Protocol::Udp;
        let udp = listener_banner(&config);
        assert_eq!(udp.iter().filter(|l| l.contains("-U")).count(), 1);
        assert!(!udp.iter().any(|l| l.contains("serialize traffic tests")));
    }

    #[test]
    fn test_format_connect_times() {
        let config = TestConfig::default();
        let mut stats = IntervalStats::empty(1, Protocol::Tcp, 0.0, 1.0);
        stats.transit.record(0.001);
        stats.transit.record(0.003);
        stats.is_final = true;
        let record = IntervalRecord::connect_times(&config, stats, 1);
        let line = format_interval(&record, ReportFormat::Adaptive);
        assert!(line.starts_with("[ CT] final connect times"));
        assert!(line.contains("1.000/2.000/3.000/"));
        assert!(line.ends_with("(tot/err) = 3/1"));
    }

    #[test]
    fn test_format_isochronous_frames() {
        let config = TestConfig::default();
        let mut stats = IntervalStats::empty(1, Protocol::Udp, 0.0, 1.0);
        stats.writes.count = 60;
        let plain = format_interval(&IntervalRecord::new(&config, stats.clone()), ReportFormat::Adaptive);
        assert!(!plain.contains("frames"));

        stats.isoch = crate::metrics::IsochStats {
            frames: 60,
            frames_missed: 2,
            slips: 1,
        };
        let line = format_interval(&IntervalRecord::new(&config, stats), ReportFormat::Adaptive);
        assert!(line.contains("60/2/1 frames (tot/miss/slip)"));
    }

    #[test]
    fn test_reporter_streams_json_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("records.json");
        let handle = Reporter::spawn(ReporterOptions {
            format: ReportFormat::Mega,
            json: Some(path.clone()),
        })
        .unwrap();
        assert!(handle.ready().wait_ticks(50, Duration::from_millis(100)));

        let sink = handle.sink();
        let config = TestConfig::default();
        sink.deliver(IntervalRecord::new(&config, IntervalStats::empty(1, Protocol::Tcp, 0.0, 1.0)));
        sink.deliver(IntervalRecord::new(&config, final_stats(5000, 0.0, 1.0)));
        let arena = ReportArena::new();
        let sum = arena.acquire(config.group_id, SumKind::Group);
        sum.contribute(&final_stats(5000, 0.0, 1.0));
        sink.deliver_sum(arena.release(sum).unwrap());

        let summary = handle.finish().unwrap();
        assert_eq!(
            summary,
            RunSummary {
                intervals: 1,
                finals: 1,
                sums: 1,
                total_bytes: 5000
            }
        );

        let contents = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<serde_json::Value> = contents
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[0]["type"], "interval");
        assert_eq!(lines[2]["type"], "sum");
        assert_eq!(lines[2]["bytes"], 5000);
    }
}
