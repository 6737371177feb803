//! # Traffic Loops
//!
//! The measurement loops run by workers once a socket is connected:
//!
//! - [`ServerWorker`] receives until end of stream, optionally answering
//!   each complete buffer with a write-ack.
//! - [`run_client_transfer`] transmits framed buffers until the byte count
//!   or the test duration is reached. An isochronous sender paces one
//!   buffer per frame at a fixed frame rate.
//! - [`connect_periodic`] times repeated connects for connect-only tests.
//!
//! When a record carries a full-duplex barrier, each loop arrives at it
//! once before the first byte and once after the last, so both directions
//! of a bidir test start and stop together. Every loop delivers interval
//! records to the sink as the interval clock fires, and a final record
//! covering the whole run.

use crate::config::{Protocol, TestConfig, TestMode};
use crate::error::{Result, TestError};
use crate::metrics::{IntervalStats, StatsAccumulator};
use crate::net::{decode_frame, encode_frame, SocketHandle, Transport, FRAME_HEADER_LEN};
use crate::results::{IntervalRecord, ReportSink};
use crate::utils::current_timestamp_ns;
use std::io;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, trace, warn};

/// Longest a receive loop blocks before re-checking its clocks.
const POLL: Duration = Duration::from_millis(100);

/// Copies of the end-of-stream datagram sent by a UDP client.
const UDP_FIN_COUNT: usize = 3;

/// A byte-bound UDP receiver gives up after this long without a datagram.
const UDP_IDLE: Duration = Duration::from_secs(10);

/// Fires once per reporting interval
#[derive(Debug)]
struct IntervalClock {
    interval: Option<Duration>,
    next: Option<Instant>,
}

impl IntervalClock {
    fn new(interval: Option<Duration>, origin: Instant) -> Self {
        Self {
            interval,
            next: interval.map(|i| origin + i),
        }
    }

    fn due(&mut self, now: Instant) -> bool {
        match (self.next, self.interval) {
            (Some(next), Some(interval)) if now >= next => {
                self.next = Some(next + interval);
                true
            }
            _ => false,
        }
    }

    /// Read timeout that never sleeps past the next boundary.
    fn poll_timeout(&self, now: Instant) -> Duration {
        match self.next {
            Some(next) => next
                .saturating_duration_since(now)
                .clamp(Duration::from_millis(1), POLL),
            None => POLL,
        }
    }
}

/// Frame slots of an isochronous sender
///
/// Frame `k` owns the slot `[k * period, (k + 1) * period)` after `origin`.
/// A frame finished after its slot ended is a slip, and slots that passed
/// entirely while it was sent are missed frames.
#[derive(Debug)]
struct FrameClock {
    origin: Instant,
    period: Duration,
    frame: u64,
}

impl FrameClock {
    fn new(fps: f64, origin: Instant) -> Self {
        Self {
            origin,
            period: Duration::try_from_secs_f64(1.0 / fps)
                .unwrap_or(Duration::MAX)
                .max(Duration::from_nanos(1)),
            frame: 0,
        }
    }

    /// Start of the slot of the next frame to send.
    fn frame_start(&self) -> Instant {
        let offset = self.period.as_nanos().saturating_mul(u128::from(self.frame));
        self.origin + Duration::from_nanos(u64::try_from(offset).unwrap_or(u64::MAX))
    }

    /// Close the current frame at `now`, returning the missed frame slots
    /// and whether the frame slipped.
    fn advance(&mut self, now: Instant) -> (u64, bool) {
        let elapsed = now.saturating_duration_since(self.origin).as_nanos();
        let slot = u64::try_from(elapsed / self.period.as_nanos()).unwrap_or(u64::MAX);
        let (missed, slipped) = if slot > self.frame {
            (slot - self.frame - 1, true)
        } else {
            (0, false)
        };
        self.frame = slot.max(self.frame + 1);
        (missed, slipped)
    }
}

fn test_socket(config: &TestConfig) -> Result<SocketHandle> {
    config
        .socket
        .clone()
        .ok_or_else(|| TestError::FatalConfig(format!("stream {} has no socket", config.transfer_id)))
}

fn arrive(config: &TestConfig, phase: &str) {
    if let Some(barrier) = &config.barrier {
        barrier.arrive_or_abort(phase);
    }
}

fn one_way_transit(sent_ns: u64) -> f64 {
    (current_timestamp_ns() as i128 - sent_ns as i128) as f64 / 1e9
}

fn finish(config: &TestConfig, acc: &StatsAccumulator, sink: &dyn ReportSink) -> IntervalStats {
    let stats = acc.finish(Instant::now());
    sink.deliver(IntervalRecord::new(config, stats.clone()));
    stats
}

/// Receive side of a stream
pub struct ServerWorker<'a> {
    config: &'a TestConfig,
    sink: &'a dyn ReportSink,
    ack: bool,
}

impl<'a> ServerWorker<'a> {
    pub fn new(config: &'a TestConfig, sink: &'a dyn ReportSink) -> Self {
        Self {
            config,
            sink,
            ack: false,
        }
    }

    /// Answer each complete buffer with a write-ack.
    pub fn with_acks(mut self, ack: bool) -> Self {
        self.ack = ack;
        self
    }

    /// Receive until end of stream and return the final totals.
    pub fn run(&self) -> Result<IntervalStats> {
        let socket = test_socket(self.config)?;
        arrive(self.config, "start");

        let origin = Instant::now();
        let deadline = match self.config.mode {
            TestMode::Time(duration) => Some(origin + duration),
            TestMode::Bytes(_) => None,
        };
        let mut acc = StatsAccumulator::new(
            self.config.transfer_id,
            self.config.protocol,
            self.config.buf_len,
            origin,
        );
        let mut clock = IntervalClock::new(self.config.interval, origin);
        let mut buf = vec![0u8; self.config.buf_len.max(FRAME_HEADER_LEN)];
        let ack_step = self.config.buf_len.max(1) as u64;
        let mut received = 0u64;
        let mut next_ack = ack_step;
        let mut last_datagram = origin;

        debug!("stream {} receiving on {}", self.config.transfer_id, socket.describe());
        loop {
            let now = Instant::now();
            if deadline.map_or(false, |d| now >= d) {
                debug!("stream {} reached its receive deadline", self.config.transfer_id);
                break;
            }
            socket.set_read_timeout(Some(clock.poll_timeout(now)))?;
            match socket.read(&mut buf) {
                Ok(0) if self.config.protocol == Protocol::Tcp => break,
                Ok(0) => {}
                Ok(n) => {
                    let now = Instant::now();
                    match self.config.protocol {
                        Protocol::Tcp => {
                            acc.record_read(n, now);
                            if self.ack {
                                received += n as u64;
                                while received >= next_ack {
                                    socket.send_ack(received)?;
                                    next_ack += ack_step;
                                }
                            }
                        }
                        Protocol::Udp => match decode_frame(&buf[..n]) {
                            Some((seq, _)) if seq < 0 => {
                                debug!("stream {} saw end of stream", self.config.transfer_id);
                                break;
                            }
                            Some((seq, sent_ns)) => {
                                acc.record_datagram(n, seq, one_way_transit(sent_ns), now);
                                last_datagram = now;
                            }
                            None => trace!("short datagram of {} bytes", n),
                        },
                    }
                }
                Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) => {}
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => {
                    warn!("stream {} receive failed: {}", self.config.transfer_id, e);
                    break;
                }
            }
            let now = Instant::now();
            if deadline.is_none()
                && self.config.protocol == Protocol::Udp
                && now.saturating_duration_since(last_datagram) >= UDP_IDLE
            {
                warn!("stream {} idle for {:?}, ending receive", self.config.transfer_id, UDP_IDLE);
                break;
            }
            if clock.due(now) {
                self.sink
                    .deliver(IntervalRecord::new(self.config, acc.close_interval(now)));
            }
        }

        if self.ack {
            if let Err(e) = socket.shutdown_write() {
                debug!("ack stream shutdown: {}", e);
            }
        }
        arrive(self.config, "stop");
        Ok(finish(self.config, &acc, self.sink))
    }
}

/// Transmit side of a stream. Returns the final totals.
pub fn run_client_transfer(config: &TestConfig, sink: &dyn ReportSink) -> Result<IntervalStats> {
    let socket = test_socket(config)?;
    arrive(config, "start");
    if let Some(holdback) = config.tx_holdback {
        debug!("stream {} holding back {:?}", config.transfer_id, holdback);
        thread::sleep(holdback);
    }

    let origin = Instant::now();
    let mut acc = StatsAccumulator::new(config.transfer_id, config.protocol, config.buf_len, origin);
    let mut clock = IntervalClock::new(config.interval, origin);
    let mut buf = vec![0u8; config.buf_len.max(FRAME_HEADER_LEN)];
    for (i, byte) in buf.iter_mut().enumerate().skip(FRAME_HEADER_LEN) {
        *byte = b'0' + (i % 10) as u8;
    }
    let (deadline, mut remaining) = match config.mode {
        TestMode::Time(duration) => (Some(origin + duration), u64::MAX),
        TestMode::Bytes(bytes) => (None, bytes),
    };
    let mut seq: i64 = 0;
    let mut frames = config.isoch_fps.map(|fps| FrameClock::new(fps, origin));

    debug!("stream {} sending on {}", config.transfer_id, socket.describe());
    while remaining > 0 {
        if let Some(frames) = &frames {
            let start = frames.frame_start();
            let wake = deadline.map_or(start, |d| start.min(d));
            let now = Instant::now();
            if wake > now {
                thread::sleep(wake - now);
            }
        }
        let now = Instant::now();
        if deadline.map_or(false, |d| now >= d) {
            break;
        }
        let len = (buf.len() as u64).min(remaining) as usize;
        let len = match config.protocol {
            Protocol::Udp => len.max(FRAME_HEADER_LEN),
            Protocol::Tcp => len,
        };
        if len >= FRAME_HEADER_LEN {
            encode_frame(&mut buf, seq, current_timestamp_ns());
        }
        match socket.write(&buf[..len]) {
            Ok(n) => {
                acc.record_write(n);
                remaining = remaining.saturating_sub(n as u64);
                seq += 1;
                if let Some(frames) = &mut frames {
                    let (missed, slipped) = frames.advance(Instant::now());
                    acc.record_frame(missed, slipped);
                }
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) if config.protocol == Protocol::Udp && e.kind() != io::ErrorKind::ConnectionRefused => {
                trace!("datagram write failed: {}", e);
                acc.record_write_error();
            }
            Err(e) => {
                warn!("stream {} write failed: {}", config.transfer_id, e);
                acc.record_write_error();
                break;
            }
        }
        let now = Instant::now();
        if clock.due(now) {
            sink.deliver(IntervalRecord::new(config, acc.close_interval(now)));
        }
    }

    match config.protocol {
        Protocol::Tcp => {
            if let Err(e) = socket.shutdown_write() {
                debug!("stream {} shutdown: {}", config.transfer_id, e);
            }
        }
        Protocol::Udp => {
            for _ in 0..UDP_FIN_COUNT {
                encode_frame(&mut buf, -seq.max(1), current_timestamp_ns());
                if let Err(e) = socket.write(&buf[..FRAME_HEADER_LEN]) {
                    debug!("end-of-stream datagram failed: {}", e);
                    break;
                }
                thread::sleep(Duration::from_millis(10));
            }
        }
    }
    arrive(config, "stop");
    Ok(finish(config, &acc, sink))
}

/// Time `connect_count` connects and report them once.
pub fn connect_periodic(config: &TestConfig, transport: &dyn Transport, sink: &dyn ReportSink) -> Result<IntervalStats> {
    let origin = Instant::now();
    let mut acc = StatsAccumulator::new(config.transfer_id, config.protocol, config.buf_len, origin);
    let mut errors = 0u64;
    for attempt in 0..config.connect_count {
        if attempt > 0 {
            if let Some(interval) = config.interval {
                thread::sleep(interval);
            }
        }
        let start = Instant::now();
        match transport.connect(config) {
            Ok(socket) => {
                acc.record_transit(start.elapsed().as_secs_f64());
                drop(socket);
            }
            Err(e) => {
                debug!("connect {} failed: {}", attempt, e);
                errors += 1;
            }
        }
    }
    let stats = acc.finish(Instant::now());
    sink.deliver(IntervalRecord::connect_times(config, stats.clone(), errors));
    Ok(stats)
}
