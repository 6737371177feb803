//! # Per-Worker Test Configuration
//!
//! [`TestConfig`] is the record every worker thread receives. The settings
//! layer builds one template from the command line
//! ([`TestConfig::from_args`]); the replicator in [`crate::launch`] copies it
//! per parallel stream, and the coordinator in [`crate::reverse`] derives
//! companion records from it. Shared state travels with the record as `Arc`
//! handles: the socket, the group and bidir sum reports, the full-duplex
//! barrier and the connect-sync barrier.

use crate::barrier::{ConnectBarrier, RendezvousBarrier};
use crate::cli::{Args, ReportFormat};
use crate::metrics::LatencyBounds;
use crate::net::SocketHandle;
use crate::results::SumReport;
use crate::utils::{validate_buffer_len, validate_parallel, validate_port};
use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr, SocketAddr, ToSocketAddrs};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

static NEXT_TRANSFER_ID: AtomicU64 = AtomicU64::new(1);

/// Allocate a process-unique transfer id for a worker record.
pub fn next_transfer_id() -> u64 {
    NEXT_TRANSFER_ID.fetch_add(1, Ordering::Relaxed)
}

/// Worker role a record is dispatched to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ThreadMode {
    Listener,
    Server,
    Client,
    WriteAckServer,
    WriteAckClient,
}

impl std::fmt::Display for ThreadMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ThreadMode::Listener => write!(f, "listener"),
            ThreadMode::Server => write!(f, "server"),
            ThreadMode::Client => write!(f, "client"),
            ThreadMode::WriteAckServer => write!(f, "write-ack server"),
            ThreadMode::WriteAckClient => write!(f, "write-ack client"),
        }
    }
}

/// Transport protocol of a test
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Protocol {
    Tcp,
    Udp,
}

impl std::fmt::Display for Protocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Protocol::Tcp => write!(f, "TCP"),
            Protocol::Udp => write!(f, "UDP"),
        }
    }
}

/// What bounds the length of a test
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TestMode {
    /// Stop after this many bytes
    Bytes(u64),
    /// Stop after this much time
    Time(Duration),
}

/// Direction and behavior flags carried by a record
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestFlags {
    pub reverse: bool,
    pub bidir: bool,
    pub server_reverse: bool,
    pub write_ack: bool,
    pub connect_only: bool,
    pub skip_connect_sync: bool,
    pub incr_dst_ip: bool,
    pub dual_test: bool,
    pub tradeoff: bool,
    /// Listener-spawned client that dials the peer's own listener
    pub connect_back: bool,
    pub single_client: bool,
    pub realtime: bool,
}

/// Configuration record handed to one worker thread
#[derive(Debug, Clone)]
pub struct TestConfig {
    /// Identifies this stream in interval records
    pub transfer_id: u64,
    /// Logical test the stream belongs to; keys the group sum report
    pub group_id: Uuid,
    pub role: ThreadMode,
    pub protocol: Protocol,
    /// Peer to connect to (clients) or None for listeners
    pub host: Option<String>,
    pub port: u16,
    pub bind: Option<String>,
    /// Per-stream destination address increment
    pub dst_ip_offset: u32,
    pub buf_len: usize,
    pub mode: TestMode,
    pub interval: Option<Duration>,
    /// Number of parallel client streams in the test
    pub threads: usize,
    pub flags: TestFlags,
    /// Delay between connect and the first transmitted byte
    pub tx_holdback: Option<Duration>,
    /// Frame rate of an isochronous sender
    pub isoch_fps: Option<f64>,
    /// Connects performed in connect-only mode
    pub connect_count: usize,
    pub max_accepts: Option<usize>,
    /// First CPU core for traffic threads
    pub affinity: Option<usize>,
    pub latency_bounds: LatencyBounds,
    pub format: ReportFormat,
    pub socket: Option<SocketHandle>,
    pub sum_report: Option<Arc<SumReport>>,
    pub bidir_report: Option<Arc<SumReport>>,
    pub barrier: Option<Arc<RendezvousBarrier>>,
    pub connect_barrier: Option<Arc<ConnectBarrier>>,
}

impl Default for TestConfig {
    fn default() -> Self {
        Self {
            transfer_id: 0,
            group_id: Uuid::nil(),
            role: ThreadMode::Client,
            protocol: Protocol::Tcp,
            host: None,
            port: crate::defaults::PORT,
            bind: None,
            dst_ip_offset: 0,
            buf_len: crate::defaults::BUF_LEN,
            mode: TestMode::Time(crate::defaults::DURATION),
            interval: None,
            threads: 1,
            flags: TestFlags::default(),
            tx_holdback: None,
            isoch_fps: None,
            connect_count: 1,
            max_accepts: None,
            affinity: None,
            latency_bounds: LatencyBounds::default(),
            format: ReportFormat::Adaptive,
            socket: None,
            sum_report: None,
            bidir_report: None,
            barrier: None,
            connect_barrier: None,
        }
    }
}

impl TestConfig {
    /// Build the template record from validated command-line arguments.
    pub fn from_args(args: &Args) -> Result<Self> {
        validate_port(args.port)?;
        validate_buffer_len(args.len)?;
        validate_parallel(args.parallel)?;

        let role = match (&args.client, args.server) {
            (Some(_), false) => ThreadMode::Client,
            (None, true) => ThreadMode::Listener,
            _ => return Err(anyhow!("exactly one of --server or --client must be given")),
        };
        if args.bidir && args.write_ack {
            return Err(anyhow!("--bidir and --write-ack cannot be combined"));
        }
        if args.udp && args.write_ack {
            return Err(anyhow!("--write-ack requires TCP"));
        }
        if args.connect_only && args.udp {
            return Err(anyhow!("--connect-only requires TCP"));
        }
        if args.dualtest && args.tradeoff {
            return Err(anyhow!("--dualtest and --tradeoff cannot be combined"));
        }
        if (args.dualtest || args.tradeoff) && (args.reverse || args.bidir || args.write_ack || args.connect_only) {
            return Err(anyhow!(
                "--dualtest and --tradeoff cannot be combined with --reverse, --bidir, --write-ack or --connect-only"
            ));
        }

        if let Some(fps) = args.isochronous {
            if !(fps.is_finite() && fps > 0.0) {
                return Err(anyhow!("--isochronous needs a positive frame rate, got {}", fps));
            }
        }

        // Byte count takes precedence over time
        let mode = match (args.num, args.time) {
            (Some(bytes), _) => TestMode::Bytes(bytes),
            (None, Some(time)) => TestMode::Time(time),
            (None, None) => TestMode::Time(crate::defaults::DURATION),
        };

        let flags = TestFlags {
            // bidir runs over the reverse machinery
            reverse: args.reverse || args.bidir,
            bidir: args.bidir,
            server_reverse: false,
            write_ack: args.write_ack,
            connect_only: args.connect_only,
            skip_connect_sync: args.no_connect_sync,
            incr_dst_ip: args.incr_dstip,
            dual_test: args.dualtest,
            tradeoff: args.tradeoff,
            connect_back: false,
            single_client: args.single_client,
            realtime: args.realtime,
        };

        Ok(Self {
            transfer_id: next_transfer_id(),
            group_id: Uuid::new_v4(),
            role,
            protocol: if args.udp { Protocol::Udp } else { Protocol::Tcp },
            host: args.client.clone(),
            port: args.port,
            bind: args.bind.clone(),
            buf_len: args.len,
            mode,
            interval: args.interval.filter(|i| !i.is_zero()),
            threads: args.parallel,
            flags,
            tx_holdback: args.txholdback.filter(|d| !d.is_zero()),
            isoch_fps: args.isochronous,
            connect_count: args.connect_count.max(1),
            max_accepts: args.max_accepts,
            affinity: args.affinity,
            format: args.format,
            ..Self::default()
        })
    }

    /// Whether a companion listener must run alongside this client.
    pub fn needs_listener(&self) -> bool {
        self.role == ThreadMode::Client && (self.flags.dual_test || self.flags.tradeoff)
    }

    /// Settings for the local listener of a legacy dual or tradeoff test.
    pub fn listener_settings(&self) -> Option<TestConfig> {
        if !self.needs_listener() {
            return None;
        }
        let mut listener = self.stream_copy();
        listener.role = ThreadMode::Listener;
        listener.host = None;
        listener.flags.dual_test = false;
        listener.flags.tradeoff = false;
        listener.flags.reverse = false;
        listener.flags.bidir = false;
        listener.max_accepts = Some(self.threads);
        listener.connect_barrier = None;
        listener.sum_report = None;
        Some(listener)
    }

    /// Copy for another stream of the same test with a fresh transfer id.
    pub fn stream_copy(&self) -> TestConfig {
        let mut copy = self.clone();
        copy.transfer_id = next_transfer_id();
        copy.socket = None;
        copy
    }

    /// Resolve the peer address, applying the per-stream address increment.
    pub fn target_addr(&self) -> Result<SocketAddr> {
        let host = self
            .host
            .as_deref()
            .ok_or_else(|| anyhow!("no peer host configured"))?;
        let addr = (host, self.port)
            .to_socket_addrs()
            .with_context(|| format!("failed to resolve {}:{}", host, self.port))?
            .next()
            .ok_or_else(|| anyhow!("no address found for {}", host))?;
        Ok(offset_addr(addr, self.dst_ip_offset))
    }

    /// Local address a listener binds to.
    pub fn listen_addr(&self) -> Result<SocketAddr> {
        let ip = match self.bind.as_deref() {
            Some(bind) => bind
                .parse::<IpAddr>()
                .with_context(|| format!("invalid bind address {}", bind))?,
            None => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
        };
        Ok(SocketAddr::new(ip, self.port))
    }
}

fn offset_addr(addr: SocketAddr, offset: u32) -> SocketAddr {
    match addr {
        SocketAddr::V4(v4) if offset > 0 => {
            let ip = Ipv4Addr::from(u32::from(*v4.ip()).wrapping_add(offset));
            SocketAddr::new(IpAddr::V4(ip), v4.port())
        }
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    fn parse(argv: &[&str]) -> Args {
        Args::parse_from(std::iter::once("duplex-bench").chain(argv.iter().copied()))
    }

    #[test]
    fn test_from_args_client_defaults() {
        let config = TestConfig::from_args(&parse(&["-c", "127.0.0.1"])).unwrap();
        assert_eq!(config.role, ThreadMode::Client);
        assert_eq!(config.protocol, Protocol::Tcp);
        assert_eq!(config.mode, TestMode::Time(crate::defaults::DURATION));
        assert!(!config.flags.reverse);
        assert!(config.transfer_id > 0);
        assert!(!config.group_id.is_nil());
    }

    #[test]
    fn test_bidir_implies_reverse() {
        let config = TestConfig::from_args(&parse(&["-c", "h", "--bidir"])).unwrap();
        assert!(config.flags.bidir);
        assert!(config.flags.reverse);
    }

    #[test]
    fn test_bytes_take_precedence() {
        let config = TestConfig::from_args(&parse(&["-c", "h", "-n", "1000", "-t", "3s"])).unwrap();
        assert_eq!(config.mode, TestMode::Bytes(1000));
    }

    #[test]
    fn test_rejects_invalid_combinations() {
        assert!(TestConfig::from_args(&parse(&["-c", "h", "--bidir", "--write-ack"])).is_err());
        assert!(TestConfig::from_args(&parse(&["-c", "h", "-u", "--write-ack"])).is_err());
        assert!(TestConfig::from_args(&parse(&[])).is_err());
    }

    #[test]
    fn test_listener_settings_only_for_legacy_modes() {
        let plain = TestConfig::from_args(&parse(&["-c", "h"])).unwrap();
        assert!(plain.listener_settings().is_none());

        let dual = TestConfig::from_args(&parse(&["-c", "h", "-d", "-P", "3"])).unwrap();
        let listener = dual.listener_settings().unwrap();
        assert_eq!(listener.role, ThreadMode::Listener);
        assert_eq!(listener.max_accepts, Some(3));
        assert_ne!(listener.transfer_id, dual.transfer_id);
        assert!(listener.host.is_none());
    }

    #[test]
    fn test_target_addr_offset() {
        let mut config = TestConfig {
            host: Some("10.0.0.1".into()),
            port: 5001,
            ..TestConfig::default()
        };
        assert_eq!(config.target_addr().unwrap(), "10.0.0.1:5001".parse().unwrap());
        config.dst_ip_offset = 3;
        assert_eq!(config.target_addr().unwrap(), "10.0.0.4:5001".parse().unwrap());
    }

    #[test]
    fn test_isochronous_frame_rate() {
        let config = TestConfig::from_args(&parse(&["-c", "h", "-u", "--isochronous", "60"])).unwrap();
        assert_eq!(config.isoch_fps, Some(60.0));
        assert!(TestConfig::from_args(&parse(&["-c", "h", "--isochronous", "0"])).is_err());
        assert!(TestConfig::from_args(&parse(&["-c", "h", "--isochronous=-5"])).is_err());
    }

    #[test]
    fn test_connect_back_modes_stand_alone() {
        assert!(TestConfig::from_args(&parse(&["-c", "h", "-d"])).is_ok());
        assert!(TestConfig::from_args(&parse(&["-c", "h", "-r"])).is_ok());
        assert!(TestConfig::from_args(&parse(&["-c", "h", "-d", "-r"])).is_err());
        assert!(TestConfig::from_args(&parse(&["-c", "h", "-d", "-R"])).is_err());
        assert!(TestConfig::from_args(&parse(&["-c", "h", "-r", "--bidir"])).is_err());
        assert!(TestConfig::from_args(&parse(&["-c", "h", "-d", "--write-ack"])).is_err());
    }
}
