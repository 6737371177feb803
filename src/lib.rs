//! # Duplex Bench Library
//!
//! The concurrency and measurement core of a network throughput benchmark.
//! Paired client and server workers exchange TCP or UDP traffic on their own
//! OS threads. Parallel streams start together, and the two directions of a
//! full-duplex test start and stop at the same instant. Every reporting
//! interval is reduced to bandwidth, jitter, loss, transit-time statistics,
//! a Little's-Law queue-depth estimate and a net-power score.
//!
//! ## Architecture Overview
//!
//! Leaf modules first:
//!
//! - `barrier`: two-party full-duplex rendezvous and N-party connect sync
//! - `metrics`: streaming interval statistics and derived-metric formulas
//! - `net`: socket2-backed transport, test header and payload frames
//! - `results`: reporter thread, sum reports and their arena
//! - `traffic`: send, receive and connect-only measurement loops
//! - `reverse`: companion workers for reverse, bidir and write-ack tests
//! - `dispatch`: per-role worker entry point and the client state machine
//! - `listener`: server-side accept loop
//! - `launch`: parallel-stream replication and thread launch
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use duplex_bench::{
//!     launch::{replicate, Launcher, Threading},
//!     net::NetTransport,
//!     results::{ReportArena, Reporter, ReporterOptions},
//!     Args, TestConfig, WorkerContext,
//! };
//! use clap::Parser;
//! use std::sync::Arc;
//!
//! fn main() -> anyhow::Result<()> {
//!     let args = Args::parse_from(["duplex-bench", "-c", "127.0.0.1", "--bidir", "-t", "5s"]);
//!     let template = TestConfig::from_args(&args)?;
//!
//!     let reporter = Reporter::spawn(ReporterOptions::default())?;
//!     let arena = Arc::new(ReportArena::new());
//!     let ctx = WorkerContext::new(Arc::new(NetTransport), reporter.sink(), reporter.ready(), Arc::clone(&arena));
//!
//!     let plan = replicate(template, Threading::Threads, &arena);
//!     Launcher::new(ctx, None).execute(plan)?;
//!     println!("{:?}", reporter.finish()?);
//!     Ok(())
//! }
//! ```

/// Timed rendezvous primitives
pub mod barrier;

/// Command-line interface
///
/// Argument parsing using clap, including human-readable durations
/// (e.g., "10s", "500ms").
pub mod cli;

/// Per-worker configuration records
pub mod config;

/// Worker dispatch and client startup
pub mod dispatch;

pub mod error;

/// Launch plans and the launcher
pub mod launch;

/// Server-side accept loop
pub mod listener;

/// Logging setup
pub mod logging;

/// Interval statistics and derived metrics
///
/// Welford transit variance, loss, Little's-Law queue depth, net power and
/// the realistic-latency gate.
pub mod metrics;

/// Socket transport and wire format
pub mod net;

/// Reporter, sum reports and banners
pub mod results;

/// Reverse and full-duplex companions
pub mod reverse;

/// Measurement loops
pub mod traffic;

pub mod utils;

pub use cli::Args;
pub use config::{Protocol, TestConfig, TestMode, ThreadMode};
pub use dispatch::{spawn_worker, WorkerContext};
pub use error::{SyncError, TestError};
pub use metrics::{DerivedMetrics, IntervalStats, Metric};
pub use results::{IntervalRecord, ReportSink, SumRecord};

/// The current version, from Cargo.toml
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default configuration values
pub mod defaults {
    use std::time::Duration;

    /// Default port for listeners and clients
    pub const PORT: u16 = 5001;

    /// Default read/write buffer length (128 KiB)
    pub const BUF_LEN: usize = 128 * 1024;

    /// Default test duration
    pub const DURATION: Duration = Duration::from_secs(10);

    /// Ticks a client waits for the reporter thread before giving up
    pub const REPORTER_READY_TICKS: u32 = 10;

    /// Ticks parallel streams wait for each other after connecting
    pub const CONNECT_SYNC_TICKS: u32 = 10;
}
