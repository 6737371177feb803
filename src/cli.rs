use clap::{ArgAction, Parser, ValueEnum};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Duplex Bench - network throughput benchmark with full-duplex test support
#[derive(Parser, Debug, Clone, Default)]
#[clap(version, about, long_about = None)]
pub struct Args {
    /// Run as a listener (server side)
    #[clap(short = 's', long, conflicts_with = "client", help_heading = "Role")]
    pub server: bool,

    /// Run as a client connecting to the given host
    #[clap(short = 'c', long, value_name = "HOST", help_heading = "Role")]
    pub client: Option<String>,

    /// Port to listen on or connect to
    #[clap(short = 'p', long, default_value_t = crate::defaults::PORT)]
    pub port: u16,

    /// Local address to bind
    #[clap(short = 'B', long)]
    pub bind: Option<String>,

    /// Use UDP rather than TCP
    #[clap(short = 'u', long, default_value_t = false)]
    pub udp: bool,

    /// Time to transmit for (e.g. "10s", "500ms", "1m")
    #[clap(short = 't', long, value_parser = parse_duration)]
    pub time: Option<Duration>,

    /// Number of bytes to transmit (takes precedence over --time)
    #[clap(short = 'n', long)]
    pub num: Option<u64>,

    /// Seconds between periodic interval reports
    #[clap(short = 'i', long, value_parser = parse_duration)]
    pub interval: Option<Duration>,

    /// Length of the buffer to read or write
    #[clap(short = 'l', long, default_value_t = crate::defaults::BUF_LEN)]
    pub len: usize,

    /// Number of parallel client streams
    #[clap(short = 'P', long, default_value_t = 1)]
    pub parallel: usize,

    /// Reverse the traffic direction (server sends, client receives)
    #[clap(short = 'R', long, default_value_t = false, help_heading = "Direction")]
    pub reverse: bool,

    /// Run traffic in both directions over one connection
    #[clap(long, default_value_t = false, help_heading = "Direction")]
    pub bidir: bool,

    /// Have the receiver acknowledge every write
    #[clap(long, default_value_t = false, help_heading = "Direction")]
    pub write_ack: bool,

    /// Legacy dual test: the server connects back and sends while this client sends
    #[clap(short = 'd', long, default_value_t = false, help_heading = "Direction")]
    pub dualtest: bool,

    /// Legacy tradeoff test: the server connects back and sends once this client is done
    #[clap(short = 'r', long, default_value_t = false, help_heading = "Direction")]
    pub tradeoff: bool,

    /// Send one buffer per frame at this many frames per second
    #[clap(long, value_name = "FPS")]
    pub isochronous: Option<f64>,

    /// Delay between connect and the first write
    #[clap(long, value_parser = parse_duration)]
    pub txholdback: Option<Duration>,

    /// Only perform connects, timing the three-way handshake
    #[clap(long, default_value_t = false)]
    pub connect_only: bool,

    /// Number of connects performed in --connect-only mode
    #[clap(long, default_value_t = 1)]
    pub connect_count: usize,

    /// Do not synchronize the connects of parallel streams
    #[clap(long, default_value_t = false)]
    pub no_connect_sync: bool,

    /// Increment the destination address per parallel stream
    #[clap(long, default_value_t = false)]
    pub incr_dstip: bool,

    /// Serialize server-side tests to one client at a time
    #[clap(short = 'U', long, default_value_t = false)]
    pub single_client: bool,

    /// Request realtime scheduling for traffic threads
    #[clap(long, default_value_t = false)]
    pub realtime: bool,

    /// Listener exits after accepting this many tests
    #[clap(long)]
    pub max_accepts: Option<usize>,

    /// Pin traffic threads to CPU cores, starting at this core
    #[clap(long)]
    pub affinity: Option<usize>,

    /// Stream interval records as JSON lines to this file
    #[clap(long)]
    pub json: Option<PathBuf>,

    /// Increase log verbosity (-v debug, -vv trace)
    #[clap(short = 'v', long, action = ArgAction::Count)]
    pub verbose: u8,

    /// Also write logs to this file
    #[clap(long)]
    pub log_file: Option<PathBuf>,

    /// Output format for interval byte counts
    #[clap(short = 'f', long, value_enum, default_value_t = ReportFormat::Adaptive)]
    pub format: ReportFormat,
}

/// Unit used when printing interval records
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, ValueEnum, Serialize, Deserialize)]
pub enum ReportFormat {
    /// Pick the unit per value
    #[default]
    #[clap(name = "a")]
    Adaptive,
    /// Kilobits
    #[clap(name = "k")]
    Kilo,
    /// Megabits
    #[clap(name = "m")]
    Mega,
    /// Gigabits
    #[clap(name = "g")]
    Giga,
}

/// Parse duration from string (e.g., "10s", "5m", "1h", "0.5s")
pub fn parse_duration(s: &str) -> Result<Duration, String> {
    let s = s.trim();

    if s.is_empty() {
        return Err("Duration cannot be empty".to_string());
    }

    let (num_str, unit) = if let Some(stripped) = s.strip_suffix("ms") {
        (stripped, "ms")
    } else if let Some(stripped) = s.strip_suffix('s') {
        (stripped, "s")
    } else if let Some(stripped) = s.strip_suffix('m') {
        (stripped, "m")
    } else if let Some(stripped) = s.strip_suffix('h') {
        (stripped, "h")
    } else {
        (s, "s") // Default to seconds
    };

    let num: f64 = num_str
        .parse()
        .map_err(|_| format!("Invalid number in duration: {}", num_str))?;
    if !num.is_finite() || num < 0.0 {
        return Err(format!("Duration must be a non-negative number: {}", s));
    }

    let duration = match unit {
        "ms" => Duration::from_secs_f64(num / 1000.0),
        "s" => Duration::from_secs_f64(num),
        "m" => Duration::from_secs_f64(num * 60.0),
        "h" => Duration::from_secs_f64(num * 3600.0),
        _ => return Err(format!("Invalid duration unit: {}", unit)),
    };

    Ok(duration)
}
