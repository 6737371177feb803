//! # Utility Functions
//!
//! Formatters for human-readable report lines, validation of command-line
//! parameters, and the wall-clock helper used to timestamp payload frames.
//!
//! ```rust
//! use duplex_bench::cli::ReportFormat;
//! use duplex_bench::utils::*;
//!
//! # fn main() -> anyhow::Result<()> {
//! assert_eq!(format_bytes(1048576), "1.00 MB");
//! assert_eq!(format_bitrate(125_000.0, ReportFormat::Mega), "1.00 Mbits/sec");
//! validate_buffer_len(8192)?;
//! # Ok(())
//! # }
//! ```

use crate::cli::ReportFormat;
use anyhow::Result;
use std::time::{SystemTime, UNIX_EPOCH};

/// Get current timestamp as nanoseconds since Unix epoch
///
/// Payload frames carry this value so the receiver can compute one-way
/// transit. If the system time is before the epoch the function returns 0
/// rather than panicking.
pub fn current_timestamp_ns() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos() as u64
}

/// Format a byte count with binary units.
pub fn format_bytes(bytes: u64) -> String {
    format_bytes_f64(bytes as f64)
}

/// Format a fractional byte count with binary units.
pub fn format_bytes_f64(bytes: f64) -> String {
    if bytes.abs() < 1024.0 {
        format!("{:.0} B", bytes)
    } else if bytes.abs() < 1024.0 * 1024.0 {
        format!("{:.2} KB", bytes / 1024.0)
    } else if bytes.abs() < 1024.0 * 1024.0 * 1024.0 {
        format!("{:.2} MB", bytes / (1024.0 * 1024.0))
    } else {
        format!("{:.2} GB", bytes / (1024.0 * 1024.0 * 1024.0))
    }
}

/// Format a throughput as bits per second in the requested unit.
///
/// Network rates use decimal prefixes. [`ReportFormat::Adaptive`] picks the
/// largest unit that keeps the value at or above one.
pub fn format_bitrate(bytes_per_second: f64, format: ReportFormat) -> String {
    let bits = bytes_per_second * 8.0;
    let (scale, unit) = match format {
        ReportFormat::Kilo => (1e3, "Kbits/sec"),
        ReportFormat::Mega => (1e6, "Mbits/sec"),
        ReportFormat::Giga => (1e9, "Gbits/sec"),
        ReportFormat::Adaptive => {
            if bits >= 1e9 {
                (1e9, "Gbits/sec")
            } else if bits >= 1e6 {
                (1e6, "Mbits/sec")
            } else if bits >= 1e3 {
                (1e3, "Kbits/sec")
            } else {
                (1.0, "bits/sec")
            }
        }
    };
    format!("{:.2} {}", bits / scale, unit)
}

/// Validate port number
pub fn validate_port(port: u16) -> Result<()> {
    if port == 0 {
        anyhow::bail!("Port number cannot be zero");
    }
    Ok(())
}

/// Validate the read/write buffer length
///
/// Every buffer must hold at least one payload frame header.
pub fn validate_buffer_len(buf_len: usize) -> Result<()> {
    if buf_len < crate::net::FRAME_HEADER_LEN {
        anyhow::bail!(
            "Buffer length {} is too small (minimum {} bytes)",
            buf_len,
            crate::net::FRAME_HEADER_LEN
        );
    }
    if buf_len > 64 * 1024 * 1024 {
        anyhow::bail!("Buffer length {} is too large (maximum 64MB)", buf_len);
    }
    Ok(())
}

/// Validate the number of parallel streams
pub fn validate_parallel(parallel: usize) -> Result<()> {
    if parallel == 0 {
        anyhow::bail!("Parallel stream count cannot be zero");
    }
    if parallel > 1024 {
        anyhow::bail!("Parallel stream count {} is too high (maximum 1024)", parallel);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(512), "512 B");
        assert_eq!(format_bytes(1024), "1.00 KB");
        assert_eq!(format_bytes(1048576), "1.00 MB");
        assert_eq!(format_bytes(1073741824), "1.00 GB");
        assert_eq!(format_bytes_f64(1536.0), "1.50 KB");
    }

    #[test]
    fn test_format_bitrate() {
        assert_eq!(format_bitrate(125_000.0, ReportFormat::Adaptive), "1.00 Mbits/sec");
        assert_eq!(format_bitrate(125_000.0, ReportFormat::Kilo), "1000.00 Kbits/sec");
        assert_eq!(format_bitrate(125_000_000.0, ReportFormat::Giga), "1.00 Gbits/sec");
        assert_eq!(format_bitrate(10.0, ReportFormat::Adaptive), "80.00 bits/sec");
    }

    #[test]
    fn test_validation() {
        assert!(validate_port(5001).is_ok());
        assert!(validate_port(0).is_err());

        assert!(validate_buffer_len(8192).is_ok());
        assert!(validate_buffer_len(4).is_err());
        assert!(validate_buffer_len(128 * 1024 * 1024).is_err());

        assert!(validate_parallel(1).is_ok());
        assert!(validate_parallel(0).is_err());
        assert!(validate_parallel(4096).is_err());
    }
}
