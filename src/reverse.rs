//! # Reverse and Full-Duplex Companions
//!
//! A reverse, bidirectional or write-ack client needs a second worker on the
//! same socket to receive what the peer sends. [`derive_companion`] builds
//! that worker's record from the primary and decides, through
//! [`CompanionPolicy`], whether the primary waits for it or transmits
//! alongside it.
//!
//! The companion receives for longer than the primary transmits: its test
//! duration is padded by [`SLOP`] plus any transmit holdback, so clock skew
//! between the two hosts never truncates the reverse stream.

use crate::barrier::RendezvousBarrier;
use crate::config::{TestConfig, TestMode, ThreadMode};
use crate::error::{Result, TestError};
use crate::results::{ReportArena, SumKind};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Extra receive time granted to a companion worker.
pub const SLOP: Duration = Duration::from_secs(2);

/// What the primary does once its companion is running
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompanionPolicy {
    /// Plain reverse: the primary sends nothing and waits for the companion.
    JoinBeforeReturn,
    /// Bidir or write-ack: the primary transmits, then joins at teardown.
    RunConcurrently,
}

/// Record and scheduling policy of a companion worker
#[derive(Debug)]
pub struct Companion {
    pub config: TestConfig,
    pub policy: CompanionPolicy,
}

/// Pad a time-bound mode by [`SLOP`] and the holdback. Byte-bound modes
/// are unchanged.
pub fn padded_mode(mode: TestMode, holdback: Option<Duration>) -> TestMode {
    match mode {
        TestMode::Time(duration) => TestMode::Time(duration + SLOP + holdback.unwrap_or_default()),
        bytes => bytes,
    }
}

/// Derive the companion of a reverse, bidir or write-ack primary.
///
/// For bidir tests this also attaches the full-duplex barrier and the bidir
/// sum report to the primary, so both directions share them.
pub fn derive_companion(primary: &mut TestConfig, arena: &ReportArena) -> Result<Companion> {
    if primary.flags.bidir {
        primary.barrier = Some(Arc::new(RendezvousBarrier::for_mode(&primary.mode)));
        primary.bidir_report = Some(arena.acquire(
            primary.group_id,
            SumKind::Bidir(primary.transfer_id),
        ));
    }

    let socket = primary
        .socket
        .clone()
        .ok_or_else(|| TestError::FatalConfig("reverse test without a connected socket".into()))?;

    let mut companion = primary.clone();
    companion.role = if primary.flags.write_ack {
        ThreadMode::WriteAckClient
    } else {
        ThreadMode::Server
    };
    companion.socket = Some(socket);
    companion.flags.server_reverse = true;
    companion.flags.reverse = true;
    companion.sum_report = None;
    companion.connect_barrier = None;
    companion.mode = padded_mode(primary.mode, primary.tx_holdback);

    let policy = if primary.flags.bidir || primary.flags.write_ack {
        CompanionPolicy::RunConcurrently
    } else {
        CompanionPolicy::JoinBeforeReturn
    };
    debug!(
        "stream {} companion {} ({:?}), mode {:?}",
        primary.transfer_id, companion.role, policy, companion.mode
    );
    Ok(Companion {
        config: companion,
        policy,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::SocketHandle;
    use std::net::UdpSocket;

    fn with_socket(mut config: TestConfig) -> TestConfig {
        let udp = UdpSocket::bind("127.0.0.1:0").unwrap();
        config.socket = Some(SocketHandle::Udp(Arc::new(udp)));
        config
    }

    #[test]
    fn test_companion_duration_padding() {
        let arena = ReportArena::new();
        let mut primary = with_socket(TestConfig {
            mode: TestMode::Time(Duration::from_secs(10)),
            ..TestConfig::default()
        });
        primary.flags.reverse = true;
        let companion = derive_companion(&mut primary, &arena).unwrap();
        assert_eq!(companion.config.mode, TestMode::Time(Duration::from_secs(12)));

        primary.tx_holdback = Some(Duration::from_millis(1500));
        let companion = derive_companion(&mut primary, &arena).unwrap();
        assert_eq!(
            companion.config.mode,
            TestMode::Time(Duration::from_millis(13_500))
        );
    }

    #[test]
    fn test_bytes_mode_not_padded() {
        assert_eq!(
            padded_mode(TestMode::Bytes(100), Some(Duration::from_secs(1))),
            TestMode::Bytes(100)
        );
    }

    #[test]
    fn test_plain_reverse_policy() {
        let arena = ReportArena::new();
        let mut primary = with_socket(TestConfig::default());
        primary.flags.reverse = true;
        let companion = derive_companion(&mut primary, &arena).unwrap();
        assert_eq!(companion.policy, CompanionPolicy::JoinBeforeReturn);
        assert_eq!(companion.config.role, ThreadMode::Server);
        assert!(companion.config.flags.server_reverse);
        assert!(primary.barrier.is_none());
        assert!(arena.is_empty());
    }

    #[test]
    fn test_bidir_shares_barrier_and_report() {
        let arena = ReportArena::new();
        let mut primary = with_socket(TestConfig::default());
        primary.flags.reverse = true;
        primary.flags.bidir = true;
        let companion = derive_companion(&mut primary, &arena).unwrap();
        assert_eq!(companion.policy, CompanionPolicy::RunConcurrently);
        let ours = primary.barrier.as_ref().unwrap();
        let theirs = companion.config.barrier.as_ref().unwrap();
        assert!(Arc::ptr_eq(ours, theirs));
        assert!(Arc::ptr_eq(
            primary.bidir_report.as_ref().unwrap(),
            companion.config.bidir_report.as_ref().unwrap()
        ));
        assert_eq!(arena.len(), 1);
    }

    #[test]
    fn test_write_ack_companion_role() {
        let arena = ReportArena::new();
        let mut primary = with_socket(TestConfig::default());
        primary.flags.write_ack = true;
        let companion = derive_companion(&mut primary, &arena).unwrap();
        assert_eq!(companion.config.role, ThreadMode::WriteAckClient);
        assert_eq!(companion.policy, CompanionPolicy::RunConcurrently);
    }

    #[test]
    fn test_missing_socket_is_fatal() {
        let arena = ReportArena::new();
        let mut primary = TestConfig::default();
        primary.flags.reverse = true;
        let err = derive_companion(&mut primary, &arena).unwrap_err();
        assert!(err.is_fatal());
    }
}
