//! Error taxonomy for test workers.
//!
//! Workers distinguish between failures that end only themselves (socket
//! errors, an unavailable reporter), failures that end the whole test
//! (missing socket or settings for a reverse test), and synchronization
//! failures that end the process (a full-duplex rendezvous that never
//! completed). Derived-metric guard conditions are not errors at all; they
//! are reported through [`crate::metrics::Metric`] sentinels.

use std::io;
use thiserror::Error;

/// Result alias used by the worker layer.
pub type Result<T> = std::result::Result<T, TestError>;

/// Synchronization failures raised by the rendezvous primitives.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum SyncError {
    /// The peer never arrived within the tick budget.
    #[error("barrier timed out after {ticks} ticks with {arrived}/2 parties present")]
    BarrierTimeout { ticks: u32, arrived: u32 },
}

/// Errors surfaced by a test worker.
#[derive(Debug, Error)]
pub enum TestError {
    /// Configuration that makes the whole test impossible to run.
    #[error("fatal configuration error: {0}")]
    FatalConfig(String),

    /// Rendezvous failure between the two directions of a full-duplex test.
    #[error(transparent)]
    Sync(#[from] SyncError),

    /// The reporter thread never signalled readiness.
    #[error("reporter did not become ready within {0} ticks")]
    ReporterUnavailable(u32),

    /// The companion worker could not be joined.
    #[error("companion worker join failed: {0}")]
    JoinFailed(String),

    /// Socket level failure, local to the worker that hit it.
    #[error("socket error: {0}")]
    Socket(#[from] io::Error),

    /// Test header could not be encoded or decoded.
    #[error("test header error: {0}")]
    Header(#[from] bincode::Error),
}

impl TestError {
    /// Whether the error invalidates the whole test rather than one worker.
    pub fn is_fatal(&self) -> bool {
        matches!(self, TestError::FatalConfig(_) | TestError::Sync(_))
    }
}
