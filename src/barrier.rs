//! # Rendezvous Barriers
//!
//! Two timed rendezvous primitives used by the worker layer:
//!
//! - [`RendezvousBarrier`]: the two-party start/stop barrier shared by the
//!   two directions of a full-duplex test. The last party to arrive resets
//!   the counter and releases the other. A party that waits out its tick
//!   budget gets [`SyncError::BarrierTimeout`]; workers go through
//!   [`RendezvousBarrier::arrive_or_abort`], which turns that into a process
//!   exit because a misaligned duplex test produces meaningless numbers.
//! - [`ConnectBarrier`]: the N-party connect-sync barrier across the
//!   parallel client streams of one test. Its timeout is not fatal.
//!
//! Both wait in fixed ticks (one second by default) so a stalled peer is
//! noticed even when no wakeup ever arrives.

use crate::config::TestMode;
use crate::error::SyncError;
use parking_lot::{Condvar, Mutex};
use std::time::Duration;
use tracing::{debug, trace, warn};

/// Minimum tick budget for the full-duplex barrier.
pub const MIN_BARRIER_TIMEOUT: u32 = 3;

/// Default length of one barrier tick.
pub const BARRIER_TICK: Duration = Duration::from_secs(1);

/// How a successful [`RendezvousBarrier::arrive`] call completed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BarrierOutcome {
    /// This caller was the second to arrive and released the other party.
    Completed,
    /// This caller waited and was released by the other party.
    Released,
}

impl BarrierOutcome {
    /// True for the caller that completed the pair.
    pub fn is_last(self) -> bool {
        self == BarrierOutcome::Completed
    }
}

#[derive(Debug, Default)]
struct BarrierState {
    count: u32,
    generation: u64,
}

/// Two-party reusable barrier with a tick-based timeout.
#[derive(Debug)]
pub struct RendezvousBarrier {
    state: Mutex<BarrierState>,
    await_cond: Condvar,
    timeout_ticks: u32,
    tick: Duration,
}

/// Tick budget derived from the test duration.
///
/// Time-bound tests get one tick per second of duration plus one, so long
/// tests tolerate multi-second startup skew. Byte-bound tests get two. Both
/// are clamped to [`MIN_BARRIER_TIMEOUT`].
pub fn timeout_ticks_for(mode: &TestMode) -> u32 {
    let raw = match mode {
        TestMode::Time(duration) => {
            let centis = duration.as_millis() / 10;
            u32::try_from(centis / 100 + 1).unwrap_or(u32::MAX)
        }
        TestMode::Bytes(_) => 2,
    };
    raw.max(MIN_BARRIER_TIMEOUT)
}

impl RendezvousBarrier {
    /// Create a barrier with the given raw tick budget.
    pub fn new(timeout_ticks: u32) -> Self {
        Self::with_tick(timeout_ticks, BARRIER_TICK)
    }

    /// Create a barrier with a custom tick length.
    pub fn with_tick(timeout_ticks: u32, tick: Duration) -> Self {
        Self {
            state: Mutex::new(BarrierState::default()),
            await_cond: Condvar::new(),
            timeout_ticks: timeout_ticks.max(MIN_BARRIER_TIMEOUT),
            tick,
        }
    }

    /// Barrier sized for the given test mode.
    pub fn for_mode(mode: &TestMode) -> Self {
        Self::new(timeout_ticks_for(mode))
    }

    /// Effective tick budget after clamping.
    pub fn timeout_ticks(&self) -> u32 {
        self.timeout_ticks
    }

    /// Number of parties currently waiting in the open round.
    pub fn arrived(&self) -> u32 {
        self.state.lock().count
    }

    /// Arrive at the barrier and wait for the other party.
    ///
    /// ## Returns
    ///
    /// - `Ok(BarrierOutcome::Completed)`: this caller arrived second
    /// - `Ok(BarrierOutcome::Released)`: this caller waited and the other party arrived
    /// - `Err(SyncError::BarrierTimeout)`: the tick budget ran out; the arrival
    ///   is withdrawn and the barrier can be used for the next round
    pub fn arrive(&self) -> Result<BarrierOutcome, SyncError> {
        let mut state = self.state.lock();
        state.count += 1;
        debug_assert!(state.count <= 2);
        if state.count == 2 {
            state.count = 0;
            state.generation = state.generation.wrapping_add(1);
            self.await_cond.notify_all();
            return Ok(BarrierOutcome::Completed);
        }

        let generation = state.generation;
        let mut remaining = self.timeout_ticks;
        while state.generation == generation {
            if remaining == 0 {
                let arrived = state.count;
                // retract our arrival so the counter stays consistent
                state.count -= 1;
                return Err(SyncError::BarrierTimeout {
                    ticks: self.timeout_ticks,
                    arrived,
                });
            }
            trace!(
                "full duplex barrier wait {}/2 ({} ticks left)",
                state.count,
                remaining
            );
            let _ = self.await_cond.wait_for(&mut state, self.tick);
            remaining -= 1;
        }
        Ok(BarrierOutcome::Released)
    }

    /// Arrive, exiting the process if the other direction never shows up.
    pub fn arrive_or_abort(&self, phase: &str) -> BarrierOutcome {
        match self.arrive() {
            Ok(outcome) => {
                debug!("full duplex {} barrier done ({:?})", phase, outcome);
                outcome
            }
            Err(err) => {
                warn!("full duplex {} barrier failed: {}", phase, err);
                println!("Failed to start full duplex traffic");
                std::process::exit(0);
            }
        }
    }
}

#[derive(Debug, Default)]
struct ConnectState {
    arrived: usize,
    generation: u64,
}

/// N-party barrier holding parallel client streams until all have connected.
#[derive(Debug)]
pub struct ConnectBarrier {
    parties: usize,
    state: Mutex<ConnectState>,
    cond: Condvar,
    timeout_ticks: u32,
    tick: Duration,
}

impl ConnectBarrier {
    /// Barrier for `parties` streams, giving up after `timeout_ticks` ticks.
    pub fn new(parties: usize, timeout_ticks: u32) -> Self {
        Self::with_tick(parties, timeout_ticks, BARRIER_TICK)
    }

    /// Barrier with a custom tick length.
    ///
    /// ## Parameters
    ///
    /// - `parties`: streams that must arrive before any is released; at least one
    /// - `timeout_ticks`: ticks a waiter sits out before giving up
    /// - `tick`: length of one tick
    pub fn with_tick(parties: usize, timeout_ticks: u32, tick: Duration) -> Self {
        Self {
            parties: parties.max(1),
            state: Mutex::new(ConnectState::default()),
            cond: Condvar::new(),
            timeout_ticks,
            tick,
        }
    }

    /// Number of streams one round waits for.
    pub fn parties(&self) -> usize {
        self.parties
    }

    /// Wait until every stream has connected. Returns false on timeout.
    pub fn wait(&self) -> bool {
        let mut state = self.state.lock();
        state.arrived += 1;
        if state.arrived >= self.parties {
            state.arrived = 0;
            state.generation = state.generation.wrapping_add(1);
            self.cond.notify_all();
            return true;
        }
        let generation = state.generation;
        let mut remaining = self.timeout_ticks;
        while state.generation == generation {
            if remaining == 0 {
                state.arrived -= 1;
                return false;
            }
            let _ = self.cond.wait_for(&mut state, self.tick);
            remaining -= 1;
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_timeout_floor() {
        for raw in 0..3 {
            assert_eq!(RendezvousBarrier::new(raw).timeout_ticks(), 3);
        }
        assert_eq!(RendezvousBarrier::new(7).timeout_ticks(), 7);
    }

    #[test]
    fn test_timeout_ticks_from_mode() {
        assert_eq!(timeout_ticks_for(&TestMode::Time(Duration::from_secs(1))), 3);
        assert_eq!(timeout_ticks_for(&TestMode::Time(Duration::from_secs(10))), 11);
        assert_eq!(timeout_ticks_for(&TestMode::Time(Duration::from_secs(120))), 121);
        assert_eq!(timeout_ticks_for(&TestMode::Bytes(1 << 20)), 3);
    }

    #[test]
    fn test_exactly_one_completes_per_round() {
        let barrier = Arc::new(RendezvousBarrier::with_tick(5, Duration::from_millis(200)));
        for _ in 0..4 {
            let peer = Arc::clone(&barrier);
            let handle = thread::spawn(move || peer.arrive().unwrap());
            let mine = barrier.arrive().unwrap();
            let theirs = handle.join().unwrap();
            assert_ne!(mine, theirs);
            assert!(mine.is_last() ^ theirs.is_last());
            assert_eq!(barrier.arrived(), 0);
        }
    }

    #[test]
    fn test_lone_party_times_out() {
        let barrier = RendezvousBarrier::with_tick(3, Duration::from_millis(10));
        let err = barrier.arrive().unwrap_err();
        assert_eq!(err, SyncError::BarrierTimeout { ticks: 3, arrived: 1 });
        assert_eq!(barrier.arrived(), 0);
    }

    #[test]
    fn test_connect_barrier_releases_all() {
        let barrier = Arc::new(ConnectBarrier::with_tick(4, 10, Duration::from_millis(100)));
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let b = Arc::clone(&barrier);
                thread::spawn(move || b.wait())
            })
            .collect();
        for handle in handles {
            assert!(handle.join().unwrap());
        }
    }

    #[test]
    fn test_connect_barrier_timeout_is_soft() {
        let barrier = ConnectBarrier::with_tick(2, 2, Duration::from_millis(5));
        assert!(!barrier.wait());
    }
}
