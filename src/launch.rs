//! # Parallel-Stream Launch
//!
//! [`replicate`] expands the template record built from the command line
//! into the records of one run, and [`Launcher::execute`] runs them.
//!
//! A [`LaunchPlan`] has two stages. Records in `run_now` start together,
//! each on its own named thread, and are joined. Records in `run_next` run
//! afterwards, one at a time, on the launching thread.
//!
//! Client streams of one plan share a connect-sync barrier and a group sum
//! report, so parallel streams start together and their totals are summed.

use crate::barrier::ConnectBarrier;
use crate::config::{TestConfig, ThreadMode};
use crate::dispatch::{spawn_worker, thread_name, WorkerContext};
use crate::error::TestError;
use crate::results::{ReportArena, SumKind};
use anyhow::{Context, Result};
use std::sync::Arc;
use std::thread;
use tracing::{debug, error, info, warn};

/// Whether records may run on their own threads
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Threading {
    Threads,
    /// Degraded fallback: no parallel streams, companion listener afterwards
    Single,
}

/// Ordered records of one run
#[derive(Debug, Default)]
pub struct LaunchPlan {
    pub run_now: Vec<TestConfig>,
    pub run_next: Vec<TestConfig>,
}

impl LaunchPlan {
    pub fn len(&self) -> usize {
        self.run_now.len() + self.run_next.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Expand the template into the records of one run.
///
/// ## Parameters
///
/// - `template`: the record built from the command line
/// - `threading`: whether records may run on their own threads
/// - `arena`: registry for the group sum report of parallel streams
///
/// ## Returns
///
/// A listener template comes back alone. A client template becomes
/// `threads` client records; with more than one they share a connect
/// barrier and a group sum. Dual and tradeoff tests add a local listener
/// for the connect-back streams, first in `run_now`, or in `run_next` when
/// only one thread is available.
pub fn replicate(mut template: TestConfig, threading: Threading, arena: &ReportArena) -> LaunchPlan {
    let listener = template.listener_settings();
    if template.role != ThreadMode::Client {
        return LaunchPlan {
            run_now: vec![template],
            run_next: Vec::new(),
        };
    }

    if threading == Threading::Single {
        return LaunchPlan {
            run_now: vec![template],
            run_next: listener.into_iter().collect(),
        };
    }

    let streams = template.threads.max(1);
    if streams > 1 {
        template.connect_barrier = Some(Arc::new(ConnectBarrier::new(
            streams,
            crate::defaults::CONNECT_SYNC_TICKS,
        )));
        template.sum_report = Some(arena.acquire(template.group_id, SumKind::Group));
    }

    let mut run_now = Vec::with_capacity(streams + 1);
    run_now.extend(listener);
    for i in 1..streams {
        let mut copy = template.stream_copy();
        if copy.flags.incr_dst_ip {
            copy.dst_ip_offset = i as u32;
        }
        run_now.push(copy);
    }
    // the template itself is the first client stream
    run_now.insert(usize::from(template.needs_listener()), template);

    LaunchPlan {
        run_now,
        run_next: Vec::new(),
    }
}

/// Totals of one executed plan
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LaunchOutcome {
    pub completed: usize,
    pub failed: usize,
    /// Messages of failures that invalidate the whole test
    pub fatal: Vec<String>,
}

impl LaunchOutcome {
    fn record(&mut self, role: ThreadMode, result: crate::error::Result<()>) {
        match result {
            Ok(()) => self.completed += 1,
            Err(e) => {
                self.failed += 1;
                if e.is_fatal() {
                    self.fatal.push(format!("{}: {}", role, e));
                }
            }
        }
    }
}

/// Runs launch plans
pub struct Launcher {
    ctx: WorkerContext,
    /// First core to pin traffic threads to
    affinity: Option<usize>,
}

impl Launcher {
    pub fn new(ctx: WorkerContext, affinity: Option<usize>) -> Self {
        Self { ctx, affinity }
    }

    /// Run a plan to completion.
    ///
    /// `run_now` records start on named threads, pinned to consecutive
    /// cores when an affinity was given, and are joined. `run_next` records
    /// then run in order on the calling thread.
    ///
    /// ## Returns
    ///
    /// - `Ok(LaunchOutcome)`: per-worker tallies, including fatal failures
    /// - `Err(anyhow::Error)`: a worker thread could not be spawned
    pub fn execute(&self, plan: LaunchPlan) -> Result<LaunchOutcome> {
        let cpus = num_cpus::get();
        debug!(
            "launching {} workers now, {} afterwards, on {} CPUs",
            plan.run_now.len(),
            plan.run_next.len(),
            cpus
        );
        if plan.run_now.len() > cpus {
            warn!(
                "{} concurrent workers exceed the {} available CPUs",
                plan.run_now.len(),
                cpus
            );
        }

        let core_ids = match self.affinity {
            Some(_) => core_affinity::get_core_ids().unwrap_or_default(),
            None => Vec::new(),
        };

        let mut outcome = LaunchOutcome::default();
        let mut handles = Vec::with_capacity(plan.run_now.len());
        for (i, config) in plan.run_now.into_iter().enumerate() {
            let role = config.role;
            let core = self
                .affinity
                .filter(|_| !core_ids.is_empty())
                .map(|first| core_ids[(first + i) % core_ids.len()]);
            let ctx = self.ctx.clone();
            let handle = thread::Builder::new()
                .name(thread_name(&config))
                .spawn(move || {
                    if let Some(core) = core {
                        if !core_affinity::set_for_current(core) {
                            warn!("failed to pin worker to core {}", core.id);
                        }
                    }
                    spawn_worker(config, &ctx)
                })
                .with_context(|| format!("failed to spawn {} worker", role))?;
            handles.push((role, handle));
        }

        for (role, handle) in handles {
            let result = handle
                .join()
                .unwrap_or_else(|_| Err(TestError::JoinFailed(format!("{} worker panicked", role))));
            outcome.record(role, result);
        }

        for config in plan.run_next {
            let role = config.role;
            info!("starting deferred {} worker", role);
            outcome.record(role, spawn_worker(config, &self.ctx));
        }

        if !outcome.fatal.is_empty() {
            error!("{} workers failed fatally", outcome.fatal.len());
        }
        Ok(outcome)
    }
}
