//! # Listener
//!
//! The accept loop of the server side. Each accepted test is turned into
//! one or two worker records according to the header the client sent:
//!
//! | Header | Workers |
//! |---|---|
//! | plain | Server |
//! | write-ack | WriteAckServer |
//! | reverse | server-reverse Client |
//! | bidir | Server + server-reverse Client sharing a full-duplex barrier |
//! | dual test | Server + connect-back Client, started together |
//! | tradeoff | Server, then a connect-back Client once it is done |
//!
//! A connect-back client dials the listener the remote client started next
//! to itself, at the remote address and the port announced in the header.

use crate::barrier::RendezvousBarrier;
use crate::config::{TestConfig, TestFlags, ThreadMode};
use crate::dispatch::{spawn_thread, spawn_worker, WorkerContext};
use crate::error::Result;
use crate::launch::LaunchPlan;
use crate::net::Accepted;
use crate::results::{listener_banner, ReportArena, SumKind};
use crate::reverse::padded_mode;
use std::io;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Accept loop of the server side
pub struct Listener {
    config: TestConfig,
    ctx: WorkerContext,
}

impl Listener {
    pub fn new(config: TestConfig, ctx: WorkerContext) -> Self {
        Self { config, ctx }
    }

    pub fn run(self) -> Result<()> {
        for line in listener_banner(&self.config) {
            info!("{}", line);
        }
        let mut acceptor = self.ctx.transport.listen(&self.config)?;
        debug!("listening on {}", acceptor.local_addr()?);

        let mut accepted_tests = 0usize;
        let mut running: Vec<JoinHandle<Result<()>>> = Vec::new();
        while self.config.max_accepts.map_or(true, |max| accepted_tests < max) {
            let accepted = match acceptor.accept() {
                Ok(accepted) => accepted,
                Err(e) => {
                    warn!("failed to accept test: {}", e);
                    continue;
                }
            };
            info!("accepted {} test from {}", self.config.protocol, accepted.peer);
            accepted_tests += 1;

            let plan = server_records(&self.config, accepted, &self.ctx.arena);
            let mut started = Vec::with_capacity(plan.run_now.len());
            for record in plan.run_now {
                match spawn_thread(record, self.ctx.clone()) {
                    Ok(handle) => started.push(handle),
                    Err(e) => warn!("failed to spawn server worker: {}", e),
                }
            }
            if plan.run_next.is_empty() {
                running.extend(started);
            } else {
                match run_after(started, plan.run_next, self.ctx.clone()) {
                    Ok(handle) => running.push(handle),
                    Err(e) => warn!("failed to spawn deferred workers: {}", e),
                }
            }
            if self.config.flags.single_client {
                join_all(&mut running);
            }
        }
        join_all(&mut running);
        debug!("listener done after {} tests", accepted_tests);
        Ok(())
    }
}

fn join_all(running: &mut Vec<JoinHandle<Result<()>>>) {
    for handle in running.drain(..) {
        if handle.join().is_err() {
            warn!("server worker panicked");
        }
    }
}

/// Join `first`, then run `next` one record at a time on a new thread.
fn run_after(
    mut first: Vec<JoinHandle<Result<()>>>,
    next: Vec<TestConfig>,
    ctx: WorkerContext,
) -> io::Result<JoinHandle<Result<()>>> {
    thread::Builder::new().name("deferred".to_string()).spawn(move || {
        join_all(&mut first);
        for record in next {
            debug!("starting deferred {} worker", record.role);
            spawn_worker(record, &ctx)?;
        }
        Ok(())
    })
}

/// Worker records for one accepted test.
///
/// ## Parameters
///
/// - `listener`: the listener's own record; per-test records are copied from it
/// - `accepted`: the socket, validated header and peer address of the test
/// - `arena`: where a bidir test registers its sum report
///
/// ## Returns
///
/// A [`LaunchPlan`] whose `run_now` records start as soon as the test is
/// accepted. `run_next` is only used by tradeoff tests and holds the
/// connect-back client that starts after the receiver finished.
pub fn server_records(listener: &TestConfig, accepted: Accepted, arena: &ReportArena) -> LaunchPlan {
    let header = accepted.header;
    let peer = accepted.peer;
    let mut base = listener.stream_copy();
    base.group_id = Uuid::new_v4();
    base.host = None;
    base.protocol = accepted.socket.protocol();
    base.buf_len = header.buf_len as usize;
    base.mode = header.mode;
    base.tx_holdback = header.tx_holdback;
    base.max_accepts = None;
    base.flags.reverse = header.reverse;
    base.flags.bidir = header.bidir;
    base.flags.write_ack = header.write_ack;
    base.flags.single_client = false;
    base.socket = Some(accepted.socket);
    base.sum_report = None;
    base.connect_barrier = None;

    let receiver = |role: ThreadMode, base: &TestConfig| {
        let mut server = base.clone();
        server.role = role;
        server.mode = padded_mode(base.mode, base.tx_holdback);
        server
    };
    let sender = |base: &TestConfig| {
        let mut client = base.clone();
        client.role = ThreadMode::Client;
        client.flags.server_reverse = true;
        client
    };
    // a new connection to the peer's listener, carrying a plain header
    let connect_back = |base: &TestConfig| {
        let mut client = base.stream_copy();
        client.role = ThreadMode::Client;
        client.host = Some(peer.ip().to_string());
        client.port = header.listen_port;
        client.flags = TestFlags {
            connect_back: true,
            realtime: base.flags.realtime,
            ..TestFlags::default()
        };
        client.barrier = None;
        client.bidir_report = None;
        client
    };

    let mut plan = LaunchPlan::default();
    if header.bidir {
        base.barrier = Some(Arc::new(RendezvousBarrier::for_mode(&header.mode)));
        base.bidir_report = Some(arena.acquire(base.group_id, SumKind::Bidir(base.transfer_id)));
        plan.run_now = vec![receiver(ThreadMode::Server, &base), sender(&base)];
    } else if header.reverse {
        plan.run_now = vec![sender(&base)];
    } else if header.write_ack {
        plan.run_now = vec![receiver(ThreadMode::WriteAckServer, &base)];
    } else {
        plan.run_now = vec![receiver(ThreadMode::Server, &base)];
    }

    if header.dual_test {
        plan.run_now.push(connect_back(&base));
    } else if header.tradeoff {
        plan.run_next.push(connect_back(&base));
    }
    plan
}
