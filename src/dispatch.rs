//! # Test Role Dispatcher
//!
//! Every worker thread runs [`spawn_worker`] with its own [`TestConfig`].
//! The dispatcher picks the behavior for the record's role, runs it to
//! completion and releases the record's shared reports.
//!
//! Client records go through the [`ClientWorker`] startup state machine:
//!
//! ```text
//! Created -> WaitReporterReady -> Connect -> ConnectSync -> Dispatch -> Teardown
//! ```
//!
//! At `Dispatch` a client either transmits, transmits immediately without a
//! header exchange (server-reverse), or hands off to the reverse coordinator
//! and starts a companion worker on the same socket.

use crate::config::{TestConfig, ThreadMode};
use crate::error::{Result, TestError};
use crate::listener::Listener;
use crate::metrics::IntervalStats;
use crate::net::{TestHeader, Transport};
use crate::results::{ReadyFlag, ReportArena, ReportSink};
use crate::reverse::{derive_companion, Companion, CompanionPolicy};
use crate::traffic::{connect_periodic, run_client_transfer, ServerWorker};
use std::io;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, error, trace, warn};

/// Shared collaborators handed to every worker
#[derive(Clone)]
pub struct WorkerContext {
    pub transport: Arc<dyn Transport>,
    pub sink: Arc<dyn ReportSink>,
    pub ready: Arc<ReadyFlag>,
    pub arena: Arc<ReportArena>,
    /// Length of one reporter-ready wait tick
    pub ready_tick: Duration,
    /// Pause between connect attempts of a connect-back client
    pub connect_retry: Duration,
}

/// Connect attempts of a connect-back client; the peer's listener may not
/// be bound yet when the test arrives.
pub const CONNECT_BACK_ATTEMPTS: u32 = 10;

impl WorkerContext {
    pub fn new(
        transport: Arc<dyn Transport>,
        sink: Arc<dyn ReportSink>,
        ready: Arc<ReadyFlag>,
        arena: Arc<ReportArena>,
    ) -> Self {
        Self {
            transport,
            sink,
            ready,
            arena,
            ready_tick: Duration::from_secs(1),
            connect_retry: Duration::from_millis(250),
        }
    }
}

/// Thread name for a worker record.
pub fn thread_name(config: &TestConfig) -> String {
    let id = config.transfer_id;
    match config.role {
        ThreadMode::Listener => "listener".to_string(),
        ThreadMode::Client if config.flags.server_reverse => format!("client-rev-{}", id),
        ThreadMode::Client => format!("client-{}", id),
        ThreadMode::Server if config.flags.server_reverse => format!("server-rev-{}", id),
        ThreadMode::Server => format!("server-{}", id),
        ThreadMode::WriteAckServer => format!("ack-server-{}", id),
        ThreadMode::WriteAckClient => format!("ack-client-{}", id),
    }
}

/// Run `config` on a new named thread.
pub fn spawn_thread(config: TestConfig, ctx: WorkerContext) -> io::Result<JoinHandle<Result<()>>> {
    thread::Builder::new()
        .name(thread_name(&config))
        .spawn(move || spawn_worker(config, &ctx))
}

/// Run one worker record to completion on the calling thread.
pub fn spawn_worker(mut config: TestConfig, ctx: &WorkerContext) -> Result<()> {
    let role = config.role;
    let id = config.transfer_id;
    debug!("starting {} worker for stream {}", role, id);

    if receives_traffic(role) {
        realtime_hint(&config);
    }
    let result = match role {
        ThreadMode::Listener => Listener::new(config, ctx.clone()).run(),
        ThreadMode::Server => run_server(config, ctx, false),
        ThreadMode::WriteAckServer => run_server(config, ctx, true),
        ThreadMode::WriteAckClient => {
            // the client-side receiver does not acknowledge
            config.flags.write_ack = false;
            run_server(config, ctx, false)
        }
        ThreadMode::Client => ClientWorker::new(config, ctx).run(),
    };

    match &result {
        Ok(()) => debug!("{} worker for stream {} done", role, id),
        Err(e) if e.is_fatal() => error!("{} worker for stream {} failed: {}", role, id, e),
        Err(e) => warn!("{} worker for stream {} failed: {}", role, id, e),
    }
    result
}

/// Roles that run the receive loop directly. Clients ask for realtime
/// scheduling in their own startup sequence.
fn receives_traffic(role: ThreadMode) -> bool {
    matches!(
        role,
        ThreadMode::Server | ThreadMode::WriteAckServer | ThreadMode::WriteAckClient
    )
}

fn run_server(mut config: TestConfig, ctx: &WorkerContext, ack: bool) -> Result<()> {
    let result = ServerWorker::new(&config, ctx.sink.as_ref())
        .with_acks(ack)
        .run();
    release_reports(&mut config, ctx, result.as_ref().ok());
    result.map(|_| ())
}

/// Fold the final totals into the record's sum reports and give them back.
pub fn release_reports(config: &mut TestConfig, ctx: &WorkerContext, totals: Option<&IntervalStats>) {
    let held = [config.sum_report.take(), config.bidir_report.take()];
    for report in held.into_iter().flatten() {
        if let Some(stats) = totals {
            report.contribute(stats);
        }
        if let Some(record) = ctx.arena.release(report) {
            if record.streams > 1 {
                ctx.sink.deliver_sum(record);
            }
        }
    }
}

/// Ask for realtime scheduling of the calling thread. Failure only warns.
#[cfg(target_os = "linux")]
fn realtime_hint(config: &TestConfig) {
    if !config.flags.realtime {
        return;
    }
    // SAFETY: sched_param is plain data and the calls only affect this thread.
    let rc = unsafe {
        let mut param: libc::sched_param = std::mem::zeroed();
        param.sched_priority = libc::sched_get_priority_max(libc::SCHED_RR);
        libc::sched_setscheduler(0, libc::SCHED_RR, &param)
    };
    if rc != 0 {
        warn!(
            "realtime scheduling unavailable for stream {}: {}",
            config.transfer_id,
            io::Error::last_os_error()
        );
    } else {
        debug!("stream {} running with SCHED_RR", config.transfer_id);
    }
}

#[cfg(not(target_os = "linux"))]
fn realtime_hint(config: &TestConfig) {
    if config.flags.realtime {
        warn!("realtime scheduling is only supported on Linux");
    }
}

/// Startup phases of a client worker
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    Created,
    WaitReporterReady,
    Connect,
    ConnectSync,
    Dispatch,
    Teardown,
}

/// Client role state machine
pub struct ClientWorker<'a> {
    config: TestConfig,
    ctx: &'a WorkerContext,
    state: ClientState,
}

impl<'a> ClientWorker<'a> {
    pub fn new(config: TestConfig, ctx: &'a WorkerContext) -> Self {
        Self {
            config,
            ctx,
            state: ClientState::Created,
        }
    }

    pub fn state(&self) -> ClientState {
        self.state
    }

    fn transition(&mut self, next: ClientState) {
        trace!(
            "stream {} client {:?} -> {:?}",
            self.config.transfer_id,
            self.state,
            next
        );
        self.state = next;
    }

    pub fn run(mut self) -> Result<()> {
        let result = self.execute();
        self.transition(ClientState::Teardown);
        let totals = match &result {
            Ok(totals) => totals.as_ref(),
            Err(_) => None,
        };
        release_reports(&mut self.config, self.ctx, totals);
        result.map(|_| ())
    }

    fn execute(&mut self) -> Result<Option<IntervalStats>> {
        realtime_hint(&self.config);

        self.transition(ClientState::WaitReporterReady);
        let ticks = crate::defaults::REPORTER_READY_TICKS;
        if !self.ctx.ready.wait_ticks(ticks, self.ctx.ready_tick) {
            return Err(TestError::ReporterUnavailable(ticks));
        }

        self.transition(ClientState::Connect);
        if self.config.flags.connect_only {
            connect_periodic(&self.config, self.ctx.transport.as_ref(), self.ctx.sink.as_ref())?;
            self.connect_sync();
            return Ok(None);
        }
        let connected = if self.config.flags.server_reverse {
            Ok(())
        } else {
            self.connect()
        };
        // streams that failed to connect still release the others
        self.connect_sync();
        connected?;

        self.transition(ClientState::Dispatch);
        let flags = self.config.flags;
        if flags.server_reverse {
            run_client_transfer(&self.config, self.ctx.sink.as_ref()).map(Some)
        } else if flags.reverse || flags.write_ack {
            self.run_with_companion()
        } else {
            self.start_synch()?;
            run_client_transfer(&self.config, self.ctx.sink.as_ref()).map(Some)
        }
    }

    fn connect(&mut self) -> Result<()> {
        let attempts = if self.config.flags.connect_back {
            CONNECT_BACK_ATTEMPTS
        } else {
            1
        };
        let mut attempt = 1;
        loop {
            match self.ctx.transport.connect(&self.config) {
                Ok(socket) => {
                    self.config.socket = Some(socket);
                    return Ok(());
                }
                Err(e) if attempt < attempts => {
                    debug!(
                        "stream {} connect attempt {}/{} failed: {}",
                        self.config.transfer_id, attempt, attempts, e
                    );
                    thread::sleep(self.ctx.connect_retry);
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn connect_sync(&mut self) {
        self.transition(ClientState::ConnectSync);
        if self.config.flags.skip_connect_sync {
            return;
        }
        if let Some(barrier) = &self.config.connect_barrier {
            if !barrier.wait() {
                warn!(
                    "stream {} connect sync timed out, starting without the other {} streams",
                    self.config.transfer_id,
                    barrier.parties() - 1
                );
            }
        }
    }

    /// Announce the test to the listener.
    fn start_synch(&self) -> Result<()> {
        let socket = self.config.socket.as_ref().ok_or_else(|| {
            TestError::FatalConfig(format!("stream {} has no socket", self.config.transfer_id))
        })?;
        socket.send_header(&TestHeader::from_config(&self.config))
    }

    fn run_with_companion(&mut self) -> Result<Option<IntervalStats>> {
        let Companion { config, policy } = derive_companion(&mut self.config, &self.ctx.arena)?;
        self.start_synch()?;
        let handle = spawn_thread(config, self.ctx.clone())?;
        match policy {
            CompanionPolicy::JoinBeforeReturn => {
                self.join_companion(handle);
                Ok(None)
            }
            CompanionPolicy::RunConcurrently => {
                let result = run_client_transfer(&self.config, self.ctx.sink.as_ref());
                self.join_companion(handle);
                result.map(Some)
            }
        }
    }

    fn join_companion(&self, handle: JoinHandle<Result<()>>) {
        match handle.join() {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(
                "companion of stream {} ended with error: {}",
                self.config.transfer_id, e
            ),
            Err(_) => warn!(
                "{}",
                TestError::JoinFailed(format!("companion of stream {} panicked", self.config.transfer_id))
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TestMode;
    use crate::net::{Acceptor, SocketHandle};
    use crate::results::{IntervalRecord, SumRecord};
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[derive(Default)]
    struct Collect {
        records: Mutex<Vec<IntervalRecord>>,
        sums: Mutex<Vec<SumRecord>>,
    }

    impl ReportSink for Collect {
        fn deliver(&self, record: IntervalRecord) {
            self.records.lock().push(record);
        }

        fn deliver_sum(&self, record: SumRecord) {
            self.sums.lock().push(record);
        }
    }

    /// Transport whose connects always fail
    #[derive(Default)]
    struct Refusing {
        attempts: AtomicU32,
    }

    impl Transport for Refusing {
        fn connect(&self, _config: &TestConfig) -> Result<SocketHandle> {
            self.attempts.fetch_add(1, Ordering::Relaxed);
            Err(io::Error::new(io::ErrorKind::ConnectionRefused, "refused").into())
        }

        fn listen(&self, _config: &TestConfig) -> Result<Box<dyn Acceptor>> {
            Err(io::Error::new(io::ErrorKind::Unsupported, "no listen").into())
        }
    }

    fn context_with(transport: Arc<Refusing>, sink: Arc<Collect>, ready: bool) -> WorkerContext {
        let flag = Arc::new(ReadyFlag::new());
        if ready {
            flag.set();
        }
        let mut ctx = WorkerContext::new(transport, sink, flag, Arc::new(ReportArena::new()));
        ctx.ready_tick = Duration::from_millis(5);
        ctx.connect_retry = Duration::from_millis(1);
        ctx
    }

    fn context(sink: Arc<Collect>, ready: bool) -> WorkerContext {
        context_with(Arc::new(Refusing::default()), sink, ready)
    }

    #[test]
    fn test_thread_names() {
        let mut config = TestConfig {
            transfer_id: 4,
            ..TestConfig::default()
        };
        assert_eq!(thread_name(&config), "client-4");
        config.flags.server_reverse = true;
        config.role = ThreadMode::Server;
        assert_eq!(thread_name(&config), "server-rev-4");
        config.role = ThreadMode::Listener;
        assert_eq!(thread_name(&config), "listener");
    }

    #[test]
    fn test_reporter_unavailable() {
        let ctx = context(Arc::new(Collect::default()), false);
        let err = spawn_worker(TestConfig::default(), &ctx).unwrap_err();
        assert!(matches!(err, TestError::ReporterUnavailable(_)));
        assert!(!err.is_fatal());
    }

    #[test]
    fn test_connect_failure_is_local() {
        let ctx = context(Arc::new(Collect::default()), true);
        let config = TestConfig {
            host: Some("127.0.0.1".into()),
            ..TestConfig::default()
        };
        let err = spawn_worker(config, &ctx).unwrap_err();
        assert!(matches!(err, TestError::Socket(_)));
        assert!(!err.is_fatal());
    }

    #[test]
    fn test_connect_back_retries() {
        let transport = Arc::new(Refusing::default());
        let ctx = context_with(Arc::clone(&transport), Arc::new(Collect::default()), true);
        let mut config = TestConfig {
            host: Some("127.0.0.1".into()),
            ..TestConfig::default()
        };
        spawn_worker(config.clone(), &ctx).unwrap_err();
        assert_eq!(transport.attempts.load(Ordering::Relaxed), 1);

        config.flags.connect_back = true;
        let err = spawn_worker(config, &ctx).unwrap_err();
        assert!(matches!(err, TestError::Socket(_)));
        assert_eq!(transport.attempts.load(Ordering::Relaxed), 1 + CONNECT_BACK_ATTEMPTS);
    }

    #[test]
    fn test_receiving_roles_get_realtime_hint() {
        assert!(receives_traffic(ThreadMode::Server));
        assert!(receives_traffic(ThreadMode::WriteAckServer));
        assert!(receives_traffic(ThreadMode::WriteAckClient));
        assert!(!receives_traffic(ThreadMode::Client));
        assert!(!receives_traffic(ThreadMode::Listener));
    }

    #[test]
    fn test_connect_only_reports_errors() {
        let sink = Arc::new(Collect::default());
        let ctx = context(Arc::clone(&sink), true);
        let mut config = TestConfig {
            host: Some("127.0.0.1".into()),
            connect_count: 3,
            mode: TestMode::Bytes(0),
            ..TestConfig::default()
        };
        config.flags.connect_only = true;
        spawn_worker(config, &ctx).unwrap();
        let records = sink.records.lock();
        assert_eq!(records.len(), 1);
        assert_eq!(
            records[0].kind,
            crate::results::RecordKind::ConnectTimes { attempts: 3, errors: 3 }
        );
    }

    #[test]
    fn test_release_reports_emits_group_sum() {
        let sink = Arc::new(Collect::default());
        let ctx = context(Arc::clone(&sink), true);
        let group = uuid::Uuid::new_v4();
        let report = ctx.arena.acquire(group, crate::results::SumKind::Group);
        let mut a = TestConfig {
            group_id: group,
            sum_report: Some(Arc::clone(&report)),
            ..TestConfig::default()
        };
        let mut b = a.clone();
        drop(report);

        let mut stats = IntervalStats::empty(1, crate::config::Protocol::Tcp, 0.0, 1.0);
        stats.bytes = 100;
        release_reports(&mut a, &ctx, Some(&stats));
        assert!(sink.sums.lock().is_empty());
        release_reports(&mut b, &ctx, Some(&stats));
        let sums = sink.sums.lock();
        assert_eq!(sums.len(), 1);
        assert_eq!(sums[0].bytes, 200);
        assert!(ctx.arena.is_empty());
    }
}
