//! # Duplex Bench - Main Entry Point
//!
//! 1. **Initialize logging** from `-v` / `RUST_LOG`, optionally to a file
//! 2. **Parse arguments** and build the validated template record
//! 3. **Start the reporter** thread and optional JSON streaming
//! 4. **Replicate** the template into a launch plan and execute it
//! 5. **Finish**: flush leftover sum reports and stop the reporter
//!
//! A fatal worker failure (a reverse test without a socket, for instance)
//! makes the process exit non-zero. A full-duplex barrier timeout exits
//! from inside the worker with status 0.

use anyhow::{bail, Context, Result};
use clap::Parser;
use duplex_bench::{
    cli::Args,
    config::TestConfig,
    dispatch::WorkerContext,
    launch::{replicate, Launcher, Threading},
    logging::init_logging,
    net::NetTransport,
    results::{client_banner, ReportArena, Reporter, ReporterOptions},
    ThreadMode, VERSION,
};
use std::sync::Arc;
use tracing::{debug, info};

fn main() -> Result<()> {
    let args = Args::parse();
    let _log_guard = init_logging(args.verbose, args.log_file.as_deref())?;

    debug!("duplex-bench {} starting: {:?}", VERSION, args);
    let template = TestConfig::from_args(&args).context("invalid configuration")?;
    if template.role == ThreadMode::Client {
        for line in client_banner(&template) {
            info!("{}", line);
        }
    }

    let reporter = Reporter::spawn(ReporterOptions {
        format: args.format,
        json: args.json.clone(),
    })?;
    let arena = Arc::new(ReportArena::new());
    let ctx = WorkerContext::new(
        Arc::new(NetTransport),
        reporter.sink(),
        reporter.ready(),
        Arc::clone(&arena),
    );

    let plan = replicate(template, Threading::Threads, &arena);
    let outcome = Launcher::new(ctx.clone(), args.affinity).execute(plan)?;

    for record in arena.drain() {
        if record.streams > 1 {
            ctx.sink.deliver_sum(record);
        }
    }
    drop(ctx);
    let summary = reporter.finish()?;
    debug!("reporter summary: {:?}", summary);

    if !outcome.fatal.is_empty() {
        bail!("test aborted: {}", outcome.fatal.join("; "));
    }
    Ok(())
}
