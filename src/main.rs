//! # fperf - Main Entry Point
//!
//! 1. **Parse arguments** and initialize logging.
//! 2. **Build the registry** of builtin client plug-ins.
//! 3. **Build the runtime** with the requested worker-thread count.
//! 4. **Run** until every worker finishes or SIGINT/SIGTERM arrives.
//! 5. **Report**: print the latency distribution to stdout and optionally
//!    write the JSON report.
//!
//! Startup failures (unknown client, dial failure, missing capability) are
//! logged and exit non-zero before any request is sent. An interrupted run
//! still prints its summary and exits 0; in-flight requests are abandoned
//! with the runtime.

use anyhow::{Context, Result};
use clap::{CommandFactory, Parser};
use fperf::{cli::Args, logging, BenchmarkConfig, BenchmarkRunner, Registry};
use std::sync::Arc;
use tracing::{error, info};

fn main() -> Result<()> {
    let args = Args::parse();
    let log_guard = logging::init(args.verbose, args.log_file.as_deref())?;

    let registry = Arc::new(Registry::with_builtins());

    if args.list_clients {
        print_clients(&registry);
        return Ok(());
    }
    if args.target.is_none() {
        // Help output failing to reach the terminal is not actionable.
        let _ = Args::command().print_help();
        println!();
        print_clients(&registry);
        std::process::exit(2);
    }

    let config = match BenchmarkConfig::from_args(&args) {
        Ok(config) => config,
        Err(e) => {
            error!("{}", e);
            drop(log_guard);
            std::process::exit(1);
        }
    };

    let threads = if args.threads == 0 {
        num_cpus::get()
    } else {
        args.threads
    };
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(threads)
        .enable_all()
        .build()
        .context("failed to build tokio runtime")?;
    info!("Starting fperf {} on {} threads", fperf::VERSION, threads);

    let runner = BenchmarkRunner::new(config, registry);
    let report = match runtime.block_on(runner.run()) {
        Ok(report) => report,
        Err(e) => {
            error!("{}", e);
            drop(log_guard);
            std::process::exit(1);
        }
    };

    println!("{}", report);
    if let Some(path) = &args.output_file {
        report.write_json(path)?;
    }

    if report.interrupted {
        runtime.shutdown_background();
    }
    Ok(())
}

fn print_clients(registry: &Registry) {
    println!("Registered clients:");
    for (name, description) in registry.descriptions() {
        println!("  {:<12} {}", name, description);
    }
}
