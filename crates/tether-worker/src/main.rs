//! Tether worker - executes a compiled bootstrap program.
//!
//! Shared workers are launched detached with the path of their compiled
//! script and serve on the script's address. Anonymous workers are started
//! with `--stdio` and receive their program from the parent over stdin.

mod handler;
mod implementations;
mod runtime;
mod server;
mod stdio;

use std::fs::{self, OpenOptions};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Mutex;

use anyhow::{Context as _, Result, anyhow, bail};
use clap::Parser;
use tether_core::{BootstrapDescriptor, KillSwitch};

use crate::handler::{Channel, Handler};
use crate::runtime::{LoopFlavor, Runtime, Transport};

#[derive(Parser)]
#[command(name = "tether-worker")]
#[command(about = "Run a Tether shared worker from its compiled bootstrap script")]
#[command(version)]
struct Cli {
    /// Compiled bootstrap script (JSON descriptor)
    #[arg(required_unless_present = "stdio")]
    script: Option<PathBuf>,

    /// Receive the program from the parent and serve it over stdin/stdout
    #[arg(long, conflicts_with = "script")]
    stdio: bool,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let result = match &cli.script {
        Some(script) if !cli.stdio => run_script(script, cli.verbose),
        _ => run_stdio(cli.verbose),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("{:#}", e);
            eprintln!("tether-worker: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

fn filter(verbose: bool) -> tracing_subscriber::EnvFilter {
    let level = if verbose {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };
    tracing_subscriber::EnvFilter::from_default_env().add_directive(level.into())
}

/// Stdout carries the protocol, so logs go to stderr.
fn run_stdio(verbose: bool) -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(filter(verbose))
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    stdio::serve()
}

fn run_script(script: &Path, verbose: bool) -> Result<()> {
    let descriptor = BootstrapDescriptor::load(script)
        .with_context(|| format!("Cannot load bootstrap script {}", script.display()))?;
    let address = descriptor
        .address
        .clone()
        .ok_or_else(|| anyhow!("{} has no address; run it with --stdio", script.display()))?;

    init_file_logging(&address.log_file(), verbose);
    tracing::info!("Bootstrapping {} from {}", address, script.display());

    if let Some(path) = &descriptor.kill_switch_path {
        let switch = KillSwitch::load(path)?;
        if switch.is_disabled(&address) {
            bail!("{} is disabled by the kill switch {}", address, path.display());
        }
    }

    // Runs before any runtime threads exist.
    let prepared = Runtime::new().execute(&descriptor)?;
    tracing::debug!(
        "Instantiated {} with {} globals bound",
        prepared.worker.name(),
        prepared.globals.len()
    );
    let Transport::Socket {
        address: bound,
        flavor,
        context,
    } = prepared.transport
    else {
        bail!("{} does not start a socket transport", script.display());
    };

    let handler = Handler::new(prepared.worker, Channel::Socket, descriptor.admin_cookie.clone());
    let runtime = build_runtime(flavor)?;
    runtime.block_on(server::serve(
        handler,
        &bound,
        context,
        descriptor.pid_file.as_deref(),
    ))
}

/// Detached workers have no terminal; log next to the socket instead.
fn init_file_logging(path: &Path, verbose: bool) {
    let file = path
        .parent()
        .map_or(Ok(()), fs::create_dir_all)
        .and_then(|()| OpenOptions::new().create(true).append(true).open(path));

    match file {
        Ok(file) => tracing_subscriber::fmt()
            .with_env_filter(filter(verbose))
            .with_target(false)
            .with_ansi(false)
            .with_writer(Mutex::new(file))
            .init(),
        Err(e) => {
            tracing_subscriber::fmt()
                .with_env_filter(filter(verbose))
                .with_target(false)
                .init();
            tracing::warn!("Cannot open log file {}: {}", path.display(), e);
        }
    }
}

fn build_runtime(flavor: LoopFlavor) -> Result<tokio::runtime::Runtime> {
    let mut builder = match flavor {
        LoopFlavor::CurrentThread => tokio::runtime::Builder::new_current_thread(),
        LoopFlavor::MultiThread { workers } => {
            let mut builder = tokio::runtime::Builder::new_multi_thread();
            if let Some(workers) = workers {
                builder.worker_threads(workers);
            }
            builder
        }
    };
    builder
        .enable_all()
        .build()
        .context("Failed to build the async runtime")
}
