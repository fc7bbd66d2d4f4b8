//! Tether CLI - manage named shared workers.

mod colors;
mod compile;
mod hooks;
mod lifecycle;
mod list;
mod stop_all;

use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand};
use tether_core::{Config, Registry};

use crate::hooks::WarmUpOptions;
use crate::list::ListOptions;
use crate::stop_all::StopAllOptions;

#[derive(Parser)]
#[command(name = "tether")]
#[command(about = "Manage this application's named shared workers")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file (default: $TETHER_CONFIG, then ./tether.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Disable colored output
    #[arg(long, global = true)]
    no_color: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// List the named shared workers
    List {
        /// Long format: show details about each worker (implies -c)
        #[arg(short, long)]
        long: bool,

        /// Color names by state (green = running, red = disabled)
        #[arg(short = 'c', long)]
        color_names: bool,

        /// Don't connect to workers to query their status
        #[arg(short = 'x', long)]
        no_status: bool,

        /// Also query remote workers (ignored with -x)
        #[arg(short, long)]
        remote_status: bool,

        /// Only list workers managed by this factory
        #[arg(short, long)]
        factory: Option<String>,
    },

    /// Stop the named shared workers
    StopAll {
        /// Also disable the workers (local ones only)
        #[arg(short = 'd', long)]
        also_disable: bool,

        /// Stop remote workers too (ignored with -k)
        #[arg(short = 'r', long)]
        include_remote: bool,

        /// Only stop workers managed by this factory
        #[arg(short, long)]
        factory: Option<String>,

        /// Send this signal (name or number) instead of the stop message
        #[arg(short = 'k', long)]
        signal: Option<String>,
    },

    /// Start a shared worker in the background
    Start {
        /// Shared worker name
        name: String,
    },

    /// Stop a shared worker with its admin cookie
    Stop {
        /// Shared worker name
        name: String,
    },

    /// Query a shared worker's status
    Status {
        /// Shared worker name
        name: String,
    },

    /// Disable a shared worker through its kill switch
    Disable {
        /// Shared worker name
        name: String,
    },

    /// Re-enable a disabled shared worker
    Enable {
        /// Shared worker name
        name: String,
    },

    /// Send a payload to a shared worker and print the reply
    Send {
        /// Shared worker name
        name: String,

        /// Payload text
        payload: String,

        /// Fail instead of starting the worker when it isn't running
        #[arg(long)]
        no_start: bool,
    },

    /// Precompile every worker's bootstrap script into the cache
    WarmUp {
        /// Cache directory (default: <root>/cache/tether)
        #[arg(long)]
        cache_dir: Option<PathBuf>,

        /// Leave eagerly starting workers stopped
        #[arg(long)]
        no_start: bool,

        /// Start from this directory instead (after the cache was moved)
        #[arg(long, conflicts_with = "no_start")]
        relocate_to: Option<PathBuf>,
    },

    /// Stop every local worker so it restarts from fresh scripts
    Clear,

    /// Print a worker's compiled bootstrap program
    Compile {
        /// Shared worker name
        name: String,

        /// Write to this file instead of stdout
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.verbose {
        tracing_subscriber::EnvFilter::from_default_env()
            .add_directive(tracing::Level::DEBUG.into())
    } else {
        tracing_subscriber::EnvFilter::from_default_env().add_directive(tracing::Level::WARN.into())
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    colors::init(cli.no_color);

    // Helper to format tether-core errors with recovery hints
    let format_error = |err: anyhow::Error| -> anyhow::Error {
        if let Some(tether_err) = err.downcast_ref::<tether_core::Error>() {
            anyhow::anyhow!("{}", tether_err.with_hint())
        } else {
            err
        }
    };

    let (config, registry) = load(cli.config.as_deref()).map_err(format_error)?;

    match cli.command {
        Commands::List {
            long,
            color_names,
            no_status,
            remote_status,
            factory,
        } => {
            let options = ListOptions::new(long, color_names, no_status, remote_status, factory);
            list::execute(&registry, &options).map_err(format_error)?;
        }

        Commands::StopAll {
            also_disable,
            include_remote,
            factory,
            signal,
        } => {
            let options =
                StopAllOptions::new(also_disable, include_remote, factory, signal.as_deref())?;
            stop_all::execute(&registry, &options).map_err(format_error)?;
        }

        Commands::Start { name } => lifecycle::start(&registry, &name).map_err(format_error)?,
        Commands::Stop { name } => lifecycle::stop(&registry, &name).map_err(format_error)?,
        Commands::Status { name } => lifecycle::status(&registry, &name).map_err(format_error)?,
        Commands::Disable { name } => lifecycle::disable(&registry, &name).map_err(format_error)?,
        Commands::Enable { name } => lifecycle::enable(&registry, &name).map_err(format_error)?,

        Commands::Send {
            name,
            payload,
            no_start,
        } => {
            lifecycle::send(&registry, &name, &payload, !no_start).map_err(format_error)?;
        }

        Commands::WarmUp {
            cache_dir,
            no_start,
            relocate_to,
        } => {
            let options = WarmUpOptions {
                cache_dir: cache_dir.as_deref(),
                no_start,
                relocate_to: relocate_to.as_deref(),
            };
            hooks::warm_up(&config, &registry, &options).map_err(format_error)?;
        }

        Commands::Clear => hooks::clear(&registry).map_err(format_error)?,

        Commands::Compile { name, output } => {
            compile::execute(&registry, &name, output.as_deref()).map_err(format_error)?;
        }
    }

    Ok(())
}

/// Load the configuration, or run with an empty one when there is none.
fn load(explicit: Option<&Path>) -> anyhow::Result<(Config, Registry)> {
    let config = match Config::locate(explicit) {
        Some(path) => Config::load(&path)?,
        None => {
            tracing::debug!("No configuration file found, using defaults");
            Config::default()
        }
    };
    let registry = config.build_registry()?;
    Ok((config, registry))
}
