//! `tether warm-up` and `tether clear` - cache lifecycle hooks.

use std::io::Write;
use std::path::Path;

use anyhow::Result;
use tether_core::{Config, Registry};

use crate::colors::emphasis;

#[derive(Debug, Clone, Default)]
pub struct WarmUpOptions<'a> {
    /// Where scripts are compiled (default: the configured cache directory).
    pub cache_dir: Option<&'a Path>,
    /// Leave eager workers stopped.
    pub no_start: bool,
    /// Directory the cache was moved to before eager workers start.
    pub relocate_to: Option<&'a Path>,
}

pub fn warm_up(config: &Config, registry: &Registry, options: &WarmUpOptions) -> Result<()> {
    let stdout = std::io::stdout();
    let mut out = stdout.lock();
    run_warm_up(config, registry, options, &mut out)
}

/// Precompile every worker's script, then start the eager ones from the
/// relocated cache.
pub fn run_warm_up(
    config: &Config,
    registry: &Registry,
    options: &WarmUpOptions,
    out: &mut impl Write,
) -> Result<()> {
    let dirs = config.dirs();
    let cache_dir = options.cache_dir.unwrap_or(&dirs.cache_dir);

    let report = registry.warm_up(cache_dir, config.warm_up_timeout());

    for (name, script) in &report.compiled {
        writeln!(out, "Compiled {} to {}", emphasis(name), script.display())?;
    }
    for name in &report.skipped {
        writeln!(out, "Skipped {} (no implementation)", emphasis(name))?;
    }
    for (name, reason) in &report.failed {
        writeln!(out, "Failed to compile {}: {}", emphasis(name), reason)?;
    }

    if options.no_start {
        if !report.pending.is_empty() {
            writeln!(
                out,
                "{} eager worker(s) left stopped (--no-start).",
                report.pending.len()
            )?;
        }
        return Ok(());
    }

    for (name, result) in report.start_pending(options.relocate_to) {
        match result {
            Ok(pid) => writeln!(out, "Started {} (PID {})", emphasis(&name), pid)?,
            Err(e) => writeln!(out, "Failed to start {}: {}", emphasis(&name), e)?,
        }
    }

    Ok(())
}

/// Stop every local worker so it restarts from fresh scripts.
pub fn clear(registry: &Registry) -> Result<()> {
    let report = registry.clear();

    for name in &report.stopped {
        println!("Stopped {}", emphasis(name));
    }
    for name in &report.not_running {
        println!("{} was not running", emphasis(name));
    }
    for (name, reason) in &report.failed {
        println!("Failed to stop {}: {}", emphasis(name), reason);
    }

    Ok(())
}
