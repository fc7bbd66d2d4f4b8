//! `tether stop-all` - stop every named shared worker.
//!
//! Workers are stopped with the authenticated stop message by default, or
//! with a POSIX signal when one is given. Signals only reach local workers
//! whose PID is known.

use std::io::Write;
use std::str::FromStr;

use anyhow::{Result, bail};
use nix::sys::signal::{Signal, kill};
use nix::unistd::Pid;
use tether_core::Registry;

use crate::colors::emphasis;

#[derive(Debug, Clone, Default)]
pub struct StopAllOptions {
    pub also_disable: bool,
    pub include_remote: bool,
    pub factory: Option<String>,
    pub signal: Option<Signal>,
}

impl StopAllOptions {
    /// A signal excludes remote workers whatever `include_remote` says.
    pub fn new(
        also_disable: bool,
        include_remote: bool,
        factory: Option<String>,
        signal: Option<&str>,
    ) -> Result<Self> {
        let signal = signal.map(parse_signal).transpose()?;
        Ok(Self {
            also_disable,
            include_remote: include_remote && signal.is_none(),
            factory,
            signal,
        })
    }
}

/// Parse a signal number, or a name with or without the `SIG` prefix.
pub fn parse_signal(text: &str) -> Result<Signal> {
    let text = text.trim();
    if let Ok(number) = text.parse::<i32>() {
        return Signal::try_from(number)
            .map_err(|_| anyhow::anyhow!("{} is not a valid signal number", number));
    }

    if text.is_empty() || !text.chars().all(|c| c.is_ascii_alphanumeric()) {
        bail!("The signal must be a valid signal number or name");
    }
    let upper = text.to_ascii_uppercase();
    let name = if upper.starts_with("SIG") {
        upper
    } else {
        format!("SIG{}", upper)
    };
    Signal::from_str(&name).map_err(|_| anyhow::anyhow!("Unknown signal {:?}", text))
}

/// Delivers signals to processes.
pub trait SignalSender {
    fn send(&self, pid: u32, signal: Signal) -> nix::Result<()>;
}

/// Sends real signals with `kill(2)`.
#[derive(Debug, Default)]
pub struct PosixSignals;

impl SignalSender for PosixSignals {
    fn send(&self, pid: u32, signal: Signal) -> nix::Result<()> {
        let pid = i32::try_from(pid).map_err(|_| nix::Error::ESRCH)?;
        kill(Pid::from_raw(pid), signal)
    }
}

pub fn execute(registry: &Registry, options: &StopAllOptions) -> Result<()> {
    let stdout = std::io::stdout();
    let mut out = stdout.lock();
    run(registry, options, &PosixSignals, &mut out)
}

/// Stop the workers, reporting one line per decision.
///
/// A failure on one worker is reported and the sweep continues. Only
/// failures to write the report end it.
pub fn run(
    registry: &Registry,
    options: &StopAllOptions,
    signals: &dyn SignalSender,
    out: &mut impl Write,
) -> Result<()> {
    for name in registry.shared_worker_names() {
        if let Err(err) = stop_one(registry, name, options, signals, out) {
            match err.downcast::<tether_core::Error>() {
                Ok(e) => writeln!(out, "Failed to stop worker {}: {}", emphasis(name), e)?,
                Err(io) => return Err(io),
            }
        }
    }

    Ok(())
}

fn stop_one(
    registry: &Registry,
    name: &str,
    options: &StopAllOptions,
    signals: &dyn SignalSender,
    out: &mut impl Write,
) -> Result<()> {
    let local = registry.shared_worker_address(name)?.is_local();
    let scope = if local { "local" } else { "remote" };

    if !options.include_remote && !local {
        writeln!(out, "Skipped remote worker {}.", emphasis(name))?;
        return Ok(());
    }

    let factory = registry.shared_worker_factory_name(name)?;
    if options.factory.as_deref().is_some_and(|f| f != factory) {
        writeln!(
            out,
            "Skipped {} worker {} from factory {}.",
            scope,
            emphasis(name),
            emphasis(factory)
        )?;
        return Ok(());
    }

    if options.also_disable && local {
        disable(registry, name, factory, out)?;
    }

    match options.signal {
        Some(signal) => stop_with_signal(registry, name, signal, signals, out),
        None => stop_with_message(registry, name, factory, scope, out),
    }
}

fn disable(registry: &Registry, name: &str, factory: &str, out: &mut impl Write) -> Result<()> {
    let profile = registry.shared_worker_factory(name)?.profile();
    if profile.kill_switch_path().is_none() {
        writeln!(
            out,
            "Couldn't disable local worker {} (please configure a kill switch on factory {} for this feature to work).",
            emphasis(name),
            emphasis(factory)
        )?;
        return Ok(());
    }

    match registry.disable_shared_worker(name) {
        Ok(()) => writeln!(out, "Disabled local worker {}.", emphasis(name))?,
        Err(e) => writeln!(out, "Failed to disable local worker {}: {}", emphasis(name), e)?,
    }
    Ok(())
}

fn stop_with_message(
    registry: &Registry,
    name: &str,
    factory: &str,
    scope: &str,
    out: &mut impl Write,
) -> Result<()> {
    let profile = registry.shared_worker_factory(name)?.profile();
    if profile.admin_cookie().is_none() {
        writeln!(
            out,
            "Couldn't send stop message to {} worker {} (please configure an admin cookie on factory {} for this feature to work).",
            scope,
            emphasis(name),
            emphasis(factory)
        )?;
        return Ok(());
    }

    match registry.stop_shared_worker(name) {
        Ok(true) => writeln!(out, "Sent stop message to {} worker {}.", scope, emphasis(name))?,
        Ok(false) => writeln!(
            out,
            "{} worker {} was not running.",
            capitalize(scope),
            emphasis(name)
        )?,
        Err(e) => writeln!(
            out,
            "Failed to stop {} worker {}: {}",
            scope,
            emphasis(name),
            e
        )?,
    }
    Ok(())
}

fn stop_with_signal(
    registry: &Registry,
    name: &str,
    signal: Signal,
    signals: &dyn SignalSender,
    out: &mut impl Write,
) -> Result<()> {
    let Some(pid) = registry.shared_worker_process_id(name)? else {
        writeln!(
            out,
            "Couldn't send signal to local worker {} because its PID couldn't be identified.",
            emphasis(name)
        )?;
        return Ok(());
    };

    match signals.send(pid, signal) {
        Ok(()) => writeln!(
            out,
            "Sent {} to local worker {} (PID {}).",
            signal,
            emphasis(name),
            emphasis(pid)
        )?,
        Err(e) => writeln!(
            out,
            "Failed sending {} to local worker {} (PID {}): {}",
            signal,
            emphasis(name),
            emphasis(pid),
            e
        )?,
    }
    Ok(())
}

fn capitalize(word: &str) -> String {
    let mut chars = word.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;
    use std::sync::Mutex;
    use tempfile::TempDir;
    use tether_core::Config;
    use tether_core::process::write_pid_file;

    use crate::colors;

    #[derive(Default)]
    struct RecordingSignals {
        sent: Mutex<Vec<(u32, Signal)>>,
    }

    impl SignalSender for RecordingSignals {
        fn send(&self, pid: u32, signal: Signal) -> nix::Result<()> {
            self.sent.lock().unwrap().push((pid, signal));
            Ok(())
        }
    }

    fn registry(root: &Path, secret: Option<&str>) -> Registry {
        colors::disable_colors();
        let secret = secret
            .map(|s| format!("secret = \"{}\"\n", s))
            .unwrap_or_default();
        let config = Config::parse(&format!(
            r#"
[paths]
root = "{}"
{}
[shared_workers.local]
expression = "Echo"

[shared_workers.far]
address = "tcp://worker.example.com:7000"
expression = "Echo"
"#,
            root.display(),
            secret
        ))
        .unwrap();
        config.build_registry().unwrap()
    }

    fn stop_all(registry: &Registry, options: &StopAllOptions, signals: &RecordingSignals) -> String {
        let mut out = Vec::new();
        run(registry, options, signals, &mut out).unwrap();
        String::from_utf8(out).unwrap()
    }

    #[test]
    fn test_parse_signal() {
        assert_eq!(parse_signal("TERM").unwrap(), Signal::SIGTERM);
        assert_eq!(parse_signal("SIGKILL").unwrap(), Signal::SIGKILL);
        assert_eq!(parse_signal("hup").unwrap(), Signal::SIGHUP);
        assert_eq!(parse_signal("15").unwrap(), Signal::SIGTERM);
        assert!(parse_signal("NOPE").is_err());
        assert!(parse_signal("TERM;").is_err());
        assert!(parse_signal("9999").is_err());
    }

    #[test]
    fn test_signal_excludes_remote() {
        let options = StopAllOptions::new(false, true, None, Some("TERM")).unwrap();
        assert!(!options.include_remote);
        assert_eq!(options.signal, Some(Signal::SIGTERM));
    }

    #[test]
    fn test_signal_mode_signals_known_pid_once() {
        let temp = TempDir::new().unwrap();
        let registry = registry(temp.path(), None);
        // The test process itself stands in for a running worker.
        let pid = std::process::id();
        let address = registry.shared_worker_address("local").unwrap();
        write_pid_file(&address.pid_file(), pid).unwrap();

        let signals = RecordingSignals::default();
        let options = StopAllOptions::new(false, true, None, Some("TERM")).unwrap();
        let text = stop_all(&registry, &options, &signals);

        assert_eq!(*signals.sent.lock().unwrap(), vec![(pid, Signal::SIGTERM)]);
        assert!(text.contains("Skipped remote worker far."));
        assert!(text.contains(&format!("Sent SIGTERM to local worker local (PID {}).", pid)));
    }

    #[test]
    fn test_signal_mode_without_pid() {
        let temp = TempDir::new().unwrap();
        let registry = registry(temp.path(), None);

        let signals = RecordingSignals::default();
        let options = StopAllOptions::new(false, false, None, Some("INT")).unwrap();
        let text = stop_all(&registry, &options, &signals);

        assert!(signals.sent.lock().unwrap().is_empty());
        assert!(text.contains("because its PID couldn't be identified"));
    }

    #[test]
    fn test_message_mode_needs_admin_cookie() {
        let temp = TempDir::new().unwrap();
        let registry = registry(temp.path(), None);

        let options = StopAllOptions::new(false, false, None, None).unwrap();
        let text = stop_all(&registry, &options, &RecordingSignals::default());
        assert!(text.contains("Couldn't send stop message to local worker local"));
    }

    #[test]
    fn test_message_mode_reports_not_running() {
        let temp = TempDir::new().unwrap();
        let registry = registry(temp.path(), Some("k"));

        let options = StopAllOptions::new(true, false, None, None).unwrap();
        let text = stop_all(&registry, &options, &RecordingSignals::default());
        assert!(text.contains("Disabled local worker local."));
        assert!(text.contains("Local worker local was not running."));
        assert!(registry.is_shared_worker_disabled("local").unwrap());
    }

    #[test]
    fn test_sweep_continues_after_bad_worker() {
        colors::disable_colors();
        let temp = TempDir::new().unwrap();
        let config = Config::parse(&format!(
            r#"
[paths]
root = "{}"
secret = "k"

[shared_workers.a]
factory = "ghost"
expression = "Echo"

[shared_workers.b]
expression = "Echo"
"#,
            temp.path().display()
        ))
        .unwrap();
        let registry = config.build_registry().unwrap();

        let options = StopAllOptions::new(false, false, None, None).unwrap();
        let text = stop_all(&registry, &options, &RecordingSignals::default());

        assert!(text.contains("Failed to stop worker a: unknown worker factory: ghost"));
        assert!(text.contains("Local worker b was not running."));
    }

    #[test]
    fn test_factory_filter_skips_others() {
        let temp = TempDir::new().unwrap();
        let registry = registry(temp.path(), None);

        let options = StopAllOptions::new(false, true, Some("other".to_string()), None).unwrap();
        let text = stop_all(&registry, &options, &RecordingSignals::default());
        assert!(text.contains("Skipped local worker local from factory default."));
        assert!(text.contains("Skipped remote worker far from factory default."));
    }
}
