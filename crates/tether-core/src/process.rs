//! Launching detached shared workers and probing their processes.

use std::ffi::OsString;
use std::fs;
use std::path::Path;
use std::process::{Command, Stdio};

use crate::error::{Error, Result};

/// Starts shared worker processes.
///
/// [`DetachedLauncher`] is the real implementation; tests substitute a
/// recording fake.
pub trait Launcher: Send + Sync {
    /// Start `command_line` (program first) in the background and return its PID.
    fn launch(&self, command_line: &[OsString]) -> Result<u32>;
}

/// Launches workers that outlive the control process.
///
/// Children get null standard streams and their own process group, and a
/// reaper thread waits on each so it never lingers as a zombie while this
/// process is alive.
#[derive(Debug, Default, Clone, Copy)]
pub struct DetachedLauncher;

impl Launcher for DetachedLauncher {
    fn launch(&self, command_line: &[OsString]) -> Result<u32> {
        let (program, arguments) = command_line
            .split_first()
            .ok_or_else(|| Error::Logic("Empty worker command line".to_string()))?;

        let mut cmd = Command::new(program);
        cmd.args(arguments)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());

        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            // Keep terminal signals aimed at the CLI away from the worker.
            cmd.process_group(0);
        }

        let mut child = cmd.spawn()?;
        let pid = child.id();

        std::thread::Builder::new()
            .name(format!("tether-reaper-{}", pid))
            .spawn(move || {
                if let Ok(status) = child.wait() {
                    tracing::debug!("Worker {} exited: {}", pid, status);
                }
            })?;

        tracing::info!(
            "Launched {} (PID {})",
            Path::new(program).display(),
            pid
        );

        Ok(pid)
    }
}

/// Whether a process with this PID exists.
///
/// A process owned by another user still counts as alive.
#[cfg(unix)]
pub fn pid_is_alive(pid: u32) -> bool {
    let Ok(pid) = libc::pid_t::try_from(pid) else {
        return false;
    };
    if pid <= 0 {
        return false;
    }

    // SAFETY: signal 0 performs the permission and existence checks only.
    let rc = unsafe { libc::kill(pid, 0) };
    rc == 0 || std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

#[cfg(not(unix))]
pub fn pid_is_alive(_pid: u32) -> bool {
    false
}

/// PID recorded in `path`, if the file exists and holds one.
pub fn read_pid_file(path: &Path) -> Option<u32> {
    let text = fs::read_to_string(path).ok()?;
    match text.trim().parse::<u32>() {
        Ok(pid) if pid > 0 => Some(pid),
        _ => {
            tracing::debug!("Ignoring malformed PID file {}", path.display());
            None
        }
    }
}

/// Write `pid` to `path`, creating the parent directory.
pub fn write_pid_file(path: &Path, pid: u32) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(path, format!("{}\n", pid))?;
    Ok(())
}
