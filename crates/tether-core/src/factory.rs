//! Worker factories.
//!
//! A [`WorkerFactory`] owns one [`BootstrapProfile`] and performs every
//! lifecycle operation on the workers built from it: spawning anonymous stdio
//! workers, and starting, connecting to, querying, stopping, disabling and
//! re-enabling shared workers by address.

use std::path::Path;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use rustc_hash::FxHashMap;

use crate::address::SocketAddress;
use crate::bootstrap::{BootstrapProfile, ImplementationSource};
use crate::control::CallOptions;
use crate::error::{Error, Result};
use crate::ipc::{Connection, WorkerCommand, WorkerHandle, WorkerPool, WorkerResponse, connect};
use crate::kill_switch::{self, KillSwitch};
use crate::process::{DetachedLauncher, Launcher, pid_is_alive, read_pid_file};
use crate::status::WorkerStatus;

/// How long an auto-started worker gets to open its socket.
pub const DEFAULT_START_TIMEOUT: Duration = Duration::from_secs(10);

/// Delay between connection attempts while a worker starts.
const START_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Creates and controls workers from one bootstrap profile.
pub struct WorkerFactory {
    profile: BootstrapProfile,
    launcher: Arc<dyn Launcher>,
    call_options: CallOptions,
    start_timeout: Duration,
    /// PIDs of shared workers launched by this factory in this run.
    launched: Mutex<FxHashMap<SocketAddress, u32>>,
}

impl std::fmt::Debug for WorkerFactory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerFactory")
            .field("profile", &self.profile)
            .field("call_options", &self.call_options)
            .field("start_timeout", &self.start_timeout)
            .finish_non_exhaustive()
    }
}

impl WorkerFactory {
    /// Factory that launches shared workers as detached processes.
    pub fn new(profile: BootstrapProfile) -> Self {
        Self::with_launcher(profile, Arc::new(DetachedLauncher))
    }

    /// Factory with a custom process launcher.
    pub fn with_launcher(profile: BootstrapProfile, launcher: Arc<dyn Launcher>) -> Self {
        Self {
            profile,
            launcher,
            call_options: CallOptions::default(),
            start_timeout: DEFAULT_START_TIMEOUT,
            launched: Mutex::new(FxHashMap::default()),
        }
    }

    /// Set the options used by operations that don't take their own.
    pub fn set_call_options(&mut self, options: CallOptions) -> &mut Self {
        self.call_options = options;
        self
    }

    pub fn set_start_timeout(&mut self, timeout: Duration) -> &mut Self {
        self.start_timeout = timeout;
        self
    }

    pub fn profile(&self) -> &BootstrapProfile {
        &self.profile
    }

    pub fn call_options(&self) -> &CallOptions {
        &self.call_options
    }

    pub fn launcher(&self) -> &Arc<dyn Launcher> {
        &self.launcher
    }

    // =========================================================================
    // Anonymous workers
    // =========================================================================

    /// Spawn a private worker that talks over stdin/stdout.
    pub fn create_worker(&self, implementation: &ImplementationSource) -> Result<WorkerHandle> {
        WorkerHandle::spawn(&self.profile, implementation)
    }

    /// Spawn `count` private workers into a pool.
    pub fn create_worker_pool(
        &self,
        implementation: &ImplementationSource,
        count: usize,
    ) -> Result<WorkerPool> {
        WorkerPool::with_warm_workers(self.profile.clone(), implementation.clone(), count, count)
    }

    // =========================================================================
    // Shared workers
    // =========================================================================

    /// Open a control connection to the shared worker at `address`.
    ///
    /// When nothing listens there and `auto_start` is set, the worker is
    /// started and the connection retried until it answers or the start
    /// timeout elapses.
    pub fn connect_to_shared_worker(
        &self,
        address: &SocketAddress,
        implementation: Option<&ImplementationSource>,
        auto_start: bool,
        opts: &CallOptions,
    ) -> Result<Connection> {
        if let Some(connection) = connect(address, opts)? {
            return Ok(connection);
        }

        if !auto_start {
            return Err(Error::connect(address, "no worker is listening"));
        }

        self.start_shared_worker(address, implementation)?;

        let deadline = Instant::now() + self.start_timeout;
        loop {
            if let Some(connection) = connect(address, opts)? {
                return Ok(connection);
            }
            if Instant::now() >= deadline {
                return Err(Error::connect(
                    address,
                    format!(
                        "worker did not start listening within {:?}",
                        self.start_timeout
                    ),
                ));
            }
            thread::sleep(START_POLL_INTERVAL);
        }
    }

    /// Launch the shared worker for `address` in the background.
    ///
    /// Reuses a precompiled script when one was recorded for this pair,
    /// otherwise compiles one next to the socket. Returns the PID.
    pub fn start_shared_worker(
        &self,
        address: &SocketAddress,
        implementation: Option<&ImplementationSource>,
    ) -> Result<u32> {
        let implementation = implementation.ok_or_else(|| {
            Error::Logic(format!(
                "the shared worker at {} has no implementation to run",
                address
            ))
        })?;

        let script = match self.profile.precompiled_script(implementation, address) {
            Some(path) if path.exists() => path.to_path_buf(),
            _ => {
                self.check_startable(address)?;
                let path = address.script_file();
                self.profile.compile_to_path(implementation, address, &path)?;
                path
            }
        };

        self.launch_script(address, &script)
    }

    /// Launch an already compiled script for the shared worker at `address`.
    pub fn launch_script(&self, address: &SocketAddress, script: &Path) -> Result<u32> {
        self.check_startable(address)?;

        let command_line = self.profile.command_line(script)?;
        let pid = self
            .launcher
            .launch(&command_line)
            .map_err(|e| Error::connect(address, format!("failed to launch worker: {}", e)))?;

        self.remember(address, Some(pid));
        tracing::info!("Started shared worker {} (PID {})", address, pid);

        Ok(pid)
    }

    /// Only local, enabled workers may be started from here.
    fn check_startable(&self, address: &SocketAddress) -> Result<()> {
        if !address.is_local() {
            return Err(Error::Logic(format!(
                "can't start the remote shared worker at {}",
                address
            )));
        }

        if self.kill_switch_trips(address)? {
            return Err(Error::Logic(format!(
                "the shared worker at {} is disabled",
                address
            )));
        }

        Ok(())
    }

    /// PID of the local shared worker at `address`, if it can be identified.
    ///
    /// Known when this factory launched it in this run, or when the worker
    /// recorded it in its PID file. Remote workers and dead PIDs yield `None`.
    pub fn shared_worker_process_id(&self, address: &SocketAddress) -> Option<u32> {
        if !address.is_local() {
            return None;
        }

        let launched = self
            .launched
            .lock()
            .ok()
            .and_then(|launched| launched.get(address).copied());

        launched
            .filter(|pid| pid_is_alive(*pid))
            .or_else(|| read_pid_file(&address.pid_file()).filter(|pid| pid_is_alive(*pid)))
    }

    /// Ask the shared worker at `address` to stop.
    ///
    /// Returns `false` when no worker is listening there, `true` once a
    /// running worker acknowledged. Needs the profile's admin cookie.
    pub fn stop_shared_worker(&self, address: &SocketAddress, opts: &CallOptions) -> Result<bool> {
        let cookie = self.profile.admin_cookie().ok_or_else(|| {
            Error::Logic(format!(
                "no admin cookie is configured; can't stop the shared worker at {} with a message",
                address
            ))
        })?;

        let Some(mut connection) = connect(address, opts)? else {
            tracing::debug!("Shared worker {} is not running", address);
            return Ok(false);
        };

        match connection.request(&WorkerCommand::Stop {
            cookie: cookie.to_string(),
        })? {
            WorkerResponse::Stopping => {
                self.remember(address, None);
                tracing::info!("Stopped shared worker {}", address);
                Ok(true)
            }
            WorkerResponse::Error { message } => Err(Error::Logic(format!(
                "the shared worker at {} refused to stop: {}",
                address, message
            ))),
            other => Err(Error::Protocol(format!(
                "Unexpected response to stop from {}: {:?}",
                address, other
            ))),
        }
    }

    /// Ask the shared worker at `address` for its status.
    pub fn query_shared_worker(
        &self,
        address: &SocketAddress,
        opts: &CallOptions,
    ) -> Result<WorkerStatus> {
        let mut connection = connect(address, opts)?
            .ok_or_else(|| Error::connect(address, "no worker is listening"))?;

        match connection.request(&WorkerCommand::Query)? {
            WorkerResponse::Status { text, pid } => Ok(WorkerStatus::new(text, Some(pid))),
            WorkerResponse::Error { message } => Err(Error::Protocol(message)),
            other => Err(Error::Protocol(format!(
                "Unexpected response to query from {}: {:?}",
                address, other
            ))),
        }
    }

    // =========================================================================
    // Kill switch
    // =========================================================================

    /// Mark the local shared worker at `address` as disabled.
    pub fn disable_shared_worker(&self, address: &SocketAddress) -> Result<()> {
        let path = self.local_kill_switch(address, "disable")?;
        kill_switch::update(path, |ks| ks.disable(address))?;
        tracing::info!("Disabled shared worker {}", address);
        Ok(())
    }

    /// Lift the disable mark of the shared worker at `address`.
    pub fn re_enable_shared_worker(&self, address: &SocketAddress) -> Result<()> {
        let path = self.local_kill_switch(address, "re-enable")?;
        kill_switch::update(path, |ks| ks.re_enable(address))?;
        tracing::info!("Re-enabled shared worker {}", address);
        Ok(())
    }

    pub fn is_shared_worker_disabled(&self, address: &SocketAddress) -> Result<bool> {
        let path = self.local_kill_switch(address, "inspect")?;
        Ok(KillSwitch::load(path)?.is_disabled(address))
    }

    /// Disable every worker using this factory's kill switch.
    pub fn disable_all_shared_workers(&self) -> Result<()> {
        let path = self.kill_switch_path("disable")?;
        kill_switch::update(path, |ks| !std::mem::replace(&mut ks.global, true))?;
        tracing::info!("Disabled all shared workers of {}", path.display());
        Ok(())
    }

    /// Clear the global disable flag. Individually disabled workers stay disabled.
    pub fn re_enable_all_shared_workers(&self) -> Result<()> {
        let path = self.kill_switch_path("re-enable")?;
        kill_switch::update(path, |ks| std::mem::replace(&mut ks.global, false))?;
        tracing::info!("Re-enabled all shared workers of {}", path.display());
        Ok(())
    }

    fn kill_switch_path(&self, action: &str) -> Result<&Path> {
        self.profile.kill_switch_path().ok_or_else(|| {
            Error::Logic(format!(
                "no kill switch is configured; can't {} shared workers",
                action
            ))
        })
    }

    fn local_kill_switch(&self, address: &SocketAddress, action: &str) -> Result<&Path> {
        if !address.is_local() {
            return Err(Error::Logic(format!(
                "can't {} the remote shared worker at {}",
                action, address
            )));
        }
        self.kill_switch_path(action)
    }

    /// Whether a configured kill switch forbids starting `address`.
    fn kill_switch_trips(&self, address: &SocketAddress) -> Result<bool> {
        match self.profile.kill_switch_path() {
            Some(path) => Ok(KillSwitch::load(path)?.is_disabled(address)),
            None => Ok(false),
        }
    }

    fn remember(&self, address: &SocketAddress, pid: Option<u32>) {
        if let Ok(mut launched) = self.launched.lock() {
            match pid {
                Some(pid) => {
                    launched.insert(address.clone(), pid);
                }
                None => {
                    launched.remove(address);
                }
            }
        }
    }
}
