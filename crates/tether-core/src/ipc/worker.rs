//! Anonymous stdio workers.
//!
//! Provides `WorkerHandle` for spawning and talking to a private worker
//! process over its standard streams, and `WorkerPool` for reusing them.

use std::io::{BufReader, BufWriter};
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::time::Duration;

use crate::bootstrap::{BootstrapProfile, ImplementationSource};
use crate::error::{Error, Result};
use crate::status::WorkerStatus;

use super::protocol::{WorkerCommand, WorkerResponse, read_message, write_message};

/// Flag that switches `tether-worker` to stdio mode.
pub const STDIO_FLAG: &str = "--stdio";

/// Handle to an anonymous worker process.
pub struct WorkerHandle {
    child: Child,
    stdin: BufWriter<ChildStdin>,
    stdout: BufReader<ChildStdout>,
    killed: bool,
}

impl WorkerHandle {
    /// Spawn a worker running `implementation` under `profile`.
    ///
    /// The compiled program is sent as the first message; the worker must
    /// then answer a ping before the handle is returned.
    pub fn spawn(profile: &BootstrapProfile, implementation: &ImplementationSource) -> Result<Self> {
        let (interpreter, arguments) = profile.resolve_interpreter()?;
        let descriptor = profile.compile_anonymous(implementation);

        let mut child = Command::new(&interpreter)
            .args(&arguments)
            .arg(STDIO_FLAG)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .spawn()
            .map_err(|e| {
                Error::Logic(format!(
                    "Failed to spawn worker process '{}': {}",
                    interpreter.display(),
                    e
                ))
            })?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| Error::Protocol("Failed to get worker stdin".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::Protocol("Failed to get worker stdout".to_string()))?;

        let mut handle = Self {
            child,
            stdin: BufWriter::new(stdin),
            stdout: BufReader::new(stdout),
            killed: false,
        };

        let reply = handle.request(&WorkerCommand::Bootstrap {
            descriptor_json: descriptor.to_json()?,
        })?;
        if let WorkerResponse::Error { message } = reply {
            return Err(Error::Logic(format!("Worker failed to bootstrap: {}", message)));
        }

        match handle.request(&WorkerCommand::Ping)? {
            WorkerResponse::Pong => {
                tracing::debug!("Spawned stdio worker {} ({})", handle.pid(), implementation);
                Ok(handle)
            }
            other => Err(unexpected("ping", &other)),
        }
    }

    /// Send a command and read its response.
    pub fn request(&mut self, command: &WorkerCommand) -> Result<WorkerResponse> {
        if self.killed {
            return Err(Error::Logic("Worker has been killed".to_string()));
        }
        write_message(&mut self.stdin, command)?;
        read_message(&mut self.stdout)?
    }

    /// Hand a payload to the worker implementation.
    pub fn send(&mut self, payload: Vec<u8>) -> Result<Vec<u8>> {
        match self.request(&WorkerCommand::Send { payload })? {
            WorkerResponse::Reply { payload } => Ok(payload),
            WorkerResponse::Error { message } => Err(Error::Logic(message)),
            other => Err(unexpected("send", &other)),
        }
    }

    /// Ask the worker for its status.
    pub fn query(&mut self) -> Result<WorkerStatus> {
        match self.request(&WorkerCommand::Query)? {
            WorkerResponse::Status { text, pid } => Ok(WorkerStatus::new(text, Some(pid))),
            WorkerResponse::Error { message } => Err(Error::Logic(message)),
            other => Err(unexpected("query", &other)),
        }
    }

    /// Kill the worker process immediately.
    pub fn kill(&mut self) -> Result<()> {
        if self.killed {
            return Ok(());
        }

        // Give the worker a chance to exit cleanly first.
        let _ = write_message(&mut self.stdin, &WorkerCommand::Shutdown);
        self.killed = true;
        std::thread::sleep(Duration::from_millis(10));

        if let Err(e) = self.child.kill()
            && e.kind() != std::io::ErrorKind::InvalidInput
        {
            tracing::warn!("Failed to kill worker {}: {}", self.child.id(), e);
        }

        // Reap the zombie.
        let _ = self.child.wait();

        Ok(())
    }

    /// Check if the worker process is still running.
    pub fn is_alive(&mut self) -> bool {
        if self.killed {
            return false;
        }
        matches!(self.child.try_wait(), Ok(None))
    }

    /// Get the process ID of the worker.
    pub fn pid(&self) -> u32 {
        self.child.id()
    }

    /// Graceful shutdown: ask the worker to exit and wait for it.
    pub fn shutdown(mut self) -> Result<()> {
        match self.request(&WorkerCommand::Shutdown) {
            Ok(WorkerResponse::ShuttingDown) => {}
            Ok(other) => tracing::warn!("Unexpected reply to shutdown: {:?}", other),
            Err(e) => tracing::warn!("Shutdown request failed: {}", e),
        }
        self.killed = true;

        let status = self.child.wait()?;
        if status.success() {
            Ok(())
        } else {
            Err(Error::Logic(format!("Worker exited with status: {}", status)))
        }
    }
}

impl Drop for WorkerHandle {
    fn drop(&mut self) {
        let _ = self.kill();
    }
}

fn unexpected(operation: &str, response: &WorkerResponse) -> Error {
    Error::Protocol(format!(
        "Unexpected response to {}: {:?}",
        operation, response
    ))
}

/// Pool of reusable anonymous workers running one implementation.
pub struct WorkerPool {
    profile: BootstrapProfile,
    implementation: ImplementationSource,
    available: Vec<WorkerHandle>,
    max_size: usize,
}

impl WorkerPool {
    /// Create an empty pool.
    pub fn new(
        profile: BootstrapProfile,
        implementation: ImplementationSource,
        max_size: usize,
    ) -> Self {
        Self {
            profile,
            implementation,
            available: Vec::with_capacity(max_size),
            max_size,
        }
    }

    /// Create a pool and pre-warm it with `warm_count` workers.
    pub fn with_warm_workers(
        profile: BootstrapProfile,
        implementation: ImplementationSource,
        max_size: usize,
        warm_count: usize,
    ) -> Result<Self> {
        let mut pool = Self::new(profile, implementation, max_size);
        for _ in 0..warm_count.min(max_size) {
            let worker = pool.spawn()?;
            pool.available.push(worker);
        }
        Ok(pool)
    }

    fn spawn(&self) -> Result<WorkerHandle> {
        WorkerHandle::spawn(&self.profile, &self.implementation)
    }

    /// Get a worker from the pool, spawning if necessary.
    pub fn get(&mut self) -> Result<WorkerHandle> {
        while let Some(mut worker) = self.available.pop() {
            if worker.is_alive() {
                return Ok(worker);
            }
        }
        self.spawn()
    }

    /// Return a worker to the pool.
    ///
    /// Dead workers and workers beyond `max_size` are dropped (killed).
    pub fn put(&mut self, mut worker: WorkerHandle) {
        if worker.is_alive() && self.available.len() < self.max_size {
            self.available.push(worker);
        }
    }

    /// Kill all idle workers.
    pub fn shutdown(&mut self) {
        for mut worker in self.available.drain(..) {
            let _ = worker.kill();
        }
    }

    pub fn available_count(&self) -> usize {
        self.available.len()
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}
