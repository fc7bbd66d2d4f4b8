//! Compiled bootstrap program.
//!
//! A descriptor is the structured form of a worker's startup program: an
//! ordered list of typed steps that the worker runtime executes top to
//! bottom. It is persisted as pretty JSON so the same file can be read back
//! by `tether-worker` and inspected by humans.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::address::SocketAddress;
use crate::error::{Error, Result};

use super::ImplementationSource;

/// Descriptor format version understood by this build.
pub const FORMAT_VERSION: u32 = 1;

/// Default event loop flavour when the profile sets none.
pub const DEFAULT_LOOP: &str = "current-thread";

/// Default channel framing when the profile sets none.
pub const DEFAULT_CHANNEL: &str = "length-prefixed";

/// Bootstrap stage a fragment belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    /// Before anything else is loaded.
    Stage1,
    /// After globals are bound.
    Stage2,
    /// After `workerImpl` exists.
    Stage3,
}

/// One step of a bootstrap program.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "step", rename_all = "snake_case")]
pub enum Step {
    /// Execute a bootstrap-language statement.
    Run { stage: Stage, fragment: String },
    /// Load a script of statements.
    Require { path: PathBuf },
    /// Bind a global variable.
    BindGlobal { name: String, expression: String },
    /// Create `workerImpl`.
    Instantiate {
        implementation: ImplementationSource,
        arguments: Vec<String>,
    },
    /// Serve the worker on its address.
    StartTransport {
        address: SocketAddress,
        loop_expression: String,
        channel_factory: String,
        socket_context: Option<String>,
    },
    /// Serve the parent process over stdin/stdout instead of a socket.
    ServeStdio { loop_expression: String },
}

/// A complete, self-contained worker startup program.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BootstrapDescriptor {
    /// Format version, see [`FORMAT_VERSION`].
    pub version: u32,
    /// Address the worker binds; `None` for anonymous stdio workers.
    pub address: Option<SocketAddress>,
    /// Secret that authorizes an in-band stop.
    pub admin_cookie: Option<String>,
    /// Kill switch consulted at start-up.
    pub kill_switch_path: Option<PathBuf>,
    /// Where a local worker records its PID.
    pub pid_file: Option<PathBuf>,
    /// Steps in execution order.
    pub steps: Vec<Step>,
}

impl BootstrapDescriptor {
    /// Serialize to the on-disk text form.
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self)
            .map_err(|e| Error::Serialization(format!("Failed to encode descriptor: {}", e)))
    }

    /// Parse the on-disk text form.
    pub fn from_json(text: &str) -> Result<Self> {
        let descriptor: Self = serde_json::from_str(text)
            .map_err(|e| Error::Serialization(format!("Failed to decode descriptor: {}", e)))?;

        if descriptor.version != FORMAT_VERSION {
            return Err(Error::Serialization(format!(
                "Unsupported descriptor version {} (expected {})",
                descriptor.version, FORMAT_VERSION
            )));
        }

        Ok(descriptor)
    }

    /// Load a persisted descriptor.
    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)?;
        Self::from_json(&text)
    }

    /// The instantiation step, if any.
    pub fn implementation(&self) -> Option<&ImplementationSource> {
        self.steps.iter().find_map(|step| match step {
            Step::Instantiate { implementation, .. } => Some(implementation),
            _ => None,
        })
    }
}

/// Failure to persist a compiled descriptor.
#[derive(Debug, thiserror::Error)]
#[error("failed to write bootstrap script {path}: {source}")]
pub struct PersistError {
    /// Destination that was being written.
    pub path: PathBuf,
    /// Whether a partial file may exist at `path` and must be removed.
    pub must_delete: bool,
    #[source]
    pub source: Error,
}

impl From<PersistError> for Error {
    fn from(e: PersistError) -> Self {
        match e.source {
            Error::Io(io) => Error::Io(io),
            other => Error::Serialization(format!("{}: {}", e.path.display(), other)),
        }
    }
}

/// Write a descriptor to `path`.
///
/// Creates the parent directory. On failure, `must_delete` tells the caller
/// whether the destination may now hold a truncated file.
pub fn persist(descriptor: &BootstrapDescriptor, path: &Path) -> std::result::Result<(), PersistError> {
    let fail = |must_delete: bool, source: Error| PersistError {
        path: path.to_path_buf(),
        must_delete,
        source,
    };

    let text = descriptor.to_json().map_err(|e| fail(false, e))?;

    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|e| fail(false, e.into()))?;
    }

    let mut file = fs::File::create(path).map_err(|e| fail(false, e.into()))?;
    file.write_all(text.as_bytes())
        .and_then(|_| file.write_all(b"\n"))
        .and_then(|_| file.sync_all())
        .map_err(|e| fail(true, e.into()))?;

    tracing::debug!(
        "Persisted bootstrap script ({} steps) to {}",
        descriptor.steps.len(),
        path.display()
    );

    Ok(())
}
