//! Error types for tether-core.

use thiserror::Error;

/// Result type for tether-core operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in tether-core.
#[derive(Debug, Error)]
pub enum Error {
    /// Two mutually exclusive settings were given together.
    #[error("ambiguous definition: {0}")]
    AmbiguousDefinition(String),

    /// Worker factory not registered.
    #[error("unknown worker factory: {0}")]
    NoSuchFactory(String),

    /// Shared worker not registered.
    #[error("unknown shared worker: {0}")]
    NoSuchSharedWorker(String),

    /// Socket operation against an address that could not be reached.
    ///
    /// This means "unknown", not "down": a remote network failure looks the
    /// same as a worker that is not running.
    #[error("cannot connect to {address}: {message}")]
    Connect { address: String, message: String },

    /// Operation requested without the capability it needs.
    #[error("{0}")]
    Logic(String),

    /// Malformed socket address.
    #[error("invalid socket address: {0}")]
    InvalidAddress(String),

    /// Configuration file could not be read or parsed.
    #[error("configuration error: {0}")]
    Config(String),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// The worker answered with something unexpected.
    #[error("protocol error: {0}")]
    Protocol(String),
}

impl Error {
    /// Shorthand for a [`Error::Connect`] on `address`.
    pub fn connect(address: impl ToString, message: impl ToString) -> Self {
        Self::Connect {
            address: address.to_string(),
            message: message.to_string(),
        }
    }

    /// Recovery hint for the user, if one applies.
    pub fn hint(&self) -> Option<&'static str> {
        match self {
            Self::AmbiguousDefinition(_) => {
                Some("give each shared worker exactly one of `expression`, `service` or `class`")
            }
            Self::NoSuchFactory(_) => Some("declare the factory under [factories.<name>]"),
            Self::NoSuchSharedWorker(_) => Some("run `tether list` to see the configured workers"),
            Self::Connect { .. } => Some("the worker may be down, or the network may be unreachable"),
            Self::Config(_) => Some("pass --config or set TETHER_CONFIG to the configuration file"),
            _ => None,
        }
    }

    /// Format the error with its hint appended.
    pub fn with_hint(&self) -> String {
        match self.hint() {
            Some(hint) => format!("{}\n  hint: {}", self, hint),
            None => self.to_string(),
        }
    }
}
