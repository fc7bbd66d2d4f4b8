//! Control plane for Tether shared workers.
//!
//! This crate provides:
//! - Bootstrap profiles that compile a worker's staged startup program
//! - Worker factories that start, query, stop, disable and re-enable workers
//! - The registry of named shared workers, with warm-up and clear hooks
//! - The length-prefixed control protocol spoken with workers
//! - Kill switch files and the TOML configuration loader

pub mod address;
pub mod bootstrap;
pub mod config;
pub mod control;
pub mod error;
pub mod factory;
pub mod ipc;
pub mod kill_switch;
pub mod paths;
pub mod process;
pub mod registry;
pub mod status;

pub use address::SocketAddress;
pub use bootstrap::{BootstrapDescriptor, BootstrapProfile, ImplementationSource, Stage, Step};
pub use config::Config;
pub use control::{AbortHandle, CallOptions};
pub use error::{Error, Result};
pub use factory::WorkerFactory;
pub use kill_switch::KillSwitch;
pub use paths::RuntimeDirs;
pub use process::{DetachedLauncher, Launcher};
pub use registry::{
    ClearReport, DEFAULT_FACTORY, PendingStart, Registry, SharedWorkerEntry, WarmUpReport,
};
pub use status::WorkerStatus;
