//! Inter-process communication with worker processes.
//!
//! Shared workers are reached over their socket with [`connect`]; anonymous
//! workers owned by this process talk over stdin/stdout through
//! [`WorkerHandle`].

pub mod protocol;
mod transport;
mod worker;

pub use protocol::{WorkerCommand, WorkerResponse, read_message, write_message};
pub use transport::{Connection, connect};
pub use worker::{STDIO_FLAG, WorkerHandle, WorkerPool};
