//! Command dispatch shared by the socket and stdio transports.

use subtle::ConstantTimeEq;
use tether_core::ipc::{WorkerCommand, WorkerResponse};

use crate::implementations::WorkerImpl;

/// What the transport should do after replying.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Next {
    Continue,
    Exit,
}

/// Transport a command arrived on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Channel {
    /// A listening socket; anyone who can connect may send commands.
    Socket,
    /// The pipes of the parent process that owns this worker.
    Stdio,
}

/// Owns `workerImpl` and answers control commands.
pub struct Handler {
    worker: Box<dyn WorkerImpl>,
    channel: Channel,
    admin_cookie: Option<String>,
    pid: u32,
}

impl Handler {
    pub fn new(worker: Box<dyn WorkerImpl>, channel: Channel, admin_cookie: Option<String>) -> Self {
        Self {
            worker,
            channel,
            admin_cookie,
            pid: std::process::id(),
        }
    }

    pub fn handle(&mut self, command: WorkerCommand) -> (WorkerResponse, Next) {
        match command {
            WorkerCommand::Ping => (WorkerResponse::Pong, Next::Continue),

            WorkerCommand::Query => (
                WorkerResponse::Status {
                    text: self.worker.status(),
                    pid: self.pid,
                },
                Next::Continue,
            ),

            WorkerCommand::Send { payload } => match self.worker.handle(&payload) {
                Ok(payload) => (WorkerResponse::Reply { payload }, Next::Continue),
                Err(e) => {
                    tracing::debug!("{} failed: {:#}", self.worker.name(), e);
                    (error(format!("{:#}", e)), Next::Continue)
                }
            },

            WorkerCommand::Stop { cookie } => self.stop(&cookie),

            WorkerCommand::Shutdown => match self.channel {
                Channel::Stdio => (WorkerResponse::ShuttingDown, Next::Exit),
                Channel::Socket => (
                    error("shutdown is only accepted from the owning process"),
                    Next::Continue,
                ),
            },

            WorkerCommand::Bootstrap { .. } => {
                (error("the worker is already bootstrapped"), Next::Continue)
            }
        }
    }

    fn stop(&self, cookie: &str) -> (WorkerResponse, Next) {
        if self.channel == Channel::Stdio {
            return (WorkerResponse::Stopping, Next::Exit);
        }

        match &self.admin_cookie {
            Some(expected) if constant_time_eq(expected.as_bytes(), cookie.as_bytes()) => {
                tracing::info!("Stop requested with a valid admin cookie");
                (WorkerResponse::Stopping, Next::Exit)
            }
            Some(_) => {
                tracing::warn!("Rejected stop request with an invalid admin cookie");
                (error("invalid admin cookie"), Next::Continue)
            }
            None => (
                error("no admin cookie is configured; stop with a signal instead"),
                Next::Continue,
            ),
        }
    }
}

fn error(message: impl Into<String>) -> WorkerResponse {
    WorkerResponse::Error {
        message: message.into(),
    }
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    a.ct_eq(b).into()
}
