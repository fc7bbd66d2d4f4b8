//! Worker status reports.

use std::fmt;

use serde::Serialize;

/// What a shared worker reported about itself.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WorkerStatus {
    /// Free-form status line from the implementation.
    pub text: String,
    /// Process ID, when the worker disclosed it.
    pub pid: Option<u32>,
}

impl WorkerStatus {
    pub fn new(text: impl Into<String>, pid: Option<u32>) -> Self {
        Self {
            text: text.into(),
            pid,
        }
    }
}

impl fmt::Display for WorkerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.pid {
            Some(pid) => write!(f, "{} (PID {})", self.text, pid),
            None => f.write_str(&self.text),
        }
    }
}
