//! Built-in worker implementations.
//!
//! A bootstrap program instantiates exactly one of these as `workerImpl`.
//! The catalog is closed: implementation names that aren't listed here fail
//! at start-up.

use std::collections::BTreeMap;

use anyhow::{Context as _, Result, bail};

/// Unit of work hosted by a worker process.
pub trait WorkerImpl: Send {
    /// Name the implementation was instantiated under.
    fn name(&self) -> &'static str;

    /// Process one payload and produce the reply.
    fn handle(&mut self, payload: &[u8]) -> Result<Vec<u8>>;

    /// Human-readable status line.
    fn status(&self) -> String;

    /// Capabilities a stage-3 `require-capability` can check for.
    fn capabilities(&self) -> &'static [&'static str] {
        &[]
    }

    /// Receive the global scope. Only context-aware implementations care.
    fn inject_context(&mut self, _globals: &BTreeMap<String, String>) {}
}

/// Replies with the payload it received.
#[derive(Debug, Default)]
pub struct Echo {
    handled: u64,
}

impl WorkerImpl for Echo {
    fn name(&self) -> &'static str {
        "Echo"
    }

    fn handle(&mut self, payload: &[u8]) -> Result<Vec<u8>> {
        self.handled += 1;
        Ok(payload.to_vec())
    }

    fn status(&self) -> String {
        format!("Echo: {} messages handled", self.handled)
    }
}

/// Running total; each payload is a decimal delta (empty means 1).
#[derive(Debug)]
pub struct Counter {
    value: i64,
}

impl WorkerImpl for Counter {
    fn name(&self) -> &'static str {
        "Counter"
    }

    fn handle(&mut self, payload: &[u8]) -> Result<Vec<u8>> {
        let text = std::str::from_utf8(payload).context("Counter payloads must be UTF-8")?;
        let delta = match text.trim() {
            "" => 1,
            n => n
                .parse::<i64>()
                .with_context(|| format!("Invalid counter delta {:?}", n))?,
        };
        self.value = self.value.saturating_add(delta);
        Ok(self.value.to_string().into_bytes())
    }

    fn status(&self) -> String {
        format!("Counter at {}", self.value)
    }

    fn capabilities(&self) -> &'static [&'static str] {
        &["stateful"]
    }
}

/// Looks payloads up as names in the injected global scope.
#[derive(Debug, Default)]
pub struct Context {
    globals: BTreeMap<String, String>,
}

impl WorkerImpl for Context {
    fn name(&self) -> &'static str {
        "Context"
    }

    fn handle(&mut self, payload: &[u8]) -> Result<Vec<u8>> {
        let key = String::from_utf8_lossy(payload);
        match self.globals.get(key.trim()) {
            Some(value) => Ok(value.clone().into_bytes()),
            None => bail!("No global named {:?}", key.trim()),
        }
    }

    fn status(&self) -> String {
        format!("Context: {} globals", self.globals.len())
    }

    fn capabilities(&self) -> &'static [&'static str] {
        &["context-aware"]
    }

    fn inject_context(&mut self, globals: &BTreeMap<String, String>) {
        self.globals = globals.clone();
    }
}

/// Instantiate `name` with already resolved constructor arguments.
pub fn instantiate(name: &str, arguments: &[String]) -> Result<Box<dyn WorkerImpl>> {
    let worker: Box<dyn WorkerImpl> = match name {
        "Echo" => {
            ignore_extra_arguments(name, arguments, 0);
            Box::new(Echo::default())
        }
        "Counter" => {
            ignore_extra_arguments(name, arguments, 1);
            let value = match arguments.first() {
                Some(start) => start
                    .parse::<i64>()
                    .with_context(|| format!("Invalid Counter start value {:?}", start))?,
                None => 0,
            };
            Box::new(Counter { value })
        }
        "Context" => {
            ignore_extra_arguments(name, arguments, 0);
            Box::new(Context::default())
        }
        other => bail!("Unknown worker implementation {:?}", other),
    };

    tracing::debug!("Instantiated {} with {} arguments", name, arguments.len());
    Ok(worker)
}

/// Profiles pass their constructor arguments to every class, so extra
/// arguments are ignored with a warning rather than rejected.
fn ignore_extra_arguments(name: &str, arguments: &[String], max: usize) {
    if arguments.len() > max {
        tracing::warn!(
            "{} takes at most {} arguments, ignoring {}",
            name,
            max,
            arguments.len() - max
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_echo() {
        let mut echo = instantiate("Echo", &[]).unwrap();
        assert_eq!(echo.handle(b"ping").unwrap(), b"ping");
        assert_eq!(echo.status(), "Echo: 1 messages handled");
    }

    #[test]
    fn test_counter() {
        let mut counter = instantiate("Counter", &["5".to_string()]).unwrap();
        assert_eq!(counter.handle(b"").unwrap(), b"6");
        assert_eq!(counter.handle(b"-10").unwrap(), b"-4");
        assert!(counter.handle(b"lots").is_err());
        assert_eq!(counter.status(), "Counter at -4");
        assert_eq!(counter.capabilities(), &["stateful"]);
    }

    #[test]
    fn test_context_sees_injected_globals() {
        let mut context = instantiate("Context", &[]).unwrap();
        let mut globals = BTreeMap::new();
        globals.insert("root".to_string(), "/srv/app".to_string());
        context.inject_context(&globals);

        assert_eq!(context.handle(b"root").unwrap(), b"/srv/app");
        assert!(context.handle(b"missing").is_err());
    }

    #[test]
    fn test_unknown_implementation() {
        assert!(instantiate("Foo", &[]).is_err());
    }
}
