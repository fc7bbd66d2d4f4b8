//! Bootstrap program interpreter.
//!
//! Executes the steps of a [`BootstrapDescriptor`] in order and hands back
//! the instantiated `workerImpl` together with the transport it should be
//! served on.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context as _, Result, anyhow, bail};
use tether_core::bootstrap::DEFAULT_LOOP;
use tether_core::{BootstrapDescriptor, ImplementationSource, SocketAddress, Stage, Step};

use crate::implementations::{WorkerImpl, instantiate};

/// Event loop the worker is served on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopFlavor {
    CurrentThread,
    MultiThread { workers: Option<usize> },
}

impl LoopFlavor {
    /// Parse `current-thread`, `multi-thread` or `multi-thread(N)`.
    pub fn parse(text: &str) -> Result<Self> {
        match text.trim() {
            "current-thread" => Ok(Self::CurrentThread),
            "multi-thread" => Ok(Self::MultiThread { workers: None }),
            other => {
                let count = other
                    .strip_prefix("multi-thread(")
                    .and_then(|rest| rest.strip_suffix(')'))
                    .ok_or_else(|| anyhow!("Unknown loop flavour {:?}", other))?;
                let workers = count
                    .trim()
                    .parse::<usize>()
                    .ok()
                    .filter(|n| *n > 0)
                    .ok_or_else(|| anyhow!("Invalid worker thread count in {:?}", other))?;
                Ok(Self::MultiThread {
                    workers: Some(workers),
                })
            }
        }
    }
}

/// Listener tuning parsed from the socket context expression.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SocketContext {
    pub backlog: u32,
}

impl Default for SocketContext {
    fn default() -> Self {
        Self { backlog: 128 }
    }
}

impl SocketContext {
    /// Parse space or comma separated `key=value` pairs.
    pub fn parse(text: &str) -> Result<Self> {
        let mut context = Self::default();
        for pair in text
            .split(|c: char| c == ',' || c.is_whitespace())
            .filter(|p| !p.is_empty())
        {
            let (key, value) = pair
                .split_once('=')
                .ok_or_else(|| anyhow!("Expected key=value in socket context, got {:?}", pair))?;
            match key {
                "backlog" => {
                    context.backlog = value
                        .parse()
                        .with_context(|| format!("Invalid backlog {:?}", value))?;
                }
                other => tracing::warn!("Ignoring unknown socket context key {:?}", other),
            }
        }
        Ok(context)
    }
}

/// Where the bootstrapped worker is served.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transport {
    Socket {
        address: SocketAddress,
        flavor: LoopFlavor,
        context: SocketContext,
    },
    Stdio,
}

/// Result of running a bootstrap program.
pub struct Prepared {
    pub worker: Box<dyn WorkerImpl>,
    pub transport: Transport,
    pub globals: BTreeMap<String, String>,
}

impl std::fmt::Debug for Prepared {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Prepared")
            .field("worker", &self.worker.name())
            .field("transport", &self.transport)
            .finish()
    }
}

/// Interpreter state while a bootstrap program runs.
#[derive(Default)]
pub struct Runtime {
    globals: BTreeMap<String, String>,
    worker: Option<Box<dyn WorkerImpl>>,
}

impl Runtime {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run every step of `descriptor`.
    ///
    /// The program must instantiate `workerImpl` and end with exactly one
    /// transport step.
    pub fn execute(mut self, descriptor: &BootstrapDescriptor) -> Result<Prepared> {
        let mut transport = None;

        for (index, step) in descriptor.steps.iter().enumerate() {
            if transport.is_some() {
                bail!("Step {} follows the transport step", index + 1);
            }
            transport = self
                .execute_step(step)
                .with_context(|| format!("Bootstrap step {} failed", index + 1))?;
        }

        let transport = transport.ok_or_else(|| anyhow!("Bootstrap program never starts a transport"))?;
        let worker = self
            .worker
            .ok_or_else(|| anyhow!("Bootstrap program never instantiates workerImpl"))?;

        Ok(Prepared {
            worker,
            transport,
            globals: self.globals,
        })
    }

    fn execute_step(&mut self, step: &Step) -> Result<Option<Transport>> {
        match step {
            Step::Run { stage, fragment } => self.run_fragment(*stage, fragment)?,
            Step::Require { path } => self.require(path)?,
            Step::BindGlobal { name, expression } => {
                let value = self.resolve(expression)?;
                self.globals.insert(name.clone(), value);
            }
            Step::Instantiate {
                implementation,
                arguments,
            } => {
                if self.worker.is_some() {
                    bail!("workerImpl is already instantiated");
                }
                self.worker = Some(self.instantiate(implementation, arguments)?);
            }
            Step::StartTransport {
                address,
                loop_expression,
                channel_factory,
                socket_context,
            } => {
                if channel_factory != "length-prefixed" {
                    bail!("Unsupported channel factory {:?}", channel_factory);
                }
                let context = match socket_context {
                    Some(expression) => SocketContext::parse(&self.resolve(expression)?)?,
                    None => SocketContext::default(),
                };
                return Ok(Some(Transport::Socket {
                    address: address.clone(),
                    flavor: self.loop_flavor(loop_expression)?,
                    context,
                }));
            }
            Step::ServeStdio { loop_expression } => {
                // Stdio workers are served synchronously; the flavour is still validated.
                self.loop_flavor(loop_expression)?;
                return Ok(Some(Transport::Stdio));
            }
        }
        Ok(None)
    }

    fn loop_flavor(&self, expression: &str) -> Result<LoopFlavor> {
        let text = if expression.is_empty() {
            DEFAULT_LOOP.to_string()
        } else {
            self.resolve(expression)?
        };
        LoopFlavor::parse(&text)
    }

    /// Execute one statement of the bootstrap language.
    fn run_fragment(&mut self, stage: Stage, fragment: &str) -> Result<()> {
        let fragment = fragment.trim();
        if fragment.is_empty() || fragment.starts_with('#') {
            return Ok(());
        }

        let (verb, rest) = match fragment.split_once(char::is_whitespace) {
            Some((verb, rest)) => (verb, rest.trim()),
            None => (fragment, ""),
        };

        match verb {
            "env" => {
                let (key, value) = rest
                    .split_once('=')
                    .ok_or_else(|| anyhow!("env expects KEY=VALUE, got {:?}", rest))?;
                let value = self.resolve(value)?;
                // SAFETY: bootstrap runs before any other thread is started.
                unsafe { std::env::set_var(key.trim(), value) };
            }
            "unset-env" => {
                // SAFETY: bootstrap runs before any other thread is started.
                unsafe { std::env::remove_var(rest) };
            }
            "chdir" => {
                let dir = PathBuf::from(self.resolve(rest)?);
                std::env::set_current_dir(&dir)
                    .with_context(|| format!("Cannot change directory to {}", dir.display()))?;
            }
            "log" => tracing::info!("{}", self.interpolate(rest)?),
            "set" => {
                let (name, value) = rest
                    .split_once(char::is_whitespace)
                    .ok_or_else(|| anyhow!("set expects NAME VALUE, got {:?}", rest))?;
                let value = self.resolve(value.trim())?;
                self.globals.insert(name.to_string(), value);
            }
            "inject-context" => {
                let globals = self.globals.clone();
                let worker = self.stage3_worker(stage, verb)?;
                worker.inject_context(&globals);
            }
            "require-capability" => {
                let worker = self.stage3_worker(stage, verb)?;
                if !worker.capabilities().contains(&rest) {
                    bail!("{} does not provide the {:?} capability", worker.name(), rest);
                }
            }
            other => bail!("Unknown bootstrap verb {:?}", other),
        }

        Ok(())
    }

    fn stage3_worker(&mut self, stage: Stage, verb: &str) -> Result<&mut Box<dyn WorkerImpl>> {
        if stage != Stage::Stage3 {
            bail!("{} is only valid in stage 3", verb);
        }
        self.worker
            .as_mut()
            .ok_or_else(|| anyhow!("{} needs workerImpl", verb))
    }

    /// Run every statement of a script file, one per line.
    fn require(&mut self, path: &Path) -> Result<()> {
        let text = fs::read_to_string(path)
            .with_context(|| format!("Cannot require {}", path.display()))?;
        for line in text.lines() {
            self.run_fragment(Stage::Stage1, line)
                .with_context(|| format!("In {}", path.display()))?;
        }
        tracing::debug!("Required {}", path.display());
        Ok(())
    }

    fn instantiate(
        &self,
        implementation: &ImplementationSource,
        profile_arguments: &[String],
    ) -> Result<Box<dyn WorkerImpl>> {
        match implementation {
            ImplementationSource::Expression { text } => self.instantiate_expression(text),
            ImplementationSource::ServiceRef { name } => {
                let expression = self
                    .globals
                    .get(name)
                    .ok_or_else(|| anyhow!("No service named {:?} in the global scope", name))?;
                self.instantiate_expression(expression)
            }
            ImplementationSource::ClassRef { name, arguments } => {
                // Classes defined without arguments take the profile's.
                let arguments = if arguments.is_empty() {
                    profile_arguments
                } else {
                    arguments
                };
                let resolved = arguments
                    .iter()
                    .map(|a| self.resolve(a))
                    .collect::<Result<Vec<_>>>()?;
                instantiate(name, &resolved)
            }
        }
    }

    /// `Name` or `Name(arg, ...)`.
    fn instantiate_expression(&self, expression: &str) -> Result<Box<dyn WorkerImpl>> {
        let expression = expression.trim();
        let (name, arguments) = match expression.split_once('(') {
            Some((name, rest)) => {
                let inner = rest
                    .strip_suffix(')')
                    .ok_or_else(|| anyhow!("Unbalanced parentheses in {:?}", expression))?;
                let arguments = inner
                    .split(',')
                    .map(str::trim)
                    .filter(|a| !a.is_empty())
                    .map(|a| self.resolve(a))
                    .collect::<Result<Vec<_>>>()?;
                (name.trim(), arguments)
            }
            None => (expression, Vec::new()),
        };
        instantiate(name, &arguments)
    }

    /// Value of an expression: `$name` reads a global, quotes are stripped,
    /// anything else is literal.
    fn resolve(&self, expression: &str) -> Result<String> {
        let expression = expression.trim();
        if let Some(name) = expression.strip_prefix('$') {
            return self
                .globals
                .get(name)
                .cloned()
                .ok_or_else(|| anyhow!("Undefined global ${}", name));
        }
        if expression.len() >= 2 && expression.starts_with('"') && expression.ends_with('"') {
            return Ok(expression[1..expression.len() - 1].to_string());
        }
        Ok(expression.to_string())
    }

    /// Replace every `$name` word in `text`.
    fn interpolate(&self, text: &str) -> Result<String> {
        text.split(' ')
            .map(|word| match word.strip_prefix('$') {
                Some(_) => self.resolve(word),
                None => Ok(word.to_string()),
            })
            .collect::<Result<Vec<_>>>()
            .map(|words| words.join(" "))
    }
}
