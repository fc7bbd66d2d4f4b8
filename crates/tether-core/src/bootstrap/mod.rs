//! Worker bootstrap compiler.
//!
//! A [`BootstrapProfile`] describes how to assemble a shared worker's
//! startup program in three caller-extensible stages:
//!
//! ```text
//! stage 1 parts ──► required scripts ──► stage 2 globals ──► stage 2 parts
//!                                                                 │
//!     start transport ◄── stage 3 parts ◄── instantiate workerImpl ◄┘
//! ```
//!
//! [`BootstrapProfile::compile`] turns the profile plus one worker's
//! implementation and address into a [`BootstrapDescriptor`], which
//! `tether-worker` executes.

mod descriptor;
mod implementation;

pub use descriptor::{
    BootstrapDescriptor, DEFAULT_CHANNEL, DEFAULT_LOOP, FORMAT_VERSION, PersistError, Stage, Step,
    persist,
};
pub use implementation::ImplementationSource;

use std::ffi::OsString;
use std::fs;
use std::path::{Path, PathBuf};

use crate::address::SocketAddress;
use crate::error::{Error, Result};

/// Name of the worker runtime binary.
pub const WORKER_BINARY: &str = "tether-worker";

/// Environment variable overriding the worker runtime location.
pub const WORKER_PATH_ENV: &str = "TETHER_WORKER_PATH";

/// How the worker's event loop is chosen.
#[derive(Debug, Clone, PartialEq, Eq)]
enum LoopSetting {
    Expression(String),
    Service(String),
}

/// Script compiled ahead of time for one (implementation, address) pair.
#[derive(Debug, Clone)]
struct PrecompiledScript {
    implementation: ImplementationSource,
    address: SocketAddress,
    path: PathBuf,
}

/// Compiler configuration for shared worker startup programs.
///
/// Built additively while the configuration is loaded, then shared
/// read-only by its [`WorkerFactory`](crate::WorkerFactory).
#[derive(Debug, Clone, Default)]
pub struct BootstrapProfile {
    stage1_parts: Vec<String>,
    scripts_to_require: Vec<PathBuf>,
    stage2_globals: Vec<(String, String)>,
    stage2_parts: Vec<String>,
    constructor_arguments: Vec<String>,
    stage3_parts: Vec<String>,
    interpreter: Option<PathBuf>,
    interpreter_arguments: Vec<String>,
    channel_factory: Option<String>,
    loop_setting: Option<LoopSetting>,
    socket_context_expression: Option<String>,
    admin_cookie: Option<String>,
    kill_switch_path: Option<PathBuf>,
    precompiled_scripts: Vec<PrecompiledScript>,
}

impl BootstrapProfile {
    /// Create an empty profile.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_stage1_part(&mut self, part: impl Into<String>) -> &mut Self {
        self.stage1_parts.push(part.into());
        self
    }

    pub fn add_script_to_require(&mut self, path: impl Into<PathBuf>) -> &mut Self {
        self.scripts_to_require.push(path.into());
        self
    }

    /// Bind a global in stage 2.
    ///
    /// Re-binding a name keeps its original position and takes the new value.
    pub fn add_stage2_global(
        &mut self,
        name: impl Into<String>,
        expression: impl Into<String>,
    ) -> &mut Self {
        let name = name.into();
        let expression = expression.into();
        match self.stage2_globals.iter_mut().find(|(n, _)| *n == name) {
            Some(slot) => slot.1 = expression,
            None => self.stage2_globals.push((name, expression)),
        }
        self
    }

    pub fn add_stage2_part(&mut self, part: impl Into<String>) -> &mut Self {
        self.stage2_parts.push(part.into());
        self
    }

    pub fn add_constructor_argument(&mut self, expression: impl Into<String>) -> &mut Self {
        self.constructor_arguments.push(expression.into());
        self
    }

    pub fn add_stage3_part(&mut self, part: impl Into<String>) -> &mut Self {
        self.stage3_parts.push(part.into());
        self
    }

    pub fn set_interpreter(&mut self, path: impl Into<PathBuf>) -> &mut Self {
        self.interpreter = Some(path.into());
        self
    }

    pub fn add_interpreter_argument(&mut self, argument: impl Into<String>) -> &mut Self {
        self.interpreter_arguments.push(argument.into());
        self
    }

    pub fn set_channel_factory(&mut self, channel: impl Into<String>) -> &mut Self {
        self.channel_factory = Some(channel.into());
        self
    }

    /// Set the loop expression.
    ///
    /// Fails with [`Error::AmbiguousDefinition`] if a loop service is set.
    pub fn set_loop_expression(&mut self, expression: impl Into<String>) -> Result<&mut Self> {
        if let Some(LoopSetting::Service(service)) = &self.loop_setting {
            return Err(Error::AmbiguousDefinition(format!(
                "bootstrap profiles can't have a loop expression and a loop service (\"{}\") at the same time",
                service
            )));
        }
        self.loop_setting = Some(LoopSetting::Expression(expression.into()));
        Ok(self)
    }

    /// Set the loop service, a global naming the loop flavour.
    ///
    /// Fails with [`Error::AmbiguousDefinition`] if a loop expression is set.
    pub fn set_loop_service(&mut self, service: impl Into<String>) -> Result<&mut Self> {
        if let Some(LoopSetting::Expression(expression)) = &self.loop_setting {
            return Err(Error::AmbiguousDefinition(format!(
                "bootstrap profiles can't have a loop expression (\"{}\") and a loop service at the same time",
                expression
            )));
        }
        self.loop_setting = Some(LoopSetting::Service(service.into()));
        Ok(self)
    }

    pub fn set_socket_context_expression(&mut self, expression: impl Into<String>) -> &mut Self {
        self.socket_context_expression = Some(expression.into());
        self
    }

    pub fn set_admin_cookie(&mut self, cookie: Option<String>) -> &mut Self {
        self.admin_cookie = cookie;
        self
    }

    pub fn set_kill_switch_path(&mut self, path: Option<PathBuf>) -> &mut Self {
        self.kill_switch_path = path;
        self
    }

    /// Record that the script for this (implementation, address) pair is
    /// compiled to `path`, so later starts reuse it.
    pub fn add_precompiled_script(
        &mut self,
        implementation: ImplementationSource,
        address: SocketAddress,
        path: impl Into<PathBuf>,
    ) -> &mut Self {
        let path = path.into();
        match self
            .precompiled_scripts
            .iter_mut()
            .find(|s| s.implementation == implementation && s.address == address)
        {
            Some(script) => script.path = path,
            None => self.precompiled_scripts.push(PrecompiledScript {
                implementation,
                address,
                path,
            }),
        }
        self
    }

    /// Precompiled script path for this pair, if one was recorded.
    pub fn precompiled_script(
        &self,
        implementation: &ImplementationSource,
        address: &SocketAddress,
    ) -> Option<&Path> {
        self.precompiled_scripts
            .iter()
            .find(|s| &s.implementation == implementation && &s.address == address)
            .map(|s| s.path.as_path())
    }

    pub fn admin_cookie(&self) -> Option<&str> {
        self.admin_cookie.as_deref()
    }

    pub fn kill_switch_path(&self) -> Option<&Path> {
        self.kill_switch_path.as_deref()
    }

    pub fn constructor_arguments(&self) -> &[String] {
        &self.constructor_arguments
    }

    /// Loop expression as it appears in compiled descriptors.
    ///
    /// A loop service compiles to a reference to the global of that name.
    pub fn loop_expression(&self) -> String {
        match &self.loop_setting {
            Some(LoopSetting::Expression(expression)) => expression.clone(),
            Some(LoopSetting::Service(service)) => format!("${}", service),
            None => DEFAULT_LOOP.to_string(),
        }
    }

    /// Compile the startup program of one shared worker.
    ///
    /// Pure and deterministic: the same profile, implementation and address
    /// always give the same descriptor.
    pub fn compile(
        &self,
        implementation: &ImplementationSource,
        address: &SocketAddress,
    ) -> BootstrapDescriptor {
        let mut steps = self.steps_through_stage3(implementation);
        steps.push(Step::StartTransport {
            address: address.clone(),
            loop_expression: self.loop_expression(),
            channel_factory: self
                .channel_factory
                .clone()
                .unwrap_or_else(|| DEFAULT_CHANNEL.to_string()),
            socket_context: self.socket_context_expression.clone(),
        });

        BootstrapDescriptor {
            version: FORMAT_VERSION,
            address: Some(address.clone()),
            admin_cookie: self.admin_cookie.clone(),
            kill_switch_path: self.kill_switch_path.clone(),
            pid_file: address.is_local().then(|| address.pid_file()),
            steps,
        }
    }

    /// Compile the startup program of an anonymous worker that talks to its
    /// parent over stdin/stdout.
    pub fn compile_anonymous(&self, implementation: &ImplementationSource) -> BootstrapDescriptor {
        let mut steps = self.steps_through_stage3(implementation);
        steps.push(Step::ServeStdio {
            loop_expression: self.loop_expression(),
        });

        BootstrapDescriptor {
            version: FORMAT_VERSION,
            address: None,
            admin_cookie: None,
            kill_switch_path: None,
            pid_file: None,
            steps,
        }
    }

    /// Stage 1 through stage 3, shared by both program shapes.
    fn steps_through_stage3(&self, implementation: &ImplementationSource) -> Vec<Step> {
        let mut steps = Vec::with_capacity(
            self.stage1_parts.len()
                + self.scripts_to_require.len()
                + self.stage2_globals.len()
                + self.stage2_parts.len()
                + self.stage3_parts.len()
                + 2,
        );

        steps.extend(self.stage1_parts.iter().map(|fragment| Step::Run {
            stage: Stage::Stage1,
            fragment: fragment.clone(),
        }));
        steps.extend(
            self.scripts_to_require
                .iter()
                .map(|path| Step::Require { path: path.clone() }),
        );
        steps.extend(
            self.stage2_globals
                .iter()
                .map(|(name, expression)| Step::BindGlobal {
                    name: name.clone(),
                    expression: expression.clone(),
                }),
        );
        steps.extend(self.stage2_parts.iter().map(|fragment| Step::Run {
            stage: Stage::Stage2,
            fragment: fragment.clone(),
        }));
        steps.push(Step::Instantiate {
            implementation: implementation.clone(),
            arguments: self.constructor_arguments.clone(),
        });
        steps.extend(self.stage3_parts.iter().map(|fragment| Step::Run {
            stage: Stage::Stage3,
            fragment: fragment.clone(),
        }));

        steps
    }

    /// Compile and persist a worker's script.
    ///
    /// A partially written file is removed before the error is returned.
    pub fn compile_to_path(
        &self,
        implementation: &ImplementationSource,
        address: &SocketAddress,
        path: &Path,
    ) -> Result<BootstrapDescriptor> {
        let descriptor = self.compile(implementation, address);

        if let Err(e) = persist(&descriptor, path) {
            if e.must_delete {
                if let Err(rm) = fs::remove_file(path) {
                    tracing::warn!("Failed to remove partial script {}: {}", path.display(), rm);
                }
            }
            return Err(e.into());
        }

        Ok(descriptor)
    }

    /// Interpreter and arguments used to run compiled scripts.
    ///
    /// Returns the configured values verbatim, or locates the worker runtime
    /// that ships with this build.
    pub fn resolve_interpreter(&self) -> Result<(PathBuf, Vec<String>)> {
        match &self.interpreter {
            Some(path) => Ok((path.clone(), self.interpreter_arguments.clone())),
            None => Ok((find_worker_binary()?, self.interpreter_arguments.clone())),
        }
    }

    /// Full command line that runs `script`.
    pub fn command_line(&self, script: &Path) -> Result<Vec<OsString>> {
        let (interpreter, arguments) = self.resolve_interpreter()?;
        let mut line = Vec::with_capacity(arguments.len() + 2);
        line.push(interpreter.into_os_string());
        line.extend(arguments.into_iter().map(OsString::from));
        line.push(script.as_os_str().to_owned());
        Ok(line)
    }
}

/// Find the tether-worker binary path.
///
/// Looks in the following order:
/// 1. `TETHER_WORKER_PATH` environment variable
/// 2. Same directory as the current executable
/// 3. System PATH
/// 4. The workspace `target/` directories during development
fn find_worker_binary() -> Result<PathBuf> {
    let worker_name = if cfg!(windows) {
        "tether-worker.exe"
    } else {
        WORKER_BINARY
    };

    if let Ok(path) = std::env::var(WORKER_PATH_ENV) {
        let path = PathBuf::from(path);
        if path.exists() {
            return Ok(path);
        }
    }

    if let Ok(exe_path) = std::env::current_exe()
        && let Some(exe_dir) = exe_path.parent()
    {
        let worker_path = exe_dir.join(worker_name);
        if worker_path.exists() {
            return Ok(worker_path);
        }
        // Test binaries live one level down, in target/<profile>/deps.
        if let Some(profile_dir) = exe_dir.parent() {
            let worker_path = profile_dir.join(worker_name);
            if worker_path.exists() {
                return Ok(worker_path);
            }
        }
    }

    if let Ok(path) = which::which(worker_name) {
        return Ok(path);
    }

    if let Ok(manifest_dir) = std::env::var("CARGO_MANIFEST_DIR") {
        for profile in &["debug", "release"] {
            let path = PathBuf::from(&manifest_dir)
                .join("..")
                .join("..")
                .join("target")
                .join(profile)
                .join(worker_name);
            if path.exists() {
                return Ok(path.canonicalize().unwrap_or(path));
            }
        }
    }

    Err(Error::Logic(format!(
        "Could not find {} binary. Set {} or ensure it's in PATH.",
        WORKER_BINARY, WORKER_PATH_ENV
    )))
}
