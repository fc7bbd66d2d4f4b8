//! Registry of worker factories and named shared workers.
//!
//! A [`Registry`] is built once per process while the configuration is
//! loaded and is read-only afterwards. Commands and the cache hooks receive
//! it by reference; nothing looks it up implicitly.

use std::ffi::OsString;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::mpsc;
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use std::time::Duration;

use rustc_hash::FxHashMap;

use crate::address::SocketAddress;
use crate::bootstrap::{BootstrapProfile, ImplementationSource};
use crate::error::{Error, Result};
use crate::factory::WorkerFactory;
use crate::ipc::Connection;
use crate::paths::warm_up_script;
use crate::status::WorkerStatus;

/// Name of the factory used when none is given.
pub const DEFAULT_FACTORY: &str = "default";

/// Default bound on compiling one worker during warm-up.
pub const DEFAULT_WARM_UP_TIMEOUT: Duration = Duration::from_secs(30);

/// Registration of one shared worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SharedWorkerEntry {
    /// Name of the factory that builds and controls it.
    pub factory: String,
    /// Where it listens.
    pub address: SocketAddress,
    /// What it runs; `None` for workers that are only ever connected to.
    pub implementation: Option<ImplementationSource>,
    /// Start it right after warm-up.
    pub eager_start: bool,
}

impl SharedWorkerEntry {
    pub fn new(
        factory: impl Into<String>,
        address: SocketAddress,
        implementation: Option<ImplementationSource>,
        eager_start: bool,
    ) -> Self {
        Self {
            factory: factory.into(),
            address,
            implementation,
            eager_start,
        }
    }
}

/// Insertion-ordered map where re-inserting a key replaces its value in place.
#[derive(Debug)]
struct OrderedMap<V> {
    entries: Vec<(String, V)>,
    index: FxHashMap<String, usize>,
}

impl<V> Default for OrderedMap<V> {
    fn default() -> Self {
        Self {
            entries: Vec::new(),
            index: FxHashMap::default(),
        }
    }
}

impl<V> OrderedMap<V> {
    fn insert(&mut self, key: String, value: V) {
        match self.index.get(&key) {
            Some(&i) => self.entries[i].1 = value,
            None => {
                self.index.insert(key.clone(), self.entries.len());
                self.entries.push((key, value));
            }
        }
    }

    fn get(&self, key: &str) -> Option<&V> {
        self.index.get(key).map(|&i| &self.entries[i].1)
    }

    fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(k, _)| k.as_str())
    }

    fn iter(&self) -> impl Iterator<Item = (&str, &V)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }

    fn len(&self) -> usize {
        self.entries.len()
    }
}

/// Named factories and shared workers.
#[derive(Debug, Default)]
pub struct Registry {
    factories: OrderedMap<Arc<WorkerFactory>>,
    shared_workers: OrderedMap<SharedWorkerEntry>,
}

impl Registry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    // =========================================================================
    // Factories
    // =========================================================================

    pub fn register_factory(
        &mut self,
        name: impl Into<String>,
        factory: Arc<WorkerFactory>,
    ) -> &mut Self {
        self.factories.insert(name.into(), factory);
        self
    }

    pub fn factory_names(&self) -> impl Iterator<Item = &str> {
        self.factories.keys()
    }

    /// Look up a factory; `None` means [`DEFAULT_FACTORY`].
    pub fn factory(&self, name: Option<&str>) -> Result<&Arc<WorkerFactory>> {
        let name = name.unwrap_or(DEFAULT_FACTORY);
        self.factories
            .get(name)
            .ok_or_else(|| Error::NoSuchFactory(name.to_string()))
    }

    // =========================================================================
    // Shared workers
    // =========================================================================

    pub fn register_shared_worker(
        &mut self,
        name: impl Into<String>,
        entry: SharedWorkerEntry,
    ) -> &mut Self {
        self.shared_workers.insert(name.into(), entry);
        self
    }

    /// Registered shared worker names, in registration order.
    pub fn shared_worker_names(&self) -> impl Iterator<Item = &str> {
        self.shared_workers.keys()
    }

    pub fn shared_worker_count(&self) -> usize {
        self.shared_workers.len()
    }

    /// Registration of `name`.
    ///
    /// Every per-worker operation goes through here, so an unknown name is
    /// always reported as [`Error::NoSuchSharedWorker`].
    pub fn shared_worker(&self, name: &str) -> Result<&SharedWorkerEntry> {
        self.shared_workers
            .get(name)
            .ok_or_else(|| Error::NoSuchSharedWorker(name.to_string()))
    }

    pub fn shared_worker_factory_name(&self, name: &str) -> Result<&str> {
        Ok(&self.shared_worker(name)?.factory)
    }

    pub fn shared_worker_factory(&self, name: &str) -> Result<&Arc<WorkerFactory>> {
        let entry = self.shared_worker(name)?;
        self.factory(Some(&entry.factory))
    }

    pub fn shared_worker_address(&self, name: &str) -> Result<&SocketAddress> {
        Ok(&self.shared_worker(name)?.address)
    }

    pub fn shared_worker_implementation(&self, name: &str) -> Result<Option<&ImplementationSource>> {
        Ok(self.shared_worker(name)?.implementation.as_ref())
    }

    pub fn is_shared_worker_eagerly_starting(&self, name: &str) -> Result<bool> {
        Ok(self.shared_worker(name)?.eager_start)
    }

    fn resolve(&self, name: &str) -> Result<(&SharedWorkerEntry, &Arc<WorkerFactory>)> {
        let entry = self.shared_worker(name)?;
        Ok((entry, self.factory(Some(&entry.factory))?))
    }

    pub fn connect_to_shared_worker(&self, name: &str, auto_start: bool) -> Result<Connection> {
        let (entry, factory) = self.resolve(name)?;
        factory.connect_to_shared_worker(
            &entry.address,
            entry.implementation.as_ref(),
            auto_start,
            factory.call_options(),
        )
    }

    pub fn start_shared_worker(&self, name: &str) -> Result<u32> {
        let (entry, factory) = self.resolve(name)?;
        factory.start_shared_worker(&entry.address, entry.implementation.as_ref())
    }

    pub fn shared_worker_process_id(&self, name: &str) -> Result<Option<u32>> {
        let (entry, factory) = self.resolve(name)?;
        Ok(factory.shared_worker_process_id(&entry.address))
    }

    pub fn stop_shared_worker(&self, name: &str) -> Result<bool> {
        let (entry, factory) = self.resolve(name)?;
        factory.stop_shared_worker(&entry.address, factory.call_options())
    }

    pub fn query_shared_worker(&self, name: &str) -> Result<WorkerStatus> {
        let (entry, factory) = self.resolve(name)?;
        factory.query_shared_worker(&entry.address, factory.call_options())
    }

    pub fn disable_shared_worker(&self, name: &str) -> Result<()> {
        let (entry, factory) = self.resolve(name)?;
        factory.disable_shared_worker(&entry.address)
    }

    pub fn re_enable_shared_worker(&self, name: &str) -> Result<()> {
        let (entry, factory) = self.resolve(name)?;
        factory.re_enable_shared_worker(&entry.address)
    }

    pub fn is_shared_worker_disabled(&self, name: &str) -> Result<bool> {
        let (entry, factory) = self.resolve(name)?;
        factory.is_shared_worker_disabled(&entry.address)
    }

    // =========================================================================
    // Cache hooks
    // =========================================================================

    /// Stop every local shared worker with its admin cookie.
    ///
    /// Best effort: failures are logged and collected, never raised, so one
    /// broken worker can't keep the others running.
    pub fn clear(&self) -> ClearReport {
        let mut report = ClearReport::default();

        for (name, entry) in self.shared_workers.iter() {
            if !entry.address.is_local() {
                continue;
            }

            let outcome = self
                .factory(Some(&entry.factory))
                .and_then(|factory| factory.stop_shared_worker(&entry.address, factory.call_options()));

            match outcome {
                Ok(true) => report.stopped.push(name.to_string()),
                Ok(false) => report.not_running.push(name.to_string()),
                Err(e) => {
                    tracing::warn!("Failed to stop shared worker {}: {}", name, e);
                    report.failed.push((name.to_string(), e.to_string()));
                }
            }
        }

        report
    }

    /// Precompile every shared worker's bootstrap script into `cache_dir`.
    ///
    /// Entries run one after another; each compile gets at most
    /// `per_entry_timeout`. Workers marked for eager start are not launched
    /// here but returned as [`PendingStart`]s, so the caller can start them
    /// once the cache directory reached its final location.
    pub fn warm_up(&self, cache_dir: &Path, per_entry_timeout: Duration) -> WarmUpReport {
        self.warm_up_with(cache_dir, per_entry_timeout, compile_script)
    }

    fn warm_up_with(
        &self,
        cache_dir: &Path,
        per_entry_timeout: Duration,
        compile: CompileFn,
    ) -> WarmUpReport {
        let mut report = WarmUpReport {
            cache_dir: cache_dir.to_path_buf(),
            ..WarmUpReport::default()
        };

        for (name, entry) in self.shared_workers.iter() {
            let Some(implementation) = entry.implementation.clone() else {
                tracing::debug!("Shared worker {} has no implementation, skipping", name);
                report.skipped.push(name.to_string());
                continue;
            };

            let factory = match self.factory(Some(&entry.factory)) {
                Ok(factory) => Arc::clone(factory),
                Err(e) => {
                    report.failed.push((name.to_string(), e.to_string()));
                    continue;
                }
            };

            let script = warm_up_script(cache_dir, name);
            let compiled = compile_with_timeout(
                factory.profile(),
                implementation,
                &entry.address,
                &script,
                per_entry_timeout,
                compile,
            );
            match compiled {
                Ok(()) => {
                    tracing::debug!("Warmed up shared worker {} at {}", name, script.display());
                    report.compiled.push((name.to_string(), script.clone()));
                    if entry.eager_start {
                        report.pending.push(PendingStart {
                            worker: name.to_string(),
                            factory,
                            address: entry.address.clone(),
                            script,
                        });
                    }
                }
                Err(e) => {
                    tracing::warn!("Failed to warm up shared worker {}: {}", name, e);
                    report.failed.push((name.to_string(), e.to_string()));
                }
            }
        }

        report
    }
}

type CompileFn = fn(&BootstrapProfile, &ImplementationSource, &SocketAddress, &Path) -> Result<()>;

fn compile_script(
    profile: &BootstrapProfile,
    implementation: &ImplementationSource,
    address: &SocketAddress,
    path: &Path,
) -> Result<()> {
    profile.compile_to_path(implementation, address, path).map(|_| ())
}

/// Compile on a helper thread so a hanging compile can't stall the sweep.
///
/// The helper writes a staging file next to `script` and renames it into
/// place only while the caller is still waiting. Once the caller gives up,
/// `script` is removed and a late compile can't bring it back.
fn compile_with_timeout(
    profile: &BootstrapProfile,
    implementation: ImplementationSource,
    address: &SocketAddress,
    script: &Path,
    timeout: Duration,
    compile: CompileFn,
) -> Result<()> {
    let profile = profile.clone();
    let address = address.clone();
    let target = script.to_path_buf();
    let staging = staging_path(script);
    let abandoned = Arc::new(Mutex::new(false));
    let (tx, rx) = mpsc::channel();

    let helper_abandoned = Arc::clone(&abandoned);
    thread::Builder::new()
        .name("tether-warm-up".to_string())
        .spawn(move || {
            let result = compile(&profile, &implementation, &address, &staging);

            // Held until the result is sent.
            let abandoned = helper_abandoned
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            if *abandoned {
                discard(&staging);
                return;
            }

            let result = result.and_then(|()| fs::rename(&staging, &target).map_err(Error::from));
            if result.is_err() {
                discard(&staging);
            }
            let _ = tx.send(result);
        })?;

    let result = match rx.recv_timeout(timeout) {
        Ok(result) => result,
        Err(mpsc::RecvTimeoutError::Timeout) => {
            let mut abandoned = abandoned.lock().unwrap_or_else(PoisonError::into_inner);
            match rx.try_recv() {
                Ok(result) => result,
                Err(_) => {
                    *abandoned = true;
                    Err(Error::Logic(format!(
                        "compiling {} took longer than {:?}",
                        script.display(),
                        timeout
                    )))
                }
            }
        }
        Err(mpsc::RecvTimeoutError::Disconnected) => Err(Error::Logic(format!(
            "compiling {} was interrupted",
            script.display()
        ))),
    };

    if result.is_err() {
        discard(script);
    }
    result
}

fn staging_path(script: &Path) -> PathBuf {
    let mut name = script
        .file_name()
        .map(OsString::from)
        .unwrap_or_default();
    name.push(".tmp");
    script.with_file_name(name)
}

fn discard(path: &Path) {
    if let Err(e) = fs::remove_file(path)
        && e.kind() != io::ErrorKind::NotFound
    {
        tracing::warn!("Failed to remove {}: {}", path.display(), e);
    }
}

/// Outcome of [`Registry::clear`].
#[derive(Debug, Default)]
pub struct ClearReport {
    /// Workers that acknowledged the stop.
    pub stopped: Vec<String>,
    /// Workers that were not running.
    pub not_running: Vec<String>,
    /// Workers that could not be stopped, with the reason.
    pub failed: Vec<(String, String)>,
}

/// Outcome of [`Registry::warm_up`].
#[derive(Debug, Default)]
pub struct WarmUpReport {
    /// Directory the scripts were written to.
    pub cache_dir: PathBuf,
    /// Compiled workers and their scripts.
    pub compiled: Vec<(String, PathBuf)>,
    /// Workers without an implementation.
    pub skipped: Vec<String>,
    /// Workers that failed to compile, with the reason.
    pub failed: Vec<(String, String)>,
    /// Eager workers waiting to be started.
    pub pending: Vec<PendingStart>,
}

impl WarmUpReport {
    /// Start every pending eager worker.
    ///
    /// With `relocated_to`, scripts are launched from that directory instead
    /// of the one they were compiled into.
    pub fn start_pending(&self, relocated_to: Option<&Path>) -> Vec<(String, Result<u32>)> {
        self.pending
            .iter()
            .map(|pending| {
                let script = match relocated_to {
                    Some(target) => relocate(&pending.script, &self.cache_dir, target),
                    None => pending.script.clone(),
                };
                let result = pending.factory.launch_script(&pending.address, &script);
                if let Err(e) = &result {
                    tracing::warn!("Failed to start shared worker {}: {}", pending.worker, e);
                }
                (pending.worker.clone(), result)
            })
            .collect()
    }
}

fn relocate(script: &Path, from: &Path, to: &Path) -> PathBuf {
    match script.strip_prefix(from) {
        Ok(relative) => to.join(relative),
        Err(_) => script.to_path_buf(),
    }
}

/// An eager shared worker compiled by warm-up and not started yet.
#[derive(Debug)]
pub struct PendingStart {
    pub worker: String,
    pub factory: Arc<WorkerFactory>,
    pub address: SocketAddress,
    pub script: PathBuf,
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::bootstrap::{BootstrapDescriptor, BootstrapProfile};
    use crate::factory::tests::{RecordingLauncher, serve_once};
    use tempfile::TempDir;

    fn registry_with(
        temp: &TempDir,
        cookie: Option<&str>,
    ) -> (Registry, Arc<RecordingLauncher>) {
        let mut profile = BootstrapProfile::new();
        profile
            .set_interpreter("/usr/local/bin/tether-worker")
            .set_admin_cookie(cookie.map(str::to_string))
            .set_kill_switch_path(Some(temp.path().join("k.json")));

        let launcher = Arc::new(RecordingLauncher::default());
        let factory = WorkerFactory::with_launcher(profile, launcher.clone());

        let mut registry = Registry::new();
        registry.register_factory(DEFAULT_FACTORY, Arc::new(factory));
        (registry, launcher)
    }

    #[test]
    fn test_unknown_names() {
        let temp = TempDir::new().unwrap();
        let (mut registry, _) = registry_with(&temp, None);

        assert!(matches!(
            registry.factory(Some("other")),
            Err(Error::NoSuchFactory(_))
        ));
        assert!(registry.factory(None).is_ok());
        assert!(matches!(
            registry.shared_worker_address("nope"),
            Err(Error::NoSuchSharedWorker(_))
        ));
        assert!(matches!(
            registry.stop_shared_worker("nope"),
            Err(Error::NoSuchSharedWorker(_))
        ));

        // Missing factories surface when the worker is resolved.
        registry.register_shared_worker(
            "orphan",
            SharedWorkerEntry::new("ghost", SocketAddress::unix("/tmp/o.sock"), None, false),
        );
        assert_eq!(registry.shared_worker_factory_name("orphan").unwrap(), "ghost");
        assert!(matches!(
            registry.shared_worker_factory("orphan"),
            Err(Error::NoSuchFactory(_))
        ));
    }

    #[test]
    fn test_last_registration_wins_in_place() {
        let temp = TempDir::new().unwrap();
        let (mut registry, _) = registry_with(&temp, None);

        for (name, sock) in [("a", "/tmp/a.sock"), ("b", "/tmp/b.sock"), ("a", "/tmp/a2.sock")] {
            registry.register_shared_worker(
                name,
                SharedWorkerEntry::new(DEFAULT_FACTORY, SocketAddress::unix(sock), None, false),
            );
        }

        assert_eq!(registry.shared_worker_names().collect::<Vec<_>>(), vec!["a", "b"]);
        assert_eq!(
            registry.shared_worker_address("a").unwrap(),
            &SocketAddress::unix("/tmp/a2.sock")
        );
    }

    #[test]
    fn test_warm_up_compiles_and_starts_eager_worker_once() {
        let temp = TempDir::new().unwrap();
        let (mut registry, launcher) = registry_with(&temp, Some("abc"));
        let address = SocketAddress::unix(temp.path().join("w1.sock"));
        registry.register_shared_worker(
            "w1",
            SharedWorkerEntry::new(
                DEFAULT_FACTORY,
                address.clone(),
                Some(ImplementationSource::class("Foo", vec![])),
                true,
            ),
        );

        let cache_dir = temp.path().join("cache");
        let report = registry.warm_up(&cache_dir, DEFAULT_WARM_UP_TIMEOUT);

        let script = cache_dir.join("shared_worker.w1.json");
        assert!(script.exists());
        assert_eq!(report.compiled, vec![("w1".to_string(), script.clone())]);
        assert_eq!(report.pending.len(), 1);
        assert_eq!(launcher.count(), 0);

        let descriptor = BootstrapDescriptor::load(&script).unwrap();
        assert_eq!(descriptor.address, Some(address));
        assert_eq!(descriptor.admin_cookie.as_deref(), Some("abc"));

        let started = report.start_pending(None);
        assert_eq!(started.len(), 1);
        assert!(started[0].1.is_ok());
        assert_eq!(launcher.count(), 1);
    }

    #[test]
    fn test_warm_up_skips_workers_without_implementation() {
        let temp = TempDir::new().unwrap();
        let (mut registry, _) = registry_with(&temp, None);
        registry.register_shared_worker(
            "client-only",
            SharedWorkerEntry::new(DEFAULT_FACTORY, SocketAddress::tcp("10.0.0.1", 9000), None, true),
        );

        let cache_dir = temp.path().join("cache");
        let report = registry.warm_up(&cache_dir, DEFAULT_WARM_UP_TIMEOUT);

        assert_eq!(report.skipped, vec!["client-only".to_string()]);
        assert!(report.pending.is_empty());
        assert!(!cache_dir.join("shared_worker.client-only.json").exists());
    }

    #[test]
    fn test_warm_up_failure_skips_start() {
        let temp = TempDir::new().unwrap();
        let (mut registry, launcher) = registry_with(&temp, None);
        registry.register_shared_worker(
            "w1",
            SharedWorkerEntry::new(
                DEFAULT_FACTORY,
                SocketAddress::unix(temp.path().join("w1.sock")),
                Some(ImplementationSource::class("Foo", vec![])),
                true,
            ),
        );

        // The cache "directory" is a regular file.
        let cache_dir = temp.path().join("cache");
        std::fs::write(&cache_dir, "x").unwrap();

        let report = registry.warm_up(&cache_dir, DEFAULT_WARM_UP_TIMEOUT);
        assert_eq!(report.failed.len(), 1);
        assert!(report.pending.is_empty());
        report.start_pending(None);
        assert_eq!(launcher.count(), 0);
    }

    fn slow_compile(
        profile: &BootstrapProfile,
        implementation: &ImplementationSource,
        address: &SocketAddress,
        path: &Path,
    ) -> Result<()> {
        thread::sleep(Duration::from_millis(300));
        compile_script(profile, implementation, address, path)
    }

    #[test]
    fn test_warm_up_timeout_removes_script_and_skips_start() {
        let temp = TempDir::new().unwrap();
        let (mut registry, launcher) = registry_with(&temp, None);
        registry.register_shared_worker(
            "w1",
            SharedWorkerEntry::new(
                DEFAULT_FACTORY,
                SocketAddress::unix(temp.path().join("w1.sock")),
                Some(ImplementationSource::expression("Echo")),
                true,
            ),
        );

        // A script left over from an earlier warm-up.
        let cache_dir = temp.path().join("cache");
        let script = cache_dir.join("shared_worker.w1.json");
        std::fs::create_dir_all(&cache_dir).unwrap();
        std::fs::write(&script, "{}").unwrap();

        let report = registry.warm_up_with(&cache_dir, Duration::from_millis(20), slow_compile);

        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].0, "w1");
        assert!(report.failed[0].1.contains("took longer than"));
        assert!(report.compiled.is_empty());
        assert!(report.pending.is_empty());
        assert!(!script.exists());

        // The abandoned compile finishes later without bringing the script back.
        thread::sleep(Duration::from_millis(600));
        assert!(!script.exists());
        assert!(!staging_path(&script).exists());

        report.start_pending(None);
        assert_eq!(launcher.count(), 0);
    }

    #[test]
    fn test_warm_up_leaves_no_staging_file() {
        let temp = TempDir::new().unwrap();
        let (mut registry, _) = registry_with(&temp, None);
        registry.register_shared_worker(
            "w1",
            SharedWorkerEntry::new(
                DEFAULT_FACTORY,
                SocketAddress::unix(temp.path().join("w1.sock")),
                Some(ImplementationSource::expression("Echo")),
                false,
            ),
        );

        let cache_dir = temp.path().join("cache");
        registry.warm_up(&cache_dir, DEFAULT_WARM_UP_TIMEOUT);

        let script = cache_dir.join("shared_worker.w1.json");
        assert!(script.exists());
        assert!(!staging_path(&script).exists());
    }

    #[test]
    fn test_start_pending_relocates_scripts() {
        let temp = TempDir::new().unwrap();
        let (mut registry, launcher) = registry_with(&temp, None);
        registry.register_shared_worker(
            "w1",
            SharedWorkerEntry::new(
                DEFAULT_FACTORY,
                SocketAddress::unix(temp.path().join("w1.sock")),
                Some(ImplementationSource::expression("Echo")),
                true,
            ),
        );

        let build_dir = temp.path().join("cache_new");
        let final_dir = temp.path().join("cache");
        let report = registry.warm_up(&build_dir, DEFAULT_WARM_UP_TIMEOUT);
        report.start_pending(Some(&final_dir));

        let launches = launcher.launches.lock().unwrap();
        assert_eq!(
            launches[0].last().unwrap(),
            final_dir.join("shared_worker.w1.json").as_os_str()
        );
    }

    #[test]
    fn test_clear_is_best_effort() {
        let temp = TempDir::new().unwrap();
        let (mut registry, _) = registry_with(&temp, Some("abc"));

        let running = temp.path().join("running.sock");
        let server = serve_once(&running, "abc");

        registry
            .register_shared_worker(
                "remote",
                SharedWorkerEntry::new(DEFAULT_FACTORY, SocketAddress::tcp("10.0.0.1", 9000), None, false),
            )
            .register_shared_worker(
                "broken",
                SharedWorkerEntry::new("ghost", SocketAddress::unix(temp.path().join("b.sock")), None, false),
            )
            .register_shared_worker(
                "idle",
                SharedWorkerEntry::new(DEFAULT_FACTORY, SocketAddress::unix(temp.path().join("i.sock")), None, false),
            )
            .register_shared_worker(
                "running",
                SharedWorkerEntry::new(DEFAULT_FACTORY, SocketAddress::unix(&running), None, false),
            );

        let report = registry.clear();
        server.join().unwrap();

        assert_eq!(report.stopped, vec!["running".to_string()]);
        assert_eq!(report.not_running, vec!["idle".to_string()]);
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].0, "broken");
    }
}
