//! Runtime directory layout.
//!
//! Everything Tether writes on a host lives under one application root:
//!
//! ```text
//! <root>/
//! ├── run/tether/     # sockets, PID files, kill switches, worker logs
//! └── cache/tether/   # warm-up bootstrap scripts
//! ```

use std::fs;
use std::path::{Path, PathBuf};

use crate::address::SocketAddress;
use crate::error::Result;

/// Directory structure under an application root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeDirs {
    /// The application root.
    pub root: PathBuf,

    /// Sockets, PID files and kill switches.
    pub run_dir: PathBuf,

    /// Precompiled bootstrap scripts.
    pub cache_dir: PathBuf,
}

impl RuntimeDirs {
    /// Layout under `root`. Nothing is created on disk.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        let run_dir = root.join("run").join("tether");
        let cache_dir = root.join("cache").join("tether");
        Self {
            root,
            run_dir,
            cache_dir,
        }
    }

    /// Create the run and cache directories if they don't exist.
    pub fn ensure(&self) -> Result<()> {
        fs::create_dir_all(&self.run_dir)?;
        fs::create_dir_all(&self.cache_dir)?;
        Ok(())
    }

    /// Socket a shared worker listens on when its address isn't configured.
    pub fn default_socket(&self, worker_name: &str) -> SocketAddress {
        SocketAddress::unix(
            self.run_dir
                .join(format!("shared_worker.{}.sock", worker_name)),
        )
    }

    /// Kill switch a factory uses when none is configured.
    pub fn default_kill_switch(&self, factory_name: &str) -> PathBuf {
        self.run_dir
            .join(format!("kill_switch.{}.json", factory_name))
    }
}

/// Warm-up artifact of one shared worker inside `cache_dir`.
pub fn warm_up_script(cache_dir: &Path, worker_name: &str) -> PathBuf {
    cache_dir.join(format!("shared_worker.{}.json", worker_name))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_layout() {
        let dirs = RuntimeDirs::new("/srv/app");
        assert_eq!(dirs.run_dir, PathBuf::from("/srv/app/run/tether"));
        assert_eq!(dirs.cache_dir, PathBuf::from("/srv/app/cache/tether"));
        assert_eq!(
            dirs.default_socket("w1"),
            SocketAddress::unix("/srv/app/run/tether/shared_worker.w1.sock")
        );
        assert_eq!(
            dirs.default_kill_switch("default"),
            PathBuf::from("/srv/app/run/tether/kill_switch.default.json")
        );
    }

    #[test]
    fn test_ensure_creates_directories() {
        let temp = TempDir::new().expect("Failed to create temp dir");
        let dirs = RuntimeDirs::new(temp.path());

        assert!(!dirs.run_dir.exists());
        dirs.ensure().expect("Failed to create dirs");
        assert!(dirs.run_dir.exists());
        assert!(dirs.cache_dir.exists());
    }

    #[test]
    fn test_warm_up_script_name() {
        assert_eq!(
            warm_up_script(Path::new("/c"), "w1"),
            PathBuf::from("/c/shared_worker.w1.json")
        );
    }
}
