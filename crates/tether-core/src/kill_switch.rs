//! Kill switch files.
//!
//! A kill switch keeps local shared workers from being (re)started. It lists
//! disabled addresses plus a global flag that disables every worker of the
//! profile. Workers consult it at start-up; the control plane consults it
//! before launching.

use std::fs;
use std::io::Write;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::address::SocketAddress;
use crate::error::{Error, Result};

/// On-disk kill switch state.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KillSwitch {
    /// Every worker using this kill switch is disabled.
    #[serde(default)]
    pub global: bool,
    /// Individually disabled addresses, in the order they were disabled.
    #[serde(default)]
    pub addresses: Vec<String>,
}

impl KillSwitch {
    /// Load the kill switch at `path`.
    ///
    /// A missing file is an empty kill switch.
    pub fn load(path: &Path) -> Result<Self> {
        let text = match fs::read_to_string(path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Self::default()),
            Err(e) => return Err(e.into()),
        };

        if text.trim().is_empty() {
            return Ok(Self::default());
        }

        serde_json::from_str(&text).map_err(|e| {
            Error::Serialization(format!("Invalid kill switch {}: {}", path.display(), e))
        })
    }

    /// Save to `path`, replacing the previous file atomically.
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let text = serde_json::to_string_pretty(self)
            .map_err(|e| Error::Serialization(format!("Failed to encode kill switch: {}", e)))?;

        let temp_path = path.with_extension("tmp");
        let mut file = fs::File::create(&temp_path)?;
        file.write_all(text.as_bytes())?;
        file.sync_all()?;

        fs::rename(&temp_path, path)?;

        tracing::debug!(
            "Saved kill switch {} (global: {}, {} addresses)",
            path.display(),
            self.global,
            self.addresses.len()
        );

        Ok(())
    }

    /// Whether the worker at `address` must not run.
    pub fn is_disabled(&self, address: &SocketAddress) -> bool {
        self.global || self.is_listed(address)
    }

    /// Whether `address` is disabled on its own, regardless of the global flag.
    pub fn is_listed(&self, address: &SocketAddress) -> bool {
        let key = address.to_string();
        self.addresses.iter().any(|a| *a == key)
    }

    /// Add `address`; returns whether anything changed.
    pub fn disable(&mut self, address: &SocketAddress) -> bool {
        if self.is_listed(address) {
            return false;
        }
        self.addresses.push(address.to_string());
        true
    }

    /// Remove `address`; returns whether anything changed.
    pub fn re_enable(&mut self, address: &SocketAddress) -> bool {
        let key = address.to_string();
        let before = self.addresses.len();
        self.addresses.retain(|a| *a != key);
        self.addresses.len() != before
    }
}

/// Load, modify and save the kill switch at `path`.
///
/// The file is only rewritten when `change` reports a modification.
pub fn update(path: &Path, change: impl FnOnce(&mut KillSwitch) -> bool) -> Result<KillSwitch> {
    let mut kill_switch = KillSwitch::load(path)?;
    if change(&mut kill_switch) {
        kill_switch.save(path)?;
    }
    Ok(kill_switch)
}
