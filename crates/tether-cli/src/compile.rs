//! `tether compile` - print or write a worker's bootstrap program.

use std::path::Path;

use anyhow::{Result, anyhow};
use tether_core::Registry;

pub fn execute(registry: &Registry, name: &str, output: Option<&Path>) -> Result<()> {
    let entry = registry.shared_worker(name)?;
    let implementation = entry
        .implementation
        .as_ref()
        .ok_or_else(|| anyhow!("Shared worker {} has no implementation to compile", name))?;
    let profile = registry.shared_worker_factory(name)?.profile();

    match output {
        Some(path) => {
            profile.compile_to_path(implementation, &entry.address, path)?;
            println!("Wrote {}", path.display());
        }
        None => println!("{}", profile.compile(implementation, &entry.address).to_json()?),
    }

    Ok(())
}
