//! Commands acting on one named shared worker.

use anyhow::{Result, bail};
use tether_core::{Error, Registry};

use crate::colors::emphasis;

pub fn start(registry: &Registry, name: &str) -> Result<()> {
    if let Some(pid) = registry.shared_worker_process_id(name)? {
        println!("Shared worker {} is already running (PID {}).", emphasis(name), pid);
        return Ok(());
    }

    let pid = registry.start_shared_worker(name)?;
    println!("Started shared worker {} (PID {}).", emphasis(name), pid);
    Ok(())
}

pub fn stop(registry: &Registry, name: &str) -> Result<()> {
    if registry.stop_shared_worker(name)? {
        println!("Sent stop message to shared worker {}.", emphasis(name));
    } else {
        println!("Shared worker {} was not running.", emphasis(name));
    }
    Ok(())
}

pub fn status(registry: &Registry, name: &str) -> Result<()> {
    let address = registry.shared_worker_address(name)?;
    match registry.query_shared_worker(name) {
        Ok(status) => println!("{}: {}", emphasis(name), status),
        Err(Error::Connect { .. }) => match registry.shared_worker_process_id(name)? {
            Some(pid) => println!("{}: not answering on {} (PID {})", emphasis(name), address, pid),
            None => println!("{}: not running ({})", emphasis(name), address),
        },
        Err(e) => return Err(e.into()),
    }
    Ok(())
}

pub fn disable(registry: &Registry, name: &str) -> Result<()> {
    registry.disable_shared_worker(name)?;
    println!("Disabled shared worker {}.", emphasis(name));
    Ok(())
}

pub fn enable(registry: &Registry, name: &str) -> Result<()> {
    registry.re_enable_shared_worker(name)?;
    if registry.is_shared_worker_disabled(name)? {
        println!(
            "Removed {} from the kill switch, but all workers of its factory are still disabled.",
            emphasis(name)
        );
    } else {
        println!("Re-enabled shared worker {}.", emphasis(name));
    }
    Ok(())
}

/// Send one payload and print the reply.
pub fn send(registry: &Registry, name: &str, payload: &str, auto_start: bool) -> Result<()> {
    let mut connection = registry.connect_to_shared_worker(name, auto_start)?;
    let reply = connection.send(payload.as_bytes().to_vec())?;
    match String::from_utf8(reply) {
        Ok(text) => println!("{}", text),
        Err(e) => bail!("{} replied with {} bytes of binary data", name, e.as_bytes().len()),
    }
    Ok(())
}
