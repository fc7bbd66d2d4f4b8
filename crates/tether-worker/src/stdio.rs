//! Stdio transport for anonymous workers owned by a parent process.
//!
//! The first message on stdin must be a bootstrap command carrying the
//! compiled descriptor. After that the worker answers commands until the
//! parent shuts it down or closes the pipe.

use std::io::{self, BufReader, BufWriter, Read, Write};

use anyhow::{Result, anyhow, bail};
use tether_core::BootstrapDescriptor;
use tether_core::ipc::{WorkerCommand, WorkerResponse, read_message, write_message};

use crate::handler::{Channel, Handler, Next};
use crate::runtime::{Runtime, Transport};

/// Serve the parent over this process's stdin and stdout.
pub fn serve() -> Result<()> {
    let mut reader = BufReader::new(io::stdin().lock());
    let mut writer = BufWriter::new(io::stdout().lock());
    serve_on(&mut reader, &mut writer)
}

pub(crate) fn serve_on<R: Read, W: Write>(reader: &mut R, writer: &mut W) -> Result<()> {
    let Some(first) = next_command(reader)? else {
        tracing::debug!("Parent closed the pipe before bootstrapping");
        return Ok(());
    };

    let mut handler = match bootstrap(first) {
        Ok(handler) => {
            write_message(writer, &WorkerResponse::Pong)?;
            handler
        }
        Err(e) => {
            let message = format!("{:#}", e);
            write_message(writer, &WorkerResponse::Error { message })?;
            return Err(e);
        }
    };

    while let Some(command) = next_command(reader)? {
        let (response, next) = handler.handle(command);
        write_message(writer, &response)?;
        if next == Next::Exit {
            tracing::debug!("Shutting down on request");
            break;
        }
    }

    Ok(())
}

fn bootstrap(command: WorkerCommand) -> Result<Handler> {
    let WorkerCommand::Bootstrap { descriptor_json } = command else {
        bail!("The first message must be a bootstrap command");
    };

    let descriptor = BootstrapDescriptor::from_json(&descriptor_json)?;
    let prepared = Runtime::new().execute(&descriptor)?;
    if prepared.transport != Transport::Stdio {
        return Err(anyhow!(
            "A socket program can't be served over stdio; launch it with its script instead"
        ));
    }

    tracing::debug!("Bootstrapped {} over stdio", prepared.worker.name());
    Ok(Handler::new(prepared.worker, Channel::Stdio, None))
}

/// Next command, or `None` once the parent closed stdin.
fn next_command<R: Read>(reader: &mut R) -> Result<Option<WorkerCommand>> {
    match read_message(reader) {
        Ok(decoded) => Ok(Some(decoded?)),
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Ok(None),
        Err(e) => Err(e.into()),
    }
}
