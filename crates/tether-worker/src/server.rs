//! Socket transport for shared workers.
//!
//! Accepts connections on the worker's address and answers length-prefixed
//! control commands until a valid stop request or a termination signal
//! arrives.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context as _, Result, anyhow, bail};
use tether_core::SocketAddress;
use tether_core::ipc::protocol::{decode_body, decode_len, encode_message};
use tether_core::ipc::{WorkerCommand, WorkerResponse};
use tether_core::process::{read_pid_file, write_pid_file};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{Mutex, Notify};

use crate::handler::{Handler, Next};
use crate::runtime::SocketContext;

enum Listener {
    #[cfg(unix)]
    Unix(tokio::net::UnixListener),
    Tcp(tokio::net::TcpListener),
}

/// Files owned by a running worker, removed on exit.
struct Footprint {
    socket: Option<PathBuf>,
    pid_file: Option<PathBuf>,
}

impl Drop for Footprint {
    fn drop(&mut self) {
        if let Some(path) = &self.socket {
            let _ = std::fs::remove_file(path);
        }
        // Only remove the PID file if a newer worker hasn't claimed it.
        if let Some(path) = &self.pid_file
            && read_pid_file(path) == Some(std::process::id())
        {
            let _ = std::fs::remove_file(path);
        }
    }
}

/// Serve `handler` on `address` until stopped.
pub async fn serve(
    handler: Handler,
    address: &SocketAddress,
    context: SocketContext,
    pid_file: Option<&Path>,
) -> Result<()> {
    let listener = bind(address, context).await?;

    let mut footprint = Footprint {
        socket: address.unix_path().map(Path::to_path_buf),
        pid_file: None,
    };
    if let Some(path) = pid_file {
        write_pid_file(path, std::process::id())?;
        footprint.pid_file = Some(path.to_path_buf());
    }

    tracing::info!("Listening on {} (PID {})", address, std::process::id());

    let handler = Arc::new(Mutex::new(handler));
    let stop = Arc::new(Notify::new());
    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            accepted = accept(&listener) => match accepted {
                #[cfg(unix)]
                Ok(Accepted::Unix(stream)) => spawn_connection(stream, &handler, &stop),
                Ok(Accepted::Tcp(stream, peer)) => {
                    tracing::debug!("Connection from {}", peer);
                    spawn_connection(stream, &handler, &stop);
                }
                Err(e) => tracing::warn!("Accept failed: {}", e),
            },
            _ = stop.notified() => {
                tracing::info!("Stopping on request");
                break;
            }
            _ = &mut shutdown => break,
        }
    }

    drop(footprint);
    tracing::info!("Worker at {} exited", address);
    Ok(())
}

async fn bind(address: &SocketAddress, context: SocketContext) -> Result<Listener> {
    match address {
        #[cfg(unix)]
        SocketAddress::Unix(path) => {
            prepare_socket_path(path)?;
            tracing::debug!("Unix sockets use the system backlog, ignoring {}", context.backlog);
            let listener = tokio::net::UnixListener::bind(path)
                .with_context(|| format!("Cannot bind {}", path.display()))?;
            Ok(Listener::Unix(listener))
        }
        #[cfg(not(unix))]
        SocketAddress::Unix(path) => bail!(
            "Unix sockets are not supported on this platform: {}",
            path.display()
        ),
        SocketAddress::Tcp { host, port } => {
            let target = tokio::net::lookup_host((host.as_str(), *port))
                .await
                .with_context(|| format!("Cannot resolve {}", host))?
                .next()
                .ok_or_else(|| anyhow!("{} resolved to no addresses", host))?;

            let socket = if target.is_ipv4() {
                tokio::net::TcpSocket::new_v4()?
            } else {
                tokio::net::TcpSocket::new_v6()?
            };
            socket.set_reuseaddr(true)?;
            socket
                .bind(target)
                .with_context(|| format!("Cannot bind {}", target))?;
            Ok(Listener::Tcp(socket.listen(context.backlog)?))
        }
    }
}

/// Make room for a new socket, refusing to replace a live worker.
#[cfg(unix)]
fn prepare_socket_path(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Cannot create {}", parent.display()))?;
    }

    if path.exists() {
        if std::os::unix::net::UnixStream::connect(path).is_ok() {
            bail!("Another worker is already listening on {}", path.display());
        }
        tracing::debug!("Removing stale socket {}", path.display());
        std::fs::remove_file(path)
            .with_context(|| format!("Cannot remove stale socket {}", path.display()))?;
    }
    Ok(())
}

enum Accepted {
    #[cfg(unix)]
    Unix(tokio::net::UnixStream),
    Tcp(tokio::net::TcpStream, std::net::SocketAddr),
}

async fn accept(listener: &Listener) -> io::Result<Accepted> {
    match listener {
        #[cfg(unix)]
        Listener::Unix(listener) => listener.accept().await.map(|(s, _)| Accepted::Unix(s)),
        Listener::Tcp(listener) => listener
            .accept()
            .await
            .map(|(s, peer)| Accepted::Tcp(s, peer)),
    }
}

fn spawn_connection<S>(stream: S, handler: &Arc<Mutex<Handler>>, stop: &Arc<Notify>)
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let handler = Arc::clone(handler);
    let stop = Arc::clone(stop);
    tokio::spawn(async move {
        if let Err(e) = serve_connection(stream, handler, stop).await {
            tracing::debug!("Connection closed: {:#}", e);
        }
    });
}

async fn serve_connection<S>(
    mut stream: S,
    handler: Arc<Mutex<Handler>>,
    stop: Arc<Notify>,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    loop {
        let command = match read_command(&mut stream).await {
            Ok(Some(command)) => command,
            Ok(None) => return Ok(()),
            Err(e) => {
                // Tell the peer why before dropping the connection.
                let response = WorkerResponse::Error {
                    message: format!("{:#}", e),
                };
                let _ = write_response(&mut stream, &response).await;
                return Err(e);
            }
        };

        let (response, next) = handler.lock().await.handle(command);
        write_response(&mut stream, &response).await?;

        if next == Next::Exit {
            stop.notify_one();
            return Ok(());
        }
    }
}

/// Read one command; `None` when the peer closed the connection.
async fn read_command<S: AsyncRead + Unpin>(stream: &mut S) -> Result<Option<WorkerCommand>> {
    let mut prefix = [0u8; 4];
    match stream.read_exact(&mut prefix).await {
        Ok(_) => {}
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }

    let len = decode_len(prefix)?;
    let mut body = vec![0u8; len];
    stream.read_exact(&mut body).await?;
    Ok(Some(decode_body(&body)?))
}

async fn write_response<S: AsyncWrite + Unpin>(
    stream: &mut S,
    response: &WorkerResponse,
) -> Result<()> {
    let framed = encode_message(response)?;
    stream.write_all(&framed).await?;
    stream.flush().await?;
    Ok(())
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        match signal(SignalKind::terminate()) {
            Ok(mut terminate) => {
                tokio::select! {
                    _ = terminate.recv() => tracing::info!("Received SIGTERM"),
                    _ = tokio::signal::ctrl_c() => tracing::info!("Received interrupt"),
                }
                return;
            }
            Err(e) => tracing::warn!("Cannot install SIGTERM handler: {}", e),
        }
    }

    if tokio::signal::ctrl_c().await.is_ok() {
        tracing::info!("Received interrupt");
    } else {
        std::future::pending::<()>().await;
    }
}
