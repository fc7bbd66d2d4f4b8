//! Blocking client connections to worker sockets.

use std::io::{self, Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
#[cfg(unix)]
use std::os::unix::net::UnixStream;
use std::time::{Duration, Instant};

use crate::address::SocketAddress;
use crate::control::CallOptions;
use crate::error::{Error, Result};

use super::protocol::{WorkerCommand, WorkerResponse, decode_body, decode_len, encode_message};

/// Granularity at which a blocked read or write re-checks the abort handle.
const POLL_SLICE: Duration = Duration::from_millis(100);

#[derive(Debug)]
enum Stream {
    #[cfg(unix)]
    Unix(UnixStream),
    Tcp(TcpStream),
}

impl Stream {
    fn set_timeouts(&self, timeout: Option<Duration>) -> io::Result<()> {
        match self {
            #[cfg(unix)]
            Self::Unix(s) => {
                s.set_read_timeout(timeout)?;
                s.set_write_timeout(timeout)
            }
            Self::Tcp(s) => {
                s.set_read_timeout(timeout)?;
                s.set_write_timeout(timeout)
            }
        }
    }
}

impl Read for Stream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            #[cfg(unix)]
            Self::Unix(s) => s.read(buf),
            Self::Tcp(s) => s.read(buf),
        }
    }
}

impl Write for Stream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            #[cfg(unix)]
            Self::Unix(s) => s.write(buf),
            Self::Tcp(s) => s.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            #[cfg(unix)]
            Self::Unix(s) => s.flush(),
            Self::Tcp(s) => s.flush(),
        }
    }
}

/// An open control connection to a shared worker.
#[derive(Debug)]
pub struct Connection {
    stream: Stream,
    address: SocketAddress,
    opts: CallOptions,
}

/// Whether a failed connect proves that nothing listens on the address.
fn is_not_listening(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::NotFound | io::ErrorKind::ConnectionRefused
    )
}

/// A socket call that ran into the poll slice rather than failing.
fn is_retryable(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut | io::ErrorKind::Interrupted
    )
}

/// Connect to a worker.
///
/// Returns `Ok(None)` when the address is confirmed not to be listening (no
/// socket file, connection refused), and [`Error::Connect`] when
/// reachability could not be determined (timeout, abort, other failures).
pub fn connect(address: &SocketAddress, opts: &CallOptions) -> Result<Option<Connection>> {
    if opts.is_aborted() {
        return Err(Error::connect(address, "aborted"));
    }

    let stream = match address {
        SocketAddress::Unix(path) => match connect_unix(address, path)? {
            Some(s) => s,
            None => return Ok(None),
        },
        SocketAddress::Tcp { .. } => match connect_tcp(address, opts.timeout)? {
            Some(s) => Stream::Tcp(s),
            None => return Ok(None),
        },
    };

    stream
        .set_timeouts(opts.timeout.map(|t| t.min(POLL_SLICE)).or(Some(POLL_SLICE)))
        .map_err(|e| Error::connect(address, e))?;

    tracing::debug!("Connected to {}", address);

    Ok(Some(Connection {
        stream,
        address: address.clone(),
        opts: opts.clone(),
    }))
}

#[cfg(unix)]
fn connect_unix(address: &SocketAddress, path: &std::path::Path) -> Result<Option<Stream>> {
    match UnixStream::connect(path) {
        Ok(s) => Ok(Some(Stream::Unix(s))),
        Err(e) if is_not_listening(&e) => Ok(None),
        Err(e) => Err(Error::connect(address, e)),
    }
}

#[cfg(not(unix))]
fn connect_unix(address: &SocketAddress, _path: &std::path::Path) -> Result<Option<Stream>> {
    Err(Error::connect(address, "unix sockets are not supported on this platform"))
}

fn connect_tcp(address: &SocketAddress, timeout: Option<Duration>) -> Result<Option<TcpStream>> {
    let target = address.tcp_target().unwrap_or_default();
    let candidates = target
        .to_socket_addrs()
        .map_err(|e| Error::connect(address, format!("cannot resolve: {}", e)))?;

    let mut refused = false;
    let mut last_error = None;
    for candidate in candidates {
        let attempt = match timeout {
            Some(t) => TcpStream::connect_timeout(&candidate, t),
            None => TcpStream::connect(candidate),
        };
        match attempt {
            Ok(stream) => return Ok(Some(stream)),
            Err(e) if is_not_listening(&e) => refused = true,
            Err(e) => last_error = Some(e),
        }
    }

    match last_error {
        // Any unexplained failure leaves reachability unknown.
        Some(e) => Err(Error::connect(address, e)),
        None if refused => Ok(None),
        None => Err(Error::connect(address, "no addresses resolved")),
    }
}

impl Connection {
    /// Address this connection is bound to.
    pub fn address(&self) -> &SocketAddress {
        &self.address
    }

    /// Send one command and wait for its response.
    pub fn request(&mut self, command: &WorkerCommand) -> Result<WorkerResponse> {
        let deadline = self.opts.timeout.map(|t| Instant::now() + t);

        let framed = encode_message(command)?;
        self.write_full(&framed, deadline)?;
        self.stream
            .flush()
            .map_err(|e| Error::connect(&self.address, format!("write failed: {}", e)))?;

        let mut prefix = [0u8; 4];
        self.read_full(&mut prefix, deadline)?;
        let len = decode_len(prefix)?;

        let mut body = vec![0u8; len];
        self.read_full(&mut body, deadline)?;

        decode_body(&body)
    }

    /// Hand a payload to the worker implementation and return its reply.
    pub fn send(&mut self, payload: Vec<u8>) -> Result<Vec<u8>> {
        match self.request(&WorkerCommand::Send { payload })? {
            WorkerResponse::Reply { payload } => Ok(payload),
            WorkerResponse::Error { message } => Err(Error::Protocol(message)),
            other => Err(Error::Protocol(format!(
                "Unexpected response to send from {}: {:?}",
                self.address, other
            ))),
        }
    }

    /// Write all of `buf`, re-checking abort and deadline while the peer
    /// isn't reading.
    fn write_full(&mut self, buf: &[u8], deadline: Option<Instant>) -> Result<()> {
        let mut written = 0;
        while written < buf.len() {
            if self.opts.is_aborted() {
                return Err(Error::connect(&self.address, "aborted"));
            }
            match self.stream.write(&buf[written..]) {
                Ok(0) => {
                    return Err(Error::connect(&self.address, "connection closed by worker"));
                }
                Ok(n) => written += n,
                Err(e) if is_retryable(&e) => {
                    if deadline.is_some_and(|d| Instant::now() >= d) {
                        return Err(Error::connect(&self.address, "timed out sending request"));
                    }
                }
                Err(e) => {
                    return Err(Error::connect(&self.address, format!("write failed: {}", e)));
                }
            }
        }
        Ok(())
    }

    /// Fill `buf`, re-checking abort and deadline while the peer is silent.
    fn read_full(&mut self, buf: &mut [u8], deadline: Option<Instant>) -> Result<()> {
        let mut filled = 0;
        while filled < buf.len() {
            if self.opts.is_aborted() {
                return Err(Error::connect(&self.address, "aborted"));
            }
            match self.stream.read(&mut buf[filled..]) {
                Ok(0) => {
                    return Err(Error::connect(&self.address, "connection closed by worker"));
                }
                Ok(n) => filled += n,
                Err(e) if is_retryable(&e) => {
                    if deadline.is_some_and(|d| Instant::now() >= d) {
                        return Err(Error::connect(&self.address, "timed out waiting for reply"));
                    }
                }
                Err(e) => return Err(Error::connect(&self.address, e)),
            }
        }
        Ok(())
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::control::AbortHandle;
    use crate::ipc::protocol::{read_message, write_message};
    use std::os::unix::net::UnixListener;
    use std::thread;
    use tempfile::TempDir;

    #[test]
    fn test_missing_socket_is_not_listening() {
        let temp = TempDir::new().unwrap();
        let address = SocketAddress::unix(temp.path().join("absent.sock"));

        let conn = connect(&address, &CallOptions::default()).unwrap();
        assert!(conn.is_none());
    }

    #[test]
    fn test_stale_socket_file_is_not_listening() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("stale.sock");
        drop(UnixListener::bind(&path).unwrap());

        let address = SocketAddress::unix(&path);
        let conn = connect(&address, &CallOptions::default()).unwrap();
        assert!(conn.is_none());
    }

    #[test]
    fn test_request_roundtrip() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("w.sock");
        let listener = UnixListener::bind(&path).unwrap();

        let server = thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            let cmd: WorkerCommand = read_message(&mut stream).unwrap().unwrap();
            assert_eq!(cmd, WorkerCommand::Ping);
            write_message(&mut stream, &WorkerResponse::Pong).unwrap();
        });

        let address = SocketAddress::unix(&path);
        let mut conn = connect(&address, &CallOptions::default()).unwrap().unwrap();
        assert_eq!(conn.request(&WorkerCommand::Ping).unwrap(), WorkerResponse::Pong);

        server.join().unwrap();
    }

    #[test]
    fn test_silent_worker_times_out() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("w.sock");
        let listener = UnixListener::bind(&path).unwrap();

        let server = thread::spawn(move || {
            let (stream, _) = listener.accept().unwrap();
            thread::sleep(Duration::from_millis(500));
            drop(stream);
        });

        let address = SocketAddress::unix(&path);
        let opts = CallOptions::with_timeout(Duration::from_millis(150));
        let mut conn = connect(&address, &opts).unwrap().unwrap();
        let err = conn.request(&WorkerCommand::Query).unwrap_err();
        assert!(matches!(err, Error::Connect { .. }));

        server.join().unwrap();
    }

    #[test]
    fn test_large_request_to_slow_reader() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("w.sock");
        let listener = UnixListener::bind(&path).unwrap();
        let size = 4 * 1024 * 1024;

        let server = thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            // Far longer than one poll slice, so the client's writes block.
            thread::sleep(Duration::from_millis(400));
            let cmd: WorkerCommand = read_message(&mut stream).unwrap().unwrap();
            let received = match cmd {
                WorkerCommand::Send { payload } => payload.len(),
                _ => 0,
            };
            let reply = WorkerResponse::Reply {
                payload: received.to_string().into_bytes(),
            };
            write_message(&mut stream, &reply).unwrap();
        });

        let address = SocketAddress::unix(&path);
        let opts = CallOptions::with_timeout(Duration::from_secs(5));
        let mut conn = connect(&address, &opts).unwrap().unwrap();
        let reply = conn.send(vec![7u8; size]).unwrap();
        assert_eq!(reply, size.to_string().into_bytes());

        server.join().unwrap();
    }

    #[test]
    fn test_aborted_call_never_connects() {
        let temp = TempDir::new().unwrap();
        let address = SocketAddress::unix(temp.path().join("w.sock"));
        let handle = AbortHandle::new();
        handle.abort();

        let opts = CallOptions::default().abort_handle(handle);
        assert!(matches!(connect(&address, &opts), Err(Error::Connect { .. })));
    }
}
