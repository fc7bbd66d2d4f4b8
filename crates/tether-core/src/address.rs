//! Shared worker socket addresses.
//!
//! An address is both the identity of a shared worker and the thing that
//! decides its locality: unix-domain sockets and loopback TCP endpoints are
//! local and may be started, signalled and disabled from this host; anything
//! else is remote and may only be managed through the authenticated in-band
//! protocol.

use std::fmt;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

const UNIX_SCHEME: &str = "unix://";
const TCP_SCHEME: &str = "tcp://";

/// Network address of a shared worker.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum SocketAddress {
    /// Unix-domain socket path.
    Unix(PathBuf),
    /// TCP endpoint.
    Tcp { host: String, port: u16 },
}

impl SocketAddress {
    /// Unix-domain socket address.
    pub fn unix(path: impl Into<PathBuf>) -> Self {
        Self::Unix(path.into())
    }

    /// TCP address.
    pub fn tcp(host: impl Into<String>, port: u16) -> Self {
        Self::Tcp {
            host: host.into(),
            port,
        }
    }

    /// Whether the worker behind this address runs on this host.
    pub fn is_local(&self) -> bool {
        match self {
            Self::Unix(_) => true,
            Self::Tcp { host, .. } => {
                host.eq_ignore_ascii_case("localhost")
                    || host
                        .parse::<IpAddr>()
                        .map(|ip| ip.is_loopback())
                        .unwrap_or(false)
            }
        }
    }

    /// Whether the address is reachable over the network at all.
    ///
    /// Unix sockets are not; they are shown as "local-only" in listings.
    pub fn is_network_exposed(&self) -> bool {
        matches!(self, Self::Tcp { .. })
    }

    /// Address without its scheme, for display.
    pub fn strip_scheme(&self) -> String {
        match self {
            Self::Unix(path) => path.display().to_string(),
            Self::Tcp { host, port } => format_host_port(host, *port),
        }
    }

    /// Unix socket path, if this is a unix-domain address.
    pub fn unix_path(&self) -> Option<&Path> {
        match self {
            Self::Unix(path) => Some(path),
            Self::Tcp { .. } => None,
        }
    }

    /// `host:port` for TCP connect/bind calls.
    pub fn tcp_target(&self) -> Option<String> {
        match self {
            Self::Unix(_) => None,
            Self::Tcp { host, port } => Some(format_host_port(host, *port)),
        }
    }

    /// File a local worker writes its PID to.
    ///
    /// Unix sockets keep it next to the socket (`<socket>.pid`); TCP
    /// endpoints use the user's runtime directory.
    pub fn pid_file(&self) -> PathBuf {
        self.sidecar_file("pid")
    }

    /// File a detached local worker logs to.
    pub fn log_file(&self) -> PathBuf {
        self.sidecar_file("log")
    }

    /// Where a freshly compiled bootstrap script for this address is kept.
    pub fn script_file(&self) -> PathBuf {
        self.sidecar_file("json")
    }

    fn sidecar_file(&self, extension: &str) -> PathBuf {
        match self {
            Self::Unix(path) => {
                let mut name = path.as_os_str().to_owned();
                name.push(".");
                name.push(extension);
                PathBuf::from(name)
            }
            Self::Tcp { host, port } => {
                let base = dirs::runtime_dir().unwrap_or_else(std::env::temp_dir);
                let host: String = host
                    .chars()
                    .map(|c| if c.is_ascii_alphanumeric() || c == '.' { c } else { '_' })
                    .collect();
                base.join("tether")
                    .join(format!("tcp.{}.{}.{}", host, port, extension))
            }
        }
    }
}

fn format_host_port(host: &str, port: u16) -> String {
    if host.contains(':') {
        format!("[{}]:{}", host, port)
    } else {
        format!("{}:{}", host, port)
    }
}

fn parse_host_port(input: &str, original: &str) -> Result<SocketAddress> {
    let invalid = || Error::InvalidAddress(original.to_string());

    let (host, port) = if let Some(rest) = input.strip_prefix('[') {
        let (host, rest) = rest.split_once(']').ok_or_else(invalid)?;
        let port = rest.strip_prefix(':').ok_or_else(invalid)?;
        (host, port)
    } else {
        input.rsplit_once(':').ok_or_else(invalid)?
    };

    if host.is_empty() {
        return Err(invalid());
    }
    let port = port.parse::<u16>().map_err(|_| invalid())?;

    Ok(SocketAddress::tcp(host, port))
}

impl FromStr for SocketAddress {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        if let Some(path) = s.strip_prefix(UNIX_SCHEME) {
            if path.is_empty() {
                return Err(Error::InvalidAddress(s.to_string()));
            }
            Ok(Self::Unix(PathBuf::from(path)))
        } else if let Some(rest) = s.strip_prefix(TCP_SCHEME) {
            parse_host_port(rest, s)
        } else if s.contains("://") {
            Err(Error::InvalidAddress(format!("unsupported scheme in {}", s)))
        } else {
            parse_host_port(s, s)
        }
    }
}

impl TryFrom<String> for SocketAddress {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<SocketAddress> for String {
    fn from(value: SocketAddress) -> Self {
        value.to_string()
    }
}

impl fmt::Display for SocketAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unix(path) => write!(f, "{}{}", UNIX_SCHEME, path.display()),
            Self::Tcp { host, port } => write!(f, "{}{}", TCP_SCHEME, format_host_port(host, *port)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_unix() {
        let addr: SocketAddress = "unix:///tmp/w1.sock".parse().unwrap();
        assert_eq!(addr, SocketAddress::unix("/tmp/w1.sock"));
        assert!(addr.is_local());
        assert!(!addr.is_network_exposed());
        assert_eq!(addr.strip_scheme(), "/tmp/w1.sock");
        assert_eq!(addr.to_string(), "unix:///tmp/w1.sock");
    }

    #[test]
    fn test_parse_tcp() {
        let addr: SocketAddress = "tcp://10.0.0.5:7000".parse().unwrap();
        assert_eq!(addr, SocketAddress::tcp("10.0.0.5", 7000));
        assert!(!addr.is_local());
        assert!(addr.is_network_exposed());

        let bare: SocketAddress = "127.0.0.1:7000".parse().unwrap();
        assert!(bare.is_local());
        assert_eq!(bare.to_string(), "tcp://127.0.0.1:7000");
    }

    #[test]
    fn test_parse_ipv6() {
        let addr: SocketAddress = "tcp://[::1]:9000".parse().unwrap();
        assert_eq!(addr, SocketAddress::tcp("::1", 9000));
        assert!(addr.is_local());
        assert_eq!(addr.strip_scheme(), "[::1]:9000");
    }

    #[test]
    fn test_localhost_is_local() {
        let addr: SocketAddress = "tcp://LocalHost:80".parse().unwrap();
        assert!(addr.is_local());
    }

    #[test]
    fn test_invalid_addresses() {
        assert!("unix://".parse::<SocketAddress>().is_err());
        assert!("tcp://host".parse::<SocketAddress>().is_err());
        assert!("tcp://host:notaport".parse::<SocketAddress>().is_err());
        assert!("udp://host:1".parse::<SocketAddress>().is_err());
        assert!(":80".parse::<SocketAddress>().is_err());
    }

    #[test]
    fn test_pid_file_next_to_socket() {
        let addr = SocketAddress::unix("/run/app/w1.sock");
        assert_eq!(addr.pid_file(), PathBuf::from("/run/app/w1.sock.pid"));
        assert_eq!(addr.log_file(), PathBuf::from("/run/app/w1.sock.log"));
    }

    #[test]
    fn test_serde_as_string() {
        let addr = SocketAddress::tcp("example.org", 443);
        let json = serde_json::to_string(&addr).unwrap();
        assert_eq!(json, "\"tcp://example.org:443\"");
        let back: SocketAddress = serde_json::from_str(&json).unwrap();
        assert_eq!(back, addr);
    }
}
