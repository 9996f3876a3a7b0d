//! Remote endpoint identity.

use core::fmt;
use std::net::{SocketAddr, ToSocketAddrs};

/// The identity of a remote server: the text the caller named it by, plus
/// the resolved socket address if resolution succeeded.
///
/// Resolution itself happens upstream of the session (here via
/// [`ServerAddress::resolve`], or by the caller handing over a
/// `SocketAddr`). A `ServerAddress` that failed to resolve is still a valid
/// input to [`ClientSession::connect`](crate::ClientSession::connect); it
/// produces a session that reports the resolution failure lazily.
#[derive(Debug, Clone)]
pub struct ServerAddress {
    text: String,
    resolved: Option<SocketAddr>,
}

impl ServerAddress {
    /// Resolve `host:port` to a socket address, keeping the original text
    /// for display. Resolution failure is not an error here; it yields an
    /// unresolved address.
    pub fn resolve(host_port: &str) -> Self {
        let resolved = host_port
            .to_socket_addrs()
            .ok()
            .and_then(|mut addrs| addrs.next());
        Self {
            text: host_port.to_owned(),
            resolved,
        }
    }

    /// An address that is known not to resolve, e.g. when resolution was
    /// attempted and failed upstream.
    pub fn unresolved(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            resolved: None,
        }
    }

    pub fn resolved(&self) -> Option<SocketAddr> {
        self.resolved
    }

    pub fn is_valid(&self) -> bool {
        self.resolved.is_some()
    }
}

impl From<SocketAddr> for ServerAddress {
    fn from(addr: SocketAddr) -> Self {
        Self {
            text: addr.to_string(),
            resolved: Some(addr),
        }
    }
}

impl fmt::Display for ServerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.text)
    }
}
