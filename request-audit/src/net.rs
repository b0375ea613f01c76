//! Connection and request-line facts used by the audit record builder
//!
//! [`ConnectionInfo`] is installed per connection by the server through axum's
//! `ConnectInfo` machinery and tells the builder who connected and whether the
//! transport was TLS. The remaining helpers interpret raw request-line and
//! header values.

use std::net::SocketAddr;

use axum::extract::connect_info::Connected;
use axum::serve::IncomingStream;
use http::{header, HeaderMap, Version};
use tokio::net::TcpListener;

use crate::error::{Error, Result};

/// Per-connection facts recorded for every request on that connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionInfo {
    /// Peer address
    pub remote_addr: SocketAddr,
    /// Whether the connection was accepted through TLS
    pub tls: bool,
}

impl ConnectionInfo {
    /// Plain-text connection from `remote_addr`
    pub fn plain(remote_addr: SocketAddr) -> Self {
        Self {
            remote_addr,
            tls: false,
        }
    }

    /// TLS connection from `remote_addr`
    pub fn tls(remote_addr: SocketAddr) -> Self {
        Self {
            remote_addr,
            tls: true,
        }
    }

    /// `https` for TLS connections, `http` otherwise
    pub fn scheme(&self) -> &'static str {
        if self.tls {
            "https"
        } else {
            "http"
        }
    }
}

impl Connected<IncomingStream<'_, TcpListener>> for ConnectionInfo {
    fn connect_info(stream: IncomingStream<'_, TcpListener>) -> Self {
        Self::plain(*stream.remote_addr())
    }
}

#[cfg(feature = "tls")]
impl Connected<IncomingStream<'_, crate::tls::TlsListener>> for ConnectionInfo {
    fn connect_info(stream: IncomingStream<'_, crate::tls::TlsListener>) -> Self {
        Self::tls(*stream.remote_addr())
    }
}

/// Split a `host:port` authority into its host and port parts
///
/// IPv6 literals must be bracketed (`[::1]:8443`); the brackets are removed
/// from the returned host. The port may be empty (`example.com:`), but the
/// delimiter is required.
pub fn split_host_port(authority: &str) -> Result<(String, String)> {
    let malformed = |reason| Error::MalformedHost {
        host: authority.to_string(),
        reason,
    };

    let (host, port) = if let Some(rest) = authority.strip_prefix('[') {
        let end = rest.find(']').ok_or_else(|| malformed("missing ']' in address"))?;
        let host = &rest[..end];
        let after = &rest[end + 1..];
        let port = after
            .strip_prefix(':')
            .ok_or_else(|| malformed("missing port in address"))?;
        (host, port)
    } else {
        let colon = authority
            .rfind(':')
            .ok_or_else(|| malformed("missing port in address"))?;
        let host = &authority[..colon];
        if host.contains(':') {
            return Err(malformed("too many colons in address"));
        }
        (host, &authority[colon + 1..])
    };

    if host.contains(['[', ']']) || port.contains(['[', ']', ':']) {
        return Err(malformed("unexpected bracket or colon in address"));
    }

    Ok((host.to_string(), port.to_string()))
}

/// Protocol name with major and minor numbers, e.g. `("HTTP/1.1", 1, 1)`
pub fn protocol_parts(version: Version) -> (&'static str, i32, i32) {
    match version {
        Version::HTTP_09 => ("HTTP/0.9", 0, 9),
        Version::HTTP_10 => ("HTTP/1.0", 1, 0),
        Version::HTTP_2 => ("HTTP/2.0", 2, 0),
        Version::HTTP_3 => ("HTTP/3.0", 3, 0),
        _ => ("HTTP/1.1", 1, 1),
    }
}

/// Transfer codings listed by the request, in order
pub fn transfer_encodings(headers: &HeaderMap) -> Vec<String> {
    headers
        .get_all(header::TRANSFER_ENCODING)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .map(|coding| coding.trim().to_ascii_lowercase())
        .filter(|coding| !coding.is_empty())
        .collect()
}

/// Whether the client asked for the connection to be closed after this request
///
/// HTTP/1.0 closes unless `Connection: keep-alive` is sent; HTTP/1.1 keeps the
/// connection unless `Connection: close` is sent. HTTP/2 and later never use
/// the `Connection` header.
pub fn wants_close(version: Version, headers: &HeaderMap) -> bool {
    let has_token = |token: &str| {
        headers
            .get_all(header::CONNECTION)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .flat_map(|v| v.split(','))
            .any(|t| t.trim().eq_ignore_ascii_case(token))
    };

    match version {
        Version::HTTP_09 => true,
        Version::HTTP_10 => !has_token("keep-alive"),
        Version::HTTP_11 => has_token("close"),
        _ => false,
    }
}
