//! HTTPS listener backed by rustls
//!
//! Connections accepted through [`TlsListener`] are reported to the audit
//! record builder as TLS (see [`ConnectionInfo`](crate::net::ConnectionInfo)),
//! which is how a request ends up with the `https` scheme.

use std::fs::File;
use std::io::{self, BufReader};
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use rustls_pemfile::{certs, private_key};
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::rustls::{self, pki_types::CertificateDer, ServerConfig};
use tokio_rustls::server::TlsStream;
use tokio_rustls::TlsAcceptor;

use crate::config::TlsConfig;
use crate::error::{Error, Op, Result};

const OP_LOAD: Op = "tls/load_server_config";

/// TCP listener that completes the TLS handshake before handing out a stream
pub struct TlsListener {
    tcp: TcpListener,
    acceptor: TlsAcceptor,
}

impl TlsListener {
    /// Wrap `tcp` with the given server configuration
    pub fn new(tcp: TcpListener, server_config: Arc<ServerConfig>) -> Self {
        Self {
            tcp,
            acceptor: TlsAcceptor::from(server_config),
        }
    }
}

impl axum::serve::Listener for TlsListener {
    type Io = TlsStream<TcpStream>;
    type Addr = SocketAddr;

    fn accept(&mut self) -> impl std::future::Future<Output = (Self::Io, Self::Addr)> + Send {
        let acceptor = self.acceptor.clone();
        let tcp = &mut self.tcp;

        async move {
            loop {
                // Inherent accept, not the Listener trait method
                let (stream, addr) = match TcpListener::accept(tcp).await {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        tracing::error!("TCP accept error: {}", e);
                        tokio::time::sleep(Duration::from_secs(1)).await;
                        continue;
                    }
                };

                match acceptor.accept(stream).await {
                    Ok(tls_stream) => return (tls_stream, addr),
                    Err(e) => {
                        tracing::warn!(remote_addr = %addr, "TLS handshake failed: {}", e);
                    }
                }
            }
        }
    }

    fn local_addr(&self) -> io::Result<Self::Addr> {
        self.tcp.local_addr()
    }
}

/// Build a rustls server configuration from PEM certificate and key files
pub fn load_server_config(tls_config: &TlsConfig) -> Result<Arc<ServerConfig>> {
    let cert_chain: Vec<CertificateDer<'static>> = certs(&mut open_pem(&tls_config.cert_path)?)
        .collect::<std::result::Result<_, _>>()
        .map_err(|e| Error::io(OP_LOAD, e))?;

    if cert_chain.is_empty() {
        return Err(Error::Internal(format!(
            "TLS cert file '{}' contains no certificates",
            tls_config.cert_path.display()
        )));
    }

    let key = private_key(&mut open_pem(&tls_config.key_path)?)
        .map_err(|e| Error::io(OP_LOAD, e))?
        .ok_or_else(|| {
            Error::Internal(format!(
                "TLS key file '{}' contains no private key",
                tls_config.key_path.display()
            ))
        })?;

    let mut config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(cert_chain, key)
        .map_err(|e: rustls::Error| {
            Error::Internal(format!("Failed to build TLS server config: {}", e))
        })?;
    config.alpn_protocols = vec![b"h2".to_vec(), b"http/1.1".to_vec()];

    Ok(Arc::new(config))
}

fn open_pem(path: &Path) -> Result<BufReader<File>> {
    File::open(path)
        .map(BufReader::new)
        .map_err(|e| Error::io(OP_LOAD, e))
}
