//! The main proxy listener.
//!
//! Accepts TCP connections on the configured port, optionally terminates TLS,
//! and serves each connection with the load-balancing pipeline.

use std::fs::File;
use std::io::BufReader;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use hyper::service::service_fn;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error, info};

use crate::proxy::forward::{self, AppState};

pub struct Server {
    listener: TcpListener,
    tls: Option<TlsAcceptor>,
    state: Arc<AppState>,
}

impl Server {
    /// Binds the listener. TLS, when given, is terminated per connection.
    pub async fn bind(
        addr: SocketAddr,
        tls: Option<TlsAcceptor>,
        state: Arc<AppState>,
    ) -> Result<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("Failed to bind {addr}"))?;
        info!(bind_addr = %listener.local_addr()?, tls = tls.is_some(), "Listener bound");
        Ok(Self {
            listener,
            tls,
            state,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accepts and serves connections forever.
    pub async fn run(self) -> Result<()> {
        loop {
            match self.listener.accept().await {
                Ok((stream, peer_addr)) => {
                    let state = Arc::clone(&self.state);
                    let tls = self.tls.clone();
                    tokio::spawn(async move {
                        let served = match tls {
                            Some(acceptor) => match acceptor.accept(stream).await {
                                Ok(tls_stream) => serve_stream(tls_stream, peer_addr, state).await,
                                Err(err) => {
                                    debug!(peer_addr = %peer_addr, error = %err, "TLS handshake failed");
                                    Ok(())
                                }
                            },
                            None => serve_stream(stream, peer_addr, state).await,
                        };
                        if let Err(err) = served {
                            debug!(peer_addr = %peer_addr, error = %err, "Connection error");
                        }
                    });
                }
                Err(err) => {
                    error!(error = %err, "Accept error");
                    // Brief sleep to avoid a tight loop on persistent errors
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            }
        }
    }
}

async fn serve_stream<S>(
    stream: S,
    peer_addr: SocketAddr,
    state: Arc<AppState>,
) -> std::result::Result<(), Box<dyn std::error::Error + Send + Sync>>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let service = service_fn(move |req| {
        let state = Arc::clone(&state);
        async move {
            Ok::<_, std::convert::Infallible>(forward::handle(req, state, peer_addr).await)
        }
    });

    auto::Builder::new(TokioExecutor::new())
        .serve_connection(TokioIo::new(stream), service)
        .await
}

/// Builds the TLS acceptor from PEM cert and key files. Any missing or
/// malformed material is fatal.
pub fn tls_acceptor(cert_path: &Path, key_path: &Path) -> Result<TlsAcceptor> {
    let cert_file = File::open(cert_path)
        .with_context(|| format!("SSL certificate file {} not found", cert_path.display()))?;
    let certs = rustls_pemfile::certs(&mut BufReader::new(cert_file))
        .collect::<std::result::Result<Vec<_>, _>>()
        .context("Failed to parse SSL certificate file")?;

    let key_file = File::open(key_path)
        .with_context(|| format!("SSL key file {} not found", key_path.display()))?;
    let key = rustls_pemfile::private_key(&mut BufReader::new(key_file))
        .context("Failed to parse SSL key file")?
        .with_context(|| format!("No private key in {}", key_path.display()))?;

    let mut config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .context("Invalid SSL certificate or key")?;
    config.alpn_protocols = vec![b"h2".to_vec(), b"http/1.1".to_vec()];

    Ok(TlsAcceptor::from(Arc::new(config)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_temp(name: &str, contents: &str) -> std::path::PathBuf {
        let path = std::env::temp_dir().join(format!("{}-{name}", uuid::Uuid::new_v4()));
        std::fs::write(&path, contents).unwrap();
        path
    }

    #[test]
    fn tls_acceptor_accepts_generated_material() {
        let cert = rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
        let cert_path = write_temp("cert.pem", &cert.cert.pem());
        let key_path = write_temp("key.pem", &cert.key_pair.serialize_pem());

        assert!(tls_acceptor(&cert_path, &key_path).is_ok());

        std::fs::remove_file(cert_path).ok();
        std::fs::remove_file(key_path).ok();
    }

    #[test]
    fn tls_acceptor_fails_on_missing_files() {
        let missing = std::env::temp_dir().join("swindlr-no-such-file.pem");
        assert!(tls_acceptor(&missing, &missing).is_err());
    }

    #[test]
    fn tls_acceptor_fails_on_garbage_key() {
        let cert = rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
        let cert_path = write_temp("cert.pem", &cert.cert.pem());
        let key_path = write_temp("key.pem", "not a pem key");

        assert!(tls_acceptor(&cert_path, &key_path).is_err());

        std::fs::remove_file(cert_path).ok();
        std::fs::remove_file(key_path).ok();
    }
}
