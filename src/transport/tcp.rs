//! TCP and TLS transport
//!
//! Default [`Transport`](super::Transport) implementation covering the
//! `tcp://` and `ssl://` schemes. TLS certificate configuration stays with
//! the caller: `ssl://` endpoints require a pre-built
//! [`rustls::ClientConfig`](tokio_rustls::rustls::ClientConfig).

use std::io;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::net::TcpStream;
use tokio_rustls::rustls::pki_types::ServerName;
use tokio_rustls::TlsConnector;
use tracing::debug;

use super::{Endpoint, Scheme, Transport, TransportStream};

/// Transport over plain TCP, with TLS for `ssl://` endpoints
pub struct TcpTransport {
    /// TCP nodelay
    nodelay: bool,
    /// TLS client configuration, required for `ssl://` endpoints
    tls: Option<Arc<tokio_rustls::rustls::ClientConfig>>,
}

impl TcpTransport {
    pub fn new() -> Self {
        Self {
            nodelay: true,
            tls: None,
        }
    }

    pub fn with_tls(mut self, config: Arc<tokio_rustls::rustls::ClientConfig>) -> Self {
        self.tls = Some(config);
        self
    }

    pub fn with_nodelay(mut self, nodelay: bool) -> Self {
        self.nodelay = nodelay;
        self
    }
}

impl Default for TcpTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Transport for TcpTransport {
    async fn open(&self, endpoint: &Endpoint) -> io::Result<TransportStream> {
        let stream = TcpStream::connect((endpoint.host(), endpoint.port())).await?;
        stream.set_nodelay(self.nodelay)?;
        debug!("TCP connected to {}", endpoint);

        match endpoint.scheme() {
            Scheme::Tcp => {
                let (reader, writer) = tokio::io::split(stream);
                Ok(TransportStream::new(reader, writer))
            }
            Scheme::Ssl => {
                let config = self.tls.clone().ok_or_else(|| {
                    io::Error::new(
                        io::ErrorKind::InvalidInput,
                        "ssl:// endpoint requires a TLS client configuration",
                    )
                })?;
                let server_name = ServerName::try_from(endpoint.host().to_string())
                    .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
                let connector = TlsConnector::from(config);
                let tls_stream = connector.connect(server_name, stream).await?;
                debug!("TLS established with {}", endpoint);
                let (reader, writer) = tokio::io::split(tls_stream);
                Ok(TransportStream::new(reader, writer))
            }
        }
    }
}
