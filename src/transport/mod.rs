//! Transport Layer
//!
//! Server endpoint parsing and the byte-duplex transport seam. The client
//! runtime only ever sees a [`TransportStream`]; concrete socket types live
//! behind the [`Transport`] trait so tests and embedders can supply their
//! own (loopback, proxied, instrumented) connections.

mod tcp;

pub use tcp::TcpTransport;

use std::fmt;
use std::io;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};

/// Supported URI schemes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scheme {
    /// Plain MQTT over TCP
    Tcp,
    /// MQTT over TLS
    Ssl,
}

impl Scheme {
    /// Get default port for this scheme
    pub fn default_port(&self) -> u16 {
        match self {
            Scheme::Tcp => 1883,
            Scheme::Ssl => 8883,
        }
    }
}

impl fmt::Display for Scheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Scheme::Tcp => write!(f, "tcp"),
            Scheme::Ssl => write!(f, "ssl"),
        }
    }
}

/// A parsed server endpoint
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    scheme: Scheme,
    host: String,
    port: u16,
}

impl Endpoint {
    /// Parse a server URI of the form `scheme://host[:port]`
    pub fn parse(uri: &str) -> io::Result<Self> {
        let (scheme, rest) = match uri.split_once("://") {
            Some(("tcp", rest)) => (Scheme::Tcp, rest),
            Some(("ssl", rest)) => (Scheme::Ssl, rest),
            Some((other, _)) => {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    format!("unsupported URI scheme: {}://", other),
                ));
            }
            None => {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    format!("missing URI scheme in {:?}", uri),
                ));
            }
        };

        if rest.is_empty() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "missing host in server URI",
            ));
        }

        let (host, port) = match rest.rsplit_once(':') {
            Some((host, port)) if !host.is_empty() => {
                let port = port.parse::<u16>().map_err(|_| {
                    io::Error::new(
                        io::ErrorKind::InvalidInput,
                        format!("invalid port in {:?}", uri),
                    )
                })?;
                (host.to_string(), port)
            }
            _ => (rest.to_string(), scheme.default_port()),
        };

        Ok(Self { scheme, host, port })
    }

    pub fn scheme(&self) -> Scheme {
        self.scheme
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}:{}", self.scheme, self.host, self.port)
    }
}

/// The read and write halves of one open connection
pub struct TransportStream {
    pub reader: Box<dyn AsyncRead + Send + Unpin>,
    pub writer: Box<dyn AsyncWrite + Send + Unpin>,
}

impl TransportStream {
    pub fn new(
        reader: impl AsyncRead + Send + Unpin + 'static,
        writer: impl AsyncWrite + Send + Unpin + 'static,
    ) -> Self {
        Self {
            reader: Box::new(reader),
            writer: Box::new(writer),
        }
    }
}

/// Opens a byte-duplex stream to a server endpoint
#[async_trait]
pub trait Transport: Send + Sync {
    async fn open(&self, endpoint: &Endpoint) -> io::Result<TransportStream>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test_case("tcp://localhost", Scheme::Tcp, "localhost", 1883; "tcp default port")]
    #[test_case("tcp://broker.example.com:9883", Scheme::Tcp, "broker.example.com", 9883; "tcp explicit port")]
    #[test_case("ssl://broker.example.com", Scheme::Ssl, "broker.example.com", 8883; "ssl default port")]
    #[test_case("ssl://10.0.0.1:8884", Scheme::Ssl, "10.0.0.1", 8884; "ssl explicit port")]
    fn test_endpoint_parse(uri: &str, scheme: Scheme, host: &str, port: u16) {
        let endpoint = Endpoint::parse(uri).unwrap();
        assert_eq!(endpoint.scheme(), scheme);
        assert_eq!(endpoint.host(), host);
        assert_eq!(endpoint.port(), port);
    }

    #[test]
    fn test_endpoint_rejects_unknown_schemes() {
        assert!(Endpoint::parse("ws://host:80").is_err());
        assert!(Endpoint::parse("local://socket").is_err());
        assert!(Endpoint::parse("host:1883").is_err());
        assert!(Endpoint::parse("tcp://").is_err());
        assert!(Endpoint::parse("tcp://host:notaport").is_err());
    }

    #[test]
    fn test_endpoint_display_roundtrip() {
        let endpoint = Endpoint::parse("tcp://good:1883").unwrap();
        assert_eq!(endpoint.to_string(), "tcp://good:1883");
        assert_eq!(Endpoint::parse(&endpoint.to_string()).unwrap(), endpoint);
    }
}
