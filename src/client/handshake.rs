//! Connect handshake coordinator
//!
//! Walks an ordered list of candidate endpoints: open the transport, write
//! CONNECT, await CONNACK, all within the configured connection timeout. A
//! transport failure moves on to the next candidate; a server that answers
//! with a non-zero return code fails the whole connect immediately.

use std::sync::Arc;

use bytes::BytesMut;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::client::inflight::encode_packet;
use crate::codec::Decoder;
use crate::error::{ClientError, ErrorKind};
use crate::protocol::{ConnAck, Connect, ConnectReturnCode, Packet};
use crate::transport::{Endpoint, Transport, TransportStream};

pub(crate) struct HandshakeOutcome {
    pub stream: TransportStream,
    pub connack: ConnAck,
    pub endpoint: Endpoint,
}

enum AttemptError {
    /// Socket-level failure; the next candidate may still succeed
    Transport(ClientError),
    /// The server answered and said no; do not try further candidates
    Rejected(ClientError),
}

/// Try each candidate endpoint in order until one accepts the CONNECT
pub(crate) async fn connect_any(
    transport: &Arc<dyn Transport>,
    endpoints: &[Endpoint],
    connect: &Connect,
    connection_timeout: std::time::Duration,
) -> Result<HandshakeOutcome, ClientError> {
    let mut last_error = None;

    for endpoint in endpoints {
        debug!("Attempting connection to {}", endpoint);
        match connect_one(transport, endpoint, connect, connection_timeout).await {
            Ok(outcome) => {
                info!(
                    "Connected to {} (session_present={})",
                    endpoint, outcome.connack.session_present
                );
                return Ok(outcome);
            }
            Err(AttemptError::Rejected(error)) => {
                warn!("Server {} rejected connect: {}", endpoint, error);
                return Err(error);
            }
            Err(AttemptError::Transport(error)) => {
                warn!("Could not reach {}: {}", endpoint, error);
                last_error = Some(error);
            }
        }
    }

    Err(last_error.unwrap_or_else(|| ClientError::new(ErrorKind::BrokerUnavailable)))
}

async fn connect_one(
    transport: &Arc<dyn Transport>,
    endpoint: &Endpoint,
    connect: &Connect,
    connection_timeout: std::time::Duration,
) -> Result<HandshakeOutcome, AttemptError> {
    let attempt = async {
        let mut stream = transport
            .open(endpoint)
            .await
            .map_err(|e| AttemptError::Transport(ClientError::with_cause(ErrorKind::BrokerUnavailable, e)))?;

        let wire = encode_packet(&Packet::Connect(Box::new(connect.clone())))
            .map_err(|e| AttemptError::Rejected(e.into()))?;
        stream
            .writer
            .write_all(&wire)
            .await
            .map_err(|e| AttemptError::Transport(ClientError::with_cause(ErrorKind::BrokerUnavailable, e)))?;

        let connack = read_connack(&mut stream).await?;
        Ok(HandshakeOutcome {
            stream,
            connack,
            endpoint: endpoint.clone(),
        })
    };

    match timeout(connection_timeout, attempt).await {
        Ok(result) => {
            let outcome = result?;
            if outcome.connack.return_code == ConnectReturnCode::Accepted {
                Ok(outcome)
            } else {
                Err(AttemptError::Rejected(ClientError::from_connack(
                    outcome.connack.return_code,
                )))
            }
        }
        Err(_) => Err(AttemptError::Transport(ClientError::with_detail(
            ErrorKind::ClientTimeout,
            format!("no CONNACK from {} within {:?}", endpoint, connection_timeout),
        ))),
    }
}

/// Read exactly one packet, which must be a CONNACK
async fn read_connack(stream: &mut TransportStream) -> Result<ConnAck, AttemptError> {
    let mut decoder = Decoder::new();
    let mut buf = BytesMut::with_capacity(64);

    loop {
        match decoder.decode(&buf) {
            Ok(Some((Packet::ConnAck(connack), _))) => return Ok(connack),
            Ok(Some((packet, _))) => {
                return Err(AttemptError::Rejected(ClientError::with_detail(
                    ErrorKind::ProtocolError,
                    format!("expected CONNACK, got packet type {}", packet.packet_type()),
                )));
            }
            Ok(None) => {}
            Err(e) => return Err(AttemptError::Rejected(e.into())),
        }

        let n = stream
            .reader
            .read_buf(&mut buf)
            .await
            .map_err(|e| AttemptError::Transport(ClientError::with_cause(ErrorKind::BrokerUnavailable, e)))?;
        if n == 0 {
            return Err(AttemptError::Transport(ClientError::with_detail(
                ErrorKind::BrokerUnavailable,
                "connection closed before CONNACK",
            )));
        }
    }
}
