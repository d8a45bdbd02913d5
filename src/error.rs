//! Client error types
//!
//! Every failed operation surfaces a [`ClientError`] carrying a stable
//! numeric reason code, mirroring the codes long established by MQTT client
//! implementations so applications can match on them across releases.

use std::fmt;
use std::sync::Arc;

use crate::protocol::ConnectReturnCode;

/// Reason for a failed client operation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// The server rejected the protocol level in CONNECT
    UnacceptableProtocolVersion,
    /// The server rejected the client identifier
    IdentifierRejected,
    /// The MQTT service is unavailable on the server
    BrokerUnavailable,
    /// Malformed user name or password
    FailedAuthentication,
    /// The client is not authorized to connect
    NotAuthorized,
    /// The server granted 0x80 for one or more requested filters
    SubscribeFailed,
    /// No response from the server within the keep alive window
    ClientTimeout,
    /// All 65535 message identifiers are in flight
    NoMessageIdsAvailable,
    /// A packet write did not complete in time
    WriteTimeout,
    /// The operation requires a disconnected client, but it is connected
    ClientConnected,
    /// The client is currently disconnecting
    ClientDisconnecting,
    /// The operation requires a connected client
    ClientNotConnected,
    /// A topic name or filter failed validation
    InvalidTopic,
    /// A malformed or unexpected packet arrived from the server
    ProtocolError,
    /// The connection to the server was lost
    ConnectionLost,
    /// A connect attempt is already in progress
    ConnectInProgress,
    /// The client has been closed
    ClientClosed,
    /// The persistence store failed an operation
    PersistenceFailure,
    /// The offline buffer is full and `delete_oldest` is disabled
    DisconnectedBufferFull,
    /// Supplied options were rejected before any network activity
    InvalidOptions,
}

impl ErrorKind {
    /// Stable numeric identity for this error kind
    pub fn code(self) -> u32 {
        match self {
            ErrorKind::UnacceptableProtocolVersion => 1,
            ErrorKind::IdentifierRejected => 2,
            ErrorKind::BrokerUnavailable => 3,
            ErrorKind::FailedAuthentication => 4,
            ErrorKind::NotAuthorized => 5,
            ErrorKind::SubscribeFailed => 128,
            ErrorKind::ClientTimeout => 32000,
            ErrorKind::NoMessageIdsAvailable => 32001,
            ErrorKind::WriteTimeout => 32002,
            ErrorKind::ClientConnected => 32100,
            ErrorKind::ClientDisconnecting => 32102,
            ErrorKind::ClientNotConnected => 32104,
            ErrorKind::InvalidTopic => 32105,
            ErrorKind::ProtocolError => 32108,
            ErrorKind::ConnectionLost => 32109,
            ErrorKind::ConnectInProgress => 32110,
            ErrorKind::ClientClosed => 32111,
            ErrorKind::PersistenceFailure => 32200,
            ErrorKind::DisconnectedBufferFull => 32203,
            ErrorKind::InvalidOptions => 32300,
        }
    }

    fn describe(self) -> &'static str {
        match self {
            ErrorKind::UnacceptableProtocolVersion => "unacceptable protocol version",
            ErrorKind::IdentifierRejected => "client identifier rejected",
            ErrorKind::BrokerUnavailable => "broker unavailable",
            ErrorKind::FailedAuthentication => "bad user name or password",
            ErrorKind::NotAuthorized => "not authorized",
            ErrorKind::SubscribeFailed => "subscription failed",
            ErrorKind::ClientTimeout => "timed out waiting for the server",
            ErrorKind::NoMessageIdsAvailable => "no message identifiers available",
            ErrorKind::WriteTimeout => "write timed out",
            ErrorKind::ClientConnected => "client is connected",
            ErrorKind::ClientDisconnecting => "client is disconnecting",
            ErrorKind::ClientNotConnected => "client is not connected",
            ErrorKind::InvalidTopic => "invalid topic",
            ErrorKind::ProtocolError => "protocol error",
            ErrorKind::ConnectionLost => "connection lost",
            ErrorKind::ConnectInProgress => "connect already in progress",
            ErrorKind::ClientClosed => "client is closed",
            ErrorKind::PersistenceFailure => "persistence failure",
            ErrorKind::DisconnectedBufferFull => "offline buffer is full",
            ErrorKind::InvalidOptions => "invalid options",
        }
    }
}

/// Error surfaced by client operations and completed tokens
///
/// Clonable so the same failure can be stored in a token, returned to a
/// waiting caller and passed to the action listener.
#[derive(Debug, Clone)]
pub struct ClientError {
    kind: ErrorKind,
    detail: Option<String>,
    cause: Option<Arc<dyn std::error::Error + Send + Sync>>,
}

impl ClientError {
    pub fn new(kind: ErrorKind) -> Self {
        Self {
            kind,
            detail: None,
            cause: None,
        }
    }

    pub fn with_detail(kind: ErrorKind, detail: impl Into<String>) -> Self {
        Self {
            kind,
            detail: Some(detail.into()),
            cause: None,
        }
    }

    pub fn with_cause(
        kind: ErrorKind,
        cause: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self {
            kind,
            detail: None,
            cause: Some(Arc::new(cause)),
        }
    }

    /// Classify a non-zero CONNACK return code
    pub fn from_connack(code: ConnectReturnCode) -> Self {
        let kind = match code {
            ConnectReturnCode::Accepted => ErrorKind::ProtocolError,
            ConnectReturnCode::UnacceptableProtocolVersion => {
                ErrorKind::UnacceptableProtocolVersion
            }
            ConnectReturnCode::IdentifierRejected => ErrorKind::IdentifierRejected,
            ConnectReturnCode::ServerUnavailable => ErrorKind::BrokerUnavailable,
            ConnectReturnCode::BadUserNameOrPassword => ErrorKind::FailedAuthentication,
            ConnectReturnCode::NotAuthorized => ErrorKind::NotAuthorized,
        };
        Self::new(kind)
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    /// Stable numeric identity of the failure
    pub fn code(&self) -> u32 {
        self.kind.code()
    }
}

impl fmt::Display for ClientError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.kind.describe(), self.kind.code())?;
        if let Some(ref detail) = self.detail {
            write!(f, ": {}", detail)?;
        }
        if let Some(ref cause) = self.cause {
            write!(f, ": {}", cause)?;
        }
        Ok(())
    }
}

impl std::error::Error for ClientError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.cause
            .as_ref()
            .map(|c| c.as_ref() as &(dyn std::error::Error + 'static))
    }
}

impl From<crate::protocol::DecodeError> for ClientError {
    fn from(e: crate::protocol::DecodeError) -> Self {
        ClientError::with_cause(ErrorKind::ProtocolError, e)
    }
}

impl From<crate::protocol::EncodeError> for ClientError {
    fn from(e: crate::protocol::EncodeError) -> Self {
        ClientError::with_cause(ErrorKind::ProtocolError, e)
    }
}

impl From<crate::persistence::PersistenceError> for ClientError {
    fn from(e: crate::persistence::PersistenceError) -> Self {
        ClientError::with_cause(ErrorKind::PersistenceFailure, e)
    }
}
