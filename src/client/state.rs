//! Session lifecycle state machine
//!
//! Tracks where the client is in its lifecycle and serializes user API
//! prechecks against connection state. Only the transitions encoded here are
//! legal; everything else is rejected with the error named for the state the
//! client is actually in.

use parking_lot::Mutex;
use tokio::sync::Notify;
use tracing::debug;

use crate::error::{ClientError, ErrorKind};

/// Connection lifecycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// No connection; the client can connect or close
    Disconnected,
    /// A connect attempt is in progress
    Connecting,
    /// Session established; publish/subscribe are live
    Connected,
    /// A disconnect is draining in-flight work
    Disconnecting,
    /// Terminal; the client can never be used again
    Closed,
}

/// Shared lifecycle state with change notification
pub(crate) struct SessionState {
    state: Mutex<ConnectionState>,
    changed: Notify,
}

impl SessionState {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(ConnectionState::Disconnected),
            changed: Notify::new(),
        }
    }

    pub fn current(&self) -> ConnectionState {
        *self.state.lock()
    }

    pub fn is_connected(&self) -> bool {
        self.current() == ConnectionState::Connected
    }

    /// Error describing why an operation is illegal in the current state
    pub fn as_error(&self) -> ClientError {
        let kind = match self.current() {
            ConnectionState::Disconnected => ErrorKind::ClientNotConnected,
            ConnectionState::Connecting => ErrorKind::ConnectInProgress,
            ConnectionState::Connected => ErrorKind::ClientConnected,
            ConnectionState::Disconnecting => ErrorKind::ClientDisconnecting,
            ConnectionState::Closed => ErrorKind::ClientClosed,
        };
        ClientError::new(kind)
    }

    /// Disconnected -> Connecting, on user connect
    pub fn begin_connect(&self) -> Result<(), ClientError> {
        let mut state = self.state.lock();
        match *state {
            ConnectionState::Disconnected => {
                *state = ConnectionState::Connecting;
                drop(state);
                self.notify_change("connecting");
                Ok(())
            }
            ConnectionState::Connecting => Err(ClientError::new(ErrorKind::ConnectInProgress)),
            ConnectionState::Connected => Err(ClientError::new(ErrorKind::ClientConnected)),
            ConnectionState::Disconnecting => Err(ClientError::new(ErrorKind::ClientDisconnecting)),
            ConnectionState::Closed => Err(ClientError::new(ErrorKind::ClientClosed)),
        }
    }

    /// Connecting -> Connected, on CONNACK with return code 0. A forced
    /// close that raced the handshake wins; the transition is then dropped.
    pub fn transition_connected(&self) {
        let mut state = self.state.lock();
        if *state == ConnectionState::Connecting {
            *state = ConnectionState::Connected;
            drop(state);
            self.notify_change("connected");
        }
    }

    /// Connected -> Disconnecting, on user disconnect
    pub fn begin_disconnect(&self) -> Result<(), ClientError> {
        let mut state = self.state.lock();
        match *state {
            ConnectionState::Connected => {
                *state = ConnectionState::Disconnecting;
                drop(state);
                self.notify_change("disconnecting");
                Ok(())
            }
            ConnectionState::Disconnected => Err(ClientError::new(ErrorKind::ClientNotConnected)),
            ConnectionState::Connecting => Err(ClientError::new(ErrorKind::ConnectInProgress)),
            ConnectionState::Disconnecting => Err(ClientError::new(ErrorKind::ClientDisconnecting)),
            ConnectionState::Closed => Err(ClientError::new(ErrorKind::ClientClosed)),
        }
    }

    /// Any non-closed state -> Disconnected (handshake failure, drain
    /// complete, connection lost)
    pub fn transition_disconnected(&self) {
        let mut state = self.state.lock();
        if *state != ConnectionState::Closed {
            *state = ConnectionState::Disconnected;
            drop(state);
            self.notify_change("disconnected");
        }
    }

    /// Disconnected -> Closed; `force` allows closing from any state
    pub fn close(&self, force: bool) -> Result<(), ClientError> {
        let mut state = self.state.lock();
        match *state {
            ConnectionState::Closed => Ok(()),
            ConnectionState::Disconnected => {
                *state = ConnectionState::Closed;
                drop(state);
                self.notify_change("closed");
                Ok(())
            }
            _ if force => {
                *state = ConnectionState::Closed;
                drop(state);
                self.notify_change("closed (forced)");
                Ok(())
            }
            ConnectionState::Connecting => Err(ClientError::new(ErrorKind::ConnectInProgress)),
            ConnectionState::Connected => Err(ClientError::new(ErrorKind::ClientConnected)),
            ConnectionState::Disconnecting => Err(ClientError::new(ErrorKind::ClientDisconnecting)),
        }
    }

    fn notify_change(&self, to: &str) {
        debug!("Session state: {}", to);
        self.changed.notify_waiters();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connect_lifecycle() {
        let state = SessionState::new();
        assert_eq!(state.current(), ConnectionState::Disconnected);

        state.begin_connect().unwrap();
        assert_eq!(state.current(), ConnectionState::Connecting);

        // Second connect while connecting is rejected
        assert_eq!(
            state.begin_connect().unwrap_err().kind(),
            ErrorKind::ConnectInProgress
        );

        state.transition_connected();
        assert!(state.is_connected());

        assert_eq!(
            state.begin_connect().unwrap_err().kind(),
            ErrorKind::ClientConnected
        );

        state.begin_disconnect().unwrap();
        assert_eq!(
            state.begin_connect().unwrap_err().kind(),
            ErrorKind::ClientDisconnecting
        );

        state.transition_disconnected();
        assert_eq!(state.current(), ConnectionState::Disconnected);
    }

    #[test]
    fn test_close_only_from_disconnected() {
        let state = SessionState::new();
        state.begin_connect().unwrap();
        state.transition_connected();

        assert_eq!(
            state.close(false).unwrap_err().kind(),
            ErrorKind::ClientConnected
        );

        state.begin_disconnect().unwrap();
        state.transition_disconnected();
        state.close(false).unwrap();
        assert_eq!(state.current(), ConnectionState::Closed);

        // Closed is terminal
        assert_eq!(
            state.begin_connect().unwrap_err().kind(),
            ErrorKind::ClientClosed
        );
        state.close(false).unwrap();
    }

    #[test]
    fn test_forced_close_from_connected() {
        let state = SessionState::new();
        state.begin_connect().unwrap();
        state.transition_connected();
        state.close(true).unwrap();
        assert_eq!(state.current(), ConnectionState::Closed);
    }

    #[test]
    fn test_disconnected_transition_does_not_revive_closed() {
        let state = SessionState::new();
        state.close(true).unwrap();
        state.transition_disconnected();
        assert_eq!(state.current(), ConnectionState::Closed);
    }
}
