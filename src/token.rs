//! Operation tokens
//!
//! Every client operation returns a [`Token`]: a one-shot completion handle
//! the caller can await, poll, or attach an [`ActionListener`] to. A token is
//! completed exactly once, by the receiver loop (ack-bearing operations), the
//! sender loop (QoS 0 publishes) or the operation itself (failures).

use std::any::Any;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::error::{ClientError, ErrorKind};
use crate::message::Message;
use crate::protocol::SubscribeReturnCode;

/// The kind of operation a token tracks
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationKind {
    Connect,
    Disconnect,
    Publish,
    Subscribe,
    Unsubscribe,
}

/// Callback invoked exactly once when a token completes
pub trait ActionListener: Send + Sync {
    fn on_success(&self, token: &Token);
    fn on_failure(&self, token: &Token, error: &ClientError);
}

#[derive(Clone)]
enum Completion {
    Pending,
    Complete,
    Failed(ClientError),
}

struct State {
    completion: Completion,
    granted_qos: Vec<SubscribeReturnCode>,
    session_present: bool,
    listener: Option<Arc<dyn ActionListener>>,
    listener_fired: bool,
    user_context: Option<Arc<dyn Any + Send + Sync>>,
}

struct Inner {
    kind: OperationKind,
    topics: Vec<String>,
    message: Option<Message>,
    state: Mutex<State>,
    done: Notify,
}

/// A one-shot handle for the result of a client operation
#[derive(Clone)]
pub struct Token {
    inner: Arc<Inner>,
}

impl Token {
    pub(crate) fn new(kind: OperationKind) -> Self {
        Self::with_parts(kind, Vec::new(), None)
    }

    pub(crate) fn publish(message: Message) -> Self {
        let topics = vec![message.topic().to_string()];
        Self::with_parts(OperationKind::Publish, topics, Some(message))
    }

    pub(crate) fn with_topics(kind: OperationKind, topics: Vec<String>) -> Self {
        Self::with_parts(kind, topics, None)
    }

    fn with_parts(kind: OperationKind, topics: Vec<String>, message: Option<Message>) -> Self {
        Self {
            inner: Arc::new(Inner {
                kind,
                topics,
                message,
                state: Mutex::new(State {
                    completion: Completion::Pending,
                    granted_qos: Vec::new(),
                    session_present: false,
                    listener: None,
                    listener_fired: false,
                    user_context: None,
                }),
                done: Notify::new(),
            }),
        }
    }

    pub fn kind(&self) -> OperationKind {
        self.inner.kind
    }

    /// Topics this operation refers to (publish topic, subscribe filters)
    pub fn topics(&self) -> &[String] {
        &self.inner.topics
    }

    /// The message being delivered, for publish tokens
    pub fn message(&self) -> Option<&Message> {
        self.inner.message.as_ref()
    }

    pub fn is_complete(&self) -> bool {
        !matches!(self.inner.state.lock().completion, Completion::Pending)
    }

    /// The stored failure, if the operation failed
    pub fn error(&self) -> Option<ClientError> {
        match &self.inner.state.lock().completion {
            Completion::Failed(e) => Some(e.clone()),
            _ => None,
        }
    }

    /// Granted QoS array from SUBACK, in request order
    pub fn granted_qos(&self) -> Vec<SubscribeReturnCode> {
        self.inner.state.lock().granted_qos.clone()
    }

    /// Session present flag from CONNACK, for connect tokens
    pub fn session_present(&self) -> bool {
        self.inner.state.lock().session_present
    }

    pub fn set_user_context(&self, context: Arc<dyn Any + Send + Sync>) {
        self.inner.state.lock().user_context = Some(context);
    }

    pub fn user_context(&self) -> Option<Arc<dyn Any + Send + Sync>> {
        self.inner.state.lock().user_context.clone()
    }

    /// Attach a completion listener.
    ///
    /// If the token is already complete the listener is invoked immediately.
    /// At most one listener invocation ever happens per token.
    pub fn set_action_listener(&self, listener: Arc<dyn ActionListener>) {
        let completion = {
            let mut state = self.inner.state.lock();
            match state.completion {
                Completion::Pending => {
                    state.listener = Some(listener);
                    return;
                }
                _ => {
                    if state.listener_fired {
                        return;
                    }
                    state.listener_fired = true;
                    state.completion.clone()
                }
            }
        };
        self.fire(&listener, &completion);
    }

    /// Await completion; returns the stored error on failure
    pub async fn wait(&self) -> Result<(), ClientError> {
        loop {
            let notified = self.inner.done.notified();
            match self.inner.state.lock().completion.clone() {
                Completion::Complete => return Ok(()),
                Completion::Failed(e) => return Err(e),
                Completion::Pending => {}
            }
            notified.await;
        }
    }

    /// Await completion with a timeout
    pub async fn wait_timeout(&self, timeout: Duration) -> Result<(), ClientError> {
        match tokio::time::timeout(timeout, self.wait()).await {
            Ok(result) => result,
            Err(_) => Err(ClientError::with_detail(
                ErrorKind::ClientTimeout,
                "timed out waiting for operation to complete",
            )),
        }
    }

    pub(crate) fn complete(&self) {
        self.finish(Completion::Complete);
    }

    pub(crate) fn complete_subscribe(&self, granted: Vec<SubscribeReturnCode>) {
        {
            let mut state = self.inner.state.lock();
            state.granted_qos = granted;
        }
        self.finish(Completion::Complete);
    }

    pub(crate) fn complete_connect(&self, session_present: bool) {
        {
            let mut state = self.inner.state.lock();
            state.session_present = session_present;
        }
        self.finish(Completion::Complete);
    }

    pub(crate) fn fail(&self, error: ClientError) {
        self.finish(Completion::Failed(error));
    }

    fn finish(&self, completion: Completion) {
        let listener = {
            let mut state = self.inner.state.lock();
            if !matches!(state.completion, Completion::Pending) {
                // Already completed; a token completes exactly once
                return;
            }
            state.completion = completion.clone();
            match state.listener.take() {
                Some(listener) if !state.listener_fired => {
                    state.listener_fired = true;
                    Some(listener)
                }
                _ => None,
            }
        };
        if let Some(listener) = listener {
            self.fire(&listener, &completion);
        }
        self.inner.done.notify_waiters();
    }

    fn fire(&self, listener: &Arc<dyn ActionListener>, completion: &Completion) {
        match completion {
            Completion::Complete => listener.on_success(self),
            Completion::Failed(e) => listener.on_failure(self, e),
            Completion::Pending => {}
        }
    }
}

impl std::fmt::Debug for Token {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Token")
            .field("kind", &self.inner.kind)
            .field("topics", &self.inner.topics)
            .field("complete", &self.is_complete())
            .finish()
    }
}
