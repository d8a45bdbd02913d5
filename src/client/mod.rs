//! Asynchronous MQTT client
//!
//! [`AsyncClient`] is the user-facing surface: it serializes API calls
//! against the session lifecycle, feeds the in-flight engine, and owns the
//! connection tasks while a session is up.

mod buffer;
mod comms;
mod dispatch;
mod handshake;
mod inflight;
mod keepalive;
mod reconnect;
mod state;

pub use dispatch::MessageHandler;
pub use state::ConnectionState;

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::error::{ClientError, ErrorKind};
use crate::message::Message;
use crate::options::{BufferOptions, ConnectOptions};
use crate::persistence::{buffered_key, ClientPersistence};
use crate::protocol::{ConnAck, Connect, Packet, QoS, Subscription, Will};
use crate::token::{OperationKind, Token};
use crate::topic::{validate_topic_filter, validate_topic_name};
use crate::transport::{Endpoint, TcpTransport, Transport};

use buffer::OfflineBuffer;
use comms::ActiveConnection;
use dispatch::Dispatcher;
use inflight::Engine;
use keepalive::{KeepAlive, PingAction};
use reconnect::ReconnectHandle;
use state::SessionState;

/// Global callbacks for events not tied to a single operation
///
/// Handlers are invoked from the client's internal tasks and must not assume
/// any particular thread.
pub trait EventHandler: Send + Sync {
    /// The connection to the server was lost unexpectedly. Fires exactly
    /// once per transition out of the connected state.
    fn connection_lost(&self, _error: &ClientError) {}

    /// A message arrived that no per-filter handler claimed
    fn message_arrived(&self, _message: &Message) {}

    /// A QoS 0 publish was written, or a QoS 1/2 publish reached its
    /// terminal ack
    fn delivery_complete(&self, _token: &Token) {}
}

/// Everything the client tasks share
pub(crate) struct ClientCore {
    client_id: String,
    primary: Endpoint,
    pub(crate) transport: Arc<dyn Transport>,
    pub(crate) persistence: Arc<dyn ClientPersistence>,
    pub(crate) state: SessionState,
    pub(crate) engine: Engine,
    pub(crate) dispatcher: Dispatcher,
    buffer: OfflineBuffer,
    callback: RwLock<Option<Arc<dyn EventHandler>>>,
    manual_acks: AtomicBool,
    /// Options from the most recent connect; reused by reconnects
    options: RwLock<Option<ConnectOptions>>,
    current_server: RwLock<Option<Endpoint>>,
    connection: Mutex<Option<ActiveConnection>>,
    reconnecting: AtomicBool,
}

impl ClientCore {
    pub(crate) fn event_handler(&self) -> Option<Arc<dyn EventHandler>> {
        self.callback.read().clone()
    }

    pub(crate) fn manual_acks(&self) -> bool {
        self.manual_acks.load(Ordering::Acquire)
    }

    pub(crate) fn notify_delivery(&self, token: &Token) {
        if let Some(handler) = self.event_handler() {
            handler.delivery_complete(token);
        }
    }

    pub(crate) fn max_reconnect_delay(&self) -> Duration {
        self.options
            .read()
            .as_ref()
            .map(|o| o.max_reconnect_delay)
            .unwrap_or(Duration::from_secs(128))
    }

    async fn do_connect(
        core: &Arc<ClientCore>,
        options: ConnectOptions,
    ) -> Result<Token, ClientError> {
        options.validate()?;
        core.state.begin_connect()?;

        let token = Token::new(OperationKind::Connect);
        match Self::establish(core, &options).await {
            Ok(connack) => {
                *core.options.write() = Some(options);
                token.complete_connect(connack.session_present);
                Ok(token)
            }
            Err(error) => {
                core.state.transition_disconnected();
                token.fail(error.clone());
                Err(error)
            }
        }
    }

    /// Handshake, session replay, task startup and buffer drain. The caller
    /// already moved the state machine into Connecting.
    async fn establish(
        core: &Arc<ClientCore>,
        options: &ConnectOptions,
    ) -> Result<ConnAck, ClientError> {
        let endpoints: Vec<Endpoint> = if options.server_uris.is_empty() {
            vec![core.primary.clone()]
        } else {
            let mut endpoints = Vec::with_capacity(options.server_uris.len());
            for uri in &options.server_uris {
                endpoints.push(
                    Endpoint::parse(uri)
                        .map_err(|e| ClientError::with_cause(ErrorKind::InvalidOptions, e))?,
                );
            }
            endpoints
        };

        let connect = Connect {
            client_id: core.client_id.clone(),
            clean_session: options.clean_session,
            keep_alive: options.keep_alive_secs(),
            username: options.username.clone(),
            password: options
                .password
                .as_ref()
                .map(|p| Bytes::from(p.clone().into_bytes())),
            will: options.will.as_ref().map(|w| Will {
                topic: w.topic.clone(),
                payload: Bytes::from(w.payload.clone().into_bytes()),
                qos: QoS::from_u8(w.qos).unwrap_or(QoS::AtMostOnce),
                retain: w.retained,
            }),
        };

        let outcome = handshake::connect_any(
            &core.transport,
            &endpoints,
            &connect,
            options.connection_timeout,
        )
        .await?;

        *core.current_server.write() = Some(outcome.endpoint.clone());
        core.engine.set_max_inflight(options.max_inflight);
        core.buffer.set_options(options.buffer.clone());

        if options.clean_session {
            // Both ends discard session state, including stale handlers for
            // subscriptions the server no longer holds
            let failed = core.engine.reset_session(&core.persistence).await?;
            for token in failed {
                token.fail(ClientError::with_detail(
                    ErrorKind::ConnectionLost,
                    "pending state discarded by clean session connect",
                ));
            }
            core.dispatcher.clear();
        } else {
            // Queue PUBREL and duplicate PUBLISH replays ahead of new traffic
            core.engine.prepare_replay();
        }

        let keepalive = Arc::new(KeepAlive::new(options.keep_alive));
        let connection = comms::start(core.clone(), outcome.stream, keepalive);
        *core.connection.lock() = Some(connection);
        core.state.transition_connected();

        // Buffered publishes follow the replays, oldest first
        core.drain_buffer().await;

        Ok(outcome.connack)
    }

    async fn drain_buffer(&self) {
        let entries = self.buffer.drain();
        if entries.is_empty() {
            return;
        }
        info!("Draining {} buffered publishes", entries.len());
        for entry in entries {
            if let Some(seq) = entry.key {
                let _ = self.persistence.remove(&buffered_key(seq)).await;
            }
            match entry.message.qos() {
                QoS::AtMostOnce => self
                    .engine
                    .post_publish_qos0(entry.message, entry.token),
                _ => {
                    if let Err(error) = self
                        .engine
                        .post_publish(&self.persistence, entry.message, entry.token.clone())
                        .await
                    {
                        warn!("Failed to requeue buffered publish: {}", error);
                        entry.token.fail(error);
                    }
                }
            }
        }
    }

    /// The connection-lost pathway, entered exactly once per established
    /// connection (the comms supervisor guarantees first-wins)
    pub(crate) async fn handle_connection_lost(core: Arc<ClientCore>, error: ClientError) {
        warn!("Connection lost: {}", error);
        *core.connection.lock() = None;

        let was_connected = core.state.current() == ConnectionState::Connected;
        let fatal = matches!(
            error.kind(),
            ErrorKind::ProtocolError | ErrorKind::PersistenceFailure
        );
        core.state.transition_disconnected();

        for token in core.engine.on_connection_lost() {
            token.fail(error.clone());
        }

        if was_connected {
            if let Some(handler) = core.event_handler() {
                handler.connection_lost(&error);
            }
        }

        if fatal {
            warn!("Unrecoverable failure; closing client");
            let _ = core.state.close(true);
            if let Err(e) = core.persistence.close().await {
                warn!("Failed to close persistence: {}", e);
            }
            return;
        }

        let automatic = core
            .options
            .read()
            .as_ref()
            .map(|o| o.automatic_reconnect)
            .unwrap_or(false);
        if was_connected && automatic && !core.reconnecting.swap(true, Ordering::SeqCst) {
            debug!("Starting automatic reconnect");
            reconnect::spawn(ReconnectHandle::new(&core));
        }
    }

    /// One attempt from the reconnect controller
    pub(crate) async fn reconnect_attempt(core: &Arc<ClientCore>) -> Result<(), ClientError> {
        let options = core
            .options
            .read()
            .clone()
            .ok_or_else(|| ClientError::new(ErrorKind::ClientNotConnected))?;
        core.state.begin_connect()?;
        match Self::establish(core, &options).await {
            Ok(_) => Ok(()),
            Err(error) => {
                core.state.transition_disconnected();
                Err(error)
            }
        }
    }

    pub(crate) fn reconnect_finished(&self) {
        self.reconnecting.store(false, Ordering::SeqCst);
    }
}

/// Asynchronous MQTT v3.1.1 client
pub struct AsyncClient {
    core: Arc<ClientCore>,
}

impl AsyncClient {
    /// Create a client for the given server URI with the default TCP/TLS
    /// transport. An empty client id gets a generated one.
    pub async fn new(
        server_uri: &str,
        client_id: &str,
        persistence: Arc<dyn ClientPersistence>,
    ) -> Result<Self, ClientError> {
        Self::with_transport(
            server_uri,
            client_id,
            persistence,
            Arc::new(TcpTransport::new()),
        )
        .await
    }

    /// Create a client with a custom transport implementation
    pub async fn with_transport(
        server_uri: &str,
        client_id: &str,
        persistence: Arc<dyn ClientPersistence>,
        transport: Arc<dyn Transport>,
    ) -> Result<Self, ClientError> {
        let primary = Endpoint::parse(server_uri)
            .map_err(|e| ClientError::with_cause(ErrorKind::InvalidOptions, e))?;
        let client_id = if client_id.is_empty() {
            generate_client_id()
        } else {
            client_id.to_string()
        };

        persistence.open(&client_id, server_uri).await?;

        let core = Arc::new(ClientCore {
            client_id,
            primary,
            transport,
            persistence,
            state: SessionState::new(),
            engine: Engine::new(),
            dispatcher: Dispatcher::new(),
            buffer: OfflineBuffer::new(BufferOptions::default()),
            callback: RwLock::new(None),
            manual_acks: AtomicBool::new(false),
            options: RwLock::new(None),
            current_server: RwLock::new(None),
            connection: Mutex::new(None),
            reconnecting: AtomicBool::new(false),
        });

        // Resume any session the previous process left behind
        let buffered = core.engine.restore(&core.persistence).await?;
        core.buffer.restore(buffered);

        Ok(Self { core })
    }

    /// Connect to the server. Returns once the handshake completed; the
    /// token carries the session-present flag.
    pub async fn connect(&self, options: ConnectOptions) -> Result<Token, ClientError> {
        ClientCore::do_connect(&self.core, options).await
    }

    /// Reconnect using the options of the previous connect
    pub async fn reconnect(&self) -> Result<Token, ClientError> {
        let options = self.core.options.read().clone().ok_or_else(|| {
            ClientError::with_detail(ErrorKind::InvalidOptions, "reconnect requires a prior connect")
        })?;
        ClientCore::do_connect(&self.core, options).await
    }

    /// Publish a message. While not connected, QoS-eligible publishes go to
    /// the offline buffer if it is enabled.
    pub async fn publish(&self, message: Message) -> Result<Token, ClientError> {
        validate_topic_name(message.topic())
            .map_err(|e| ClientError::with_detail(ErrorKind::InvalidTopic, e))?;

        let token = Token::publish(message.clone());
        match self.core.state.current() {
            ConnectionState::Connected => match message.qos() {
                QoS::AtMostOnce => {
                    self.core.engine.post_publish_qos0(message, token.clone());
                    Ok(token)
                }
                _ => {
                    match self
                        .core
                        .engine
                        .post_publish(&self.core.persistence, message, token.clone())
                        .await
                    {
                        Ok(_) => Ok(token),
                        Err(error) => {
                            token.fail(error.clone());
                            Err(error)
                        }
                    }
                }
            },
            ConnectionState::Closed => Err(ClientError::new(ErrorKind::ClientClosed)),
            _ => {
                if self.core.buffer.is_enabled() {
                    self.core
                        .buffer
                        .enqueue(&self.core.persistence, message, token.clone())
                        .await?;
                    Ok(token)
                } else {
                    Err(ClientError::new(ErrorKind::ClientNotConnected))
                }
            }
        }
    }

    /// Subscribe to a single filter
    pub async fn subscribe(&self, filter: &str, qos: QoS) -> Result<Token, ClientError> {
        self.subscribe_many_with(&[(filter, qos)], vec![None]).await
    }

    /// Subscribe to a single filter with a dedicated message handler
    pub async fn subscribe_with(
        &self,
        filter: &str,
        qos: QoS,
        handler: MessageHandler,
    ) -> Result<Token, ClientError> {
        self.subscribe_many_with(&[(filter, qos)], vec![Some(handler)])
            .await
    }

    /// Subscribe to several filters in one SUBSCRIBE packet
    pub async fn subscribe_many(&self, filters: &[(&str, QoS)]) -> Result<Token, ClientError> {
        self.subscribe_many_with(filters, vec![None; filters.len()])
            .await
    }

    /// Subscribe to several filters, each optionally with its own handler.
    /// The dispatch table is updated before the packet is sent; on failure
    /// the handlers are dropped again (previously registered handlers for
    /// the same filters are not restored).
    pub async fn subscribe_many_with(
        &self,
        filters: &[(&str, QoS)],
        handlers: Vec<Option<MessageHandler>>,
    ) -> Result<Token, ClientError> {
        if filters.is_empty() {
            return Err(ClientError::with_detail(
                ErrorKind::InvalidOptions,
                "subscribe requires at least one filter",
            ));
        }
        if handlers.len() != filters.len() {
            return Err(ClientError::with_detail(
                ErrorKind::InvalidOptions,
                "one handler slot per filter required",
            ));
        }
        for (filter, _) in filters {
            validate_topic_filter(filter)
                .map_err(|e| ClientError::with_detail(ErrorKind::InvalidTopic, e))?;
        }
        self.require_connected()?;

        let names: Vec<String> = filters.iter().map(|(f, _)| f.to_string()).collect();
        for ((filter, qos), handler) in filters.iter().zip(handlers) {
            self.core.dispatcher.insert(filter, *qos, handler);
        }

        let token = Token::with_topics(OperationKind::Subscribe, names.clone());
        let subscriptions = filters
            .iter()
            .map(|(filter, qos)| Subscription {
                filter: filter.to_string(),
                qos: *qos,
            })
            .collect();

        match self.core.engine.post_subscribe(subscriptions, token.clone()) {
            Ok(_) => Ok(token),
            Err(error) => {
                self.core.dispatcher.remove_handlers(&names);
                token.fail(error.clone());
                Err(error)
            }
        }
    }

    /// Unsubscribe from a single filter
    pub async fn unsubscribe(&self, filter: &str) -> Result<Token, ClientError> {
        self.unsubscribe_many(&[filter]).await
    }

    /// Unsubscribe from several filters. Handlers are removed immediately,
    /// before the UNSUBSCRIBE is sent.
    pub async fn unsubscribe_many(&self, filters: &[&str]) -> Result<Token, ClientError> {
        if filters.is_empty() {
            return Err(ClientError::with_detail(
                ErrorKind::InvalidOptions,
                "unsubscribe requires at least one filter",
            ));
        }
        for filter in filters {
            validate_topic_filter(filter)
                .map_err(|e| ClientError::with_detail(ErrorKind::InvalidTopic, e))?;
        }
        self.require_connected()?;

        for filter in filters {
            self.core.dispatcher.remove(filter);
        }

        let names: Vec<String> = filters.iter().map(|f| f.to_string()).collect();
        let token = Token::with_topics(OperationKind::Unsubscribe, names.clone());
        match self.core.engine.post_unsubscribe(names, token.clone()) {
            Ok(_) => Ok(token),
            Err(error) => {
                token.fail(error.clone());
                Err(error)
            }
        }
    }

    /// Disconnect gracefully: stop accepting publishes, allow up to
    /// `quiesce` for in-flight work to finish, then send DISCONNECT
    pub async fn disconnect(&self, quiesce: Duration) -> Result<Token, ClientError> {
        self.disconnect_with(quiesce, Duration::from_secs(10), true)
            .await
    }

    /// Disconnect with a separate cap on the DISCONNECT write, optionally
    /// skipping the DISCONNECT packet entirely
    pub async fn disconnect_forcibly(
        &self,
        quiesce: Duration,
        disconnect_timeout: Duration,
        send_disconnect_packet: bool,
    ) -> Result<Token, ClientError> {
        self.disconnect_with(quiesce, disconnect_timeout, send_disconnect_packet)
            .await
    }

    async fn disconnect_with(
        &self,
        quiesce: Duration,
        disconnect_timeout: Duration,
        send_disconnect_packet: bool,
    ) -> Result<Token, ClientError> {
        self.core.state.begin_disconnect()?;
        info!("Disconnecting");

        if !quiesce.is_zero() && !self.core.engine.wait_quiescent(quiesce).await {
            debug!("Quiesce period elapsed with work still in flight");
        }

        let token = Token::new(OperationKind::Disconnect);
        if send_disconnect_packet {
            self.core.engine.post_disconnect(token.clone());
            if token.wait_timeout(disconnect_timeout).await.is_err() {
                debug!("DISCONNECT was not written within {:?}", disconnect_timeout);
            }
        }

        let connection = self.core.connection.lock().take();
        if let Some(connection) = connection {
            connection.stop().await;
        }
        self.core.state.transition_disconnected();
        token.complete();
        Ok(token)
    }

    /// Release the client. Legal only while disconnected unless `force`.
    pub async fn close(&self, force: bool) -> Result<(), ClientError> {
        if force {
            let connection = self.core.connection.lock().take();
            if let Some(connection) = connection {
                connection.stop().await;
            }
            let error = ClientError::new(ErrorKind::ClientClosed);
            for token in self.core.engine.on_connection_lost() {
                token.fail(error.clone());
            }
            self.core.buffer.fail_all(&error);
        }
        self.core.state.close(force)?;
        self.core.persistence.close().await?;
        Ok(())
    }

    /// Register the global event handler
    pub fn set_event_handler(&self, handler: Arc<dyn EventHandler>) {
        *self.core.callback.write() = Some(handler);
    }

    /// Configure offline buffering ahead of the first connect. A later
    /// connect replaces these with the buffer options it carries.
    pub fn set_buffer_options(&self, options: BufferOptions) {
        self.core.buffer.set_options(options);
    }

    /// Defer PUBACK/PUBCOMP for inbound QoS 1/2 messages until the
    /// application calls [`message_arrived_complete`](Self::message_arrived_complete)
    pub fn set_manual_acks(&self, manual: bool) {
        self.core.manual_acks.store(manual, Ordering::Release);
    }

    /// Complete an inbound delivery in manual-ack mode
    pub async fn message_arrived_complete(&self, id: u16, qos: QoS) -> Result<(), ClientError> {
        if !self.core.state.is_connected() {
            return Err(ClientError::new(ErrorKind::ClientNotConnected));
        }
        self.core
            .engine
            .manual_complete(&self.core.persistence, id, qos)
            .await
    }

    /// Host-driven keepalive scheduling: evaluate the ping schedule once.
    /// Sends PINGREQ or declares the connection lost as appropriate.
    pub fn check_ping(&self) -> Result<(), ClientError> {
        let connection = self.core.connection.lock();
        match connection.as_ref() {
            Some(connection) => match connection.keepalive.check(tokio::time::Instant::now()) {
                PingAction::SendPing => {
                    self.core.engine.enqueue_packet(Packet::PingReq);
                    Ok(())
                }
                PingAction::Timeout => {
                    let error = ClientError::with_detail(
                        ErrorKind::ClientTimeout,
                        "no PINGRESP within the keep alive interval",
                    );
                    connection.signal.report(error.clone());
                    Err(error)
                }
                PingAction::None => Ok(()),
            },
            None => Err(ClientError::new(ErrorKind::ClientNotConnected)),
        }
    }

    pub fn client_id(&self) -> &str {
        &self.core.client_id
    }

    /// URI of the endpoint that accepted the most recent connect
    pub fn current_server_uri(&self) -> Option<String> {
        self.core
            .current_server
            .read()
            .as_ref()
            .map(|e| e.to_string())
    }

    pub fn is_connected(&self) -> bool {
        self.core.state.is_connected()
    }

    pub fn state(&self) -> ConnectionState {
        self.core.state.current()
    }

    /// Number of publishes waiting in the offline buffer
    pub fn buffered_message_count(&self) -> usize {
        self.core.buffer.len()
    }

    fn require_connected(&self) -> Result<(), ClientError> {
        match self.core.state.current() {
            ConnectionState::Connected => Ok(()),
            ConnectionState::Closed => Err(ClientError::new(ErrorKind::ClientClosed)),
            _ => Err(ClientError::new(ErrorKind::ClientNotConnected)),
        }
    }
}

fn generate_client_id() -> String {
    static COUNTER: AtomicU32 = AtomicU32::new(0);
    let host = hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "unknown".to_string());
    format!(
        "vibemq-{}-{}-{}",
        host,
        std::process::id(),
        COUNTER.fetch_add(1, Ordering::SeqCst)
    )
}
