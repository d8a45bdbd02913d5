//! Connection tasks
//!
//! While a session is up, four tasks share the connection: the sender drains
//! the engine and owns the write half, the receiver decodes frames off the
//! read half and drives the ack flow, the keepalive scheduler sends PINGREQ,
//! and the dispatch task runs application handlers so the receiver is never
//! blocked by user code.
//!
//! The first task to hit a wire error reports it to the shared lost signal;
//! the supervisor then cancels and joins the rest and runs the
//! connection-lost pathway exactly once.

use std::sync::Arc;

use bytes::{Buf, BytesMut};
use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use crate::client::inflight::{InboundAction, SendItem};
use crate::client::keepalive::{KeepAlive, PingAction};
use crate::client::ClientCore;
use crate::codec::{Decoder, Encoder, DEFAULT_MAX_PACKET_SIZE};
use crate::error::{ClientError, ErrorKind};
use crate::message::Message;
use crate::protocol::{Packet, SubscribeReturnCode};
use crate::token::Token;
use crate::transport::TransportStream;

/// First-wins connection-lost signal shared by the connection tasks
pub(crate) struct LostSignal {
    error: Mutex<Option<ClientError>>,
    notify: Notify,
}

impl LostSignal {
    pub fn new() -> Self {
        Self {
            error: Mutex::new(None),
            notify: Notify::new(),
        }
    }

    /// Record the error that killed the connection; later reports lose
    pub fn report(&self, error: ClientError) {
        let mut slot = self.error.lock();
        if slot.is_none() {
            *slot = Some(error);
            self.notify.notify_one();
        }
    }

    async fn wait(&self) -> ClientError {
        loop {
            let notified = self.notify.notified();
            if let Some(error) = self.error.lock().clone() {
                return error;
            }
            notified.await;
        }
    }
}

/// A message handed from the receiver to the dispatch task
struct DispatchItem {
    message: Message,
    /// Ack to queue after the handlers ran (QoS 1 auto-ack)
    ack: Option<Packet>,
}

/// Handle to the running connection tasks
pub(crate) struct ActiveConnection {
    pub keepalive: Arc<KeepAlive>,
    pub signal: Arc<LostSignal>,
    shutdown: Arc<Notify>,
    supervisor: JoinHandle<()>,
}

impl ActiveConnection {
    /// Tear everything down without running the connection-lost pathway
    /// (clean disconnect, forced close)
    pub async fn stop(self) {
        self.shutdown.notify_one();
        let _ = self.supervisor.await;
    }
}

/// Spawn the connection tasks over an established, CONNACK-accepted stream
pub(crate) fn start(
    core: Arc<ClientCore>,
    stream: TransportStream,
    keepalive: Arc<KeepAlive>,
) -> ActiveConnection {
    let signal = Arc::new(LostSignal::new());
    let shutdown = Arc::new(Notify::new());
    let (dispatch_tx, dispatch_rx) = mpsc::unbounded_channel();

    let TransportStream { reader, writer } = stream;

    let mut tasks: Vec<JoinHandle<()>> = Vec::with_capacity(4);
    tasks.push(tokio::spawn(sender_loop(
        core.clone(),
        writer,
        keepalive.clone(),
        signal.clone(),
    )));
    tasks.push(tokio::spawn(receiver_loop(
        core.clone(),
        reader,
        keepalive.clone(),
        dispatch_tx,
        signal.clone(),
    )));
    tasks.push(tokio::spawn(dispatch_loop(core.clone(), dispatch_rx)));
    if keepalive.enabled() {
        tasks.push(tokio::spawn(keepalive_loop(
            core.clone(),
            keepalive.clone(),
            signal.clone(),
        )));
    }

    let supervisor = tokio::spawn(supervise(core, tasks, signal.clone(), shutdown.clone()));

    ActiveConnection {
        keepalive,
        signal,
        shutdown,
        supervisor,
    }
}

async fn supervise(
    core: Arc<ClientCore>,
    tasks: Vec<JoinHandle<()>>,
    signal: Arc<LostSignal>,
    shutdown: Arc<Notify>,
) {
    tokio::select! {
        error = signal.wait() => {
            for task in &tasks {
                task.abort();
            }
            for task in tasks {
                let _ = task.await;
            }
            ClientCore::handle_connection_lost(core, error).await;
        }
        _ = shutdown.notified() => {
            for task in &tasks {
                task.abort();
            }
            for task in tasks {
                let _ = task.await;
            }
        }
    }
}

/// What the sender does after a successful write
enum PostWrite {
    Nothing,
    CompleteQos0(Token),
    MarkSent(u16),
    CompleteDisconnect(Token),
}

async fn sender_loop(
    core: Arc<ClientCore>,
    mut writer: Box<dyn tokio::io::AsyncWrite + Send + Unpin>,
    keepalive: Arc<KeepAlive>,
    signal: Arc<LostSignal>,
) {
    let encoder = Encoder::new();
    let mut buf = BytesMut::with_capacity(4096);

    loop {
        let item = core.engine.dequeue().await;
        let (packet, post) = match item {
            SendItem::Packet(packet) => (packet, PostWrite::Nothing),
            SendItem::PublishQos0 { publish, token } => {
                (Packet::Publish(publish), PostWrite::CompleteQos0(token))
            }
            SendItem::Publish { id, publish } => {
                (Packet::Publish(publish), PostWrite::MarkSent(id))
            }
            SendItem::Disconnect { token } => {
                (Packet::Disconnect, PostWrite::CompleteDisconnect(token))
            }
        };

        buf.clear();
        if let Err(e) = encoder.encode(&packet, &mut buf) {
            signal.report(e.into());
            return;
        }

        trace!("Writing packet type {}", packet.packet_type());
        if let Err(e) = writer.write_all(&buf).await {
            signal.report(ClientError::with_cause(ErrorKind::ConnectionLost, e));
            return;
        }
        if let Err(e) = writer.flush().await {
            signal.report(ClientError::with_cause(ErrorKind::ConnectionLost, e));
            return;
        }
        keepalive.touch();

        match post {
            PostWrite::Nothing => {}
            PostWrite::CompleteQos0(token) => {
                token.complete();
                core.notify_delivery(&token);
            }
            PostWrite::MarkSent(id) => core.engine.mark_sent(id),
            PostWrite::CompleteDisconnect(token) => token.complete(),
        }
    }
}

async fn receiver_loop(
    core: Arc<ClientCore>,
    mut reader: Box<dyn tokio::io::AsyncRead + Send + Unpin>,
    keepalive: Arc<KeepAlive>,
    dispatch_tx: mpsc::UnboundedSender<DispatchItem>,
    signal: Arc<LostSignal>,
) {
    let mut decoder = Decoder::new().with_max_packet_size(DEFAULT_MAX_PACKET_SIZE);
    let mut read_buf = BytesMut::with_capacity(8192);

    loop {
        loop {
            match decoder.decode(&read_buf) {
                Ok(Some((packet, consumed))) => {
                    read_buf.advance(consumed);
                    if let Err(error) =
                        handle_packet(&core, &keepalive, &dispatch_tx, packet).await
                    {
                        signal.report(error);
                        return;
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    signal.report(e.into());
                    return;
                }
            }
        }

        match reader.read_buf(&mut read_buf).await {
            Ok(0) => {
                signal.report(ClientError::with_detail(
                    ErrorKind::ConnectionLost,
                    "server closed the connection",
                ));
                return;
            }
            Ok(_) => {}
            Err(e) => {
                signal.report(ClientError::with_cause(ErrorKind::ConnectionLost, e));
                return;
            }
        }
    }
}

/// Dispatch one inbound packet into the engine. Inbound handling is strictly
/// sequential: the next frame is not decoded until this one is fully routed.
async fn handle_packet(
    core: &Arc<ClientCore>,
    keepalive: &Arc<KeepAlive>,
    dispatch_tx: &mpsc::UnboundedSender<DispatchItem>,
    packet: Packet,
) -> Result<(), ClientError> {
    match packet {
        Packet::Publish(publish) => {
            trace!(
                "Inbound PUBLISH topic={:?} qos={:?} id={:?}",
                publish.topic,
                publish.qos,
                publish.packet_id
            );
            let manual = core.manual_acks();
            match core
                .engine
                .handle_inbound_publish(&core.persistence, publish, manual)
                .await?
            {
                InboundAction::Dispatch { message, ack } => {
                    if dispatch_tx.send(DispatchItem { message, ack }).is_err() {
                        warn!("Dispatch task gone; dropping inbound message");
                    }
                }
                InboundAction::None => {}
            }
            Ok(())
        }
        Packet::PubAck(ack) => {
            if let Some(token) = core.engine.handle_puback(&core.persistence, ack.packet_id).await {
                token.complete();
                core.notify_delivery(&token);
            }
            Ok(())
        }
        Packet::PubRec(rec) => {
            core.engine
                .handle_pubrec(&core.persistence, rec.packet_id)
                .await
        }
        Packet::PubComp(comp) => {
            if let Some(token) = core
                .engine
                .handle_pubcomp(&core.persistence, comp.packet_id)
                .await
            {
                token.complete();
                core.notify_delivery(&token);
            }
            Ok(())
        }
        Packet::PubRel(rel) => {
            core.engine
                .handle_pubrel(&core.persistence, rel.packet_id)
                .await
        }
        Packet::SubAck(suback) => {
            if let Some((token, filters, codes)) = core
                .engine
                .handle_suback(suback.packet_id, suback.return_codes)
            {
                if codes.contains(&SubscribeReturnCode::Failure) {
                    // Fail open: the handlers for the requested filters are
                    // dropped, matching traffic falls to the global handler
                    core.dispatcher.remove_handlers(&filters);
                    token.fail(ClientError::with_detail(
                        ErrorKind::SubscribeFailed,
                        "server rejected one or more filters",
                    ));
                } else {
                    token.complete_subscribe(codes);
                }
            }
            Ok(())
        }
        Packet::UnsubAck(unsuback) => {
            if let Some((token, _filters)) = core.engine.handle_unsuback(unsuback.packet_id) {
                token.complete();
            }
            Ok(())
        }
        Packet::PingResp => {
            trace!("PINGRESP received");
            keepalive.pong();
            Ok(())
        }
        // The server never sends these in v3.1.1; receiving one is an
        // unrecoverable protocol violation
        Packet::Connect(_)
        | Packet::ConnAck(_)
        | Packet::Subscribe(_)
        | Packet::Unsubscribe(_)
        | Packet::PingReq
        | Packet::Disconnect => Err(ClientError::with_detail(
            ErrorKind::ProtocolError,
            format!("unexpected packet type {} from server", packet.packet_type()),
        )),
    }
}

async fn dispatch_loop(core: Arc<ClientCore>, mut rx: mpsc::UnboundedReceiver<DispatchItem>) {
    while let Some(item) = rx.recv().await {
        let handlers = core.dispatcher.handlers_for(item.message.topic());
        if handlers.is_empty() {
            if let Some(handler) = core.event_handler() {
                handler.message_arrived(&item.message);
            }
        } else {
            for handler in handlers {
                handler(item.message.clone());
            }
        }

        // The ack goes out only after the application saw the message
        if let Some(ack) = item.ack {
            core.engine.enqueue_packet(ack);
        }
    }
}

async fn keepalive_loop(core: Arc<ClientCore>, keepalive: Arc<KeepAlive>, signal: Arc<LostSignal>) {
    loop {
        match keepalive.check(tokio::time::Instant::now()) {
            PingAction::SendPing => {
                debug!("Sending PINGREQ");
                core.engine.enqueue_packet(Packet::PingReq);
            }
            PingAction::Timeout => {
                signal.report(ClientError::with_detail(
                    ErrorKind::ClientTimeout,
                    "no PINGRESP within the keep alive interval",
                ));
                return;
            }
            PingAction::None => {}
        }
        tokio::time::sleep_until(keepalive.next_deadline(tokio::time::Instant::now())).await;
    }
}
