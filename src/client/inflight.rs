//! In-flight message engine
//!
//! Owns everything between the user API and the wire: message-id allocation,
//! the outbound/inbound pending tables, the send queue, the in-flight window
//! and the persist-before-write choreography. The sender loop drains this
//! engine; the receiver loop drives acks back into it.
//!
//! Lock discipline: the single engine mutex guards table operations only and
//! is never held across I/O or persistence calls.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use ahash::AHashMap;
use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use tokio::sync::Notify;
use tracing::{debug, trace, warn};

use crate::codec::{Decoder, Encoder};
use crate::error::{ClientError, ErrorKind};
use crate::message::Message;
use crate::persistence::{
    received_key, send_confirmed_key, send_key, send_rel_key, ClientPersistence, PersistedKey,
};
use crate::protocol::{
    EncodeError, Packet, PubComp, PubRec, PubRel, Publish, QoS, Subscribe, SubscribeReturnCode,
    Subscription, Unsubscribe,
};
use crate::token::Token;

/// Encode a packet into its wire bytes
pub(crate) fn encode_packet(packet: &Packet) -> Result<Bytes, EncodeError> {
    let mut buf = BytesMut::new();
    Encoder::new().encode(packet, &mut buf)?;
    Ok(buf.freeze())
}

/// Bitmap allocator over the message identifier space [1, 65535]
pub(crate) struct IdAllocator {
    bitmap: Vec<u64>,
    cursor: u16,
    in_use: usize,
}

impl IdAllocator {
    const WORDS: usize = 1024; // 65536 bits

    pub fn new() -> Self {
        Self {
            bitmap: vec![0u64; Self::WORDS],
            cursor: 0,
            in_use: 0,
        }
    }

    fn is_set(&self, id: u16) -> bool {
        self.bitmap[(id as usize) / 64] & (1u64 << (id as usize % 64)) != 0
    }

    fn set(&mut self, id: u16) {
        self.bitmap[(id as usize) / 64] |= 1u64 << (id as usize % 64);
    }

    fn clear(&mut self, id: u16) {
        self.bitmap[(id as usize) / 64] &= !(1u64 << (id as usize % 64));
    }

    /// Allocate the next free identifier, scanning from the cursor and
    /// wrapping once. Returns None when all 65535 identifiers are in flight.
    pub fn next(&mut self) -> Option<u16> {
        if self.in_use >= 65535 {
            return None;
        }
        let mut candidate = self.cursor;
        loop {
            candidate = candidate.wrapping_add(1);
            if candidate == 0 {
                candidate = 1;
            }
            if !self.is_set(candidate) {
                self.set(candidate);
                self.in_use += 1;
                self.cursor = candidate;
                return Some(candidate);
            }
            if candidate == self.cursor {
                // Wrapped all the way around
                return None;
            }
        }
    }

    /// Mark an identifier as in use (session restore)
    pub fn reserve(&mut self, id: u16) {
        if id != 0 && !self.is_set(id) {
            self.set(id);
            self.in_use += 1;
        }
    }

    pub fn release(&mut self, id: u16) {
        if id != 0 && self.is_set(id) {
            self.clear(id);
            self.in_use -= 1;
        }
    }

    pub fn reset(&mut self) {
        self.bitmap.iter_mut().for_each(|w| *w = 0);
        self.cursor = 0;
        self.in_use = 0;
    }

    pub fn in_use(&self) -> usize {
        self.in_use
    }
}

/// Delivery phase of an outbound QoS 1/2 publish
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum OutboundPhase {
    /// Persisted and queued, not yet written
    Queued,
    /// Written, awaiting PUBACK (QoS 1) or PUBREC (QoS 2)
    Sent,
    /// PUBREC received, PUBREL persisted, awaiting PUBCOMP
    PubRecReceived,
}

struct OutboundRecord {
    message: Message,
    token: Token,
    phase: OutboundPhase,
    /// Encoded PUBLISH bytes, reused when re-keying the persisted record
    wire: Bytes,
}

struct InboundRecord {
    /// PUBREL has arrived from the server
    pubrel_received: bool,
    /// Application side is done (always true unless manual acks are on)
    completed: bool,
}

enum ControlKind {
    Subscribe(Vec<Subscription>),
    Unsubscribe(Vec<String>),
}

struct ControlRecord {
    token: Token,
    kind: ControlKind,
}

/// Queued user traffic, drained in FIFO order by the sender
enum Outgoing {
    PublishQos0 { publish: Publish, token: Token },
    Publish { id: u16 },
    Subscribe { id: u16 },
    Unsubscribe { id: u16 },
    Disconnect { token: Token },
}

/// What the sender loop should write next
pub(crate) enum SendItem {
    /// Ack, ping or replayed packet; no completion bookkeeping
    Packet(Packet),
    /// QoS 0 publish; complete the token after the write
    PublishQos0 { publish: Publish, token: Token },
    /// QoS 1/2 publish; mark the record SENT after the write
    Publish { id: u16, publish: Publish },
    /// DISCONNECT; complete the token after the write
    Disconnect { token: Token },
}

struct EngineInner {
    ids: IdAllocator,
    outbound: AHashMap<u16, OutboundRecord>,
    control: AHashMap<u16, ControlRecord>,
    inbound: AHashMap<u16, InboundRecord>,
    /// FIFO of user traffic
    queue: VecDeque<Outgoing>,
    /// Priority lane: acks, PINGREQ and reconnect replays bypass the FIFO
    acks: VecDeque<Packet>,
    /// Outbound publishes in a non-terminal ack phase
    window: usize,
    max_inflight: usize,
}

/// The in-flight engine shared by the user API, sender and receiver
pub(crate) struct Engine {
    inner: Mutex<EngineInner>,
    /// Wakes the sender when either queue gains an entry or the window opens
    wake: Notify,
    /// Signalled whenever the outbound tables drain
    idle: Notify,
}

/// Outcome of an inbound PUBLISH
pub(crate) enum InboundAction {
    /// Hand to the dispatcher; `ack` is written after dispatch completes
    Dispatch {
        message: Message,
        ack: Option<Packet>,
    },
    /// Duplicate or otherwise already handled
    None,
}

impl Engine {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(EngineInner {
                ids: IdAllocator::new(),
                outbound: AHashMap::new(),
                control: AHashMap::new(),
                inbound: AHashMap::new(),
                queue: VecDeque::new(),
                acks: VecDeque::new(),
                window: 0,
                max_inflight: 10,
            }),
            wake: Notify::new(),
            idle: Notify::new(),
        }
    }

    pub fn set_max_inflight(&self, max_inflight: usize) {
        self.inner.lock().max_inflight = max_inflight;
        self.wake.notify_one();
    }

    /// Number of outbound publishes not yet terminally acked
    pub fn outstanding(&self) -> usize {
        self.inner.lock().outbound.len()
    }

    // ========================================================================
    // Send paths
    // ========================================================================

    /// Queue a QoS 0 publish; its token completes once written
    pub fn post_publish_qos0(&self, message: Message, token: Token) {
        let publish = message.to_publish(None, false);
        self.inner
            .lock()
            .queue
            .push_back(Outgoing::PublishQos0 { publish, token });
        self.wake.notify_one();
    }

    /// Queue a QoS 1/2 publish: allocate an id, persist the wire bytes, then
    /// enqueue. The persisted record exists before the packet can possibly
    /// reach the wire.
    pub async fn post_publish(
        &self,
        persistence: &Arc<dyn ClientPersistence>,
        message: Message,
        token: Token,
    ) -> Result<u16, ClientError> {
        let (id, wire) = {
            let mut inner = self.inner.lock();
            let id = inner
                .ids
                .next()
                .ok_or_else(|| ClientError::new(ErrorKind::NoMessageIdsAvailable))?;
            let wire = match encode_packet(&Packet::Publish(message.to_publish(Some(id), false))) {
                Ok(wire) => wire,
                Err(e) => {
                    inner.ids.release(id);
                    return Err(e.into());
                }
            };
            inner.outbound.insert(
                id,
                OutboundRecord {
                    message: message.clone(),
                    token: token.clone(),
                    phase: OutboundPhase::Queued,
                    wire: wire.clone(),
                },
            );
            (id, wire)
        };

        if let Err(e) = persistence.put(&send_key(id), wire).await {
            let mut inner = self.inner.lock();
            inner.outbound.remove(&id);
            inner.ids.release(id);
            drop(inner);
            let error = ClientError::with_cause(ErrorKind::PersistenceFailure, e);
            token.fail(error.clone());
            return Err(error);
        }

        self.inner.lock().queue.push_back(Outgoing::Publish { id });
        self.wake.notify_one();
        trace!("Queued publish, id={}", id);
        Ok(id)
    }

    pub fn post_subscribe(
        &self,
        subscriptions: Vec<Subscription>,
        token: Token,
    ) -> Result<u16, ClientError> {
        let mut inner = self.inner.lock();
        let id = inner
            .ids
            .next()
            .ok_or_else(|| ClientError::new(ErrorKind::NoMessageIdsAvailable))?;
        inner.control.insert(
            id,
            ControlRecord {
                token,
                kind: ControlKind::Subscribe(subscriptions),
            },
        );
        inner.queue.push_back(Outgoing::Subscribe { id });
        drop(inner);
        self.wake.notify_one();
        Ok(id)
    }

    pub fn post_unsubscribe(
        &self,
        filters: Vec<String>,
        token: Token,
    ) -> Result<u16, ClientError> {
        let mut inner = self.inner.lock();
        let id = inner
            .ids
            .next()
            .ok_or_else(|| ClientError::new(ErrorKind::NoMessageIdsAvailable))?;
        inner.control.insert(
            id,
            ControlRecord {
                token,
                kind: ControlKind::Unsubscribe(filters),
            },
        );
        inner.queue.push_back(Outgoing::Unsubscribe { id });
        drop(inner);
        self.wake.notify_one();
        Ok(id)
    }

    pub fn post_disconnect(&self, token: Token) {
        self.inner
            .lock()
            .queue
            .push_back(Outgoing::Disconnect { token });
        self.wake.notify_one();
    }

    /// Push an ack/ping/replay packet onto the priority lane
    pub fn enqueue_packet(&self, packet: Packet) {
        self.inner.lock().acks.push_back(packet);
        self.wake.notify_one();
    }

    // ========================================================================
    // Sender interface
    // ========================================================================

    /// Wait for and take the next packet to write.
    ///
    /// Acks bypass the FIFO. A QoS 1/2 publish at the head of the FIFO is
    /// held back while `max_inflight` publishes are already in non-terminal
    /// phases; everything queued behind it waits in order.
    pub async fn dequeue(&self) -> SendItem {
        loop {
            let notified = self.wake.notified();
            if let Some(item) = self.try_dequeue() {
                return item;
            }
            notified.await;
        }
    }

    fn try_dequeue(&self) -> Option<SendItem> {
        let mut inner = self.inner.lock();

        if let Some(packet) = inner.acks.pop_front() {
            return Some(SendItem::Packet(packet));
        }

        loop {
            match inner.queue.front() {
                Some(Outgoing::Publish { .. }) if inner.window >= inner.max_inflight => {
                    return None;
                }
                Some(_) => {}
                None => return None,
            }

            match inner.queue.pop_front()? {
                Outgoing::PublishQos0 { publish, token } => {
                    return Some(SendItem::PublishQos0 { publish, token });
                }
                Outgoing::Publish { id } => {
                    match inner.outbound.get(&id) {
                        Some(record) => {
                            let dup = record.phase != OutboundPhase::Queued;
                            let publish = record.message.to_publish(Some(id), dup);
                            inner.window += 1;
                            return Some(SendItem::Publish { id, publish });
                        }
                        // Record already completed or discarded; skip
                        None => continue,
                    }
                }
                Outgoing::Subscribe { id } => {
                    if let Some(ControlRecord {
                        kind: ControlKind::Subscribe(subs),
                        ..
                    }) = inner.control.get(&id)
                    {
                        return Some(SendItem::Packet(Packet::Subscribe(Subscribe {
                            packet_id: id,
                            subscriptions: subs.clone(),
                        })));
                    }
                    continue;
                }
                Outgoing::Unsubscribe { id } => {
                    if let Some(ControlRecord {
                        kind: ControlKind::Unsubscribe(filters),
                        ..
                    }) = inner.control.get(&id)
                    {
                        return Some(SendItem::Packet(Packet::Unsubscribe(Unsubscribe {
                            packet_id: id,
                            filters: filters.clone(),
                        })));
                    }
                    continue;
                }
                Outgoing::Disconnect { token } => {
                    return Some(SendItem::Disconnect { token });
                }
            }
        }
    }

    /// Record a successful write of a QoS 1/2 publish
    pub fn mark_sent(&self, id: u16) {
        let mut inner = self.inner.lock();
        if let Some(record) = inner.outbound.get_mut(&id) {
            if record.phase == OutboundPhase::Queued {
                record.phase = OutboundPhase::Sent;
            }
        }
    }

    // ========================================================================
    // Outbound ack flow
    // ========================================================================

    /// PUBACK: terminal ack for a QoS 1 publish
    pub async fn handle_puback(
        &self,
        persistence: &Arc<dyn ClientPersistence>,
        id: u16,
    ) -> Option<Token> {
        let token = {
            let mut inner = self.inner.lock();
            match inner.outbound.remove(&id) {
                Some(record) => {
                    inner.window = inner.window.saturating_sub(1);
                    inner.ids.release(id);
                    Some(record.token)
                }
                None => None,
            }
        };

        let token = match token {
            Some(token) => token,
            None => {
                warn!("PUBACK for unknown id {}", id);
                return None;
            }
        };

        if let Err(e) = persistence.remove(&send_key(id)).await {
            warn!("Failed to remove persisted record {}: {}", send_key(id), e);
        }

        self.wake.notify_one();
        self.notify_if_idle();
        Some(token)
    }

    /// PUBREC: first half of the QoS 2 outbound cycle. Re-keys the persisted
    /// publish from `s-` to `sc-`, persists the PUBREL as `sb-` and queues it.
    pub async fn handle_pubrec(
        &self,
        persistence: &Arc<dyn ClientPersistence>,
        id: u16,
    ) -> Result<(), ClientError> {
        let wire = {
            let mut inner = self.inner.lock();
            match inner.outbound.get_mut(&id) {
                Some(record) if record.phase == OutboundPhase::PubRecReceived => None,
                Some(record) => {
                    record.phase = OutboundPhase::PubRecReceived;
                    Some(record.wire.clone())
                }
                None => {
                    warn!("PUBREC for unknown id {}", id);
                    return Ok(());
                }
            }
        };

        if let Some(wire) = wire {
            let rel = encode_packet(&Packet::PubRel(PubRel::new(id)))?;
            persistence.put(&send_confirmed_key(id), wire).await?;
            persistence.remove(&send_key(id)).await?;
            persistence.put(&send_rel_key(id), rel).await?;
        }

        // Duplicate PUBREC also re-answers with PUBREL
        self.enqueue_packet(Packet::PubRel(PubRel::new(id)));
        Ok(())
    }

    /// PUBCOMP: terminal ack for a QoS 2 publish
    pub async fn handle_pubcomp(
        &self,
        persistence: &Arc<dyn ClientPersistence>,
        id: u16,
    ) -> Option<Token> {
        let token = {
            let mut inner = self.inner.lock();
            match inner.outbound.remove(&id) {
                Some(record) => {
                    inner.window = inner.window.saturating_sub(1);
                    inner.ids.release(id);
                    Some(record.token)
                }
                None => None,
            }
        };

        let token = match token {
            Some(token) => token,
            None => {
                warn!("PUBCOMP for unknown id {}", id);
                return None;
            }
        };

        for key in [send_confirmed_key(id), send_rel_key(id)] {
            if let Err(e) = persistence.remove(&key).await {
                warn!("Failed to remove persisted record {}: {}", key, e);
            }
        }

        self.wake.notify_one();
        self.notify_if_idle();
        Some(token)
    }

    /// SUBACK: returns the token, requested filters and granted codes so the
    /// caller can complete the token and roll the dispatch table back on
    /// failure
    pub fn handle_suback(
        &self,
        id: u16,
        codes: Vec<SubscribeReturnCode>,
    ) -> Option<(Token, Vec<String>, Vec<SubscribeReturnCode>)> {
        let mut inner = self.inner.lock();
        match inner.control.remove(&id) {
            Some(ControlRecord {
                token,
                kind: ControlKind::Subscribe(subs),
            }) => {
                inner.ids.release(id);
                drop(inner);
                self.notify_if_idle();
                let filters = subs.into_iter().map(|s| s.filter).collect();
                Some((token, filters, codes))
            }
            Some(record) => {
                // UNSUBACK/SUBACK mismatch; put it back and complain
                inner.control.insert(id, record);
                warn!("SUBACK for non-subscribe id {}", id);
                None
            }
            None => {
                warn!("SUBACK for unknown id {}", id);
                None
            }
        }
    }

    /// UNSUBACK: returns the token and the filters that were removed
    pub fn handle_unsuback(&self, id: u16) -> Option<(Token, Vec<String>)> {
        let mut inner = self.inner.lock();
        match inner.control.remove(&id) {
            Some(ControlRecord {
                token,
                kind: ControlKind::Unsubscribe(filters),
            }) => {
                inner.ids.release(id);
                drop(inner);
                self.notify_if_idle();
                Some((token, filters))
            }
            Some(record) => {
                inner.control.insert(id, record);
                warn!("UNSUBACK for non-unsubscribe id {}", id);
                None
            }
            None => {
                warn!("UNSUBACK for unknown id {}", id);
                None
            }
        }
    }

    // ========================================================================
    // Inbound flow
    // ========================================================================

    /// Inbound PUBLISH. QoS 2 messages are persisted and recorded before
    /// PUBREC goes out so a duplicate is never dispatched twice.
    pub async fn handle_inbound_publish(
        &self,
        persistence: &Arc<dyn ClientPersistence>,
        publish: Publish,
        manual_acks: bool,
    ) -> Result<InboundAction, ClientError> {
        let message = Message::from_publish(&publish);

        match publish.qos {
            QoS::AtMostOnce => Ok(InboundAction::Dispatch { message, ack: None }),
            QoS::AtLeastOnce => {
                let id = publish
                    .packet_id
                    .ok_or_else(|| ClientError::with_detail(ErrorKind::ProtocolError, "QoS 1 PUBLISH without id"))?;
                let ack = if manual_acks {
                    None
                } else {
                    Some(Packet::PubAck(crate::protocol::PubAck::new(id)))
                };
                Ok(InboundAction::Dispatch { message, ack })
            }
            QoS::ExactlyOnce => {
                let id = publish
                    .packet_id
                    .ok_or_else(|| ClientError::with_detail(ErrorKind::ProtocolError, "QoS 2 PUBLISH without id"))?;

                if self.inner.lock().inbound.contains_key(&id) {
                    // Duplicate delivery while the first is still pending;
                    // re-answer with PUBREC, never redispatch
                    debug!("Duplicate QoS 2 PUBLISH id={}, suppressing dispatch", id);
                    self.enqueue_packet(Packet::PubRec(PubRec::new(id)));
                    return Ok(InboundAction::None);
                }

                let wire = encode_packet(&Packet::Publish(Publish {
                    dup: false,
                    ..publish.clone()
                }))?;
                persistence.put(&received_key(id), wire).await?;

                self.inner.lock().inbound.insert(
                    id,
                    InboundRecord {
                        pubrel_received: false,
                        completed: !manual_acks,
                    },
                );
                self.enqueue_packet(Packet::PubRec(PubRec::new(id)));
                Ok(InboundAction::Dispatch { message, ack: None })
            }
        }
    }

    /// PUBREL: release an inbound QoS 2 message. With manual acks on, the
    /// PUBCOMP waits until the application completes the delivery.
    pub async fn handle_pubrel(
        &self,
        persistence: &Arc<dyn ClientPersistence>,
        id: u16,
    ) -> Result<(), ClientError> {
        let finish = {
            let mut inner = self.inner.lock();
            match inner.inbound.get_mut(&id) {
                // Retransmitted PUBREL after we already completed; answer again
                None => true,
                Some(record) => {
                    record.pubrel_received = true;
                    if record.completed {
                        inner.inbound.remove(&id);
                        true
                    } else {
                        false
                    }
                }
            }
        };

        if finish {
            if let Err(e) = persistence.remove(&received_key(id)).await {
                warn!("Failed to remove persisted record {}: {}", received_key(id), e);
            }
            self.enqueue_packet(Packet::PubComp(PubComp::new(id)));
        }
        Ok(())
    }

    /// Manual-ack completion: performs the ack step dispatch withheld
    pub async fn manual_complete(
        &self,
        persistence: &Arc<dyn ClientPersistence>,
        id: u16,
        qos: QoS,
    ) -> Result<(), ClientError> {
        match qos {
            QoS::AtMostOnce => Ok(()),
            QoS::AtLeastOnce => {
                self.enqueue_packet(Packet::PubAck(crate::protocol::PubAck::new(id)));
                Ok(())
            }
            QoS::ExactlyOnce => {
                let finish = {
                    let mut inner = self.inner.lock();
                    match inner.inbound.get_mut(&id) {
                        Some(record) => {
                            record.completed = true;
                            if record.pubrel_received {
                                inner.inbound.remove(&id);
                                true
                            } else {
                                false
                            }
                        }
                        None => false,
                    }
                };
                if finish {
                    if let Err(e) = persistence.remove(&received_key(id)).await {
                        warn!(
                            "Failed to remove persisted record {}: {}",
                            received_key(id),
                            e
                        );
                    }
                    self.enqueue_packet(Packet::PubComp(PubComp::new(id)));
                }
                Ok(())
            }
        }
    }

    // ========================================================================
    // Connection lifecycle
    // ========================================================================

    /// Tear down for a lost connection: queued control operations fail, the
    /// pending publish tables, allocator state and persisted records are all
    /// preserved for replay. Returns the tokens to fail.
    pub fn on_connection_lost(&self) -> Vec<Token> {
        let mut inner = self.inner.lock();
        let mut failed = Vec::new();

        inner.acks.clear();
        while let Some(entry) = inner.queue.pop_front() {
            match entry {
                Outgoing::PublishQos0 { token, .. } => failed.push(token),
                Outgoing::Disconnect { token } => failed.push(token),
                // Persisted; replayed on reconnect
                Outgoing::Publish { .. } => {}
                Outgoing::Subscribe { .. } | Outgoing::Unsubscribe { .. } => {}
            }
        }

        let control_ids: Vec<u16> = inner.control.keys().copied().collect();
        for id in control_ids {
            if let Some(record) = inner.control.remove(&id) {
                inner.ids.release(id);
                failed.push(record.token);
            }
        }

        inner.window = 0;
        debug!(
            "Connection lost: {} publishes held for replay, {} operations failed",
            inner.outbound.len(),
            failed.len()
        );
        failed
    }

    /// Queue the reconnect replays, PUBRELs first, then unacknowledged
    /// publishes with the duplicate flag set, both in id order. Uses the
    /// priority lane so replays precede any new user traffic.
    pub fn prepare_replay(&self) -> usize {
        let mut inner = self.inner.lock();

        let mut rel_ids = Vec::new();
        let mut pub_ids = Vec::new();
        for (&id, record) in &inner.outbound {
            match record.phase {
                OutboundPhase::PubRecReceived => rel_ids.push(id),
                OutboundPhase::Queued | OutboundPhase::Sent => pub_ids.push(id),
            }
        }
        rel_ids.sort_unstable();
        pub_ids.sort_unstable();

        for &id in &rel_ids {
            inner.acks.push_back(Packet::PubRel(PubRel::new(id)));
        }
        for &id in &pub_ids {
            if let Some(record) = inner.outbound.get_mut(&id) {
                record.phase = OutboundPhase::Sent;
            }
            let packet = inner
                .outbound
                .get(&id)
                .map(|r| Packet::Publish(r.message.to_publish(Some(id), true)));
            if let Some(packet) = packet {
                inner.acks.push_back(packet);
            }
        }

        // Every replayed publish is back in flight
        inner.window = inner.outbound.len();

        let count = rel_ids.len() + pub_ids.len();
        if count > 0 {
            debug!(
                "Replaying {} PUBREL and {} PUBLISH packets",
                rel_ids.len(),
                pub_ids.len()
            );
            drop(inner);
            self.wake.notify_one();
        }
        count
    }

    /// Load pending records persisted by a previous process into the tables.
    /// Returns the offline-buffered publishes in submission order.
    pub async fn restore(
        &self,
        persistence: &Arc<dyn ClientPersistence>,
    ) -> Result<Vec<(u64, Message)>, ClientError> {
        let keys = persistence.keys().await?;
        let mut buffered = Vec::new();

        for key in keys {
            let parsed = match PersistedKey::parse(&key) {
                Some(parsed) => parsed,
                None => {
                    warn!("Ignoring foreign persistence key {:?}", key);
                    continue;
                }
            };
            let bytes = match persistence.get(&key).await? {
                Some(bytes) => bytes,
                None => continue,
            };

            match parsed {
                PersistedKey::Send(id) => {
                    let message = decode_persisted_publish(&key, &bytes)?;
                    let token = Token::publish(message.clone());
                    let mut inner = self.inner.lock();
                    inner.ids.reserve(id);
                    inner.outbound.insert(
                        id,
                        OutboundRecord {
                            message,
                            token,
                            phase: OutboundPhase::Sent,
                            wire: bytes,
                        },
                    );
                }
                PersistedKey::SendConfirmed(id) => {
                    let message = decode_persisted_publish(&key, &bytes)?;
                    let token = Token::publish(message.clone());
                    let mut inner = self.inner.lock();
                    inner.ids.reserve(id);
                    inner.outbound.insert(
                        id,
                        OutboundRecord {
                            message,
                            token,
                            phase: OutboundPhase::PubRecReceived,
                            wire: bytes,
                        },
                    );
                }
                PersistedKey::SendRel(id) => {
                    // Implies the PUBREC was seen. Normally the sc- record
                    // carries the message; if only the sb- record survived,
                    // a placeholder suffices since this phase only ever
                    // retransmits the PUBREL.
                    let mut inner = self.inner.lock();
                    inner.ids.reserve(id);
                    inner.outbound.entry(id).or_insert_with(|| {
                        let message = Message::new("", Bytes::new(), QoS::ExactlyOnce);
                        OutboundRecord {
                            token: Token::publish(message.clone()),
                            message,
                            phase: OutboundPhase::PubRecReceived,
                            wire: Bytes::new(),
                        }
                    });
                    if let Some(record) = inner.outbound.get_mut(&id) {
                        record.phase = OutboundPhase::PubRecReceived;
                    }
                }
                PersistedKey::Received(id) => {
                    // Already dispatched by the previous process; only the
                    // PUBREL/PUBCOMP exchange remains
                    self.inner.lock().inbound.insert(
                        id,
                        InboundRecord {
                            pubrel_received: false,
                            completed: true,
                        },
                    );
                }
                PersistedKey::Buffered(n) => {
                    let message = decode_persisted_publish(&key, &bytes)?;
                    buffered.push((n, message));
                }
            }
        }

        buffered.sort_by_key(|(n, _)| *n);
        let restored = self.inner.lock().outbound.len();
        if restored > 0 || !buffered.is_empty() {
            debug!(
                "Restored {} in-flight and {} buffered messages",
                restored,
                buffered.len()
            );
        }
        Ok(buffered)
    }

    /// Discard the whole session (clean-session connect): clears the tables,
    /// the allocator and every persisted record. Returns tokens to fail.
    pub async fn reset_session(
        &self,
        persistence: &Arc<dyn ClientPersistence>,
    ) -> Result<Vec<Token>, ClientError> {
        let failed = {
            let mut inner = self.inner.lock();
            let mut failed: Vec<Token> =
                inner.outbound.drain().map(|(_, r)| r.token).collect();
            failed.extend(inner.control.drain().map(|(_, r)| r.token));
            inner.inbound.clear();
            inner.queue.retain(|entry| match entry {
                Outgoing::Publish { .. } => false,
                _ => true,
            });
            inner.ids.reset();
            inner.window = 0;
            failed
        };
        persistence.clear().await?;
        self.notify_if_idle();
        Ok(failed)
    }

    /// Wait until no outbound publish or control operation is pending, up to
    /// the given quiesce time. Returns true if fully drained.
    pub async fn wait_quiescent(&self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let notified = self.idle.notified();
            if self.is_quiescent() {
                return true;
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return self.is_quiescent();
            }
        }
    }

    fn is_quiescent(&self) -> bool {
        let inner = self.inner.lock();
        inner.outbound.is_empty() && inner.control.is_empty() && inner.queue.is_empty()
    }

    fn notify_if_idle(&self) {
        if self.is_quiescent() {
            self.idle.notify_waiters();
        }
    }
}

fn decode_persisted_publish(key: &str, bytes: &Bytes) -> Result<Message, ClientError> {
    let mut decoder = Decoder::new();
    match decoder.decode(bytes) {
        Ok(Some((Packet::Publish(publish), _))) => Ok(Message::from_publish(&publish)),
        Ok(_) | Err(_) => Err(ClientError::with_detail(
            ErrorKind::PersistenceFailure,
            format!("corrupt persisted record {:?}", key),
        )),
    }
}
