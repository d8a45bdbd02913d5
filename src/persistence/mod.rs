//! Persistence for in-flight session state.
//!
//! QoS 1/2 delivery survives process restarts by writing every in-flight
//! message to a key-value store before it goes on the wire. Records are raw
//! wire bytes keyed by direction and delivery phase:
//!
//! - `s-<id>`   outbound PUBLISH awaiting PUBACK (QoS 1) or PUBREC (QoS 2)
//! - `sc-<id>`  outbound PUBLISH with PUBREC received, awaiting PUBCOMP
//! - `sb-<id>`  outbound PUBREL to retransmit until PUBCOMP arrives
//! - `r-<id>`   inbound QoS 2 PUBLISH awaiting PUBREL
//! - `b-<n>`    offline-buffered publishes, in submission order

mod backend;
mod error;
mod fjall;
mod memory;

pub use backend::ClientPersistence;
pub use error::{PersistenceError, Result};
pub use fjall::FjallPersistence;
pub use memory::MemoryPersistence;

/// Key prefix for outbound publishes awaiting their first ack
pub const KEY_SEND: &str = "s-";
/// Key prefix for outbound publishes past PUBREC
pub const KEY_SEND_CONFIRMED: &str = "sc-";
/// Key prefix for persisted PUBREL packets
pub const KEY_SEND_REL: &str = "sb-";
/// Key prefix for inbound QoS 2 publishes awaiting PUBREL
pub const KEY_RECEIVED: &str = "r-";
/// Key prefix for offline-buffered publishes
pub const KEY_BUFFERED: &str = "b-";

/// A parsed persistence key
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PersistedKey {
    /// `s-<id>`
    Send(u16),
    /// `sc-<id>`
    SendConfirmed(u16),
    /// `sb-<id>`
    SendRel(u16),
    /// `r-<id>`
    Received(u16),
    /// `b-<n>`
    Buffered(u64),
}

impl PersistedKey {
    /// Parse a store key; returns None for keys this crate did not write
    pub fn parse(key: &str) -> Option<Self> {
        // sc-/sb- must be checked before the bare s- prefix
        if let Some(id) = key.strip_prefix(KEY_SEND_CONFIRMED) {
            return id.parse().ok().map(PersistedKey::SendConfirmed);
        }
        if let Some(id) = key.strip_prefix(KEY_SEND_REL) {
            return id.parse().ok().map(PersistedKey::SendRel);
        }
        if let Some(id) = key.strip_prefix(KEY_SEND) {
            return id.parse().ok().map(PersistedKey::Send);
        }
        if let Some(id) = key.strip_prefix(KEY_RECEIVED) {
            return id.parse().ok().map(PersistedKey::Received);
        }
        if let Some(n) = key.strip_prefix(KEY_BUFFERED) {
            return n.parse().ok().map(PersistedKey::Buffered);
        }
        None
    }
}

pub(crate) fn send_key(id: u16) -> String {
    format!("{}{}", KEY_SEND, id)
}

pub(crate) fn send_confirmed_key(id: u16) -> String {
    format!("{}{}", KEY_SEND_CONFIRMED, id)
}

pub(crate) fn send_rel_key(id: u16) -> String {
    format!("{}{}", KEY_SEND_REL, id)
}

pub(crate) fn received_key(id: u16) -> String {
    format!("{}{}", KEY_RECEIVED, id)
}

pub(crate) fn buffered_key(n: u64) -> String {
    format!("{}{}", KEY_BUFFERED, n)
}
