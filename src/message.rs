//! Application-facing message type

use bytes::Bytes;

use crate::protocol::{Publish, QoS};

/// An application message published to or received from the server
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    topic: String,
    payload: Bytes,
    qos: QoS,
    retained: bool,
    duplicate: bool,
}

impl Message {
    /// Create a message for publishing
    pub fn new(topic: impl Into<String>, payload: impl Into<Bytes>, qos: QoS) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
            qos,
            retained: false,
            duplicate: false,
        }
    }

    pub fn with_retained(mut self, retained: bool) -> Self {
        self.retained = retained;
        self
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn qos(&self) -> QoS {
        self.qos
    }

    pub fn retained(&self) -> bool {
        self.retained
    }

    /// True only on a retransmitted delivery
    pub fn duplicate(&self) -> bool {
        self.duplicate
    }

    /// Build the PUBLISH packet for this message
    pub(crate) fn to_publish(&self, packet_id: Option<u16>, dup: bool) -> Publish {
        Publish {
            dup,
            qos: self.qos,
            retain: self.retained,
            topic: self.topic.clone(),
            packet_id,
            payload: self.payload.clone(),
        }
    }

    /// Build a message from an inbound PUBLISH packet
    pub(crate) fn from_publish(publish: &Publish) -> Self {
        Self {
            topic: publish.topic.clone(),
            payload: publish.payload.clone(),
            qos: publish.qos,
            retained: publish.retain,
            duplicate: publish.dup,
        }
    }
}
