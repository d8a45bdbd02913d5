//! Offline publish buffer
//!
//! Holds publishes submitted while the client is not connected. Entries keep
//! their tokens so delivery completion still reaches the original caller
//! after a reconnect. With `persist` enabled, entries are written to the
//! store under `b-<n>` keys and survive a restart.

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

use crate::client::inflight::encode_packet;
use crate::error::{ClientError, ErrorKind};
use crate::message::Message;
use crate::options::BufferOptions;
use crate::persistence::{buffered_key, ClientPersistence};
use crate::protocol::{Packet, QoS};
use crate::token::Token;

pub(crate) struct BufferedEntry {
    pub message: Message,
    pub token: Token,
    /// Persistence sequence number, when persisted
    pub key: Option<u64>,
}

struct BufferInner {
    options: BufferOptions,
    entries: VecDeque<BufferedEntry>,
    next_seq: u64,
}

/// FIFO buffer for publishes while disconnected
pub(crate) struct OfflineBuffer {
    inner: Mutex<BufferInner>,
}

impl OfflineBuffer {
    pub fn new(options: BufferOptions) -> Self {
        Self {
            inner: Mutex::new(BufferInner {
                options,
                entries: VecDeque::new(),
                next_seq: 0,
            }),
        }
    }

    pub fn set_options(&self, options: BufferOptions) {
        self.inner.lock().options = options;
    }

    pub fn is_enabled(&self) -> bool {
        self.inner.lock().options.enabled
    }

    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    /// Seed the buffer with entries restored from persistence
    pub fn restore(&self, entries: Vec<(u64, Message)>) {
        let mut inner = self.inner.lock();
        for (seq, message) in entries {
            inner.next_seq = inner.next_seq.max(seq + 1);
            let token = Token::publish(message.clone());
            inner.entries.push_back(BufferedEntry {
                message,
                token,
                key: Some(seq),
            });
        }
    }

    /// Append a publish. When full, either the oldest entry is evicted (its
    /// token failing with the buffer-full error) or the new publish is
    /// rejected, per configuration.
    pub async fn enqueue(
        &self,
        persistence: &Arc<dyn ClientPersistence>,
        message: Message,
        token: Token,
    ) -> Result<(), ClientError> {
        let (evicted, seq) = {
            let mut inner = self.inner.lock();
            if !inner.options.enabled {
                return Err(ClientError::new(ErrorKind::ClientNotConnected));
            }

            let mut evicted = None;
            if inner.entries.len() >= inner.options.size {
                if inner.options.delete_oldest {
                    evicted = inner.entries.pop_front();
                } else {
                    return Err(ClientError::new(ErrorKind::DisconnectedBufferFull));
                }
            }

            let seq = if inner.options.persist {
                let seq = inner.next_seq;
                inner.next_seq += 1;
                Some(seq)
            } else {
                None
            };
            inner.entries.push_back(BufferedEntry {
                message: message.clone(),
                token,
                key: seq,
            });
            (evicted, seq)
        };

        if let Some(evicted) = evicted {
            evicted
                .token
                .fail(ClientError::new(ErrorKind::DisconnectedBufferFull));
            if let Some(key) = evicted.key {
                let _ = persistence.remove(&buffered_key(key)).await;
            }
        }

        if let Some(seq) = seq {
            // QoS 1/2 publishes get their real identifier at drain time; the
            // persisted record carries a placeholder
            let packet_id = match message.qos() {
                QoS::AtMostOnce => None,
                _ => Some(1),
            };
            let wire = encode_packet(&Packet::Publish(message.to_publish(packet_id, false)))?;
            if let Err(e) = persistence.put(&buffered_key(seq), wire).await {
                // Keep the entry; it just won't survive a restart
                debug!("Failed to persist buffered publish: {}", e);
            }
        }

        debug!("Buffered publish to {:?} while offline", message.topic());
        Ok(())
    }

    /// Take every buffered entry in FIFO order for the reconnect drain
    pub fn drain(&self) -> Vec<BufferedEntry> {
        let mut inner = self.inner.lock();
        inner.entries.drain(..).collect()
    }

    /// Fail and drop everything (forced close)
    pub fn fail_all(&self, error: &ClientError) {
        for entry in self.drain() {
            entry.token.fail(error.clone());
        }
    }
}
