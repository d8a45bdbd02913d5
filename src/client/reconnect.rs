//! Automatic reconnect controller
//!
//! Spawned when an established connection is lost and automatic reconnect is
//! enabled. Sleeps, attempts a reconnect, and doubles the delay on failure up
//! to the configured cap. The delay is controller-local state, reset simply
//! by the controller ending on success and a future loss spawning a fresh
//! one. The controller holds only a weak handle to the client, so an
//! abandoned client shuts the cycle down.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::client::ClientCore;
use crate::error::ErrorKind;

/// Initial reconnect delay
pub(crate) const INITIAL_DELAY: Duration = Duration::from_millis(1000);

/// Narrow view of the client exposed to the reconnect task
pub(crate) struct ReconnectHandle {
    core: std::sync::Weak<ClientCore>,
}

impl ReconnectHandle {
    pub fn new(core: &Arc<ClientCore>) -> Self {
        Self {
            core: Arc::downgrade(core),
        }
    }

    /// One reconnect attempt. Err carries whether further attempts make sense.
    async fn attempt(&self) -> Result<(), AttemptOutcome> {
        let core = match self.core.upgrade() {
            Some(core) => core,
            None => return Err(AttemptOutcome::GiveUp),
        };
        match ClientCore::reconnect_attempt(&core).await {
            Ok(()) => Ok(()),
            Err(error) => match error.kind() {
                // Someone else connected, or the client is gone for good
                ErrorKind::ClientConnected
                | ErrorKind::ConnectInProgress
                | ErrorKind::ClientDisconnecting
                | ErrorKind::ClientClosed => Err(AttemptOutcome::GiveUp),
                _ => {
                    warn!("Reconnect attempt failed: {}", error);
                    Err(AttemptOutcome::Retry)
                }
            },
        }
    }

    fn max_delay(&self) -> Duration {
        self.core
            .upgrade()
            .map(|core| core.max_reconnect_delay())
            .unwrap_or(Duration::from_secs(128))
    }

    fn finished(&self) {
        if let Some(core) = self.core.upgrade() {
            core.reconnect_finished();
        }
    }
}

enum AttemptOutcome {
    Retry,
    GiveUp,
}

/// Run the backoff cycle until a reconnect succeeds or the client goes away
pub(crate) fn spawn(handle: ReconnectHandle) -> JoinHandle<()> {
    tokio::spawn(async move {
        let max_delay = handle.max_delay();
        let mut delay = INITIAL_DELAY;

        loop {
            debug!("Reconnecting in {:?}", delay);
            tokio::time::sleep(delay).await;

            match handle.attempt().await {
                Ok(()) => {
                    info!("Automatic reconnect succeeded");
                    break;
                }
                Err(AttemptOutcome::GiveUp) => {
                    debug!("Reconnect cycle abandoned");
                    break;
                }
                Err(AttemptOutcome::Retry) => {
                    delay = next_delay(delay, max_delay);
                }
            }
        }
        handle.finished();
    })
}

/// Exponential backoff: double up to the cap
pub(crate) fn next_delay(current: Duration, max: Duration) -> Duration {
    (current * 2).min(max)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delay_doubles_to_cap() {
        let max = Duration::from_secs(128);
        let mut delay = INITIAL_DELAY;
        let mut observed = vec![delay];
        for _ in 0..9 {
            delay = next_delay(delay, max);
            observed.push(delay);
        }
        let secs: Vec<u64> = observed.iter().map(|d| d.as_secs()).collect();
        assert_eq!(secs, vec![1, 2, 4, 8, 16, 32, 64, 128, 128, 128]);
    }

    #[test]
    fn test_delay_respects_small_cap() {
        let max = Duration::from_secs(5);
        assert_eq!(
            next_delay(Duration::from_secs(4), max),
            Duration::from_secs(5)
        );
        assert_eq!(next_delay(max, max), max);
    }
}
