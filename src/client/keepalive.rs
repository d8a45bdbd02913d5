//! Keepalive controller
//!
//! Watches sender activity and schedules PINGREQ when the connection has
//! been idle for a full keep alive interval. A PINGRESP must arrive within
//! one further interval or the connection is declared lost. The controller
//! only decides; the keepalive task (or a host calling
//! [`AsyncClient::check_ping`](crate::AsyncClient::check_ping)) acts on the
//! decision.

use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;

/// What the keepalive scheduler should do right now
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PingAction {
    /// Nothing due yet
    None,
    /// The idle gap reached the interval; send PINGREQ
    SendPing,
    /// The response window elapsed without a PINGRESP
    Timeout,
}

struct KeepAliveState {
    last_activity: Instant,
    ping_outstanding: bool,
    response_deadline: Option<Instant>,
}

pub(crate) struct KeepAlive {
    interval: Duration,
    state: Mutex<KeepAliveState>,
}

impl KeepAlive {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            state: Mutex::new(KeepAliveState {
                last_activity: Instant::now(),
                ping_outstanding: false,
                response_deadline: None,
            }),
        }
    }

    pub fn enabled(&self) -> bool {
        !self.interval.is_zero()
    }

    /// Record outbound wire activity; resets the idle counter
    pub fn touch(&self) {
        self.state.lock().last_activity = Instant::now();
    }

    /// PINGRESP arrived. A response after the retry window already fired is
    /// simply ignored by virtue of the state reset here being idempotent.
    pub fn pong(&self) {
        let mut state = self.state.lock();
        state.ping_outstanding = false;
        state.response_deadline = None;
    }

    /// Evaluate the schedule at `now`
    pub fn check(&self, now: Instant) -> PingAction {
        if !self.enabled() {
            return PingAction::None;
        }

        let mut state = self.state.lock();
        if state.ping_outstanding {
            match state.response_deadline {
                Some(deadline) if now >= deadline => PingAction::Timeout,
                _ => PingAction::None,
            }
        } else if now.duration_since(state.last_activity) >= self.interval {
            state.ping_outstanding = true;
            state.response_deadline = Some(now + self.interval);
            PingAction::SendPing
        } else {
            PingAction::None
        }
    }

    /// When the scheduler should look again
    pub fn next_deadline(&self, now: Instant) -> Instant {
        if !self.enabled() {
            return now + Duration::from_secs(3600);
        }
        let state = self.state.lock();
        match state.response_deadline {
            Some(deadline) => deadline,
            None => {
                let idle_deadline = state.last_activity + self.interval;
                idle_deadline.max(now + Duration::from_millis(50))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_disabled_never_pings() {
        let keepalive = KeepAlive::new(Duration::ZERO);
        assert!(!keepalive.enabled());
        let late = Instant::now() + Duration::from_secs(3600);
        assert_eq!(keepalive.check(late), PingAction::None);
    }

    #[test]
    fn test_ping_after_idle_interval() {
        let keepalive = KeepAlive::new(Duration::from_secs(10));
        let now = Instant::now();

        assert_eq!(keepalive.check(now), PingAction::None);
        assert_eq!(
            keepalive.check(now + Duration::from_secs(10)),
            PingAction::SendPing
        );
        // Outstanding ping; no second PINGREQ
        assert_eq!(
            keepalive.check(now + Duration::from_secs(11)),
            PingAction::None
        );
    }

    #[test]
    fn test_timeout_without_pong() {
        let keepalive = KeepAlive::new(Duration::from_secs(10));
        let now = Instant::now();

        assert_eq!(
            keepalive.check(now + Duration::from_secs(10)),
            PingAction::SendPing
        );
        assert_eq!(
            keepalive.check(now + Duration::from_secs(20)),
            PingAction::Timeout
        );
    }

    #[test]
    fn test_pong_clears_outstanding() {
        let keepalive = KeepAlive::new(Duration::from_secs(10));
        let now = Instant::now();

        assert_eq!(
            keepalive.check(now + Duration::from_secs(10)),
            PingAction::SendPing
        );
        keepalive.pong();
        assert_eq!(
            keepalive.check(now + Duration::from_secs(20)),
            PingAction::SendPing
        );
    }

    #[test]
    fn test_activity_resets_idle_counter() {
        let keepalive = KeepAlive::new(Duration::from_secs(60));
        keepalive.touch();
        assert_eq!(
            keepalive.check(Instant::now() + Duration::from_secs(30)),
            PingAction::None
        );
    }

    #[test]
    fn test_late_pong_ignored() {
        let keepalive = KeepAlive::new(Duration::from_secs(10));
        let now = Instant::now();
        assert_eq!(
            keepalive.check(now + Duration::from_secs(10)),
            PingAction::SendPing
        );
        assert_eq!(
            keepalive.check(now + Duration::from_secs(20)),
            PingAction::Timeout
        );
        // Response arrives after the verdict; state just resets, the
        // connection-lost decision already stands
        keepalive.pong();
        assert_eq!(
            keepalive.check(now + Duration::from_secs(20)),
            PingAction::SendPing
        );
    }
}
