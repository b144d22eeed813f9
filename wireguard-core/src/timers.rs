//! Named timer constants and the per-peer timer state machine (spec
//! §3 "Timers", §4.5). The device's timer thread calls
//! `PeerTimers::poll` once per tick for every peer; it never sleeps
//! per-peer, so the constants below are compared against plain
//! `Instant` deltas rather than driving individual OS timers.

use std::time::{Duration, Instant};

pub const REKEY_AFTER_MESSAGES: u64 = 1 << 60;
pub const REJECT_AFTER_MESSAGES: u64 = u64::MAX - (1 << 13) - 1;
pub const REKEY_AFTER_TIME: u64 = 120;
pub const REJECT_AFTER_TIME: u64 = 180;
pub const REKEY_ATTEMPT_TIME: u64 = 90;
pub const REKEY_TIMEOUT: Duration = Duration::from_secs(5);
pub const REKEY_TIMEOUT_JITTER_MAX_MS: u64 = 333;
pub const KEEPALIVE_TIMEOUT: Duration = Duration::from_secs(10);

/// `REJECT_AFTER_TIME x 3`, spec §4.5's "zero-key timer".
pub fn zero_key_timeout() -> Duration {
    Duration::from_secs(REJECT_AFTER_TIME * 3)
}

/// Actions the timer state machine can ask the caller to perform.
/// `PeerTimers::poll` returns the subset that fired this tick; the
/// caller (the device's timer thread) is responsible for actually
/// sending packets or touching crypto state — this module only
/// tracks *when*.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerEvent {
    /// Send a new handshake initiation.
    SendHandshakeInitiation,
    /// Send an empty keepalive transport message.
    SendKeepalive,
    /// Retry an in-flight handshake that hasn't gotten a response.
    RetryHandshake,
    /// Give up on the in-flight handshake (`REKEY_ATTEMPT_TIME` elapsed).
    AbandonHandshake,
    /// Zeroize all keypairs; the peer has been idle for 3x the max
    /// session lifetime.
    ZeroKeys,
}

#[derive(Debug, Clone, Copy)]
struct HandshakeAttempt {
    started_at: Instant,
    last_retry: Instant,
}

/// One peer's timer bookkeeping. Every field is a plain `Instant` or
/// `Option`, matching the spec's description of timers as derived
/// conditions over a handful of monotonic instants rather than
/// independently-scheduled alarms.
pub struct PeerTimers {
    pub is_initiator_capable: bool,
    pub persistent_keepalive: Option<Duration>,
    last_handshake_completed: Option<Instant>,
    last_sent: Option<Instant>,
    last_received: Option<Instant>,
    last_authenticated_received: Option<Instant>,
    in_flight: Option<HandshakeAttempt>,
    current_keypair_age: Option<Instant>,
}

impl PeerTimers {
    pub fn new() -> Self {
        Self {
            is_initiator_capable: true,
            persistent_keepalive: None,
            last_handshake_completed: None,
            last_sent: None,
            last_received: None,
            last_authenticated_received: None,
            in_flight: None,
            current_keypair_age: None,
        }
    }

    pub fn on_data_sent(&mut self, now: Instant) {
        self.last_sent = Some(now);
    }

    pub fn on_data_received(&mut self, now: Instant) {
        self.last_received = Some(now);
    }

    pub fn on_authenticated_received(&mut self, now: Instant) {
        self.last_authenticated_received = Some(now);
    }

    pub fn on_handshake_initiated(&mut self, now: Instant) {
        self.in_flight = Some(HandshakeAttempt {
            started_at: now,
            last_retry: now,
        });
    }

    pub fn on_handshake_completed(&mut self, now: Instant) {
        self.in_flight = None;
        self.last_handshake_completed = Some(now);
        self.current_keypair_age = Some(now);
    }

    pub fn on_handshake_retried(&mut self, now: Instant) {
        if let Some(attempt) = &mut self.in_flight {
            attempt.last_retry = now;
        }
    }

    /// Returns every timer event that should fire this tick. Order
    /// matters only in that `AbandonHandshake` should be acted on
    /// before `SendHandshakeInitiation` is considered again next
    /// tick; callers iterate the returned `Vec` in order.
    pub fn poll(&mut self, now: Instant) -> Vec<TimerEvent> {
        let mut events = Vec::new();

        if let Some(attempt) = self.in_flight {
            let elapsed = now.duration_since(attempt.started_at).as_secs();
            if elapsed >= REKEY_ATTEMPT_TIME {
                events.push(TimerEvent::AbandonHandshake);
                self.in_flight = None;
            } else if now.duration_since(attempt.last_retry) >= REKEY_TIMEOUT {
                events.push(TimerEvent::RetryHandshake);
            }
        } else if self.needs_new_handshake(now) {
            events.push(TimerEvent::SendHandshakeInitiation);
        }

        if self.needs_keepalive(now) {
            events.push(TimerEvent::SendKeepalive);
        }

        if self.is_idle_past_zero_key_timeout(now) {
            events.push(TimerEvent::ZeroKeys);
        }

        events
    }

    fn needs_new_handshake(&self, now: Instant) -> bool {
        let keypair_stale = match self.current_keypair_age {
            Some(age) if self.is_initiator_capable => {
                now.duration_since(age).as_secs() >= REKEY_AFTER_TIME
            }
            _ => false,
        };

        let silent_despite_sending = match (self.last_sent, self.last_authenticated_received) {
            (Some(sent), last_recv) => {
                let quiet_for = last_recv.map(|r| now.duration_since(r)).unwrap_or_else(|| now.duration_since(sent));
                sent > last_recv.unwrap_or(sent)
                    && quiet_for >= KEEPALIVE_TIMEOUT + REKEY_TIMEOUT
            }
            (None, _) => false,
        };

        keypair_stale || silent_despite_sending
    }

    fn needs_keepalive(&self, now: Instant) -> bool {
        if let Some(interval) = self.persistent_keepalive {
            if self.last_sent.map(|t| now.duration_since(t)).unwrap_or(interval) >= interval {
                return true;
            }
        }
        match (self.last_received, self.last_sent) {
            (Some(recv), sent) => {
                let sent_after_recv = sent.is_some_and(|s| s >= recv);
                !sent_after_recv && now.duration_since(recv) >= KEEPALIVE_TIMEOUT
            }
            (None, _) => false,
        }
    }

    fn is_idle_past_zero_key_timeout(&self, now: Instant) -> bool {
        let last_activity = [self.last_sent, self.last_received, self.last_handshake_completed]
            .into_iter()
            .flatten()
            .max();
        match last_activity {
            Some(t) => now.duration_since(t) >= zero_key_timeout(),
            None => false,
        }
    }
}

impl Default for PeerTimers {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_peer_fires_nothing() {
        let mut timers = PeerTimers::new();
        assert!(timers.poll(Instant::now()).is_empty());
    }

    #[test]
    fn stale_keypair_triggers_new_handshake_for_initiator() {
        let mut timers = PeerTimers::new();
        let start = Instant::now();
        timers.on_handshake_completed(start);
        let later = start + Duration::from_secs(REKEY_AFTER_TIME + 1);
        assert!(timers.poll(later).contains(&TimerEvent::SendHandshakeInitiation));
    }

    #[test]
    fn in_flight_handshake_retries_then_gives_up() {
        let mut timers = PeerTimers::new();
        let start = Instant::now();
        timers.on_handshake_initiated(start);
        let retry_time = start + REKEY_TIMEOUT + Duration::from_millis(1);
        assert!(timers.poll(retry_time).contains(&TimerEvent::RetryHandshake));
        timers.on_handshake_retried(retry_time);

        let give_up = start + Duration::from_secs(REKEY_ATTEMPT_TIME + 1);
        assert!(timers.poll(give_up).contains(&TimerEvent::AbandonHandshake));
    }

    #[test]
    fn keepalive_fires_after_receive_with_no_reply() {
        let mut timers = PeerTimers::new();
        let start = Instant::now();
        timers.on_data_received(start);
        let later = start + KEEPALIVE_TIMEOUT + Duration::from_millis(1);
        assert!(timers.poll(later).contains(&TimerEvent::SendKeepalive));
    }

    #[test]
    fn long_idle_peer_zeroizes_keys() {
        let mut timers = PeerTimers::new();
        let start = Instant::now();
        timers.on_handshake_completed(start);
        let later = start + zero_key_timeout() + Duration::from_secs(1);
        assert!(timers.poll(later).contains(&TimerEvent::ZeroKeys));
    }
}
