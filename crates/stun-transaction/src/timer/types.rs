//! Timer configuration and the client retransmission schedule.
//!
//! RFC 5389 Section 7.2.1 fixes the client behaviour over unreliable
//! transports: the first retransmission follows after an RTO of 100 ms, each
//! further interval doubles the previous one until it reaches 1.6 s and stays
//! there, a total of 9 requests is sent, and the transaction fails if nothing
//! arrived 1.6 s after the last one. With the defaults below the requests go
//! out at 0, 100, 300, 700, 1500, 3100, 4700, 6300 and 7900 ms and the
//! transaction times out at 9500 ms.
//!
//! A server transaction is kept alive for a fixed lifetime (16 s by default)
//! so retransmitted requests can be answered from its cached response.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Timer durations for STUN transactions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimerSettings {
    /// **Initial RTO (Default: 100 ms)**
    /// Interval between the original request and the first retransmission.
    pub initial_interval: Duration,

    /// **Maximum retransmission interval (Default: 1.6 s)**
    /// Doubling stops once an interval reaches this value.
    pub max_interval: Duration,

    /// **Retransmissions (Default: 8)**
    /// Number of resends after the original request, so 9 sends in total.
    pub max_retransmissions: u32,

    /// **Final wait (Default: 1.6 s)**
    /// How long to wait for a response after the last request went out
    /// before the transaction is considered failed.
    pub final_wait: Duration,

    /// **Server transaction lifetime (Default: 16 s)**
    /// How long a server transaction keeps its cached response, measured
    /// from its creation.
    pub server_lifetime: Duration,
}

impl Default for TimerSettings {
    fn default() -> Self {
        Self {
            initial_interval: Duration::from_millis(100),
            max_interval: Duration::from_millis(1600),
            max_retransmissions: 8,
            final_wait: Duration::from_millis(1600),
            server_lifetime: Duration::from_secs(16),
        }
    }
}

impl TimerSettings {
    /// Loads settings from a JSON document. Missing fields keep their defaults.
    ///
    /// Durations use serde's `{ "secs": .., "nanos": .. }` representation.
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// Total number of sends of a client request, the original included.
    pub fn max_sends(&self) -> u32 {
        self.max_retransmissions + 1
    }

    /// The retransmission schedule these settings describe.
    pub fn schedule(&self) -> RetransmissionSchedule {
        RetransmissionSchedule::new(self)
    }

    /// Time from the original send until a silent client transaction
    /// times out (9.5 s with the defaults).
    pub fn total_client_timeout(&self) -> Duration {
        self.schedule().send_offsets().last().copied().unwrap_or_default() + self.final_wait
    }
}

/// Exponential-backoff schedule for one client transaction.
///
/// Each call to [`next_wait`](Self::next_wait) records one send and returns
/// how long to wait before the next event: the next retransmission, or the
/// final timeout once all sends are used up.
#[derive(Debug, Clone)]
pub struct RetransmissionSchedule {
    current_interval: Duration,
    max_interval: Duration,
    final_wait: Duration,
    max_sends: u32,
    sends: u32,
}

impl RetransmissionSchedule {
    pub fn new(settings: &TimerSettings) -> Self {
        Self {
            current_interval: settings.initial_interval,
            max_interval: settings.max_interval,
            final_wait: settings.final_wait,
            max_sends: settings.max_sends(),
            sends: 0,
        }
    }

    /// Number of sends recorded so far.
    pub fn sends(&self) -> u32 {
        self.sends
    }

    /// Whether every allowed send has been recorded.
    pub fn is_exhausted(&self) -> bool {
        self.sends >= self.max_sends
    }

    /// Records a send and returns the wait until the next event, or `None`
    /// if the schedule was already exhausted.
    pub fn next_wait(&mut self) -> Option<Duration> {
        if self.is_exhausted() {
            return None;
        }
        self.sends += 1;
        if self.is_exhausted() {
            return Some(self.final_wait);
        }
        let wait = self.current_interval;
        self.current_interval = std::cmp::min(self.current_interval * 2, self.max_interval);
        Some(wait)
    }

    /// Offsets of every send from the original one, without consuming `self`.
    pub fn send_offsets(&self) -> Vec<Duration> {
        let mut schedule = Self {
            sends: 0,
            ..self.clone()
        };
        let mut offsets = Vec::with_capacity(self.max_sends as usize);
        let mut at = Duration::ZERO;
        while !schedule.is_exhausted() {
            offsets.push(at);
            match schedule.next_wait() {
                Some(wait) => at += wait,
                None => break,
            }
        }
        offsets
    }
}
