//! Timing primitives for STUN transactions.
//!
//! This module re-exports key components:
//! - [`TimerSettings`]: Configuration for the retransmission and lifetime durations.
//! - [`RetransmissionSchedule`]: The exponential-backoff schedule of a client transaction.
//! - [`sleep_until_or_woken`]: The interruptible wait every transaction loop suspends on.

pub mod types;
pub mod wait;

pub use types::{RetransmissionSchedule, TimerSettings};
pub use wait::{sleep_until_or_woken, WaitOutcome};
