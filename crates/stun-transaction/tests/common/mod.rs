//! Shared helpers for the transaction integration tests.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::time::Instant;

use rvoip_stun_transaction::{Error, Message, Result, TransactionEvent, Transport};

pub const LOCAL: &str = "127.0.0.1:3478";
pub const REMOTE: &str = "127.0.0.1:5000";

pub fn local() -> SocketAddr {
    LOCAL.parse().unwrap()
}

pub fn remote() -> SocketAddr {
    REMOTE.parse().unwrap()
}

/// One send attempt seen by [`MockTransport`].
#[derive(Debug, Clone)]
pub struct SentMessage {
    pub message: Message,
    pub local_addr: SocketAddr,
    pub remote_addr: SocketAddr,
    /// Time since the transport was created.
    pub at: Duration,
}

/// Transport that records every send attempt and can be told to fail.
#[derive(Debug)]
pub struct MockTransport {
    sent: Mutex<Vec<SentMessage>>,
    created: Instant,
    failing: AtomicBool,
}

impl MockTransport {
    pub fn new() -> Self {
        Self {
            sent: Mutex::new(Vec::new()),
            created: Instant::now(),
            failing: AtomicBool::new(false),
        }
    }

    /// Makes every following send fail (still recorded as an attempt).
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn sent(&self) -> Vec<SentMessage> {
        self.sent.lock().unwrap().clone()
    }

    pub fn sent_count(&self) -> usize {
        self.sent.lock().unwrap().len()
    }

    /// Whole milliseconds from creation to each send attempt.
    pub fn send_offsets_ms(&self) -> Vec<u64> {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .map(|s| s.at.as_millis() as u64)
            .collect()
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn send_message(&self, message: &Message, local_addr: SocketAddr, remote_addr: SocketAddr) -> Result<()> {
        self.sent.lock().unwrap().push(SentMessage {
            message: message.clone(),
            local_addr,
            remote_addr,
            at: self.created.elapsed(),
        });
        if self.failing.load(Ordering::SeqCst) {
            return Err(Error::Transport("simulated send failure".to_string()));
        }
        Ok(())
    }
}

/// Drains every event currently queued.
pub fn drain_events(events: &mut mpsc::Receiver<TransactionEvent>) -> Vec<TransactionEvent> {
    let mut drained = Vec::new();
    while let Ok(event) = events.try_recv() {
        drained.push(event);
    }
    drained
}

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}
