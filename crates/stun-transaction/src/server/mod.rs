//! Server transactions: response caching and duplicate suppression.
//!
//! A request may be processed only once, because answering it can have side
//! effects (a nonce handed out, an allocation made). A [`ServerTransaction`]
//! therefore stores the first response the application supplies and replays
//! exactly that response for every retransmission of the request, without
//! the application ever seeing the duplicates.
//!
//! The transaction lives for a fixed lifetime (16 s by default) measured
//! from its creation, then expires and removes itself from its dispatcher.

use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;
use tracing::{debug, trace, warn};

use crate::error::Result;
use crate::message::Message;
use crate::timer::{sleep_until_or_woken, TimerSettings, WaitOutcome};
use crate::transaction::{Dispatcher, ServerTransactionState, TransactionId};
use crate::transport::Transport;

/// Server transaction (RFC 5389 Section 7.3)
#[derive(Clone)]
pub struct ServerTransaction {
    data: Arc<ServerTransactionData>,
}

struct ServerTransactionData {
    id: TransactionId,
    transport: Arc<dyn Transport>,
    dispatcher: Weak<dyn Dispatcher>,
    expires_at: Instant,
    state: Mutex<ServerState>,
    // Mirrors `phase == Expired` for lock-free readers; only set under `state`
    expired: AtomicBool,
    wake: Notify,
}

#[derive(Debug)]
struct ServerState {
    phase: ServerTransactionState,
    cached: Option<CachedResponse>,
}

/// The first response and the addresses it was sent with.
#[derive(Debug, Clone)]
struct CachedResponse {
    response: Message,
    local_addr: SocketAddr,
    remote_addr: SocketAddr,
}

impl ServerTransaction {
    /// Creates a server transaction for a request carrying `id`.
    ///
    /// The lifetime deadline is fixed here and the task waiting for it is
    /// spawned right away, so this must be called from within a tokio
    /// runtime.
    pub fn new(
        id: TransactionId,
        transport: Arc<dyn Transport>,
        dispatcher: Weak<dyn Dispatcher>,
        timer_config: Option<TimerSettings>,
    ) -> Self {
        let lifetime = timer_config.unwrap_or_default().server_lifetime;
        let data = Arc::new(ServerTransactionData {
            id,
            transport,
            dispatcher,
            expires_at: Instant::now() + lifetime,
            state: Mutex::new(ServerState {
                phase: ServerTransactionState::AwaitingFirstResponse,
                cached: None,
            }),
            expired: AtomicBool::new(false),
            wake: Notify::new(),
        });

        tokio::spawn(run_lifetime_timer(data.clone()));
        debug!(id=%id, lifetime=?lifetime, "Server transaction created");

        Self { data }
    }

    /// Sends a response to the request that created this transaction.
    ///
    /// The first call stores `response` (stamped with this transaction's ID)
    /// together with the addresses and transmits it. Every later call
    /// transmits the stored response again and ignores the `response` and
    /// addresses passed in. After expiry nothing is sent.
    ///
    /// # Errors
    /// Whatever the transport reports for this one send attempt.
    pub async fn send_response(&self, mut response: Message, send_through: SocketAddr, send_to: SocketAddr) -> Result<()> {
        let data = &self.data;
        let mut state = data.state.lock().await;
        match state.phase {
            ServerTransactionState::Expired => {
                trace!(id=%data.id, "Transaction expired, response discarded");
                return Ok(());
            }
            ServerTransactionState::AwaitingFirstResponse => {
                response.set_transaction_id(data.id);
                state.cached = Some(CachedResponse {
                    response,
                    local_addr: send_through,
                    remote_addr: send_to,
                });
                state.phase = ServerTransactionState::Retransmitting;
                debug!(id=%data.id, remote=%send_to, "Caching first response");
            }
            ServerTransactionState::Retransmitting => {
                trace!(id=%data.id, "Response already cached, replaying it instead");
            }
        }
        data.transmit(&state).await
    }

    /// Retransmits the cached response.
    ///
    /// Does nothing if the transaction expired or the application has not
    /// supplied a first response yet.
    pub async fn retransmit_response(&self) -> Result<()> {
        let state = self.data.state.lock().await;
        if state.phase != ServerTransactionState::Retransmitting {
            trace!(id=%self.data.id, state=%state.phase, "Nothing to retransmit");
            return Ok(());
        }
        self.data.transmit(&state).await
    }

    /// Expires the transaction: later sends are discarded and the lifetime
    /// task is woken so it can unregister the transaction. Idempotent.
    pub async fn expire(&self) {
        self.data.expire().await;
    }

    pub fn id(&self) -> TransactionId {
        self.data.id
    }

    /// The deadline fixed at creation.
    pub fn expires_at(&self) -> Instant {
        self.data.expires_at
    }

    pub async fn state(&self) -> ServerTransactionState {
        self.data.state.lock().await.phase
    }

    /// Whether a first response has been sent, i.e. duplicates are now
    /// answered from the cache.
    pub async fn is_retransmitting(&self) -> bool {
        self.state().await == ServerTransactionState::Retransmitting
    }

    pub async fn is_expired(&self) -> bool {
        self.state().await.is_terminal()
    }

    /// Like [`is_expired`](Self::is_expired) but without taking the state
    /// lock, for callers that cannot await.
    pub fn has_expired(&self) -> bool {
        self.data.expired.load(Ordering::Acquire)
    }

    /// The cached response, once the first one has been supplied.
    pub async fn cached_response(&self) -> Option<Message> {
        self.data.state.lock().await.cached.as_ref().map(|c| c.response.clone())
    }
}

impl ServerTransactionData {
    /// Sends the cached response. Callers hold the state lock, so an
    /// `expire()` cannot slip in between their check and this send.
    async fn transmit(&self, state: &ServerState) -> Result<()> {
        let Some(cached) = state.cached.as_ref() else {
            return Ok(());
        };
        let result = self
            .transport
            .send_message(&cached.response, cached.local_addr, cached.remote_addr)
            .await;
        if let Err(e) = &result {
            warn!(id=%self.id, error=%e, "Failed to send response");
        }
        result
    }

    /// Returns `true` if this call did the expiring.
    async fn expire(&self) -> bool {
        let mut state = self.state.lock().await;
        if state.phase.is_terminal() {
            return false;
        }
        trace!(id=%self.id, "State transition: {} -> {}", state.phase, ServerTransactionState::Expired);
        state.phase = ServerTransactionState::Expired;
        self.expired.store(true, Ordering::Release);
        self.wake.notify_one();
        true
    }
}

/// Waits out the transaction lifetime, then expires and unregisters it.
async fn run_lifetime_timer(data: Arc<ServerTransactionData>) {
    loop {
        match sleep_until_or_woken(data.expires_at, &data.wake).await {
            WaitOutcome::Elapsed => break,
            WaitOutcome::Woken => {
                if data.state.lock().await.phase.is_terminal() {
                    break;
                }
            }
        }
    }

    if data.expire().await {
        debug!(id=%data.id, "Server transaction lifetime over");
    } else {
        debug!(id=%data.id, "Server transaction expired early");
    }

    if let Some(dispatcher) = data.dispatcher.upgrade() {
        dispatcher.remove_server_transaction(&data.id);
    }
}

impl fmt::Debug for ServerTransaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerTransaction")
            .field("id", &self.data.id)
            .field("expires_at", &self.data.expires_at)
            .finish()
    }
}
