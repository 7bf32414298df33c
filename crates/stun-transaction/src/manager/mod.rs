//! # Transaction Manager for STUN
//!
//! The `TransactionManager` is the dispatcher of the transaction layer. It
//! owns the two registries of active transactions, keyed by
//! [`TransactionId`]:
//!
//! - **client transactions** correlate inbound responses with the requests
//!   this endpoint sent;
//! - **server transactions** recognize retransmitted inbound requests and
//!   answer them from the cached response.
//!
//! The two registries are independent: the same ID may appear in both
//! without the entries sharing any state.
//!
//! ## Message routing
//!
//! [`TransactionManager::handle_message`] is fed every decoded inbound
//! message:
//!
//! - a **response** is delivered to the client transaction with the same ID
//!   and silently dropped if there is none (late or stray);
//! - a **request** with an unknown ID creates a server transaction and is
//!   reported to the application as [`TransactionEvent::RequestReceived`];
//!   a request whose ID is already known is a retransmission and is answered
//!   from the cache without the application hearing about it;
//! - an **indication** is passed through as
//!   [`TransactionEvent::IndicationReceived`].
//!
//! Transactions remove themselves through the [`Dispatcher`] trait when they
//! reach a terminal state; each removal is reported as
//! [`TransactionEvent::TransactionTerminated`].
//!
//! ## Event delivery
//!
//! Events go out on a bounded channel and are never waited for: when the
//! owner stops draining it, further events are dropped with a warning while
//! timers and routing carry on. A request whose `RequestReceived` event
//! cannot be queued expires its fresh server transaction right away, so the
//! peer's next retransmission is announced again.
//!
//! A request arriving for a server transaction that expired but is not yet
//! unregistered replaces that transaction and counts as new.
//!
//! ## Example
//!
//! ```rust,no_run
//! # use std::sync::Arc;
//! # use rvoip_stun_transaction::prelude::*;
//! # async fn example() -> Result<()> {
//! let local = "0.0.0.0:3478".parse().unwrap();
//! let transport = UdpTransport::new();
//! transport.bind(local).await?;
//!
//! let (manager, mut events) = TransactionManager::new(Arc::new(transport.clone()), None);
//! transport.spawn_receive_loop(local, manager.clone())?;
//!
//! while let Some(event) = events.recv().await {
//!     if let TransactionEvent::RequestReceived { transaction_id, request, local_addr, source } = event {
//!         let response = Message::success_response_to(&request, Default::default());
//!         manager.send_response(&transaction_id, response, local_addr, source).await?;
//!     }
//! }
//! # Ok(())
//! # }
//! ```

use std::fmt;
use std::net::SocketAddr;
use std::sync::{Arc, Weak};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::future::join_all;
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, trace, warn};

use crate::client::ClientTransaction;
use crate::error::{Error, Result};
use crate::message::{Message, MessageClass};
use crate::server::ServerTransaction;
use crate::timer::TimerSettings;
use crate::transaction::{emit_event, Dispatcher, TransactionEvent, TransactionId};
use crate::transport::Transport;

// Default channel capacity
const DEFAULT_EVENT_CHANNEL_CAPACITY: usize = 100;

/// How an inbound request relates to the server registry.
enum RequestRoute {
    New,
    Retransmission,
    Replaced,
}

/// Registry and router for client and server transactions.
#[derive(Clone)]
pub struct TransactionManager {
    inner: Arc<TransactionManagerInner>,
}

pub(crate) struct TransactionManagerInner {
    transport: Arc<dyn Transport>,
    client_transactions: DashMap<TransactionId, ClientTransaction>,
    server_transactions: DashMap<TransactionId, ServerTransaction>,
    events_tx: mpsc::Sender<TransactionEvent>,
    timer_settings: TimerSettings,
}

impl TransactionManager {
    /// Creates a manager sending through `transport`.
    ///
    /// Returns the manager and the receiving end of its event channel.
    pub fn new(
        transport: Arc<dyn Transport>,
        timer_settings: Option<TimerSettings>,
    ) -> (Self, mpsc::Receiver<TransactionEvent>) {
        Self::with_capacity(transport, timer_settings, DEFAULT_EVENT_CHANNEL_CAPACITY)
    }

    /// Like [`new`](Self::new) with an explicit event channel capacity.
    pub fn with_capacity(
        transport: Arc<dyn Transport>,
        timer_settings: Option<TimerSettings>,
        capacity: usize,
    ) -> (Self, mpsc::Receiver<TransactionEvent>) {
        let (events_tx, events_rx) = mpsc::channel(capacity);
        let manager = Self {
            inner: Arc::new(TransactionManagerInner {
                transport,
                client_transactions: DashMap::new(),
                server_transactions: DashMap::new(),
                events_tx,
                timer_settings: timer_settings.unwrap_or_default(),
            }),
        };
        (manager, events_rx)
    }

    fn dispatcher(&self) -> Weak<dyn Dispatcher> {
        Arc::downgrade(&self.inner) as Weak<dyn Dispatcher>
    }

    /// Registers and starts a client transaction for `request`.
    ///
    /// A failed first send is reported as [`TransactionEvent::TransportError`]
    /// and the retransmissions carry on. A request that cannot be encoded
    /// will never go out, so in that case the transaction is canceled and
    /// the error returned.
    ///
    /// # Errors
    /// - [`Error::TransactionExists`] if a client transaction with the same
    ///   ID is still active.
    /// - [`Error::InvalidMessage`] if `request` is not a request.
    /// - [`Error::Encode`] as described above.
    pub async fn send_request(
        &self,
        request: Message,
        local_addr: SocketAddr,
        remote_addr: SocketAddr,
    ) -> Result<ClientTransaction> {
        let id = request.transaction_id();
        let transaction = ClientTransaction::new(
            id,
            request,
            local_addr,
            remote_addr,
            self.inner.transport.clone(),
            self.dispatcher(),
            self.inner.events_tx.clone(),
            Some(self.inner.timer_settings),
        )?;

        match self.inner.client_transactions.entry(id) {
            Entry::Occupied(_) => return Err(Error::TransactionExists(id)),
            Entry::Vacant(entry) => {
                entry.insert(transaction.clone());
            }
        }
        debug!(id=%id, remote=%remote_addr, "Created client transaction");

        match transaction.start().await {
            Ok(()) => {}
            Err(e @ Error::Encode(_)) => {
                transaction.cancel().await;
                return Err(e);
            }
            Err(e) => {
                emit_event(
                    &self.inner.events_tx,
                    TransactionEvent::TransportError {
                        transaction_id: id,
                        error: e.to_string(),
                    },
                )?;
            }
        }
        Ok(transaction)
    }

    /// Cancels the active client transaction with `id`.
    pub async fn cancel_request(&self, id: &TransactionId) -> Result<()> {
        let transaction = self
            .client_transaction(id)
            .ok_or(Error::TransactionNotFound(*id))?;
        transaction.cancel().await;
        Ok(())
    }

    /// Sends the application's response through the server transaction
    /// with `id`. Only the first response sent on a transaction counts.
    ///
    /// # Errors
    /// [`Error::TransactionNotFound`] if no server transaction with `id` is
    /// active, otherwise whatever the transport reports.
    pub async fn send_response(
        &self,
        id: &TransactionId,
        response: Message,
        local_addr: SocketAddr,
        remote_addr: SocketAddr,
    ) -> Result<()> {
        let transaction = self
            .server_transaction(id)
            .ok_or(Error::TransactionNotFound(*id))?;
        transaction.send_response(response, local_addr, remote_addr).await
    }

    /// Routes one inbound message. See the module documentation.
    pub async fn handle_message(&self, message: Message, local_addr: SocketAddr, source: SocketAddr) -> Result<()> {
        let id = message.transaction_id();
        match message.class() {
            MessageClass::SuccessResponse | MessageClass::ErrorResponse => {
                match self.client_transaction(&id) {
                    Some(transaction) => {
                        if !transaction.deliver_response(message).await {
                            trace!(id=%id, "Response not accepted by client transaction");
                        }
                    }
                    None => debug!(id=%id, source=%source, "Dropping response with no matching transaction"),
                }
                Ok(())
            }
            MessageClass::Request => self.handle_request(message, local_addr, source).await,
            MessageClass::Indication => emit_event(
                &self.inner.events_tx,
                TransactionEvent::IndicationReceived {
                    message,
                    local_addr,
                    source,
                },
            ),
        }
    }

    async fn handle_request(&self, request: Message, local_addr: SocketAddr, source: SocketAddr) -> Result<()> {
        let id = request.transaction_id();
        let (transaction, route) = match self.inner.server_transactions.entry(id) {
            // Expired but not yet unregistered: the request starts a new exchange
            Entry::Occupied(mut entry) if entry.get().has_expired() => {
                let fresh = self.new_server_transaction(id);
                entry.insert(fresh.clone());
                (fresh, RequestRoute::Replaced)
            }
            Entry::Occupied(entry) => (entry.get().clone(), RequestRoute::Retransmission),
            Entry::Vacant(entry) => {
                let fresh = self.new_server_transaction(id);
                entry.insert(fresh.clone());
                (fresh, RequestRoute::New)
            }
        };

        match route {
            RequestRoute::Retransmission => {
                trace!(id=%id, source=%source, "Retransmitted request, replaying cached response");
                if let Err(e) = transaction.retransmit_response().await {
                    warn!(id=%id, error=%e, "Failed to replay cached response");
                }
                return Ok(());
            }
            RequestRoute::Replaced => self.inner.notify_terminated(&id, true),
            RequestRoute::New => {}
        }

        debug!(id=%id, source=%source, "Created server transaction");
        let event = TransactionEvent::RequestReceived {
            transaction_id: id,
            request,
            local_addr,
            source,
        };
        match self.inner.events_tx.try_send(event) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => {
                // Nobody will answer this one, so let a retransmission start over
                warn!(id=%id, "Event channel full, dropping request");
                transaction.expire().await;
                Ok(())
            }
            Err(TrySendError::Closed(_)) => Err(Error::ChannelClosed),
        }
    }

    fn new_server_transaction(&self, id: TransactionId) -> ServerTransaction {
        ServerTransaction::new(
            id,
            self.inner.transport.clone(),
            self.dispatcher(),
            Some(self.inner.timer_settings),
        )
    }

    pub fn client_transaction(&self, id: &TransactionId) -> Option<ClientTransaction> {
        self.inner.client_transactions.get(id).map(|entry| entry.value().clone())
    }

    pub fn server_transaction(&self, id: &TransactionId) -> Option<ServerTransaction> {
        self.inner.server_transactions.get(id).map(|entry| entry.value().clone())
    }

    /// IDs of the active (client, server) transactions.
    pub fn active_transactions(&self) -> (Vec<TransactionId>, Vec<TransactionId>) {
        let clients = self.inner.client_transactions.iter().map(|e| *e.key()).collect();
        let servers = self.inner.server_transactions.iter().map(|e| *e.key()).collect();
        (clients, servers)
    }

    pub fn timer_settings(&self) -> &TimerSettings {
        &self.inner.timer_settings
    }

    pub fn transport(&self) -> Arc<dyn Transport> {
        self.inner.transport.clone()
    }

    /// Cancels every client transaction and expires every server transaction.
    pub async fn shutdown(&self) {
        let clients: Vec<ClientTransaction> = self
            .inner
            .client_transactions
            .iter()
            .map(|e| e.value().clone())
            .collect();
        let servers: Vec<ServerTransaction> = self
            .inner
            .server_transactions
            .iter()
            .map(|e| e.value().clone())
            .collect();
        debug!(clients = clients.len(), servers = servers.len(), "Shutting down transaction manager");

        join_all(clients.iter().map(|tx| tx.cancel())).await;
        join_all(servers.iter().map(|tx| tx.expire())).await;
    }
}

impl TransactionManagerInner {
    fn notify_terminated(&self, id: &TransactionId, is_server: bool) {
        let event = TransactionEvent::TransactionTerminated {
            transaction_id: *id,
            is_server,
        };
        if emit_event(&self.events_tx, event).is_err() {
            trace!(id=%id, "Event receiver gone");
        }
    }
}

impl Dispatcher for TransactionManagerInner {
    fn remove_client_transaction(&self, id: &TransactionId) {
        if self.client_transactions.remove(id).is_some() {
            trace!(id=%id, "Removed client transaction");
            self.notify_terminated(id, false);
        }
    }

    fn remove_server_transaction(&self, id: &TransactionId) {
        // A newer transaction may already have taken over an expired entry
        if self
            .server_transactions
            .remove_if(id, |_, transaction| transaction.has_expired())
            .is_some()
        {
            trace!(id=%id, "Removed server transaction");
            self.notify_terminated(id, true);
        }
    }
}

impl fmt::Debug for TransactionManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransactionManager")
            .field("transport", &self.inner.transport)
            .field("client_transactions", &self.inner.client_transactions.len())
            .field("server_transactions", &self.inner.server_transactions.len())
            .field("timer_settings", &self.inner.timer_settings)
            .finish()
    }
}
