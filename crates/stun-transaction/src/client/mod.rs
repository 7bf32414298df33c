//! Client transactions: reliable delivery of one outgoing request.
//!
//! A [`ClientTransaction`] sends its request when started and then keeps
//! retransmitting it on the [`RetransmissionSchedule`](crate::timer::RetransmissionSchedule)
//! until one of three things happens first:
//!
//! - the dispatcher delivers a matching response ([`ClientTransaction::deliver_response`]),
//! - the owner cancels it ([`ClientTransaction::cancel`]),
//! - the schedule runs out and the final wait lapses (timeout).
//!
//! Every check-then-send in the retransmission task and every terminal
//! transition run under the same per-transaction lock, so a response racing
//! a timer either lands before the send (and the send is skipped) or after
//! it (and no further send happens).

use std::fmt;
use std::net::SocketAddr;
use std::sync::{Arc, Weak};

use tokio::sync::{mpsc, watch, Mutex, Notify};
use tokio::time::Instant;
use tracing::{debug, error, trace, warn};

use crate::error::{Error, Result};
use crate::message::Message;
use crate::timer::{sleep_until_or_woken, RetransmissionSchedule, TimerSettings, WaitOutcome};
use crate::transaction::{
    emit_event, ClientOutcome, ClientTransactionState, Dispatcher, TransactionEvent, TransactionId,
};
use crate::transport::Transport;

/// Client transaction (RFC 5389 Section 7.2.1)
#[derive(Clone)]
pub struct ClientTransaction {
    data: Arc<ClientTransactionData>,
}

/// Everything the retransmission task and the public handle share.
struct ClientTransactionData {
    id: TransactionId,
    request: Message,
    local_addr: SocketAddr,
    remote_addr: SocketAddr,
    transport: Arc<dyn Transport>,
    dispatcher: Weak<dyn Dispatcher>,
    events_tx: mpsc::Sender<TransactionEvent>,
    timer_config: TimerSettings,
    state: Mutex<ClientState>,
    wake: Notify,
    outcome_tx: watch::Sender<Option<ClientOutcome>>,
}

/// Mutable part of a client transaction, only touched under `data.state`.
#[derive(Debug)]
struct ClientState {
    phase: ClientTransactionState,
    sends: u32,
    next_retransmission: Option<Instant>,
    expires_at: Option<Instant>,
}

impl ClientTransaction {
    /// Create a new client transaction in the `Scheduled` state.
    ///
    /// The request is stamped with `id`, whatever ID it carried before.
    ///
    /// # Errors
    /// [`Error::InvalidMessage`] if `request` is not a request.
    pub fn new(
        id: TransactionId,
        mut request: Message,
        local_addr: SocketAddr,
        remote_addr: SocketAddr,
        transport: Arc<dyn Transport>,
        dispatcher: Weak<dyn Dispatcher>,
        events_tx: mpsc::Sender<TransactionEvent>,
        timer_config: Option<TimerSettings>,
    ) -> Result<Self> {
        if !request.is_request() {
            return Err(Error::InvalidMessage(format!(
                "client transaction {} needs a request, got {:?}",
                id,
                request.class()
            )));
        }
        request.set_transaction_id(id);

        let (outcome_tx, _) = watch::channel(None);
        let data = Arc::new(ClientTransactionData {
            id,
            request,
            local_addr,
            remote_addr,
            transport,
            dispatcher,
            events_tx,
            timer_config: timer_config.unwrap_or_default(),
            state: Mutex::new(ClientState {
                phase: ClientTransactionState::Scheduled,
                sends: 0,
                next_retransmission: None,
                expires_at: None,
            }),
            wake: Notify::new(),
            outcome_tx,
        });

        Ok(Self { data })
    }

    /// Sends the request and starts the retransmission timeline.
    ///
    /// The outcome of the first send is returned to the caller. A failed
    /// first send does not stop the schedule: the retransmissions still go
    /// out unless the transaction is canceled. Starting a transaction that
    /// is already running or finished does nothing.
    pub async fn start(&self) -> Result<()> {
        let data = &self.data;
        let mut state = data.state.lock().await;
        if state.phase != ClientTransactionState::Scheduled {
            trace!(id=%data.id, state=%state.phase, "start() ignored, transaction already started or finished");
            return Ok(());
        }

        let mut schedule = data.timer_config.schedule();
        let started_at = Instant::now();
        state.phase = ClientTransactionState::Retransmitting;
        state.expires_at = Some(started_at + data.timer_config.total_client_timeout());

        debug!(id=%data.id, remote=%data.remote_addr, "Sending initial request");
        let send_result = data
            .transport
            .send_message(&data.request, data.local_addr, data.remote_addr)
            .await;
        state.sends = 1;

        let Some(wait) = schedule.next_wait() else {
            return send_result;
        };
        let deadline = started_at + wait;
        state.next_retransmission = (!schedule.is_exhausted()).then_some(deadline);
        drop(state);

        tokio::spawn(run_retransmission_loop(data.clone(), schedule, deadline));

        if let Err(e) = &send_result {
            error!(id=%data.id, error=%e, "Failed to send initial request");
        }
        send_result
    }

    /// Delivers a response matching this transaction.
    ///
    /// Moves the transaction to `Answered`, stops retransmissions and wakes
    /// anyone waiting for the outcome. Returns `false` if the response was
    /// not accepted: wrong class, wrong ID, or the transaction already
    /// reached a terminal state.
    pub async fn deliver_response(&self, response: Message) -> bool {
        let data = &self.data;
        if !response.is_response() || response.transaction_id() != data.id {
            warn!(id=%data.id, response=?response, "Ignoring message that does not answer this transaction");
            return false;
        }

        let recorded = {
            let mut state = data.state.lock().await;
            data.finish(&mut state, ClientOutcome::Answered(response.clone()))
        };
        if !recorded {
            trace!(id=%data.id, "Late response ignored, transaction already finished");
            return false;
        }

        debug!(id=%data.id, "Response delivered, transaction answered");
        data.emit(TransactionEvent::ResponseReceived {
            transaction_id: data.id,
            response,
            remote_addr: data.remote_addr,
        });
        data.unregister();
        true
    }

    /// Cancels the transaction. No sends happen after this returns.
    /// Canceling a finished transaction does nothing.
    pub async fn cancel(&self) {
        let data = &self.data;
        let recorded = {
            let mut state = data.state.lock().await;
            data.finish(&mut state, ClientOutcome::Canceled)
        };
        if recorded {
            debug!(id=%data.id, "Client transaction canceled");
            data.unregister();
        }
    }

    /// Waits until the transaction reaches a terminal state.
    pub async fn wait_for_outcome(&self) -> ClientOutcome {
        let mut outcome_rx = self.data.outcome_tx.subscribe();
        loop {
            if let Some(outcome) = outcome_rx.borrow_and_update().clone() {
                return outcome;
            }
            // The sender lives as long as `self`, so this only fails if it
            // was dropped, which cannot happen while we hold the handle.
            if outcome_rx.changed().await.is_err() {
                return ClientOutcome::Canceled;
            }
        }
    }

    /// The terminal outcome, if one has been recorded.
    pub fn outcome(&self) -> Option<ClientOutcome> {
        self.data.outcome_tx.borrow().clone()
    }

    pub fn id(&self) -> TransactionId {
        self.data.id
    }

    pub fn request(&self) -> &Message {
        &self.data.request
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.data.local_addr
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.data.remote_addr
    }

    pub async fn state(&self) -> ClientTransactionState {
        self.data.state.lock().await.phase
    }

    /// How many times the request has been handed to the transport.
    pub async fn send_count(&self) -> u32 {
        self.data.state.lock().await.sends
    }

    /// When the next retransmission is due, if one is still scheduled.
    pub async fn next_retransmission(&self) -> Option<Instant> {
        self.data.state.lock().await.next_retransmission
    }

    /// When the transaction will time out if no response arrives.
    pub async fn expires_at(&self) -> Option<Instant> {
        self.data.state.lock().await.expires_at
    }
}

impl ClientTransactionData {
    /// Records a terminal outcome. Returns `false` if one was already recorded.
    fn finish(&self, state: &mut ClientState, outcome: ClientOutcome) -> bool {
        if state.phase.is_terminal() {
            return false;
        }
        trace!(id=%self.id, "State transition: {} -> {}", state.phase, outcome.state());
        state.phase = outcome.state();
        state.next_retransmission = None;
        self.outcome_tx.send_replace(Some(outcome));
        self.wake.notify_one();
        true
    }

    /// Never waits on the owner, so a slow consumer cannot stall the schedule.
    fn emit(&self, event: TransactionEvent) {
        if emit_event(&self.events_tx, event).is_err() {
            trace!(id=%self.id, "Event receiver gone");
        }
    }

    fn unregister(&self) {
        if let Some(dispatcher) = self.dispatcher.upgrade() {
            dispatcher.remove_client_transaction(&self.id);
        }
    }
}

/// Retransmits until the schedule is exhausted or the transaction finishes.
async fn run_retransmission_loop(
    data: Arc<ClientTransactionData>,
    mut schedule: RetransmissionSchedule,
    mut deadline: Instant,
) {
    trace!(id=%data.id, "Retransmission loop starting");
    loop {
        if sleep_until_or_woken(deadline, &data.wake).await == WaitOutcome::Woken {
            if data.state.lock().await.phase.is_terminal() {
                break;
            }
            continue;
        }

        let mut state = data.state.lock().await;
        if state.phase.is_terminal() {
            break;
        }

        if schedule.is_exhausted() {
            data.finish(&mut state, ClientOutcome::TimedOut);
            drop(state);
            debug!(id=%data.id, sends=schedule.sends(), "Client transaction timed out");
            data.emit(TransactionEvent::Timeout { transaction_id: data.id });
            data.unregister();
            break;
        }

        let result = data
            .transport
            .send_message(&data.request, data.local_addr, data.remote_addr)
            .await;
        state.sends += 1;
        let Some(wait) = schedule.next_wait() else {
            break;
        };
        deadline += wait;
        state.next_retransmission = (!schedule.is_exhausted()).then_some(deadline);
        trace!(id=%data.id, sends=state.sends, next_in=?wait, "Retransmitted request");
        drop(state);

        if let Err(e) = result {
            warn!(id=%data.id, error=%e, "Retransmission failed, keeping schedule");
            data.emit(TransactionEvent::TransportError {
                transaction_id: data.id,
                error: e.to_string(),
            });
        }
    }
    trace!(id=%data.id, "Retransmission loop ended");
}

impl fmt::Debug for ClientTransaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientTransaction")
            .field("id", &self.data.id)
            .field("remote_addr", &self.data.remote_addr)
            .field("outcome", &*self.data.outcome_tx.borrow())
            .finish()
    }
}
