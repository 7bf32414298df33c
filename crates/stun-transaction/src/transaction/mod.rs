//! Identifiers, states and events shared by client and server transactions.
//!
//! This module also defines [`Dispatcher`], the capability a transaction uses
//! to take itself out of the registry that owns it once it reaches the end of
//! its life.

pub mod id;
pub mod state;

use std::net::SocketAddr;

use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::warn;

use crate::error::{Error, Result};
use crate::message::Message;

pub use id::{TransactionId, TRANSACTION_ID_LEN};
pub use state::{ClientOutcome, ClientTransactionState, ServerTransactionState};

/// Events delivered from the transaction layer to its owner (the "TU").
#[derive(Debug, Clone)]
pub enum TransactionEvent {
    /// A response matching an outstanding client transaction arrived.
    ResponseReceived {
        transaction_id: TransactionId,
        response: Message,
        remote_addr: SocketAddr,
    },

    /// A client transaction ran out of retransmissions without an answer.
    Timeout { transaction_id: TransactionId },

    /// A send attempt failed. The transaction keeps its schedule.
    TransportError {
        transaction_id: TransactionId,
        error: String,
    },

    /// A new request arrived and needs an answer from the application.
    /// Retransmissions of the same request are never reported.
    RequestReceived {
        transaction_id: TransactionId,
        request: Message,
        local_addr: SocketAddr,
        source: SocketAddr,
    },

    /// An indication arrived. Indications have no transaction.
    IndicationReceived {
        message: Message,
        local_addr: SocketAddr,
        source: SocketAddr,
    },

    /// A transaction left its registry.
    TransactionTerminated {
        transaction_id: TransactionId,
        is_server: bool,
    },
}

impl TransactionEvent {
    /// The transaction this event is about, if any.
    pub fn transaction_id(&self) -> Option<TransactionId> {
        match self {
            TransactionEvent::ResponseReceived { transaction_id, .. }
            | TransactionEvent::Timeout { transaction_id }
            | TransactionEvent::TransportError { transaction_id, .. }
            | TransactionEvent::RequestReceived { transaction_id, .. }
            | TransactionEvent::TransactionTerminated { transaction_id, .. } => Some(*transaction_id),
            TransactionEvent::IndicationReceived { .. } => None,
        }
    }
}

/// Queues `event` for the owner without waiting for channel capacity.
///
/// Timers and inbound routing must keep running when the owner falls behind,
/// so a full channel drops the event with a warning. Only a closed channel is
/// reported, as [`Error::ChannelClosed`].
pub(crate) fn emit_event(events_tx: &mpsc::Sender<TransactionEvent>, event: TransactionEvent) -> Result<()> {
    match events_tx.try_send(event) {
        Ok(()) => Ok(()),
        Err(TrySendError::Full(event)) => {
            warn!(id=?event.transaction_id(), "Event channel full, dropping {:?}", event);
            Ok(())
        }
        Err(TrySendError::Closed(_)) => Err(Error::ChannelClosed),
    }
}

/// Registry capability handed to every transaction.
///
/// Each transaction calls the matching removal method at most once, when it
/// reaches a terminal state. Implementations must tolerate an ID that is no
/// longer present, or that by now belongs to a newer transaction.
pub trait Dispatcher: Send + Sync {
    /// Drops a finished client transaction from the outbound registry.
    fn remove_client_transaction(&self, id: &TransactionId);

    /// Drops an expired server transaction from the inbound registry.
    fn remove_server_transaction(&self, id: &TransactionId);
}
