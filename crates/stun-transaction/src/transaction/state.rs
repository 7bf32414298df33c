use std::fmt;

use crate::message::Message;

/// State of a client transaction.
///
/// ```text
/// Scheduled -> Retransmitting -> { Answered | TimedOut | Canceled }
/// ```
///
/// A transaction may also be canceled straight from `Scheduled`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ClientTransactionState {
    /// Created but `start()` has not been called yet.
    Scheduled,
    /// The request has been sent at least once and retransmissions are running.
    Retransmitting,
    /// A matching response was delivered.
    Answered,
    /// No response arrived before the final deadline.
    TimedOut,
    /// The owner canceled the transaction.
    Canceled,
}

impl ClientTransactionState {
    /// Terminal states accept no further transitions.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ClientTransactionState::Answered
                | ClientTransactionState::TimedOut
                | ClientTransactionState::Canceled
        )
    }
}

impl fmt::Display for ClientTransactionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClientTransactionState::Scheduled => write!(f, "Scheduled"),
            ClientTransactionState::Retransmitting => write!(f, "Retransmitting"),
            ClientTransactionState::Answered => write!(f, "Answered"),
            ClientTransactionState::TimedOut => write!(f, "TimedOut"),
            ClientTransactionState::Canceled => write!(f, "Canceled"),
        }
    }
}

/// State of a server transaction.
///
/// ```text
/// AwaitingFirstResponse -> Retransmitting -> Expired
/// ```
///
/// `Expired` is reachable from both earlier states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ServerTransactionState {
    /// The request was seen but the application has not answered yet.
    AwaitingFirstResponse,
    /// A response is cached and is replayed for every duplicate request.
    Retransmitting,
    /// Lifetime over or explicitly expired; all sends are discarded.
    Expired,
}

impl ServerTransactionState {
    pub fn is_terminal(&self) -> bool {
        *self == ServerTransactionState::Expired
    }
}

impl fmt::Display for ServerTransactionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServerTransactionState::AwaitingFirstResponse => write!(f, "AwaitingFirstResponse"),
            ServerTransactionState::Retransmitting => write!(f, "Retransmitting"),
            ServerTransactionState::Expired => write!(f, "Expired"),
        }
    }
}

/// The single logical outcome a client transaction reports to its owner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientOutcome {
    /// A response matching the transaction ID arrived.
    Answered(Message),
    /// The retransmission schedule ran out without a response.
    TimedOut,
    /// The transaction was canceled before an answer arrived.
    Canceled,
}

impl ClientOutcome {
    /// The state a transaction ends up in when recording this outcome.
    pub fn state(&self) -> ClientTransactionState {
        match self {
            ClientOutcome::Answered(_) => ClientTransactionState::Answered,
            ClientOutcome::TimedOut => ClientTransactionState::TimedOut,
            ClientOutcome::Canceled => ClientTransactionState::Canceled,
        }
    }

    /// The response, if the transaction was answered.
    pub fn response(&self) -> Option<&Message> {
        match self {
            ClientOutcome::Answered(response) => Some(response),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_states() {
        assert!(!ClientTransactionState::Scheduled.is_terminal());
        assert!(!ClientTransactionState::Retransmitting.is_terminal());
        assert!(ClientTransactionState::Answered.is_terminal());
        assert!(ClientTransactionState::TimedOut.is_terminal());
        assert!(ClientTransactionState::Canceled.is_terminal());

        assert!(!ServerTransactionState::AwaitingFirstResponse.is_terminal());
        assert!(!ServerTransactionState::Retransmitting.is_terminal());
        assert!(ServerTransactionState::Expired.is_terminal());
    }

    #[test]
    fn outcome_maps_to_state() {
        assert_eq!(ClientOutcome::TimedOut.state(), ClientTransactionState::TimedOut);
        assert_eq!(ClientOutcome::Canceled.state(), ClientTransactionState::Canceled);
        assert!(ClientOutcome::Canceled.response().is_none());
    }
}
