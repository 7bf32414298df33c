//! # STUN Transaction Layer for RVOIP
//!
//! This crate provides the transaction layer of a STUN stack (RFC 5389,
//! Section 7), sitting between a datagram transport and the STUN logic that
//! builds and answers messages.
//!
//! ## What it does
//!
//! - **Client transactions** make one outgoing request reliable over an
//!   unreliable transport. The request is retransmitted with exponential
//!   backoff (100 ms initial RTO, doubling up to 1.6 s, 9 sends in total)
//!   until a matching response arrives, the owner cancels, or the
//!   transaction times out 9.5 s after the first send.
//! - **Server transactions** cache the first response to an inbound request
//!   and replay it for every retransmission of that request, so the
//!   application processes each request exactly once. They expire 16 s
//!   after creation.
//! - The **[`TransactionManager`]** keeps the registries of active
//!   transactions, routes inbound messages by their 96-bit transaction ID,
//!   and reports what happened through [`TransactionEvent`]s.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────┐
//! │ Application (STUN usage)     │
//! └──────────────┬───────────────┘
//!                │ TransactionEvent / send_request / send_response
//! ┌──────────────▼───────────────┐
//! │ TransactionManager           │
//! │  ├─ ClientTransaction (task) │
//! │  └─ ServerTransaction (task) │
//! └──────────────┬───────────────┘
//!                │ Transport::send_message / handle_message
//! ┌──────────────▼───────────────┐
//! │ UdpTransport                 │
//! └──────────────────────────────┘
//! ```
//!
//! Each transaction runs its timers on its own tokio task. A single lock per
//! transaction serializes sends with terminal transitions, so no message is
//! ever sent after a transaction was answered, canceled, timed out or
//! expired.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use rvoip_stun_transaction::prelude::*;
//!
//! # async fn example() -> Result<()> {
//! let transport = UdpTransport::new();
//! let local = transport.bind("0.0.0.0:0".parse().unwrap()).await?;
//! let (manager, _events) = TransactionManager::new(Arc::new(transport.clone()), None);
//! transport.spawn_receive_loop(local, manager.clone())?;
//!
//! let server = "192.0.2.1:3478".parse().unwrap();
//! let transaction = manager.send_request(Message::binding_request(), local, server).await?;
//! match transaction.wait_for_outcome().await {
//!     ClientOutcome::Answered(response) => println!("answered: {:?}", response),
//!     ClientOutcome::TimedOut => println!("no answer"),
//!     ClientOutcome::Canceled => {}
//! }
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod error;
pub mod manager;
pub mod message;
pub mod server;
pub mod timer;
pub mod transaction;
pub mod transport;

pub use client::ClientTransaction;
pub use error::{Error, Result};
pub use manager::TransactionManager;
pub use message::{Message, MessageClass};
pub use server::ServerTransaction;
pub use timer::{RetransmissionSchedule, TimerSettings};
pub use transaction::{
    ClientOutcome, ClientTransactionState, Dispatcher, ServerTransactionState, TransactionEvent, TransactionId,
};
pub use transport::{Transport, UdpTransport};

/// Re-export of common types for convenience
pub mod prelude {
    pub use crate::client::ClientTransaction;
    pub use crate::error::{Error, Result};
    pub use crate::manager::TransactionManager;
    pub use crate::message::{Message, MessageClass, BINDING_METHOD};
    pub use crate::server::ServerTransaction;
    pub use crate::timer::TimerSettings;
    pub use crate::transaction::{
        ClientOutcome, ClientTransactionState, ServerTransactionState, TransactionEvent, TransactionId,
    };
    pub use crate::transport::{Transport, UdpTransport};
}
