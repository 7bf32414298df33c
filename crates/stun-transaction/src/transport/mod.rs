//! The send path consumed by transactions.
//!
//! Transactions only ever need "send this message from here to there"; how
//! sockets are bound and how datagrams are received is up to the
//! implementation. [`UdpTransport`] is the default one.

pub mod udp;

use std::fmt;
use std::net::SocketAddr;

use async_trait::async_trait;

use crate::error::Result;
use crate::message::Message;

pub use udp::UdpTransport;

/// Best-effort message delivery.
///
/// A successful return only means the message was handed to the network;
/// there is no delivery or ordering guarantee across calls. Encoding
/// failures surface as [`crate::Error::Encode`] and socket failures as
/// [`crate::Error::Transport`] or [`crate::Error::Io`].
#[async_trait]
pub trait Transport: Send + Sync + fmt::Debug {
    /// Sends `message` through the socket bound to `local_addr` to `remote_addr`.
    async fn send_message(&self, message: &Message, local_addr: SocketAddr, remote_addr: SocketAddr) -> Result<()>;
}
