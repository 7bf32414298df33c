use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::net::UdpSocket;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

use crate::error::{Error, Result};
use crate::manager::TransactionManager;
use crate::message::Message;
use crate::transport::Transport;

// Largest datagram we accept
const MAX_DATAGRAM_SIZE: usize = 65_535;

/// UDP transport for STUN messages.
///
/// One transport may own several sockets, each addressed by the local
/// address it is bound to. Sends pick the socket by the `local_addr` the
/// transaction was created with.
#[derive(Clone, Default)]
pub struct UdpTransport {
    inner: Arc<UdpTransportInner>,
}

#[derive(Default)]
struct UdpTransportInner {
    sockets: DashMap<SocketAddr, Arc<UdpSocket>>,
    closed: AtomicBool,
    shutdown: Notify,
}

impl UdpTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Binds a socket to `addr` and returns the address it actually got
    /// (useful with port 0).
    pub async fn bind(&self, addr: SocketAddr) -> Result<SocketAddr> {
        if self.is_closed() {
            return Err(Error::Transport("transport is closed".to_string()));
        }
        let socket = UdpSocket::bind(addr)
            .await
            .map_err(|e| Error::transport_error(e, &format!("failed to bind {}", addr)))?;
        let local_addr = socket.local_addr()?;
        self.inner.sockets.insert(local_addr, Arc::new(socket));
        info!("STUN UDP transport bound to {}", local_addr);
        Ok(local_addr)
    }

    /// Local addresses of all bound sockets.
    pub fn local_addrs(&self) -> Vec<SocketAddr> {
        self.inner.sockets.iter().map(|e| *e.key()).collect()
    }

    fn socket(&self, local_addr: &SocketAddr) -> Result<Arc<UdpSocket>> {
        self.inner
            .sockets
            .get(local_addr)
            .map(|e| e.value().clone())
            .ok_or_else(|| Error::Transport(format!("no socket bound to {}", local_addr)))
    }

    /// Spawns a task feeding every datagram received on the socket bound to
    /// `local_addr` into `manager`.
    ///
    /// Datagrams that do not decode as STUN are logged and skipped. The task
    /// ends when the transport is closed or the manager's event channel is
    /// gone.
    pub fn spawn_receive_loop(&self, local_addr: SocketAddr, manager: TransactionManager) -> Result<JoinHandle<()>> {
        let socket = self.socket(&local_addr)?;
        let transport = self.clone();

        Ok(tokio::spawn(async move {
            let inner = &transport.inner;
            let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];

            while !inner.closed.load(Ordering::Relaxed) {
                let received = tokio::select! {
                    result = socket.recv_from(&mut buf) => result,
                    _ = inner.shutdown.notified() => break,
                };

                let (len, source) = match received {
                    Ok(r) => r,
                    Err(e) => {
                        if inner.closed.load(Ordering::Relaxed) {
                            break;
                        }
                        error!("Error receiving UDP packet on {}: {}", local_addr, e);
                        continue;
                    }
                };

                let message = match Message::decode(&buf[..len]) {
                    Ok(m) => m,
                    Err(e) => {
                        debug!("Ignoring {} byte datagram from {}: {}", len, source, e);
                        continue;
                    }
                };
                trace!("Received {:?} from {}", message, source);

                match manager.handle_message(message, local_addr, source).await {
                    Ok(()) => {}
                    Err(Error::ChannelClosed) => {
                        debug!("Event channel closed, stopping receive loop on {}", local_addr);
                        break;
                    }
                    Err(e) => warn!("Error handling message from {}: {}", source, e),
                }
            }

            info!("UDP receive loop on {} terminated", local_addr);
        }))
    }

    /// Closes the transport: later sends fail and receive loops stop.
    pub fn close(&self) {
        self.inner.closed.store(true, Ordering::Relaxed);
        self.inner.shutdown.notify_waiters();
        self.inner.sockets.clear();
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl Transport for UdpTransport {
    async fn send_message(&self, message: &Message, local_addr: SocketAddr, remote_addr: SocketAddr) -> Result<()> {
        if self.is_closed() {
            return Err(Error::Transport("transport is closed".to_string()));
        }
        let bytes = message.encode()?;
        let socket = self.socket(&local_addr)?;

        trace!("Sending {} byte message to {}", bytes.len(), remote_addr);
        socket
            .send_to(&bytes, remote_addr)
            .await
            .map_err(|e| Error::transport_error(e, &format!("failed to send to {}", remote_addr)))?;
        Ok(())
    }
}

impl fmt::Debug for UdpTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "UdpTransport({:?})", self.local_addrs())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn send_without_bound_socket_fails() {
        let transport = UdpTransport::new();
        let local: SocketAddr = "127.0.0.1:3478".parse().unwrap();
        let remote: SocketAddr = "127.0.0.1:3479".parse().unwrap();

        let err = transport
            .send_message(&Message::binding_request(), local, remote)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Transport(_)));
    }

    #[tokio::test]
    async fn datagram_reaches_peer_socket() {
        let transport = UdpTransport::new();
        let local = transport.bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
        let peer = UdpSocket::bind("127.0.0.1:0").await.unwrap();

        let request = Message::binding_request();
        transport
            .send_message(&request, local, peer.local_addr().unwrap())
            .await
            .unwrap();

        let mut buf = [0u8; 1500];
        let (len, from) = peer.recv_from(&mut buf).await.unwrap();
        assert_eq!(from, local);
        assert_eq!(Message::decode(&buf[..len]).unwrap(), request);
    }

    #[tokio::test]
    async fn closed_transport_rejects_sends() {
        let transport = UdpTransport::new();
        let local = transport.bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
        transport.close();

        assert!(transport.is_closed());
        assert!(transport.local_addrs().is_empty());
        let result = transport
            .send_message(&Message::binding_request(), local, "127.0.0.1:9".parse().unwrap())
            .await;
        assert!(result.is_err());
    }
}
