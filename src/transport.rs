//! Datagram transport under a connection
//!
//! The connection only needs to hand finished datagrams to something that
//! delivers them to the peer. [`MemoryTransport`] is an in-process pair
//! used by tests and the loopback handshake.

use async_trait::async_trait;
use bytes::Bytes;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, trace};

use crate::quic::connection::Connection;
use crate::quic::error::{ConnectionError, Result};

#[async_trait]
pub trait Transport: Send + Sync {
    /// Deliver one datagram to the peer
    async fn send(&self, datagram: Bytes) -> Result<()>;

    fn peer_addr(&self) -> SocketAddr;

    fn local_addr(&self) -> SocketAddr;

    /// Stop sending; later sends fail
    async fn close(&self);
}

/// One end of an in-memory datagram link
#[derive(Debug)]
pub struct MemoryTransport {
    local: SocketAddr,
    peer: SocketAddr,
    tx: mpsc::UnboundedSender<Bytes>,
    rx: Mutex<mpsc::UnboundedReceiver<Bytes>>,
    closed: AtomicBool,
}

impl MemoryTransport {
    /// Two linked ends: what one sends, the other receives
    pub fn pair(a: SocketAddr, b: SocketAddr) -> (Arc<Self>, Arc<Self>) {
        let (a_tx, b_rx) = mpsc::unbounded_channel();
        let (b_tx, a_rx) = mpsc::unbounded_channel();
        let first = Self { local: a, peer: b, tx: a_tx, rx: Mutex::new(a_rx), closed: AtomicBool::new(false) };
        let second = Self { local: b, peer: a, tx: b_tx, rx: Mutex::new(b_rx), closed: AtomicBool::new(false) };
        (Arc::new(first), Arc::new(second))
    }

    /// Next datagram from the peer, `None` once the peer end is gone
    pub async fn recv(&self) -> Option<Bytes> {
        self.rx.lock().await.recv().await
    }

    /// Next datagram if one is already queued
    pub async fn try_recv(&self) -> Option<Bytes> {
        self.rx.lock().await.try_recv().ok()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn send(&self, datagram: Bytes) -> Result<()> {
        if self.is_closed() {
            return Err(ConnectionError::Closed.into());
        }
        trace!("{} -> {}: {} bytes", self.local, self.peer, datagram.len());
        // a vanished peer looks like loss on a real network
        if self.tx.send(datagram).is_err() {
            debug!("datagram to {} dropped, peer gone", self.peer);
        }
        Ok(())
    }

    fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    fn local_addr(&self) -> SocketAddr {
        self.local
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }
}

/// Feed every datagram arriving on `transport` into `connection` until the
/// link goes away or the connection is closed
pub fn pump(transport: Arc<MemoryTransport>, connection: Arc<Connection>) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(datagram) = transport.recv().await {
            connection.receive(&datagram).await;
            if connection.state() == crate::quic::state::State::Closed {
                break;
            }
        }
        debug!("pump for {} stopped", transport.local_addr());
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addrs() -> (SocketAddr, SocketAddr) {
        ("127.0.0.1:5000".parse().unwrap(), "127.0.0.1:5001".parse().unwrap())
    }

    #[tokio::test]
    async fn test_pair_delivers_in_order() {
        let (a, b) = addrs();
        let (left, right) = MemoryTransport::pair(a, b);
        assert_eq!(left.peer_addr(), b);
        assert_eq!(right.peer_addr(), a);

        left.send(Bytes::from_static(b"one")).await.unwrap();
        left.send(Bytes::from_static(b"two")).await.unwrap();
        assert_eq!(right.recv().await.unwrap(), Bytes::from_static(b"one"));
        assert_eq!(right.recv().await.unwrap(), Bytes::from_static(b"two"));
        assert!(right.try_recv().await.is_none());
    }

    #[tokio::test]
    async fn test_closed_end_refuses_sends() {
        let (a, b) = addrs();
        let (left, right) = MemoryTransport::pair(a, b);
        tokio_test::assert_ok!(left.send(Bytes::from_static(b"early")).await);
        left.close().await;
        assert!(left.is_closed());
        tokio_test::assert_err!(left.send(Bytes::from_static(b"late")).await);
        assert_eq!(right.recv().await.unwrap(), Bytes::from_static(b"early"));
    }

    #[tokio::test]
    async fn test_send_to_dropped_peer_is_loss() {
        let (a, b) = addrs();
        let (left, right) = MemoryTransport::pair(a, b);
        drop(right);
        tokio_test::assert_ok!(left.send(Bytes::from_static(b"lost")).await);
    }
}
