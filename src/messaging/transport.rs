use std::fmt::{Debug, Formatter};
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::UdpSocket;
use tokio::sync::broadcast;
use tracing::{error, trace, warn};

/// Datagrams larger than this are truncated by the receiver. All records of the multicast
///  protocol are far smaller.
pub const MAX_DATAGRAM_SIZE: usize = 1024;

/// Best-effort datagram transport: no delivery, ordering or duplication guarantees.
#[async_trait::async_trait]
pub trait Transport: Sync + Send + 'static {
    fn self_addr(&self) -> SocketAddr;

    async fn send(&self, to: SocketAddr, buf: &[u8]) -> anyhow::Result<()>;

    /// Blocks receiving datagrams, handing each one to `handler` in turn. Returns only when
    ///  cancelled or on a socket error.
    async fn recv_loop(&self, handler: Arc<dyn MessageHandler>) -> anyhow::Result<()>;

    fn cancel_recv_loop(&self);
}

/// This trait decouples the transport implementation from the handling of a datagram once it
///  is received.
///
/// It is passed around as an `Arc<dyn ...>` to minimize dependencies of [Transport] implementations.
#[async_trait::async_trait]
pub trait MessageHandler: Sync + Send {
    async fn handle_message(&self, buf: &[u8], sender: SocketAddr);
}

/// A single UDP socket bound to a well-known port, used both for sending and receiving so that
///  the source address of outgoing datagrams is the peer's well-known address.
pub struct UdpTransport {
    self_addr: SocketAddr,
    socket: UdpSocket,
    cancel_sender: broadcast::Sender<()>,
}
impl Debug for UdpTransport {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "UdpTransport{{{:?}}}", self.self_addr)
    }
}

impl UdpTransport {
    pub async fn bind(self_addr: SocketAddr) -> anyhow::Result<UdpTransport> {
        let socket = UdpSocket::bind(self_addr).await?;
        let (cancel_sender, _) = broadcast::channel(1);

        Ok(UdpTransport {
            self_addr: socket.local_addr()?,
            socket,
            cancel_sender,
        })
    }
}

#[async_trait::async_trait]
impl Transport for UdpTransport {
    fn self_addr(&self) -> SocketAddr {
        self.self_addr
    }

    async fn send(&self, to: SocketAddr, buf: &[u8]) -> anyhow::Result<()> {
        trace!(?to, len = buf.len(), "sending datagram");
        self.socket.send_to(buf, to).await?;
        Ok(())
    }

    async fn recv_loop(&self, handler: Arc<dyn MessageHandler>) -> anyhow::Result<()> {
        let mut buf = [0u8; MAX_DATAGRAM_SIZE];
        let mut cancel_receiver = self.cancel_sender.subscribe();

        trace!("starting UDP receive loop on {:?}", self.self_addr);

        loop {
            tokio::select! {
                r = self.socket.recv_from(&mut buf) => {
                    match r {
                        Ok((len, from)) => {
                            trace!(?from, len, "received datagram");
                            handler.handle_message(&buf[..len], from).await;
                        }
                        Err(e) => {
                            error!(error = ?e, "error receiving from datagram socket");
                            return Err(e.into());
                        }
                    }
                }
                _ = cancel_receiver.recv() => break,
            }
        }

        Ok(())
    }

    fn cancel_recv_loop(&self) {
        if let Err(err) = self.cancel_sender.send(()) {
            warn!(?err, "error canceling receive loop");
        }
    }
}
