use std::fmt::{Debug, Formatter};
use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::{broadcast, RwLock};

use crate::messaging::control::ControlMessage;
use crate::messaging::transport::{MessageHandler, Transport};
use crate::messaging::wire::Record;

/// A [Transport] that does not send anything but records outgoing datagrams for later
///  assertions. Its receive loop only waits for cancellation.
pub struct TrackingTransport {
    myself: SocketAddr,
    tracker: Arc<RwLock<Vec<(SocketAddr, Bytes)>>>,
    cancel_sender: broadcast::Sender<()>,
}
impl Debug for TrackingTransport {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "TrackingTransport{{{:?}}}", self.myself)
    }
}

impl TrackingTransport {
    pub fn new(myself: SocketAddr) -> Self {
        TrackingTransport {
            myself,
            tracker: Default::default(),
            cancel_sender: broadcast::channel(1).0,
        }
    }

    async fn next_sent(&self) -> (SocketAddr, Bytes) {
        let mut lock = self.tracker.write().await;
        if lock.is_empty() {
            panic!("no message was sent");
        }
        lock.remove(0)
    }

    pub async fn assert_record_sent(&self, to: SocketAddr, record: Record) {
        let (actual_to, buf) = self.next_sent().await;
        match Record::decode(&buf) {
            Ok(actual) => {
                assert_eq!(actual, record);
                assert_eq!(actual_to, to);
            }
            Err(e) => panic!("expected record {:?}, was undecodable: {}", record, e),
        }
    }

    pub async fn assert_control_sent(&self, to: SocketAddr, msg: ControlMessage) {
        let (actual_to, buf) = self.next_sent().await;
        match ControlMessage::deser(&buf) {
            Ok(actual) => {
                assert_eq!(actual, msg);
                assert_eq!(actual_to, to);
            }
            Err(e) => panic!("expected control message {:?}, was undecodable: {}", msg, e),
        }
    }

    /// All recorded datagrams in the order they were sent, removing them from the tracker
    pub async fn take_sent(&self) -> Vec<(SocketAddr, Bytes)> {
        std::mem::take(&mut *self.tracker.write().await)
    }

    pub async fn assert_no_remaining_messages(&self) {
        let lock = self.tracker.read().await;
        assert!(lock.is_empty(), "unexpected messages: {:?}", lock);
    }
}

#[async_trait]
impl Transport for TrackingTransport {
    fn self_addr(&self) -> SocketAddr {
        self.myself
    }

    async fn send(&self, to: SocketAddr, buf: &[u8]) -> anyhow::Result<()> {
        self.tracker.write().await.push((to, Bytes::copy_from_slice(buf)));
        Ok(())
    }

    async fn recv_loop(&self, _handler: Arc<dyn MessageHandler>) -> anyhow::Result<()> {
        let mut cancel_receiver = self.cancel_sender.subscribe();
        let _ = cancel_receiver.recv().await;
        Ok(())
    }

    fn cancel_recv_loop(&self) {
        let _ = self.cancel_sender.send(());
    }
}
