use std::sync::Arc;

use anyhow::anyhow;
use async_trait::async_trait;
use bytes::{Buf, BufMut, BytesMut};
use num_enum::{IntoPrimitive, TryFromPrimitive};
use std::net::SocketAddr;
use tokio::sync::mpsc;
use tracing::warn;

use crate::messaging::roster::PeerId;
use crate::messaging::transport::MessageHandler;

/// Control-plane records exchanged on the probing and heartbeat ports. They never share a
///  socket with the multicast records.
#[derive(Debug, Copy, Clone, Eq, PartialEq, TryFromPrimitive, IntoPrimitive)]
#[repr(u32)]
pub enum ControlKind {
    Alive = 1,
    AliveAck = 2,
    Heartbeat = 6,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum ControlMessage {
    Alive(PeerId),
    AliveAck(PeerId),
    Heartbeat(PeerId),
}

impl ControlMessage {
    pub const WIRE_SIZE: usize = 2 * size_of::<u32>();

    pub fn kind(&self) -> ControlKind {
        match self {
            ControlMessage::Alive(_) => ControlKind::Alive,
            ControlMessage::AliveAck(_) => ControlKind::AliveAck,
            ControlMessage::Heartbeat(_) => ControlKind::Heartbeat,
        }
    }

    pub fn peer(&self) -> PeerId {
        match self {
            ControlMessage::Alive(p) | ControlMessage::AliveAck(p) | ControlMessage::Heartbeat(p) => *p,
        }
    }

    pub fn ser(&self, buf: &mut impl BufMut) {
        buf.put_u32(self.kind().into());
        buf.put_u32(self.peer().0);
    }

    pub fn to_bytes(&self) -> BytesMut {
        let mut buf = BytesMut::with_capacity(Self::WIRE_SIZE);
        self.ser(&mut buf);
        buf
    }

    pub fn deser(buf: &[u8]) -> anyhow::Result<ControlMessage> {
        if buf.len() != Self::WIRE_SIZE {
            return Err(anyhow!("control message must be {} bytes, was {}", Self::WIRE_SIZE, buf.len()));
        }
        let mut buf = buf;
        let raw_kind = buf.get_u32();
        let peer = PeerId(buf.get_u32());

        match ControlKind::try_from(raw_kind) {
            Ok(ControlKind::Alive) => Ok(ControlMessage::Alive(peer)),
            Ok(ControlKind::AliveAck) => Ok(ControlMessage::AliveAck(peer)),
            Ok(ControlKind::Heartbeat) => Ok(ControlMessage::Heartbeat(peer)),
            Err(_) => Err(anyhow!("invalid control message discriminator {}", raw_kind)),
        }
    }
}

/// Decodes control datagrams and forwards them to a processing loop
pub struct ControlMessageModule {
    channel: mpsc::Sender<(SocketAddr, ControlMessage)>,
}
impl ControlMessageModule {
    pub fn new(channel: mpsc::Sender<(SocketAddr, ControlMessage)>) -> Arc<ControlMessageModule> {
        Arc::new(ControlMessageModule { channel })
    }

    async fn _on_message(&self, buf: &[u8], sender: SocketAddr) -> anyhow::Result<()> {
        let msg = ControlMessage::deser(buf)?;
        self.channel.send((sender, msg)).await?;
        Ok(())
    }
}

#[async_trait]
impl MessageHandler for ControlMessageModule {
    async fn handle_message(&self, buf: &[u8], sender: SocketAddr) {
        if let Err(e) = self._on_message(buf, sender).await {
            warn!("dropping control message from {:?}: {}", sender, e);
        }
    }
}
