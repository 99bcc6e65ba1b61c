//! Fixed-layout wire format for the multicast port. Every field is a big-endian (network order)
//!  `u32`, and every record kind has a fixed size, so there is no framing: the first field
//!  identifies the kind, and the datagram length must match that kind's size exactly.

use std::fmt::{Debug, Display, Formatter};

use bytes::{Buf, BufMut, BytesMut};
use num_enum::{IntoPrimitive, TryFromPrimitive};

use crate::messaging::roster::PeerId;

#[derive(Debug, Clone, Eq, PartialEq, thiserror::Error)]
pub enum WireError {
    #[error("malformed {kind:?} message: expected {expected} bytes, got {actual}")]
    MalformedMessage {
        kind: RecordKind,
        expected: usize,
        actual: usize,
    },
    #[error("unknown record kind {0}")]
    UnknownKind(u32),
    #[error("datagram of {0} bytes is too short to contain a record kind")]
    Truncated(usize),
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, TryFromPrimitive, IntoPrimitive)]
#[repr(u32)]
pub enum RecordKind {
    Data = 1,
    Ack = 2,
    Seq = 3,
    SeqAck = 4,
    Marker = 5,
}

impl RecordKind {
    /// Reads only the leading kind field, leaving interpretation of the rest to the caller.
    pub fn peek(buf: &[u8]) -> Result<RecordKind, WireError> {
        if buf.len() < size_of::<u32>() {
            return Err(WireError::Truncated(buf.len()));
        }
        let mut kind_buf = &buf[..size_of::<u32>()];
        let raw = kind_buf.get_u32();
        RecordKind::try_from(raw).map_err(|_| WireError::UnknownKind(raw))
    }
}

/// The identity of a multicast message across the whole group: the original sender plus the
///  sender-local message counter.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct MsgIdentity {
    pub sender: PeerId,
    pub msg_id: u32,
}
impl Debug for MsgIdentity {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}-{}", self.sender, self.msg_id)
    }
}
impl Display for MsgIdentity {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        Debug::fmt(self, f)
    }
}

pub trait WireMessage: Sized {
    const KIND: RecordKind;
    /// number of u32 fields including the leading kind
    const NUM_FIELDS: usize;
    const WIRE_SIZE: usize = Self::NUM_FIELDS * size_of::<u32>();

    /// writes all fields after the kind
    fn ser_fields(&self, buf: &mut impl BufMut);

    /// reads all fields after the kind; the buffer is guaranteed to hold exactly enough bytes
    fn deser_fields(buf: &mut impl Buf) -> Self;

    fn ser(&self, buf: &mut impl BufMut) {
        buf.put_u32(Self::KIND.into());
        self.ser_fields(buf);
    }

    fn to_bytes(&self) -> BytesMut {
        let mut buf = BytesMut::with_capacity(Self::WIRE_SIZE);
        self.ser(&mut buf);
        buf
    }

    fn deser(buf: &[u8]) -> Result<Self, WireError> {
        if buf.len() != Self::WIRE_SIZE {
            return Err(WireError::MalformedMessage {
                kind: Self::KIND,
                expected: Self::WIRE_SIZE,
                actual: buf.len(),
            });
        }

        let mut buf = buf;
        let kind = buf.get_u32();
        if kind != u32::from(Self::KIND) {
            return Err(match RecordKind::try_from(kind) {
                Ok(_) => WireError::MalformedMessage {
                    kind: Self::KIND,
                    expected: Self::WIRE_SIZE,
                    actual: buf.len() + size_of::<u32>(),
                },
                Err(_) => WireError::UnknownKind(kind),
            });
        }
        Ok(Self::deser_fields(&mut buf))
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub struct DataMessage {
    pub sender: PeerId,
    pub msg_id: u32,
    pub payload: u32,
}
impl DataMessage {
    pub fn identity(&self) -> MsgIdentity {
        MsgIdentity { sender: self.sender, msg_id: self.msg_id }
    }
}
impl WireMessage for DataMessage {
    const KIND: RecordKind = RecordKind::Data;
    const NUM_FIELDS: usize = 4;

    fn ser_fields(&self, buf: &mut impl BufMut) {
        buf.put_u32(self.sender.0);
        buf.put_u32(self.msg_id);
        buf.put_u32(self.payload);
    }

    fn deser_fields(buf: &mut impl Buf) -> Self {
        DataMessage {
            sender: PeerId(buf.get_u32()),
            msg_id: buf.get_u32(),
            payload: buf.get_u32(),
        }
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub struct AckMessage {
    /// the original sender of the acknowledged data message
    pub sender: PeerId,
    pub msg_id: u32,
    pub proposed_seq: u32,
    pub proposer: PeerId,
}
impl AckMessage {
    pub fn identity(&self) -> MsgIdentity {
        MsgIdentity { sender: self.sender, msg_id: self.msg_id }
    }
}
impl WireMessage for AckMessage {
    const KIND: RecordKind = RecordKind::Ack;
    const NUM_FIELDS: usize = 5;

    fn ser_fields(&self, buf: &mut impl BufMut) {
        buf.put_u32(self.sender.0);
        buf.put_u32(self.msg_id);
        buf.put_u32(self.proposed_seq);
        buf.put_u32(self.proposer.0);
    }

    fn deser_fields(buf: &mut impl Buf) -> Self {
        AckMessage {
            sender: PeerId(buf.get_u32()),
            msg_id: buf.get_u32(),
            proposed_seq: buf.get_u32(),
            proposer: PeerId(buf.get_u32()),
        }
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub struct SeqMessage {
    pub sender: PeerId,
    pub msg_id: u32,
    pub final_seq: u32,
    pub final_seq_proposer: PeerId,
}
impl SeqMessage {
    pub fn identity(&self) -> MsgIdentity {
        MsgIdentity { sender: self.sender, msg_id: self.msg_id }
    }
}
impl WireMessage for SeqMessage {
    const KIND: RecordKind = RecordKind::Seq;
    const NUM_FIELDS: usize = 5;

    fn ser_fields(&self, buf: &mut impl BufMut) {
        buf.put_u32(self.sender.0);
        buf.put_u32(self.msg_id);
        buf.put_u32(self.final_seq);
        buf.put_u32(self.final_seq_proposer.0);
    }

    fn deser_fields(buf: &mut impl Buf) -> Self {
        SeqMessage {
            sender: PeerId(buf.get_u32()),
            msg_id: buf.get_u32(),
            final_seq: buf.get_u32(),
            final_seq_proposer: PeerId(buf.get_u32()),
        }
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub struct SeqAckMessage {
    pub sender: PeerId,
    pub msg_id: u32,
    pub ack_sender: PeerId,
}
impl SeqAckMessage {
    pub fn identity(&self) -> MsgIdentity {
        MsgIdentity { sender: self.sender, msg_id: self.msg_id }
    }
}
impl WireMessage for SeqAckMessage {
    const KIND: RecordKind = RecordKind::SeqAck;
    const NUM_FIELDS: usize = 4;

    fn ser_fields(&self, buf: &mut impl BufMut) {
        buf.put_u32(self.sender.0);
        buf.put_u32(self.msg_id);
        buf.put_u32(self.ack_sender.0);
    }

    fn deser_fields(buf: &mut impl Buf) -> Self {
        SeqAckMessage {
            sender: PeerId(buf.get_u32()),
            msg_id: buf.get_u32(),
            ack_sender: PeerId(buf.get_u32()),
        }
    }
}

/// Chandy-Lamport marker, only carried through the codec for the snapshot collaborator
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub struct MarkerMessage {
    pub sender: PeerId,
}
impl WireMessage for MarkerMessage {
    const KIND: RecordKind = RecordKind::Marker;
    const NUM_FIELDS: usize = 2;

    fn ser_fields(&self, buf: &mut impl BufMut) {
        buf.put_u32(self.sender.0);
    }

    fn deser_fields(buf: &mut impl Buf) -> Self {
        MarkerMessage {
            sender: PeerId(buf.get_u32()),
        }
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Record {
    Data(DataMessage),
    Ack(AckMessage),
    Seq(SeqMessage),
    SeqAck(SeqAckMessage),
    Marker(MarkerMessage),
}
impl Record {
    pub fn kind(&self) -> RecordKind {
        match self {
            Record::Data(_) => RecordKind::Data,
            Record::Ack(_) => RecordKind::Ack,
            Record::Seq(_) => RecordKind::Seq,
            Record::SeqAck(_) => RecordKind::SeqAck,
            Record::Marker(_) => RecordKind::Marker,
        }
    }

    pub fn encode(&self) -> BytesMut {
        match self {
            Record::Data(m) => m.to_bytes(),
            Record::Ack(m) => m.to_bytes(),
            Record::Seq(m) => m.to_bytes(),
            Record::SeqAck(m) => m.to_bytes(),
            Record::Marker(m) => m.to_bytes(),
        }
    }

    pub fn decode(buf: &[u8]) -> Result<Record, WireError> {
        Ok(match RecordKind::peek(buf)? {
            RecordKind::Data => Record::Data(DataMessage::deser(buf)?),
            RecordKind::Ack => Record::Ack(AckMessage::deser(buf)?),
            RecordKind::Seq => Record::Seq(SeqMessage::deser(buf)?),
            RecordKind::SeqAck => Record::SeqAck(SeqAckMessage::deser(buf)?),
            RecordKind::Marker => Record::Marker(MarkerMessage::deser(buf)?),
        })
    }
}
