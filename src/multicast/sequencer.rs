use std::collections::{BTreeMap, BTreeSet};

use anyhow::anyhow;
use rustc_hash::FxHashMap;
use tracing::{debug, info, warn};

use crate::messaging::roster::PeerId;
use crate::messaging::wire::{AckMessage, DataMessage, MsgIdentity, SeqAckMessage, SeqMessage};
use crate::multicast::hold_back_queue::HoldBackQueue;

/// A message whose final sequence number was just decided by this process (as its original
///  sender), together with the messages that became deliverable locally as a consequence.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Finalized {
    pub seq: SeqMessage,
    pub delivered: Vec<DataMessage>,
}

/// The message ids of one sender that were delivered locally: everything up to `contiguous`, plus
///  the ids above it that were delivered out of order.
#[derive(Debug, Default)]
struct DeliveredIds {
    contiguous: u32,
    above: BTreeSet<u32>,
}

impl DeliveredIds {
    fn insert(&mut self, msg_id: u32) {
        if msg_id <= self.contiguous {
            return;
        }
        self.above.insert(msg_id);
        while let Some(next) = self.contiguous.checked_add(1) {
            if !self.above.remove(&next) {
                break;
            }
            self.contiguous = next;
        }
    }

    fn contains(&self, msg_id: u32) -> bool {
        msg_id <= self.contiguous || self.above.contains(&msg_id)
    }
}

/// Picks the biggest proposed sequence number, breaking ties toward the smaller proposer id
pub fn choose_final_seq(proposals: &BTreeMap<PeerId, u32>) -> Option<(u32, PeerId)> {
    proposals.iter()
        .max_by(|(p1, s1), (p2, s2)| s1.cmp(s2).then_with(|| p2.cmp(p1)))
        .map(|(&proposer, &seq)| (seq, proposer))
}

/// The protocol state of one process, without any I/O: operations return the records to send
///  and the messages to deliver, and the caller does the rest.
///
/// The originating process of a message is one of its proposers: it assigns its own
///  provisional sequence number when multicasting and applies its own final sequence number
///  locally, so the final number is the maximum over *all* live group members' proposals.
#[derive(Debug)]
pub struct Sequencer {
    myself: PeerId,
    live_peers: BTreeSet<PeerId>,

    msg_counter: u32,
    latest_seq: u32,

    /// Acks sent for received data messages that are not delivered yet, replayed verbatim for
    ///  retransmitted data
    ack_cache: FxHashMap<MsgIdentity, AckMessage>,
    /// per sender, so that a stale duplicate never re-enters the hold-back queue
    delivered: FxHashMap<PeerId, DeliveredIds>,
    /// proposals for this process' own messages that are still collecting acks
    proposals: FxHashMap<MsgIdentity, BTreeMap<PeerId, u32>>,
    hold_back_queue: HoldBackQueue,
}

impl Sequencer {
    pub fn new(myself: PeerId, all_peers: impl IntoIterator<Item = PeerId>) -> Sequencer {
        let mut live_peers = all_peers.into_iter().collect::<BTreeSet<_>>();
        live_peers.insert(myself);

        Sequencer {
            myself,
            live_peers,
            msg_counter: 0,
            latest_seq: 0,
            ack_cache: Default::default(),
            delivered: Default::default(),
            proposals: Default::default(),
            hold_back_queue: HoldBackQueue::new(),
        }
    }

    pub fn myself(&self) -> PeerId {
        self.myself
    }

    pub fn latest_seq(&self) -> u32 {
        self.latest_seq
    }

    pub fn hold_back_queue(&self) -> &HoldBackQueue {
        &self.hold_back_queue
    }

    /// live group members except myself, i.e. the recipients of anything this process multicasts
    pub fn other_live_peers(&self) -> Vec<PeerId> {
        self.live_peers.iter()
            .cloned()
            .filter(|&p| p != self.myself)
            .collect()
    }

    /// Creates a new data message and registers this process' own proposal for it. The result
    ///  is only finalized right away if there is no other live peer.
    ///
    /// Fails without changing any state if the message counter or the sequence numbers are
    ///  exhausted.
    pub fn create_data_message(&mut self, payload: u32) -> anyhow::Result<(DataMessage, Option<Finalized>)> {
        let msg_id = self.msg_counter.checked_add(1)
            .ok_or_else(|| anyhow!("message ids are exhausted"))?;
        let proposed = self.latest_seq.checked_add(1)
            .ok_or_else(|| anyhow!("sequence numbers are exhausted"))?;

        self.msg_counter = msg_id;
        self.latest_seq = proposed;

        let data_msg = DataMessage {
            sender: self.myself,
            msg_id,
            payload,
        };
        debug!("data msg created: {:?}", data_msg);

        self.hold_back_queue.add(data_msg, proposed, self.myself);
        self.proposals.insert(data_msg.identity(), [(self.myself, proposed)].into());

        let finalized = self.try_finalize(data_msg.identity());
        Ok((data_msg, finalized))
    }

    /// Returns the ack to reply with, or `None` if the message must not be acknowledged. A
    ///  retransmitted data message gets the cached ack, leaving all state unchanged. Data for a
    ///  message that was delivered already is ignored: its sender has all proposals.
    pub fn on_data(&mut self, data_msg: DataMessage) -> Option<AckMessage> {
        let identity = data_msg.identity();

        if data_msg.sender == self.myself {
            warn!("received my own data message {:?} - ignoring", data_msg);
            return None;
        }

        if let Some(cached) = self.ack_cache.get(&identity) {
            debug!("received duplicate data msg {:?}, replaying {:?}", identity, cached);
            return Some(*cached);
        }

        if self.delivered.get(&data_msg.sender).is_some_and(|d| d.contains(data_msg.msg_id)) {
            debug!("received data msg {:?} after delivering it - ignoring", identity);
            return None;
        }

        let Some(proposed_seq) = self.latest_seq.checked_add(1) else {
            warn!("sequence numbers are exhausted, dropping data msg {:?}", identity);
            return None;
        };
        self.latest_seq = proposed_seq;
        self.hold_back_queue.add(data_msg, proposed_seq, self.myself);

        let ack = AckMessage {
            sender: data_msg.sender,
            msg_id: data_msg.msg_id,
            proposed_seq,
            proposer: self.myself,
        };
        self.ack_cache.insert(identity, ack);
        Some(ack)
    }

    /// Records a proposal for one of this process' own messages. Must only be called for acks
    ///  that were not seen before.
    pub fn on_proposal(&mut self, ack: AckMessage) -> Option<Finalized> {
        let identity = ack.identity();
        let Some(proposals) = self.proposals.get_mut(&identity) else {
            warn!("received proposal for {:?} which is not collecting proposals", identity);
            return None;
        };

        proposals.insert(ack.proposer, ack.proposed_seq);
        debug!("proposals for {:?}: {:?}", identity, proposals);
        self.try_finalize(identity)
    }

    fn try_finalize(&mut self, identity: MsgIdentity) -> Option<Finalized> {
        let proposals = self.proposals.get(&identity)?;
        if !self.live_peers.iter().all(|p| proposals.contains_key(p)) {
            return None;
        }

        let (final_seq, final_seq_proposer) = choose_final_seq(proposals)?;
        self.proposals.remove(&identity);

        let seq = SeqMessage {
            sender: identity.sender,
            msg_id: identity.msg_id,
            final_seq,
            final_seq_proposer,
        };
        info!("final sequence number for {:?}: {}/{}", identity, final_seq, final_seq_proposer);

        let delivered = self.apply_final_seq(&seq);
        Some(Finalized { seq, delivered })
    }

    fn apply_final_seq(&mut self, seq: &SeqMessage) -> Vec<DataMessage> {
        self.latest_seq = self.latest_seq.max(seq.final_seq);

        if self.hold_back_queue.mark_deliverable(seq.identity(), seq.final_seq, seq.final_seq_proposer) {
            let delivered = self.hold_back_queue.drain_deliverable();
            for data_msg in &delivered {
                self.ack_cache.remove(&data_msg.identity());
                self.delivered.entry(data_msg.sender)
                    .or_default()
                    .insert(data_msg.msg_id);
            }
            delivered
        }
        else {
            debug!("received duplicate or unknown seq msg {:?}", seq);
            Vec::new()
        }
    }

    /// Always returns a SeqAck: the original sender keeps retransmitting until every recipient
    ///  acknowledged, whether or not this process still tracks the message.
    pub fn on_seq(&mut self, seq: SeqMessage) -> (SeqAckMessage, Vec<DataMessage>) {
        let delivered = self.apply_final_seq(&seq);
        let seq_ack = SeqAckMessage {
            sender: seq.sender,
            msg_id: seq.msg_id,
            ack_sender: self.myself,
        };
        (seq_ack, delivered)
    }

    /// Stops waiting for proposals from `peer`, finalizing every message for which all remaining
    ///  live peers have proposed.
    pub fn remove_peer(&mut self, peer: PeerId) -> Vec<Finalized> {
        if peer == self.myself {
            warn!("cannot remove myself from the group");
            return Vec::new();
        }
        if !self.live_peers.remove(&peer) {
            debug!("peer {:?} was removed already", peer);
            return Vec::new();
        }
        info!("removed peer {:?}, live peers: {:?}", peer, self.live_peers);

        let mut candidates = self.proposals.keys().cloned().collect::<Vec<_>>();
        candidates.sort();
        candidates.into_iter()
            .filter_map(|identity| self.try_finalize(identity))
            .collect()
    }

    pub fn current_state(&self) -> String {
        let pending = self.hold_back_queue.pending()
            .map(|p| p.to_string())
            .collect::<Vec<_>>();
        format!("myself: {:?}, live peers: {:?}, msg counter: {}, latest seq: {}, collecting proposals: {}, cached acks: {}, hold-back queue: [{}]",
                self.myself, self.live_peers, self.msg_counter, self.latest_seq, self.proposals.len(), self.ack_cache.len(), pending.join(", "))
    }
}
