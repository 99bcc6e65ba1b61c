use std::cmp::Ordering;
use std::fmt::{Display, Formatter};

use rustc_hash::FxHashSet;
use tracing::{debug, info, warn};

use crate::messaging::roster::PeerId;
use crate::messaging::wire::{DataMessage, MsgIdentity};

/// A received data message waiting for its final sequence number. Until it is deliverable,
///  `final_seq` / `final_seq_proposer` hold this process' own provisional proposal.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct PendingMsg {
    pub data_msg: DataMessage,
    pub final_seq: u32,
    pub final_seq_proposer: PeerId,
    pub deliverable: bool,
}

impl PendingMsg {
    /// Ascending sequence number, provisional entries before deliverable ones on an equal
    ///  sequence number, then the smaller proposer id.
    ///
    /// A provisional entry's final sequence number is at least its provisional one, but on an
    ///  equal number its final proposer may be any smaller id. So a deliverable entry must wait
    ///  behind every provisional entry with the same sequence number, whatever its proposer.
    fn delivery_order(&self, other: &PendingMsg) -> Ordering {
        self.final_seq.cmp(&other.final_seq)
            .then_with(|| self.deliverable.cmp(&other.deliverable))
            .then_with(|| self.final_seq_proposer.cmp(&other.final_seq_proposer))
    }
}

impl Display for PendingMsg {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}/{}{}", self.data_msg.identity(), self.final_seq, self.final_seq_proposer, if self.deliverable { "!" } else { "" })
    }
}

/// Buffers received data messages and releases them in the group's total order. An entry is
///  only released once it and every entry ordered before it have their final sequence number.
#[derive(Debug, Default)]
pub struct HoldBackQueue {
    pending_ids: FxHashSet<MsgIdentity>,
    queue: Vec<PendingMsg>,
}

impl HoldBackQueue {
    pub fn new() -> HoldBackQueue {
        Default::default()
    }

    /// Returns `false` if the message is already pending
    pub fn add(&mut self, data_msg: DataMessage, provisional_seq: u32, proposer: PeerId) -> bool {
        if !self.pending_ids.insert(data_msg.identity()) {
            warn!("tried adding duplicate data message to hold-back queue: {:?}", data_msg);
            return false;
        }

        self.queue.push(PendingMsg {
            data_msg,
            final_seq: provisional_seq,
            final_seq_proposer: proposer,
            deliverable: false,
        });
        debug!("added {:?} to hold-back queue, size {}", data_msg, self.queue.len());
        true
    }

    /// Returns `false` if there is no pending entry for the identity, e.g. because it was
    ///  delivered already
    pub fn mark_deliverable(&mut self, identity: MsgIdentity, final_seq: u32, final_seq_proposer: PeerId) -> bool {
        if !self.pending_ids.contains(&identity) {
            debug!("no pending message {:?} to mark deliverable", identity);
            return false;
        }

        match self.queue.iter_mut().find(|p| p.data_msg.identity() == identity) {
            Some(pending) => {
                pending.final_seq = final_seq;
                pending.final_seq_proposer = final_seq_proposer;
                pending.deliverable = true;
                true
            }
            None => {
                warn!("pending id set and queue are out of sync for {:?}", identity);
                false
            }
        }
    }

    /// Removes and returns the longest deliverable prefix of the queue, in delivery order
    #[must_use]
    pub fn drain_deliverable(&mut self) -> Vec<DataMessage> {
        self.queue.sort_by(PendingMsg::delivery_order);

        let num_deliverable = self.queue.iter()
            .take_while(|p| p.deliverable)
            .count();

        let delivered = self.queue.drain(..num_deliverable)
            .map(|p| {
                info!("delivering {}", p);
                self.pending_ids.remove(&p.data_msg.identity());
                p.data_msg
            })
            .collect::<Vec<_>>();

        if !delivered.is_empty() {
            debug!("delivered {} messages, {} remain in hold-back queue", delivered.len(), self.queue.len());
        }
        delivered
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn pending(&self) -> impl Iterator<Item = &PendingMsg> {
        self.queue.iter()
    }
}

#[cfg(test)]
mod test {
    use rstest::rstest;

    use super::*;

    fn data(sender: u32, msg_id: u32) -> DataMessage {
        DataMessage { sender: PeerId(sender), msg_id, payload: sender * 100 + msg_id }
    }

    fn ids(msgs: &[DataMessage]) -> Vec<(u32, u32)> {
        msgs.iter().map(|m| (m.sender.0, m.msg_id)).collect()
    }

    fn is_pending(queue: &HoldBackQueue, data_msg: DataMessage) -> bool {
        queue.pending().any(|p| p.data_msg.identity() == data_msg.identity())
    }

    #[test]
    fn test_add_rejects_duplicates() {
        let mut queue = HoldBackQueue::new();
        assert!(queue.add(data(1, 1), 1, PeerId(2)));
        assert!(!queue.add(data(1, 1), 2, PeerId(2)));
        assert_eq!(queue.len(), 1);
        assert!(is_pending(&queue, data(1, 1)));
    }

    #[test]
    fn test_nothing_deliverable_initially() {
        let mut queue = HoldBackQueue::new();
        queue.add(data(1, 1), 1, PeerId(2));
        queue.add(data(2, 1), 2, PeerId(2));
        assert!(queue.drain_deliverable().is_empty());
        assert_eq!(queue.len(), 2);
    }

    #[test]
    fn test_front_blocks_later_deliverable_entries() {
        let mut queue = HoldBackQueue::new();
        queue.add(data(1, 1), 1, PeerId(2));
        queue.add(data(3, 1), 2, PeerId(2));

        assert!(queue.mark_deliverable(data(3, 1).identity(), 5, PeerId(1)));
        assert!(queue.drain_deliverable().is_empty());

        assert!(queue.mark_deliverable(data(1, 1).identity(), 3, PeerId(3)));
        assert_eq!(ids(&queue.drain_deliverable()), vec![(1, 1), (3, 1)]);
        assert!(queue.is_empty());
        assert!(!is_pending(&queue, data(1, 1)));
    }

    #[test]
    fn test_final_seq_reorders() {
        let mut queue = HoldBackQueue::new();
        queue.add(data(1, 1), 1, PeerId(2));
        queue.add(data(3, 1), 2, PeerId(2));

        // the message received first gets the bigger final sequence number
        assert!(queue.mark_deliverable(data(1, 1).identity(), 7, PeerId(1)));
        assert!(queue.drain_deliverable().is_empty());
        assert!(queue.mark_deliverable(data(3, 1).identity(), 4, PeerId(3)));
        assert_eq!(ids(&queue.drain_deliverable()), vec![(3, 1), (1, 1)]);
    }

    #[test]
    fn test_partial_prefix_delivery() {
        let mut queue = HoldBackQueue::new();
        queue.add(data(1, 1), 1, PeerId(2));
        queue.add(data(1, 2), 2, PeerId(2));
        queue.add(data(1, 3), 3, PeerId(2));

        queue.mark_deliverable(data(1, 1).identity(), 4, PeerId(1));
        queue.mark_deliverable(data(1, 3).identity(), 6, PeerId(1));
        assert_eq!(ids(&queue.drain_deliverable()), Vec::<(u32, u32)>::new());

        queue.mark_deliverable(data(1, 2).identity(), 5, PeerId(1));
        assert_eq!(ids(&queue.drain_deliverable()), vec![(1, 1), (1, 2), (1, 3)]);
    }

    #[rstest]
    #[case::smaller_proposer_first(5, 1, 5, 3, vec![(1, 1), (2, 1)])]
    #[case::smaller_proposer_second(5, 3, 5, 1, vec![(2, 1), (1, 1)])]
    #[case::seq_wins_over_proposer(6, 1, 5, 3, vec![(2, 1), (1, 1)])]
    fn test_tie_break(#[case] seq_a: u32, #[case] proposer_a: u32, #[case] seq_b: u32, #[case] proposer_b: u32, #[case] expected: Vec<(u32, u32)>) {
        let mut queue = HoldBackQueue::new();
        queue.add(data(1, 1), 1, PeerId(2));
        queue.add(data(2, 1), 2, PeerId(2));

        queue.mark_deliverable(data(1, 1).identity(), seq_a, PeerId(proposer_a));
        queue.mark_deliverable(data(2, 1).identity(), seq_b, PeerId(proposer_b));
        assert_eq!(ids(&queue.drain_deliverable()), expected);
    }

    #[test]
    fn test_deliverable_waits_behind_provisional_with_equal_seq() {
        let mut queue = HoldBackQueue::new();
        queue.add(data(1, 1), 5, PeerId(2));
        queue.add(data(3, 1), 1, PeerId(2));

        // (5, P2) provisional sorts before (5, P3) final: the provisional entry may still end
        //  up with final key (5, P1)
        queue.mark_deliverable(data(3, 1).identity(), 5, PeerId(3));
        assert!(queue.drain_deliverable().is_empty());

        queue.mark_deliverable(data(1, 1).identity(), 5, PeerId(1));
        assert_eq!(ids(&queue.drain_deliverable()), vec![(1, 1), (3, 1)]);
    }

    #[test]
    fn test_deliverable_waits_behind_provisional_with_bigger_proposer() {
        let mut queue = HoldBackQueue::new();
        queue.add(data(1, 1), 5, PeerId(3));
        queue.add(data(2, 1), 1, PeerId(3));

        // (5, P3) may still be finalized as (5, P1)
        queue.mark_deliverable(data(2, 1).identity(), 5, PeerId(2));
        assert!(queue.drain_deliverable().is_empty());

        queue.mark_deliverable(data(1, 1).identity(), 5, PeerId(1));
        assert_eq!(ids(&queue.drain_deliverable()), vec![(1, 1), (2, 1)]);
    }

    #[test]
    fn test_provisional_with_bigger_seq_does_not_block() {
        let mut queue = HoldBackQueue::new();
        queue.add(data(1, 1), 6, PeerId(1));
        queue.add(data(2, 1), 1, PeerId(1));

        queue.mark_deliverable(data(2, 1).identity(), 5, PeerId(3));
        assert_eq!(ids(&queue.drain_deliverable()), vec![(2, 1)]);
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn test_mark_unknown_or_delivered() {
        let mut queue = HoldBackQueue::new();
        assert!(!queue.mark_deliverable(data(1, 1).identity(), 1, PeerId(1)));

        queue.add(data(1, 1), 1, PeerId(2));
        queue.mark_deliverable(data(1, 1).identity(), 1, PeerId(1));
        assert_eq!(queue.drain_deliverable().len(), 1);
        assert!(!queue.mark_deliverable(data(1, 1).identity(), 1, PeerId(1)));
    }
}
