use std::collections::BTreeSet;
use std::fmt::Debug;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::{Mutex, Notify};
use tokio::time;
use tracing::{debug, info, trace, warn};

use crate::messaging::roster::{PeerId, Roster};
use crate::messaging::transport::Transport;
use crate::messaging::wire::{DataMessage, MsgIdentity, SeqMessage, WireMessage};
use crate::multicast::backoff::Backoff;

/// A record kind that is retransmitted until every recipient acknowledged it
pub trait Reliable: Debug + Clone + Send + Sync + 'static {
    const NAME: &'static str;

    fn identity(&self) -> MsgIdentity;
    fn encode(&self) -> Bytes;
}

impl Reliable for DataMessage {
    const NAME: &'static str = "DataMsg";

    fn identity(&self) -> MsgIdentity {
        DataMessage::identity(self)
    }
    fn encode(&self) -> Bytes {
        self.to_bytes().freeze()
    }
}

impl Reliable for SeqMessage {
    const NAME: &'static str = "SeqMsg";

    fn identity(&self) -> MsgIdentity {
        SeqMessage::identity(self)
    }
    fn encode(&self) -> Bytes {
        self.to_bytes().freeze()
    }
}

struct TransmissionUnit<T> {
    record: T,
    encoded: Bytes,
    remaining: BTreeSet<PeerId>,
}

/// Keeps re-sending every enqueued record to all recipients that did not acknowledge it yet.
///
/// [ReliableSender::enqueue] and [ReliableSender::acknowledge] are called from the receive path
///  and from producers, [ReliableSender::run] is the sending loop. The unit list's lock is never
///  held while sending.
pub struct ReliableSender<T: Reliable, X: Transport> {
    transport: Arc<X>,
    roster: Arc<Roster>,
    units: Mutex<Vec<TransmissionUnit<T>>>,
    work_available: Notify,
    base_interval: Duration,
    max_interval: Duration,
}

impl<T: Reliable, X: Transport> ReliableSender<T, X> {
    pub fn new(transport: Arc<X>, roster: Arc<Roster>, base_interval: Duration, max_interval: Duration) -> ReliableSender<T, X> {
        ReliableSender {
            transport,
            roster,
            units: Default::default(),
            work_available: Notify::new(),
            base_interval,
            max_interval,
        }
    }

    pub async fn enqueue(&self, record: T, recipients: impl IntoIterator<Item = PeerId>) {
        let remaining = recipients.into_iter().collect::<BTreeSet<_>>();
        if remaining.is_empty() {
            debug!("no recipients for {} {:?} - nothing to send", T::NAME, record.identity());
            return;
        }

        debug!("queueing {} {:?} for {:?}", T::NAME, record, remaining);
        let was_empty = {
            let mut units = self.units.lock().await;
            let was_empty = units.is_empty();
            units.push(TransmissionUnit {
                encoded: record.encode(),
                record,
                remaining,
            });
            was_empty
        };

        if was_empty {
            self.work_available.notify_one();
        }
    }

    /// Returns `true` if `recipient` was still waiting for the record identified by `identity`,
    ///  `false` for duplicate or late acknowledgements.
    pub async fn acknowledge(&self, identity: MsgIdentity, recipient: PeerId) -> bool {
        let mut units = self.units.lock().await;

        let Some(pos) = units.iter().position(|u| u.record.identity() == identity) else {
            debug!("duplicate remove for {} {:?} - not in flight", T::NAME, identity);
            return false;
        };

        let removed = units[pos].remaining.remove(&recipient);
        if removed {
            trace!("removed recipient {:?} for {} {:?}", recipient, T::NAME, identity);
        }
        else {
            debug!("duplicate remove of recipient {:?} for {} {:?}", recipient, T::NAME, identity);
        }

        if units[pos].remaining.is_empty() {
            units.remove(pos);
            debug!("{} {:?} acknowledged by all recipients, {} still in flight", T::NAME, identity, units.len());
        }
        removed
    }

    /// Stops expecting acknowledgements from `peer` for all records in flight. Returns the number
    ///  of records that were waiting for it.
    pub async fn prune_recipient(&self, peer: PeerId) -> usize {
        let mut units = self.units.lock().await;

        let mut num_affected = 0;
        for unit in units.iter_mut() {
            if unit.remaining.remove(&peer) {
                num_affected += 1;
            }
        }
        units.retain(|u| !u.remaining.is_empty());

        info!("pruned {:?} from {} in-flight {} records", peer, num_affected, T::NAME);
        num_affected
    }

    pub async fn in_flight(&self) -> Vec<MsgIdentity> {
        self.units.lock().await
            .iter()
            .map(|u| u.record.identity())
            .collect()
    }

    pub async fn remaining_recipients(&self, identity: MsgIdentity) -> Option<Vec<PeerId>> {
        self.units.lock().await
            .iter()
            .find(|u| u.record.identity() == identity)
            .map(|u| u.remaining.iter().cloned().collect())
    }

    /// The sending loop. It never returns.
    pub async fn run(&self) {
        info!("starting sending {} records", T::NAME);
        let mut backoff = Backoff::new(self.base_interval, self.max_interval);

        loop {
            let batch = self.current_batch().await;
            if batch.is_empty() {
                debug!("waiting for new {} records", T::NAME);
                backoff.reset();
                self.work_available.notified().await;
                continue;
            }

            for (to, buf) in &batch {
                if let Err(e) = self.transport.send(*to, buf).await {
                    warn!("error sending {} to {:?}: {}", T::NAME, to, e);
                }
            }

            let interval = backoff.next_interval();
            trace!("{} sender sent {} datagrams, sleeping for {:?}", T::NAME, batch.len(), interval);
            time::sleep(interval).await;
        }
    }

    async fn current_batch(&self) -> Vec<(SocketAddr, Bytes)> {
        let units = self.units.lock().await;

        let mut result = Vec::new();
        for unit in units.iter() {
            for recipient in &unit.remaining {
                match self.roster.addr_of(*recipient) {
                    Some(addr) => result.push((addr, unit.encoded.clone())),
                    None => warn!("no address for recipient {:?} of {} {:?}", recipient, T::NAME, unit.record.identity()),
                }
            }
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::messaging::wire::Record;
    use crate::test_util::node::{test_addr, test_roster};
    use crate::test_util::transport::TrackingTransport;

    fn data(msg_id: u32) -> DataMessage {
        DataMessage { sender: PeerId(1), msg_id, payload: 100 + msg_id }
    }

    fn sender(transport: Arc<TrackingTransport>) -> Arc<ReliableSender<DataMessage, TrackingTransport>> {
        Arc::new(ReliableSender::new(transport, Arc::new(test_roster(3, 1)), Duration::from_millis(200), Duration::from_millis(4000)))
    }

    #[tokio::test]
    async fn test_acknowledge() {
        let transport = Arc::new(TrackingTransport::new(test_addr(1)));
        let sender = sender(transport);

        sender.enqueue(data(1), [PeerId(2), PeerId(3)]).await;
        sender.enqueue(data(2), [PeerId(2)]).await;

        assert!(sender.acknowledge(data(1).identity(), PeerId(2)).await);
        assert!(!sender.acknowledge(data(1).identity(), PeerId(2)).await);
        assert_eq!(sender.remaining_recipients(data(1).identity()).await, Some(vec![PeerId(3)]));

        assert!(sender.acknowledge(data(1).identity(), PeerId(3)).await);
        assert_eq!(sender.in_flight().await, vec![data(2).identity()]);
        assert!(!sender.acknowledge(data(1).identity(), PeerId(3)).await);

        assert!(!sender.acknowledge(data(2).identity(), PeerId(3)).await);
        assert!(sender.acknowledge(data(2).identity(), PeerId(2)).await);
        assert!(sender.in_flight().await.is_empty());
    }

    #[tokio::test]
    async fn test_enqueue_without_recipients() {
        let transport = Arc::new(TrackingTransport::new(test_addr(1)));
        let sender = sender(transport);

        sender.enqueue(data(1), []).await;
        assert!(sender.in_flight().await.is_empty());
    }

    #[tokio::test]
    async fn test_prune_recipient() {
        let transport = Arc::new(TrackingTransport::new(test_addr(1)));
        let sender = sender(transport);

        sender.enqueue(data(1), [PeerId(2), PeerId(3)]).await;
        sender.enqueue(data(2), [PeerId(3)]).await;
        sender.enqueue(data(3), [PeerId(2)]).await;

        assert_eq!(sender.prune_recipient(PeerId(3)).await, 2);
        assert_eq!(sender.in_flight().await, vec![data(1).identity(), data(3).identity()]);
        assert_eq!(sender.remaining_recipients(data(1).identity()).await, Some(vec![PeerId(2)]));
        assert_eq!(sender.prune_recipient(PeerId(3)).await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retransmit_until_acknowledged() {
        let transport = Arc::new(TrackingTransport::new(test_addr(1)));
        let sender = sender(transport.clone());

        let s = sender.clone();
        tokio::spawn(async move { s.run().await });

        sender.enqueue(data(1), [PeerId(2), PeerId(3)]).await;

        time::sleep(Duration::from_millis(1)).await;
        transport.assert_record_sent(test_addr(2), Record::Data(data(1))).await;
        transport.assert_record_sent(test_addr(3), Record::Data(data(1))).await;
        transport.assert_no_remaining_messages().await;

        assert!(sender.acknowledge(data(1).identity(), PeerId(2)).await);

        // first retransmission after the base interval, only to the recipient that did not ack
        time::sleep(Duration::from_millis(200)).await;
        transport.assert_record_sent(test_addr(3), Record::Data(data(1))).await;
        transport.assert_no_remaining_messages().await;

        // the interval doubled
        time::sleep(Duration::from_millis(200)).await;
        transport.assert_no_remaining_messages().await;
        time::sleep(Duration::from_millis(200)).await;
        transport.assert_record_sent(test_addr(3), Record::Data(data(1))).await;

        assert!(sender.acknowledge(data(1).identity(), PeerId(3)).await);

        time::sleep(Duration::from_secs(10)).await;
        transport.assert_no_remaining_messages().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_wakes_up_when_work_arrives() {
        let transport = Arc::new(TrackingTransport::new(test_addr(1)));
        let sender = sender(transport.clone());

        let s = sender.clone();
        tokio::spawn(async move { s.run().await });

        time::sleep(Duration::from_secs(60)).await;
        transport.assert_no_remaining_messages().await;

        sender.enqueue(data(7), [PeerId(3)]).await;
        time::sleep(Duration::from_millis(1)).await;
        transport.assert_record_sent(test_addr(3), Record::Data(data(7))).await;
        transport.assert_no_remaining_messages().await;
    }
}
