use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::bail;
use async_trait::async_trait;
use tokio::select;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, error, info, trace, warn};

use crate::config::MulticastConfig;
use crate::messaging::roster::{PeerId, Roster};
use crate::messaging::transport::{MessageHandler, Transport};
use crate::messaging::wire::{AckMessage, DataMessage, MarkerMessage, Record, RecordKind, SeqAckMessage, SeqMessage};
use crate::multicast::fault::FaultInjector;
use crate::multicast::reliable_sender::ReliableSender;
use crate::multicast::sequencer::{Finalized, Sequencer};

/// Invoked once per message, in the group's total order
pub type DeliveryCallback = Box<dyn Fn(&DataMessage) + Send + Sync>;

/// Decodes datagrams from the multicast port and forwards them to the record-processing loop
pub struct RecordMessageModule {
    channel: mpsc::Sender<(SocketAddr, Record)>,
}
impl RecordMessageModule {
    pub fn new(channel: mpsc::Sender<(SocketAddr, Record)>) -> Arc<RecordMessageModule> {
        Arc::new(RecordMessageModule { channel })
    }

    async fn _on_message(&self, buf: &[u8], sender: SocketAddr) -> anyhow::Result<()> {
        let record = Record::decode(buf)?;
        trace!(?sender, "received {:?}", record);
        self.channel.send((sender, record)).await?;
        Ok(())
    }
}

#[async_trait]
impl MessageHandler for RecordMessageModule {
    async fn handle_message(&self, buf: &[u8], sender: SocketAddr) {
        if let Err(e) = self._on_message(buf, sender).await {
            warn!("dropping datagram from {:?}: {}", sender, e);
        }
    }
}

/// Totally ordered reliable multicast to a fixed group of peers.
///
/// Every message is delivered by every non-failed peer, exactly once and in the same order
///  across the group. Data and Seq records are retransmitted until acknowledged, Acks and
///  SeqAcks are plain replies that are regenerated when the original record is retransmitted.
pub struct MulticastService<X: Transport> {
    config: Arc<MulticastConfig>,
    roster: Arc<Roster>,
    transport: Arc<X>,

    sequencer: Mutex<Sequencer>,
    data_sender: ReliableSender<DataMessage, X>,
    seq_sender: ReliableSender<SeqMessage, X>,

    faults: FaultInjector,
    on_deliver: DeliveryCallback,
}

impl<X: Transport> MulticastService<X> {
    pub fn new(config: Arc<MulticastConfig>, roster: Arc<Roster>, transport: Arc<X>, on_deliver: DeliveryCallback) -> anyhow::Result<MulticastService<X>> {
        config.validate()?;

        if roster.peer(roster.myself()).is_none() {
            bail!("{:?} is not part of the group", roster.myself());
        }

        Ok(MulticastService {
            sequencer: Mutex::new(Sequencer::new(roster.myself(), roster.all_ids())),
            data_sender: ReliableSender::new(transport.clone(), roster.clone(), config.retransmit_base_interval, config.retransmit_max_interval),
            seq_sender: ReliableSender::new(transport.clone(), roster.clone(), config.retransmit_base_interval, config.retransmit_max_interval),
            faults: FaultInjector::new(&config),
            on_deliver,
            config,
            roster,
            transport,
        })
    }

    pub fn myself(&self) -> PeerId {
        self.roster.myself()
    }

    /// Starts the total-ordering process for a new message and returns without waiting for it
    ///  to be delivered. Fails only if this process ran out of message ids or sequence numbers.
    pub async fn multicast(&self, payload: u32) -> anyhow::Result<()> {
        let mut sequencer = self.sequencer.lock().await;
        let (data_msg, finalized) = sequencer.create_data_message(payload)?;
        info!("multicasting {:?}", data_msg);

        // remove_peer prunes the senders under the same lock
        self.data_sender.enqueue(data_msg, sequencer.other_live_peers()).await;
        if let Some(finalized) = finalized {
            let (seq, recipients) = self.deliver_finalized(&sequencer, finalized);
            self.seq_sender.enqueue(seq, recipients).await;
        }
        Ok(())
    }

    /// Runs the receive loop, the two retransmission loops and the record-processing loop.
    ///  Returns only if the transport fails or is cancelled.
    pub async fn run(&self) -> anyhow::Result<()> {
        info!("starting multicast service for {:?} on {:?}", self.myself(), self.transport.self_addr());

        let (send, recv) = mpsc::channel(self.config.record_channel_capacity);
        let message_module = RecordMessageModule::new(send);

        select! {
            r = self.transport.recv_loop(message_module) => {
                if let Err(e) = &r {
                    error!("receive loop terminated: {}", e);
                }
                r
            }
            _ = self.data_sender.run() => Ok(()),
            _ = self.seq_sender.run() => Ok(()),
            _ = self.process_records(recv) => Ok(()),
        }
    }

    async fn process_records(&self, mut recv: mpsc::Receiver<(SocketAddr, Record)>) {
        while let Some((from, record)) = recv.recv().await {
            self.on_record(from, record).await;
        }
        debug!("record channel closed");
    }

    pub(crate) async fn on_record(&self, from: SocketAddr, record: Record) {
        let Some(source) = self.roster.peer_by_addr(from) else {
            warn!("dropping {:?} from {:?} which is not a group member", record, from);
            return;
        };
        if !self.matches_source(source, &record) {
            warn!("dropping {:?} from {:?}: its peer ids do not match the source", record, source);
            return;
        }

        if self.faults.should_drop(record.kind()) {
            return;
        }

        match record {
            Record::Data(msg) => self.on_data(msg).await,
            Record::Ack(msg) => self.on_ack(msg).await,
            Record::Seq(msg) => self.on_seq(msg).await,
            Record::SeqAck(msg) => self.on_seq_ack(msg).await,
            Record::Marker(msg) => self.on_marker(source, msg),
        }
    }

    /// The peer a record claims to come from must be the peer it was received from, and replies
    ///  must refer to this process' own messages.
    fn matches_source(&self, source: PeerId, record: &Record) -> bool {
        let myself = self.myself();
        match record {
            Record::Data(msg) => msg.sender == source,
            Record::Ack(msg) => msg.proposer == source && msg.sender == myself,
            Record::Seq(msg) => msg.sender == source && self.roster.peer(msg.final_seq_proposer).is_some(),
            Record::SeqAck(msg) => msg.ack_sender == source && msg.sender == myself,
            Record::Marker(msg) => msg.sender == source,
        }
    }

    async fn on_data(&self, msg: DataMessage) {
        debug!("received {:?}", msg);
        let ack = self.sequencer.lock().await.on_data(msg);

        if let Some(ack) = ack {
            self.faults.maybe_delay(RecordKind::Ack).await;
            self.send_to_peer(msg.sender, Record::Ack(ack)).await;
        }
    }

    async fn on_ack(&self, msg: AckMessage) {
        debug!("received {:?}", msg);
        if !self.data_sender.acknowledge(msg.identity(), msg.proposer).await {
            return;
        }

        let mut sequencer = self.sequencer.lock().await;
        if let Some(finalized) = sequencer.on_proposal(msg) {
            let (seq, recipients) = self.deliver_finalized(&sequencer, finalized);
            self.seq_sender.enqueue(seq, recipients).await;
        }
    }

    async fn on_seq(&self, msg: SeqMessage) {
        debug!("received {:?}", msg);
        let seq_ack = {
            let mut sequencer = self.sequencer.lock().await;
            let (seq_ack, delivered) = sequencer.on_seq(msg);
            self.deliver(delivered);
            seq_ack
        };

        self.faults.maybe_delay(RecordKind::SeqAck).await;
        self.send_to_peer(msg.sender, Record::SeqAck(seq_ack)).await;
    }

    async fn on_seq_ack(&self, msg: SeqAckMessage) {
        debug!("received {:?}", msg);
        self.seq_sender.acknowledge(msg.identity(), msg.ack_sender).await;
    }

    fn on_marker(&self, source: PeerId, msg: MarkerMessage) {
        debug!("ignoring marker {:?} from {:?}", msg, source);
    }

    /// Delivers what a freshly decided final sequence number unblocked locally, returning the Seq
    ///  record and its recipients.
    ///
    /// Callers hold the sequencer lock across draining the hold-back queue, delivering and
    ///  enqueueing the Seq, so that concurrent callers cannot deliver out of order.
    fn deliver_finalized(&self, sequencer: &Sequencer, finalized: Finalized) -> (SeqMessage, Vec<PeerId>) {
        self.deliver(finalized.delivered);
        (finalized.seq, sequencer.other_live_peers())
    }

    fn deliver(&self, messages: Vec<DataMessage>) {
        for msg in messages {
            info!(sender = %msg.sender, msg_id = msg.msg_id, payload = msg.payload, "delivered");
            (self.on_deliver)(&msg);
        }
    }

    async fn send_to_peer(&self, peer: PeerId, record: Record) {
        let Some(addr) = self.roster.addr_of(peer) else {
            warn!("no address for peer {:?} - not sending {:?}", peer, record);
            return;
        };

        if let Err(e) = self.transport.send(addr, &record.encode()).await {
            warn!("error sending {:?} to {:?}: {}", record, peer, e);
        }
    }

    /// Stops waiting for a failed peer, both for acknowledgements of in-flight records and for
    ///  sequence number proposals. Messages that only waited for that peer's proposal get their
    ///  final sequence number right away.
    pub async fn remove_peer(&self, peer: PeerId) {
        info!("removing peer {:?} from the group", peer);

        let mut sequencer = self.sequencer.lock().await;
        let finalized = sequencer.remove_peer(peer);

        self.data_sender.prune_recipient(peer).await;
        self.seq_sender.prune_recipient(peer).await;

        for f in finalized {
            let (seq, recipients) = self.deliver_finalized(&sequencer, f);
            self.seq_sender.enqueue(seq, recipients).await;
        }
    }

    pub async fn current_state(&self) -> String {
        let sequencer_state = self.sequencer.lock().await.current_state();
        format!("{}, data in flight: {:?}, seq in flight: {:?}",
                sequencer_state, self.data_sender.in_flight().await, self.seq_sender.in_flight().await)
    }
}
