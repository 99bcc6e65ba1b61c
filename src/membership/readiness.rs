use std::collections::BTreeSet;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::bail;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::{select, time};
use tracing::{debug, info, warn};

use crate::messaging::control::{ControlMessage, ControlMessageModule};
use crate::messaging::roster::{PeerId, Roster};
use crate::messaging::transport::Transport;

#[derive(Debug, Clone, Default)]
struct ProbeState {
    /// peers that answered our `Alive`
    acked_by: BTreeSet<PeerId>,
    /// peers whose `Alive` we received
    heard_from: BTreeSet<PeerId>,
}
impl ProbeState {
    fn is_complete(&self, peers: &[PeerId]) -> bool {
        peers.iter().all(|p| self.acked_by.contains(p) && self.heard_from.contains(p))
    }
}

/// Start-up barrier: blocks until every peer in the roster is known to be up and to know that
///  we are up, so that no multicast record is sent to a peer that has not bound its socket yet.
///
/// `transport` is bound to the probe port, and `roster` must carry the peers' probe addresses.
///  The returned task keeps answering probes after the barrier is passed, so that peers that
///  started later can pass it as well. It runs until the transport's receive loop is cancelled.
pub async fn wait_for_peers<X: Transport>(transport: Arc<X>, roster: Arc<Roster>, interval: Duration) -> anyhow::Result<JoinHandle<anyhow::Result<()>>> {
    let peers = roster.peers();
    let (state_sender, mut state_receiver) = watch::channel(ProbeState::default());

    let responder = tokio::spawn(answer_probes(transport.clone(), roster.clone(), state_sender));

    info!("waiting for peers {:?}", peers);
    let mut probe_ticks = time::interval(interval);
    loop {
        if state_receiver.borrow_and_update().is_complete(&peers) {
            break;
        }

        select! {
            _ = probe_ticks.tick() => {
                let acked_by = state_receiver.borrow().acked_by.clone();
                send_probes(transport.as_ref(), roster.as_ref(), &acked_by).await;
            }
            changed = state_receiver.changed() => {
                if changed.is_err() {
                    bail!("probe responder terminated before all peers were ready");
                }
            }
        }
    }

    info!("all peers are ready");
    Ok(responder)
}

async fn send_probes<X: Transport>(transport: &X, roster: &Roster, acked_by: &BTreeSet<PeerId>) {
    let alive = ControlMessage::Alive(roster.myself()).to_bytes();

    for peer in roster.peers() {
        if acked_by.contains(&peer) {
            continue;
        }
        let Some(target) = roster.peer(peer) else {
            continue;
        };

        debug!("probing {:?} ({}) at {:?}", peer, target.hostname, target.addr);
        if let Err(e) = transport.send(target.addr, &alive).await {
            warn!("error probing {} ({:?}): {}", target.hostname, peer, e);
        }
    }
}

async fn answer_probes<X: Transport>(transport: Arc<X>, roster: Arc<Roster>, state: watch::Sender<ProbeState>) -> anyhow::Result<()> {
    let (send, mut recv) = mpsc::channel(64);
    let module = ControlMessageModule::new(send);

    let process = async {
        while let Some((from, msg)) = recv.recv().await {
            on_control_message(transport.as_ref(), roster.as_ref(), &state, from, msg).await;
        }
    };

    select! {
        r = transport.recv_loop(module) => r,
        _ = process => Ok(()),
    }
}

async fn on_control_message<X: Transport>(transport: &X, roster: &Roster, state: &watch::Sender<ProbeState>, from: SocketAddr, msg: ControlMessage) {
    let peer = msg.peer();
    if roster.peer(peer).is_none() || peer == roster.myself() {
        warn!("received {:?} from {:?} for a peer that is not in the group - ignoring", msg, from);
        return;
    }

    match msg {
        ControlMessage::Alive(_) => {
            debug!("{:?} is alive", peer);
            state.send_if_modified(|s| s.heard_from.insert(peer));

            let ack = ControlMessage::AliveAck(roster.myself()).to_bytes();
            if let Err(e) = transport.send(from, &ack).await {
                warn!("error acknowledging probe from {:?}: {}", peer, e);
            }
        }
        ControlMessage::AliveAck(_) => {
            debug!("{:?} acknowledged our probe", peer);
            state.send_if_modified(|s| s.acked_by.insert(peer));
        }
        ControlMessage::Heartbeat(_) => {
            warn!("unexpected heartbeat from {:?} on the probe port - ignoring", from);
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::test_util::network::SimulatedNetwork;
    use crate::test_util::node::{test_addr, test_roster};
    use crate::test_util::transport::TrackingTransport;

    #[tokio::test(start_paused = true)]
    async fn test_all_peers_pass_the_barrier() {
        let network = SimulatedNetwork::new();

        let mut barriers = Vec::new();
        for myself in 1..=3u32 {
            let transport = network.attach(test_addr(myself as u16)).await;
            let roster = Arc::new(test_roster(3, myself));
            barriers.push(tokio::spawn(wait_for_peers(transport, roster, Duration::from_secs(1))));
        }

        for barrier in barriers {
            let responder = time::timeout(Duration::from_secs(10), barrier).await
                .unwrap()
                .unwrap()
                .unwrap();
            responder.abort();
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_late_peer_is_answered_after_barrier() {
        let network = SimulatedNetwork::new();

        let t1 = network.attach(test_addr(1)).await;
        let t2 = network.attach(test_addr(2)).await;
        let b1 = tokio::spawn(wait_for_peers(t1, Arc::new(test_roster(3, 1)), Duration::from_secs(1)));
        let b2 = tokio::spawn(wait_for_peers(t2, Arc::new(test_roster(3, 2)), Duration::from_secs(1)));

        time::sleep(Duration::from_secs(5)).await;
        assert!(!b1.is_finished());
        assert!(!b2.is_finished());

        let t3 = network.attach(test_addr(3)).await;
        let responder3 = time::timeout(Duration::from_secs(10), wait_for_peers(t3, Arc::new(test_roster(3, 3)), Duration::from_secs(1))).await
            .unwrap()
            .unwrap();

        let responder1 = time::timeout(Duration::from_secs(10), b1).await.unwrap().unwrap().unwrap();
        let responder2 = time::timeout(Duration::from_secs(10), b2).await.unwrap().unwrap().unwrap();

        responder1.abort();
        responder2.abort();
        responder3.abort();
    }

    #[tokio::test(start_paused = true)]
    async fn test_probes_unacknowledged_peers() {
        let transport = Arc::new(TrackingTransport::new(test_addr(1)));
        let barrier = tokio::spawn(wait_for_peers(transport.clone(), Arc::new(test_roster(3, 1)), Duration::from_secs(1)));

        time::sleep(Duration::from_millis(10)).await;
        transport.assert_control_sent(test_addr(2), ControlMessage::Alive(PeerId(1))).await;
        transport.assert_control_sent(test_addr(3), ControlMessage::Alive(PeerId(1))).await;
        transport.assert_no_remaining_messages().await;

        time::sleep(Duration::from_secs(1)).await;
        transport.assert_control_sent(test_addr(2), ControlMessage::Alive(PeerId(1))).await;
        transport.assert_control_sent(test_addr(3), ControlMessage::Alive(PeerId(1))).await;

        assert!(!barrier.is_finished());
        barrier.abort();
    }

    #[test]
    fn test_probe_state_is_complete() {
        let peers = vec![PeerId(2), PeerId(3)];
        let mut state = ProbeState::default();
        assert!(!state.is_complete(&peers));

        state.acked_by.extend([PeerId(2), PeerId(3)]);
        state.heard_from.insert(PeerId(2));
        assert!(!state.is_complete(&peers));

        state.heard_from.insert(PeerId(3));
        assert!(state.is_complete(&peers));
    }
}
