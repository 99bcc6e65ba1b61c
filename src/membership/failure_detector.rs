use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::{select, time};
use tracing::{debug, info, trace, warn};

use crate::config::MulticastConfig;
use crate::messaging::control::{ControlMessage, ControlMessageModule};
use crate::messaging::roster::{PeerId, Roster};
use crate::messaging::transport::Transport;

/// Per-peer countdown of heartbeat intervals. A heartbeat resets a peer's countdown; a peer whose
///  countdown is exhausted is declared failed exactly once and not monitored afterwards.
#[derive(Debug)]
pub struct HeartbeatTracker {
    countdowns: BTreeMap<PeerId, u32>,
    misses_before_failure: u32,
}

impl HeartbeatTracker {
    pub fn new(peers: impl IntoIterator<Item = PeerId>, misses_before_failure: u32) -> HeartbeatTracker {
        HeartbeatTracker {
            countdowns: peers.into_iter()
                .map(|p| (p, misses_before_failure))
                .collect(),
            misses_before_failure,
        }
    }

    pub fn on_heartbeat(&mut self, peer: PeerId) {
        match self.countdowns.get_mut(&peer) {
            Some(countdown) => *countdown = self.misses_before_failure,
            None => debug!("heartbeat from {:?} which is not monitored", peer),
        }
    }

    /// Advances every countdown by one interval, returning the peers that failed
    pub fn tick(&mut self) -> Vec<PeerId> {
        let mut failed = Vec::new();
        for (&peer, countdown) in self.countdowns.iter_mut() {
            if *countdown == 0 {
                failed.push(peer);
            }
            else {
                *countdown -= 1;
            }
        }

        for peer in &failed {
            self.countdowns.remove(peer);
        }
        failed
    }

    pub fn live_peers(&self) -> Vec<PeerId> {
        self.countdowns.keys().cloned().collect()
    }
}

/// Heartbeat-based detection of crashed peers on a dedicated port. Every interval, a heartbeat is
///  sent to all peers that are not known to have failed.
pub struct FailureDetector<X: Transport> {
    config: Arc<MulticastConfig>,
    /// peers addressed on the heartbeat port
    roster: Arc<Roster>,
    transport: Arc<X>,
    on_failure: Box<dyn Fn(PeerId) + Send + Sync>,
}

impl<X: Transport> FailureDetector<X> {
    pub fn new(config: Arc<MulticastConfig>, roster: Arc<Roster>, transport: Arc<X>, on_failure: Box<dyn Fn(PeerId) + Send + Sync>) -> FailureDetector<X> {
        FailureDetector {
            config,
            roster,
            transport,
            on_failure,
        }
    }

    /// Returns only if the transport fails or is cancelled
    pub async fn run(&self) -> anyhow::Result<()> {
        let (send, recv) = mpsc::channel(self.config.record_channel_capacity);
        let module = ControlMessageModule::new(send);

        select! {
            r = self.transport.recv_loop(module) => r,
            _ = self.run_active_loop(recv) => Ok(()),
        }
    }

    async fn run_active_loop(&self, mut recv: mpsc::Receiver<(SocketAddr, ControlMessage)>) {
        let mut tracker = HeartbeatTracker::new(self.roster.peers(), self.config.heartbeat_misses_before_failure);
        let mut heartbeat_ticks = time::interval(self.config.heartbeat_interval);

        loop {
            select! {
                msg = recv.recv() => {
                    match msg {
                        Some((_, ControlMessage::Heartbeat(peer))) => {
                            trace!("heartbeat from {:?}", peer);
                            tracker.on_heartbeat(peer);
                        }
                        Some((from, msg)) => warn!("unexpected {:?} from {:?} on the heartbeat port - ignoring", msg, from),
                        None => break,
                    }
                }
                _ = heartbeat_ticks.tick() => {
                    for peer in tracker.tick() {
                        info!("peer {:?} failed", peer);
                        (self.on_failure)(peer);
                    }
                    self.send_heartbeats(&tracker.live_peers()).await;
                }
            }
        }
    }

    async fn send_heartbeats(&self, recipients: &[PeerId]) {
        let heartbeat = ControlMessage::Heartbeat(self.roster.myself()).to_bytes();

        for &peer in recipients {
            let Some(addr) = self.roster.addr_of(peer) else {
                continue;
            };
            if let Err(e) = self.transport.send(addr, &heartbeat).await {
                warn!("error sending heartbeat to {:?}: {}", peer, e);
            }
        }
    }
}

#[cfg(test)]
mod test {
    use std::sync::Mutex;
    use std::time::Duration;

    use super::*;
    use crate::test_util::network::SimulatedNetwork;
    use crate::test_util::node::{test_addr, test_roster};
    use crate::test_util::transport::TrackingTransport;

    #[test]
    fn test_tracker_countdown() {
        let mut tracker = HeartbeatTracker::new([PeerId(2), PeerId(3)], 2);

        assert!(tracker.tick().is_empty());
        tracker.on_heartbeat(PeerId(2));
        assert!(tracker.tick().is_empty());
        tracker.on_heartbeat(PeerId(2));
        assert_eq!(tracker.tick(), vec![PeerId(3)]);
        assert_eq!(tracker.live_peers(), vec![PeerId(2)]);

        // a failed peer is reported only once, and heartbeats do not revive it
        tracker.on_heartbeat(PeerId(3));
        assert!(tracker.tick().is_empty());
        assert_eq!(tracker.tick(), vec![PeerId(2)]);
        assert!(tracker.live_peers().is_empty());
    }

    #[test]
    fn test_tracker_without_tolerance() {
        let mut tracker = HeartbeatTracker::new([PeerId(1)], 0);
        assert_eq!(tracker.tick(), vec![PeerId(1)]);
    }

    fn detector<X: Transport>(transport: Arc<X>, myself: u32, failed: Arc<Mutex<Vec<PeerId>>>) -> Arc<FailureDetector<X>> {
        Arc::new(FailureDetector::new(
            Arc::new(MulticastConfig::default()),
            Arc::new(test_roster(3, myself)),
            transport,
            Box::new(move |peer| failed.lock().unwrap().push(peer)),
        ))
    }

    #[tokio::test(start_paused = true)]
    async fn test_sends_heartbeats() {
        let transport = Arc::new(TrackingTransport::new(test_addr(1)));
        let failed = Arc::new(Mutex::new(Vec::new()));
        let detector = detector(transport.clone(), 1, failed.clone());

        let d = detector.clone();
        tokio::spawn(async move { d.run().await });

        time::sleep(Duration::from_millis(10)).await;
        transport.assert_control_sent(test_addr(2), ControlMessage::Heartbeat(PeerId(1))).await;
        transport.assert_control_sent(test_addr(3), ControlMessage::Heartbeat(PeerId(1))).await;
        transport.assert_no_remaining_messages().await;

        time::sleep(Duration::from_secs(1)).await;
        transport.assert_control_sent(test_addr(2), ControlMessage::Heartbeat(PeerId(1))).await;
        transport.assert_control_sent(test_addr(3), ControlMessage::Heartbeat(PeerId(1))).await;

        // nobody answers: both peers fail on the third tick and are not sent heartbeats anymore
        time::sleep(Duration::from_secs(1)).await;
        assert_eq!(*failed.lock().unwrap(), vec![PeerId(2), PeerId(3)]);
        transport.take_sent().await;

        time::sleep(Duration::from_secs(5)).await;
        transport.assert_no_remaining_messages().await;
        assert_eq!(failed.lock().unwrap().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_detects_silent_peer() {
        let network = SimulatedNetwork::new();
        let failed_1 = Arc::new(Mutex::new(Vec::new()));
        let failed_2 = Arc::new(Mutex::new(Vec::new()));

        let d1 = detector(network.attach(test_addr(1)).await, 1, failed_1.clone());
        let d2 = detector(network.attach(test_addr(2)).await, 2, failed_2.clone());
        tokio::spawn(async move { d1.run().await });
        tokio::spawn(async move { d2.run().await });

        time::sleep(Duration::from_secs(30)).await;
        assert_eq!(*failed_1.lock().unwrap(), vec![PeerId(3)]);
        assert_eq!(*failed_2.lock().unwrap(), vec![PeerId(3)]);
    }
}
