use std::fmt::{Debug, Formatter};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rustc_hash::FxHashMap;
use tokio::sync::{broadcast, mpsc, Mutex, RwLock};
use tokio::{select, time};
use tracing::trace;

use crate::messaging::transport::{MessageHandler, Transport};

type Inbox = mpsc::UnboundedSender<(Bytes, SocketAddr)>;

/// How a [SimulatedNetwork] mistreats datagrams. Every copy of a datagram gets its own random
///  latency, so datagrams overtake each other whenever the latency range is not empty.
#[derive(Debug, Clone)]
pub struct NetworkConditions {
    pub min_latency: Duration,
    pub max_latency: Duration,
    /// probability of a datagram arriving twice
    pub duplicate_rate: f64,
    pub seed: u64,
}

impl NetworkConditions {
    pub fn reordering(seed: u64) -> NetworkConditions {
        NetworkConditions {
            min_latency: Duration::from_millis(1),
            max_latency: Duration::from_millis(300),
            duplicate_rate: 0.2,
            seed,
        }
    }
}

struct Impairment {
    conditions: NetworkConditions,
    rng: StdMutex<StdRng>,
}

impl Impairment {
    /// the latency of each copy to deliver
    fn copies(&self) -> Vec<Duration> {
        let Ok(mut rng) = self.rng.lock() else {
            return vec![self.conditions.min_latency];
        };
        let min = self.conditions.min_latency.as_millis() as u64;
        let max = (self.conditions.max_latency.as_millis() as u64).max(min);

        let num_copies = if rng.random_bool(self.conditions.duplicate_rate) { 2 } else { 1 };
        (0..num_copies)
            .map(|_| Duration::from_millis(rng.random_range(min..=max)))
            .collect()
    }
}

/// An in-memory datagram fabric, so that several peers can run in a single test process.
///  Datagrams to an address without an attached transport are silently lost, like UDP.
///
/// By default datagrams arrive immediately and in order. With [NetworkConditions] they are
///  delayed, reordered and duplicated, reproducibly for a given seed and schedule.
#[derive(Default)]
pub struct SimulatedNetwork {
    endpoints: RwLock<FxHashMap<SocketAddr, Inbox>>,
    impairment: Option<Impairment>,
}
impl Debug for SimulatedNetwork {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "SimulatedNetwork")
    }
}

impl SimulatedNetwork {
    pub fn new() -> Arc<SimulatedNetwork> {
        Default::default()
    }

    pub fn with_conditions(conditions: NetworkConditions) -> Arc<SimulatedNetwork> {
        Arc::new(SimulatedNetwork {
            endpoints: Default::default(),
            impairment: Some(Impairment {
                rng: StdMutex::new(StdRng::seed_from_u64(conditions.seed)),
                conditions,
            }),
        })
    }

    /// Attaches a new transport at `addr`, replacing any transport previously attached there
    pub async fn attach(self: &Arc<Self>, addr: SocketAddr) -> Arc<SimTransport> {
        let (send, recv) = mpsc::unbounded_channel();
        self.endpoints.write().await.insert(addr, send);

        Arc::new(SimTransport {
            self_addr: addr,
            network: self.clone(),
            inbox: Mutex::new(recv),
            cancel_sender: broadcast::channel(1).0,
        })
    }

    /// Simulates a crashed peer: datagrams to `addr` are lost from now on, and the receive loop
    ///  of the transport attached there terminates
    pub async fn detach(&self, addr: SocketAddr) {
        self.endpoints.write().await.remove(&addr);
    }

    async fn route(&self, from: SocketAddr, to: SocketAddr, buf: &[u8]) {
        let Some(inbox) = self.endpoints.read().await.get(&to).cloned() else {
            trace!(?from, ?to, "no endpoint - datagram lost");
            return;
        };
        let buf = Bytes::copy_from_slice(buf);

        let Some(impairment) = &self.impairment else {
            if inbox.send((buf, from)).is_err() {
                trace!(?from, ?to, "receiver is gone - datagram lost");
            }
            return;
        };

        for latency in impairment.copies() {
            let inbox = inbox.clone();
            let buf = buf.clone();
            tokio::spawn(async move {
                time::sleep(latency).await;
                if inbox.send((buf, from)).is_err() {
                    trace!(?from, ?to, "receiver is gone - datagram lost");
                }
            });
        }
    }
}

pub struct SimTransport {
    self_addr: SocketAddr,
    network: Arc<SimulatedNetwork>,
    inbox: Mutex<mpsc::UnboundedReceiver<(Bytes, SocketAddr)>>,
    cancel_sender: broadcast::Sender<()>,
}
impl Debug for SimTransport {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "SimTransport{{{:?}}}", self.self_addr)
    }
}

#[async_trait]
impl Transport for SimTransport {
    fn self_addr(&self) -> SocketAddr {
        self.self_addr
    }

    async fn send(&self, to: SocketAddr, buf: &[u8]) -> anyhow::Result<()> {
        self.network.route(self.self_addr, to, buf).await;
        Ok(())
    }

    async fn recv_loop(&self, handler: Arc<dyn MessageHandler>) -> anyhow::Result<()> {
        let mut cancel_receiver = self.cancel_sender.subscribe();
        let mut inbox = self.inbox.lock().await;

        loop {
            select! {
                datagram = inbox.recv() => {
                    match datagram {
                        Some((buf, from)) => handler.handle_message(&buf, from).await,
                        None => break,
                    }
                }
                _ = cancel_receiver.recv() => break,
            }
        }
        Ok(())
    }

    fn cancel_recv_loop(&self) {
        let _ = self.cancel_sender.send(());
    }
}
