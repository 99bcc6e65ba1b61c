use std::fmt::{Debug, Display, Formatter};
use std::net::SocketAddr;
use std::path::Path;

use anyhow::{anyhow, bail};
use rustc_hash::FxHashSet;
use tracing::{debug, info};

/// A peer's identity for the lifetime of a run: its 1-based rank in the hostfile. Numerically
///  smaller ids win ties between equal sequence numbers.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Default)]
pub struct PeerId(pub u32);

impl Debug for PeerId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "P{}", self.0)
    }
}
impl Display for PeerId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Peer {
    pub id: PeerId,
    pub hostname: String,
    pub addr: SocketAddr,
}

/// Reads a hostfile with one hostname per line. Blank lines are skipped, and duplicates are
///  dropped keeping the first occurrence, so ranks follow first appearance.
pub fn read_hostfile(path: impl AsRef<Path>) -> anyhow::Result<Vec<String>> {
    let path = path.as_ref();
    debug!("reading host file {:?}", path);
    let content = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("cannot read hostfile {:?}: {}", path, e))?;
    parse_hostfile(&content)
}

pub fn parse_hostfile(content: &str) -> anyhow::Result<Vec<String>> {
    let mut unique = FxHashSet::default();
    let hostnames = content.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .filter(|line| unique.insert(line.to_string()))
        .map(str::to_string)
        .collect::<Vec<_>>();

    info!("{} hosts found in hostfile", hostnames.len());
    if hostnames.len() < 2 {
        bail!("hostfile must contain at least 2 distinct hosts, found {}", hostnames.len());
    }
    Ok(hostnames)
}

/// The static group configuration: every participating process, its rank-derived [PeerId]
///  and its network address, plus which of them is 'myself'.
#[derive(Debug, Clone)]
pub struct Roster {
    myself: PeerId,
    peers: Vec<Peer>,
}

impl Roster {
    /// Assigns ids by rank and resolves every hostname to a socket address on `port`
    pub async fn resolve(hostnames: &[String], my_hostname: &str, port: u16) -> anyhow::Result<Roster> {
        let my_rank = hostnames.iter()
            .position(|h| h == my_hostname)
            .ok_or_else(|| anyhow!("cannot find process identifier for {} in hostfile", my_hostname))?;

        let mut peers = Vec::with_capacity(hostnames.len());
        for (rank, hostname) in hostnames.iter().enumerate() {
            let addr = tokio::net::lookup_host((hostname.as_str(), port)).await
                .map_err(|e| anyhow!("cannot resolve {}: {}", hostname, e))?
                .next()
                .ok_or_else(|| anyhow!("no address found for {}", hostname))?;
            peers.push(Peer {
                id: Self::id_for_rank(rank)?,
                hostname: hostname.clone(),
                addr,
            });
        }

        let myself = Self::id_for_rank(my_rank)?;
        info!("process identifier of {} -> {}", my_hostname, myself);
        Ok(Roster { myself, peers })
    }

    /// Builds a roster from already-known addresses, using the textual address as hostname
    pub fn from_addrs(addrs: &[SocketAddr], my_rank: usize) -> anyhow::Result<Roster> {
        if my_rank >= addrs.len() {
            bail!("rank {} is out of range for {} addresses", my_rank, addrs.len());
        }
        let peers = addrs.iter()
            .enumerate()
            .map(|(rank, addr)| Ok(Peer {
                id: Self::id_for_rank(rank)?,
                hostname: addr.to_string(),
                addr: *addr,
            }))
            .collect::<anyhow::Result<Vec<_>>>()?;

        Ok(Roster {
            myself: Self::id_for_rank(my_rank)?,
            peers,
        })
    }

    fn id_for_rank(rank: usize) -> anyhow::Result<PeerId> {
        let id = u32::try_from(rank + 1)
            .map_err(|_| anyhow!("too many hosts"))?;
        Ok(PeerId(id))
    }

    pub fn myself(&self) -> PeerId {
        self.myself
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    pub fn all_ids(&self) -> Vec<PeerId> {
        self.peers.iter().map(|p| p.id).collect()
    }

    /// all peers except myself, in ascending id order
    pub fn peers(&self) -> Vec<PeerId> {
        self.peers.iter()
            .map(|p| p.id)
            .filter(|&id| id != self.myself)
            .collect()
    }

    pub fn addr_of(&self, peer: PeerId) -> Option<SocketAddr> {
        self.peer(peer).map(|p| p.addr)
    }

    pub fn peer(&self, peer: PeerId) -> Option<&Peer> {
        self.peers.iter().find(|p| p.id == peer)
    }

    pub fn peer_by_addr(&self, addr: SocketAddr) -> Option<PeerId> {
        self.peers.iter()
            .find(|p| p.addr == addr)
            .map(|p| p.id)
    }

    /// The same group, addressed on a different port - used for the probing and heartbeat sockets
    pub fn with_port(&self, port: u16) -> Roster {
        Roster {
            myself: self.myself,
            peers: self.peers.iter()
                .map(|p| {
                    let mut addr = p.addr;
                    addr.set_port(port);
                    Peer { id: p.id, hostname: p.hostname.clone(), addr }
                })
                .collect(),
        }
    }
}

#[cfg(test)]
mod test {
    use std::str::FromStr;

    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case::simple("a\nb\nc\n", vec!["a", "b", "c"])]
    #[case::blank_lines("a\n\n b \n\nc", vec!["a", "b", "c"])]
    #[case::duplicates("a\nb\na\nc\nb", vec!["a", "b", "c"])]
    fn test_parse_hostfile(#[case] content: &str, #[case] expected: Vec<&str>) {
        assert_eq!(parse_hostfile(content).unwrap(), expected);
    }

    #[rstest]
    #[case::empty("")]
    #[case::single("a\n")]
    #[case::single_duplicated("a\na\n")]
    fn test_parse_hostfile_too_few(#[case] content: &str) {
        assert!(parse_hostfile(content).is_err());
    }

    fn addrs() -> Vec<SocketAddr> {
        ["127.0.0.1:1001", "127.0.0.1:1002", "127.0.0.1:1003"].iter()
            .map(|s| SocketAddr::from_str(s).unwrap())
            .collect()
    }

    #[test]
    fn test_from_addrs() {
        let roster = Roster::from_addrs(&addrs(), 1).unwrap();
        assert_eq!(roster.myself(), PeerId(2));
        assert_eq!(roster.len(), 3);
        assert_eq!(roster.all_ids(), vec![PeerId(1), PeerId(2), PeerId(3)]);
        assert_eq!(roster.peers(), vec![PeerId(1), PeerId(3)]);
        assert_eq!(roster.addr_of(PeerId(3)), Some(addrs()[2]));
        assert_eq!(roster.addr_of(PeerId(4)), None);
        assert_eq!(roster.peer_by_addr(addrs()[0]), Some(PeerId(1)));
    }

    #[test]
    fn test_from_addrs_rank_out_of_range() {
        assert!(Roster::from_addrs(&addrs(), 3).is_err());
    }

    #[test]
    fn test_with_port() {
        let roster = Roster::from_addrs(&addrs(), 0).unwrap().with_port(9999);
        assert_eq!(roster.addr_of(PeerId(2)), Some(SocketAddr::from_str("127.0.0.1:9999").unwrap()));
        assert_eq!(roster.myself(), PeerId(1));
    }

    #[tokio::test]
    async fn test_resolve() {
        let hostnames = vec!["127.0.0.1".to_string(), "localhost".to_string()];
        let roster = Roster::resolve(&hostnames, "localhost", 10001).await.unwrap();
        assert_eq!(roster.myself(), PeerId(2));
        assert_eq!(roster.addr_of(PeerId(1)), Some(SocketAddr::from_str("127.0.0.1:10001").unwrap()));
        assert_eq!(roster.peer(PeerId(2)).unwrap().hostname, "localhost");
    }

    #[tokio::test]
    async fn test_resolve_unknown_self() {
        let hostnames = vec!["127.0.0.1".to_string(), "127.0.0.2".to_string()];
        assert!(Roster::resolve(&hostnames, "somewhere-else", 10001).await.is_err());
    }
}
