use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};

use crate::messaging::roster::Roster;

/// convenience function for unit test code: create a localhost address based on a number, the
///  same number generating the same address and different numbers different addresses
pub fn test_addr(number: u16) -> SocketAddr {
    SocketAddrV4::new(Ipv4Addr::LOCALHOST, number).into()
}

/// A roster of `num_peers` peers at [test_addr] `1..=num_peers`, where peer `n` has
///  [crate::messaging::roster::PeerId] `n`
pub fn test_roster(num_peers: u16, myself: u32) -> Roster {
    let addrs = (1..=num_peers)
        .map(test_addr)
        .collect::<Vec<_>>();
    Roster::from_addrs(&addrs, myself as usize - 1)
        .expect("myself must be in 1..=num_peers")
}
