use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};

use crate::messaging::peer_id::PeerId;

pub fn localhost(port: u16) -> SocketAddr {
    SocketAddrV4::new(Ipv4Addr::LOCALHOST, port).into()
}

/// convenience for unit tests: the same number always produces the same address, and different
///  numbers produce different addresses
pub fn test_addr_from_number(number: u16) -> SocketAddr {
    localhost(10_000 + number)
}

pub fn peer_ids<const N: usize>(ids: [&str; N]) -> std::collections::BTreeSet<PeerId> {
    ids.into_iter()
        .map(PeerId::new)
        .collect()
}
