use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use rustc_hash::FxHashMap;

use crate::chat::room_registry::DEFAULT_MAX_PENDING_PAYLOADS;
use crate::messaging::peer_id::PeerId;

#[derive(Debug, Clone)]
pub struct ChatConfig {
    pub self_id: PeerId,
    /// the UDP address the node's reliable channel binds to
    pub listen_addr: SocketAddr,
    /// TCP address of the rendezvous service
    pub rendezvous_addr: SocketAddr,

    /// how long a send waits for the peer's ack before the peer is considered unreachable
    pub ack_timeout: Duration,
    pub reconnect_interval: Duration,

    /// number of attempts for each request to the rendezvous service before giving up
    pub discovery_retries: usize,
    pub discovery_retry_delay: Duration,
    /// timeout for a single request / response round trip with the rendezvous service
    pub discovery_request_timeout: Duration,

    /// upper bound for the time shutdown may take, regardless of wedged network calls
    pub shutdown_grace_period: Duration,

    pub max_datagram_size: usize,

    /// upper bound for payloads kept for rooms whose `CreateRoom` has not arrived yet, over all
    ///  such rooms
    pub max_pending_payloads: usize,

    /// Simulates degraded links for testing: packets received from these peers are processed
    ///  only after the given delay.
    pub artificial_delays: FxHashMap<PeerId, Duration>,

    /// chat rooms are loaded from and saved to this directory if it is set
    pub backup_dir: Option<PathBuf>,
}

impl ChatConfig {
    pub fn new(self_id: PeerId, listen_addr: SocketAddr, rendezvous_addr: SocketAddr) -> ChatConfig {
        ChatConfig {
            self_id,
            listen_addr,
            rendezvous_addr,
            ack_timeout: Duration::from_secs(5),
            reconnect_interval: Duration::from_secs(5),
            discovery_retries: 5,
            discovery_retry_delay: Duration::from_secs(1),
            discovery_request_timeout: Duration::from_secs(3),
            shutdown_grace_period: Duration::from_secs(2),
            max_datagram_size: 64*1024,
            max_pending_payloads: DEFAULT_MAX_PENDING_PAYLOADS,
            artificial_delays: Default::default(),
            backup_dir: None,
        }
    }

    pub fn artificial_delay(&self, peer: &PeerId) -> Option<Duration> {
        self.artificial_delays.get(peer).cloned()
    }
}

#[derive(Debug, Clone)]
pub struct RendezvousConfig {
    /// TCP address for register / goodbye / forward requests
    pub listen_addr: SocketAddr,
    /// UDP address of the reliable channel the service uses to push address tables and
    ///  forwarded packets to peers
    pub push_addr: SocketAddr,
    pub ack_timeout: Duration,
    pub max_datagram_size: usize,
}

impl RendezvousConfig {
    pub fn new(listen_addr: SocketAddr, push_addr: SocketAddr) -> RendezvousConfig {
        RendezvousConfig {
            listen_addr,
            push_addr,
            ack_timeout: Duration::from_secs(5),
            max_datagram_size: 64*1024,
        }
    }
}
