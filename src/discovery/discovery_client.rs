use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use anyhow::anyhow;
use async_trait::async_trait;
#[cfg(test)] use mockall::automock;
use tokio::net::TcpStream;
use tokio::time::{sleep, timeout};
use tracing::{debug, info, warn};

use crate::config::ChatConfig;
use crate::discovery::discovery_wire::{read_frame, write_frame};
use crate::error::DiscoveryError;
use crate::messaging::datagram::Datagram;
use crate::messaging::packet::Packet;
use crate::messaging::peer_id::PeerId;

/// The rendezvous service as seen by a peer. It knows every registered peer's address, and it
///  relays packets to peers that could not be reached directly.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait Rendezvous: Send + Sync + 'static {
    /// Registers this peer as reachable at `port` (on the address the request comes from), and
    ///  returns the addresses of all registered peers, including this one
    async fn register(&self, id: &PeerId, port: u16) -> Result<BTreeMap<PeerId, SocketAddr>, DiscoveryError>;

    async fn disconnect(&self, id: &PeerId) -> Result<(), DiscoveryError>;

    /// Asks the service to deliver `packets` to `target_id` when it registers next
    async fn forward_queue(&self, target_id: &PeerId, packets: Vec<Packet>) -> Result<(), DiscoveryError>;
}

/// Talks to the rendezvous service over TCP, one connection per request. Every request is
///  attempted a fixed number of times with a fixed delay in between.
pub struct DiscoveryClient {
    rendezvous_addr: SocketAddr,
    retries: usize,
    retry_delay: Duration,
    request_timeout: Duration,
    max_frame_len: usize,
    next_seq: AtomicU64,
}

impl DiscoveryClient {
    pub fn new(config: &ChatConfig) -> DiscoveryClient {
        DiscoveryClient {
            rendezvous_addr: config.rendezvous_addr,
            retries: config.discovery_retries.max(1),
            retry_delay: config.discovery_retry_delay,
            request_timeout: config.discovery_request_timeout,
            max_frame_len: config.max_datagram_size,
            next_seq: AtomicU64::new(1),
        }
    }

    async fn request<T>(&self, packet: Packet, parse_reply: impl Fn(u64, Datagram) -> anyhow::Result<T>) -> Result<T, DiscoveryError> {
        let mut last_error = String::new();

        for attempt in 1..=self.retries {
            let seq = self.next_seq.fetch_add(1, Ordering::AcqRel);

            match timeout(self.request_timeout, self.round_trip(seq, packet.clone())).await {
                Ok(Ok(reply)) => match parse_reply(seq, reply) {
                    Ok(result) => return Ok(result),
                    Err(e) => last_error = e.to_string(),
                },
                Ok(Err(e)) => last_error = e.to_string(),
                Err(_) => last_error = format!("no reply within {:?}", self.request_timeout),
            }

            warn!("request #{} to rendezvous service at {:?} failed (attempt {} of {}): {}", seq, self.rendezvous_addr, attempt, self.retries, last_error);
            if attempt < self.retries {
                sleep(self.retry_delay).await;
            }
        }

        Err(DiscoveryError::Unreachable { attempts: self.retries, last_error })
    }

    async fn round_trip(&self, seq: u64, packet: Packet) -> anyhow::Result<Datagram> {
        let mut stream = TcpStream::connect(self.rendezvous_addr).await?;
        debug!("sending request #{} to rendezvous service: {:?}", seq, packet);
        write_frame(&mut stream, &Datagram::Sequenced { seq, packet }).await?;
        read_frame(&mut stream, self.max_frame_len).await
    }
}

fn expect_ack(seq: u64, reply: Datagram) -> anyhow::Result<()> {
    match reply {
        Datagram::Ack { seq: acked } if acked == seq => Ok(()),
        other => Err(anyhow!("expected ack for #{}, got {:?}", seq, other)),
    }
}

#[async_trait]
impl Rendezvous for DiscoveryClient {
    async fn register(&self, id: &PeerId, port: u16) -> Result<BTreeMap<PeerId, SocketAddr>, DiscoveryError> {
        let addresses = self.request(Packet::RegisterAddress { id: id.clone(), port }, |seq, reply| {
            match reply {
                Datagram::Sequenced { seq: reply_seq, packet: Packet::PeerAddressTable { addresses } } if reply_seq == seq => Ok(addresses),
                other => Err(anyhow!("expected peer address table for #{}, got {:?}", seq, other)),
            }
        }).await?;

        info!("registered as {} with rendezvous service, {} peer(s) known", id, addresses.len());
        Ok(addresses)
    }

    async fn disconnect(&self, id: &PeerId) -> Result<(), DiscoveryError> {
        self.request(Packet::Goodbye { id: id.clone() }, expect_ack).await?;
        info!("deregistered {} from rendezvous service", id);
        Ok(())
    }

    async fn forward_queue(&self, target_id: &PeerId, packets: Vec<Packet>) -> Result<(), DiscoveryError> {
        let num_packets = packets.len();
        self.request(Packet::ForwardQueue { target_id: target_id.clone(), packets }, expect_ack).await?;
        debug!("handed {} packet(s) for {} to rendezvous service", num_packets, target_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::AtomicUsize;

    use tokio::net::TcpListener;

    use crate::test_util::peer::localhost;
    use super::*;

    fn config(rendezvous_addr: SocketAddr) -> ChatConfig {
        let mut config = ChatConfig::new(PeerId::new("a"), localhost(0), rendezvous_addr);
        config.discovery_retries = 3;
        config.discovery_retry_delay = Duration::from_millis(10);
        config.discovery_request_timeout = Duration::from_millis(500);
        config
    }

    /// answers every request with the result of `reply`, counting the requests it received
    async fn fake_service(reply: impl Fn(Datagram) -> Option<Datagram> + Send + 'static) -> (SocketAddr, Arc<AtomicUsize>) {
        let listener = TcpListener::bind(localhost(0)).await.unwrap();
        let addr = listener.local_addr().unwrap();
        let num_requests = Arc::new(AtomicUsize::new(0));

        let counter = num_requests.clone();
        tokio::spawn(async move {
            loop {
                let (mut stream, _) = listener.accept().await.unwrap();
                let request = read_frame(&mut stream, 1024).await.unwrap();
                counter.fetch_add(1, Ordering::SeqCst);
                if let Some(response) = reply(request) {
                    write_frame(&mut stream, &response).await.unwrap();
                }
            }
        });

        (addr, num_requests)
    }

    #[tokio::test]
    async fn test_register() {
        let (addr, num_requests) = fake_service(|request| {
            match request {
                Datagram::Sequenced { seq, packet: Packet::RegisterAddress { id, port } } => Some(Datagram::Sequenced {
                    seq,
                    packet: Packet::PeerAddressTable { addresses: [(id, localhost(port))].into() },
                }),
                _ => None,
            }
        }).await;

        let client = DiscoveryClient::new(&config(addr));
        let table = client.register(&PeerId::new("a"), 1234).await.unwrap();
        assert_eq!(table, [(PeerId::new("a"), localhost(1234))].into());
        assert_eq!(num_requests.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_disconnect_and_forward_are_acked() {
        let (addr, num_requests) = fake_service(|request| Some(Datagram::Ack { seq: request.seq() })).await;

        let client = DiscoveryClient::new(&config(addr));
        client.disconnect(&PeerId::new("a")).await.unwrap();
        client.forward_queue(&PeerId::new("b"), vec![Packet::Bye { sender_id: PeerId::new("a") }]).await.unwrap();
        assert_eq!(num_requests.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_unexpected_replies_are_retried() {
        let (addr, num_requests) = fake_service(|request| Some(Datagram::Ack { seq: request.seq() + 100 })).await;

        let client = DiscoveryClient::new(&config(addr));
        let result = client.disconnect(&PeerId::new("a")).await;
        assert!(matches!(result, Err(DiscoveryError::Unreachable { attempts: 3, .. })));
        assert_eq!(num_requests.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_unreachable_after_retries() {
        // bind and drop to get an address where nobody listens
        let addr = TcpListener::bind(localhost(0)).await.unwrap().local_addr().unwrap();

        let client = DiscoveryClient::new(&config(addr));
        match client.register(&PeerId::new("a"), 1234).await {
            Err(DiscoveryError::Unreachable { attempts, last_error }) => {
                assert_eq!(attempts, 3);
                assert!(!last_error.is_empty());
            }
            other => panic!("expected DiscoveryUnreachable, got {:?}", other),
        }
    }
}
