use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::anyhow;
use rustc_hash::FxHashMap;
use tokio::net::{TcpListener, TcpStream};
use tokio::select;
use tokio::sync::RwLock;
use tokio::task::JoinSet;
use tracing::{debug, info, span, warn, Instrument, Level};
use uuid::Uuid;

use crate::config::RendezvousConfig;
use crate::discovery::discovery_wire::{read_frame, write_frame};
use crate::messaging::datagram::Datagram;
use crate::messaging::packet::Packet;
use crate::messaging::peer_id::PeerId;
use crate::messaging::reliable_channel::{InboundQueues, ReliableChannel};

#[derive(Default)]
struct RendezvousState {
    addresses: BTreeMap<PeerId, SocketAddr>,
    forward_queues: FxHashMap<PeerId, Vec<Packet>>,
}

/// A minimal rendezvous service keeping everything in memory.
///
/// Peers register via TCP request / response. Whenever the set of registered peers changes, the
///  service pushes the new address table to all registered peers over a [ReliableChannel], and
///  it relays forwarded packets to a peer when that peer registers.
pub struct RendezvousServer {
    listener: TcpListener,
    channel: Arc<ReliableChannel>,
    max_frame_len: usize,
    state: RwLock<RendezvousState>,
}

impl RendezvousServer {
    pub async fn bind(config: RendezvousConfig) -> anyhow::Result<Arc<RendezvousServer>> {
        let listener = TcpListener::bind(config.listen_addr).await?;
        let (channel, inbound) = ReliableChannel::bind(config.push_addr, config.ack_timeout, config.max_datagram_size).await?;
        info!("rendezvous service listening on {:?}, pushing from {:?}", listener.local_addr()?, channel.local_addr());
        tokio::spawn(discard_inbound(inbound));

        Ok(Arc::new(RendezvousServer {
            listener,
            channel,
            max_frame_len: config.max_datagram_size,
            state: Default::default(),
        }))
    }

    pub fn local_addr(&self) -> anyhow::Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub async fn addresses(&self) -> BTreeMap<PeerId, SocketAddr> {
        self.state.read().await
            .addresses
            .clone()
    }

    pub async fn num_forwarded_packets(&self, target_id: &PeerId) -> usize {
        self.state.read().await
            .forward_queues.get(target_id)
            .map(|q| q.len())
            .unwrap_or(0)
    }

    /// Accepts connections until an I/O error on the listening socket
    pub async fn run(self: Arc<Self>) -> anyhow::Result<()> {
        loop {
            let (stream, from) = self.listener.accept().await?;

            let correlation_id = Uuid::new_v4();
            let span = span!(Level::DEBUG, "rendezvous_request", ?correlation_id, ?from);
            let server = self.clone();
            tokio::spawn(async move {
                if let Err(e) = server.handle_connection(stream, from).await {
                    warn!("error handling request from {:?}: {}", from, e);
                }
            }.instrument(span));
        }
    }

    pub async fn close(&self) {
        self.channel.close().await;
    }

    async fn handle_connection(self: Arc<Self>, mut stream: TcpStream, from: SocketAddr) -> anyhow::Result<()> {
        let Datagram::Sequenced { seq, packet } = read_frame(&mut stream, self.max_frame_len).await? else {
            return Err(anyhow!("expected a request, got an ack"));
        };
        debug!("request #{}: {:?}", seq, packet);

        match packet {
            Packet::RegisterAddress { id, port } => {
                let peer_addr = SocketAddr::new(from.ip(), port);
                let addresses = self.on_register(id.clone(), peer_addr).await;
                write_frame(&mut stream, &Datagram::Sequenced { seq, packet: Packet::PeerAddressTable { addresses } }).await?;

                tokio::spawn(async move {
                    self.push_address_table(Some(&id)).await;
                    self.relay_forward_queue(id, peer_addr).await;
                });
            }
            Packet::Goodbye { id } => {
                info!("peer {} said goodbye", id);
                self.state.write().await
                    .addresses.remove(&id);
                write_frame(&mut stream, &Datagram::Ack { seq }).await?;

                tokio::spawn(async move {
                    self.push_address_table(None).await;
                });
            }
            Packet::ForwardQueue { target_id, packets } => {
                debug!("storing {} packet(s) for {}", packets.len(), target_id);
                self.state.write().await
                    .forward_queues.entry(target_id)
                    .or_default()
                    .extend(packets);
                write_frame(&mut stream, &Datagram::Ack { seq }).await?;
            }
            other => {
                return Err(anyhow!("unexpected request {:?}", other));
            }
        }
        Ok(())
    }

    async fn on_register(&self, id: PeerId, addr: SocketAddr) -> BTreeMap<PeerId, SocketAddr> {
        info!("registering peer {} at {:?}", id, addr);
        let mut state = self.state.write().await;
        state.addresses.insert(id, addr);
        state.addresses.clone()
    }

    /// sends the current table to all registered peers except `except`, concurrently
    async fn push_address_table(&self, except: Option<&PeerId>) {
        let addresses = self.addresses().await;

        let mut sends = JoinSet::new();
        for (id, &addr) in &addresses {
            if Some(id) == except {
                continue;
            }
            let channel = self.channel.clone();
            let packet = Packet::PeerAddressTable { addresses: addresses.clone() };
            let id = id.clone();
            sends.spawn(async move {
                if let Err(e) = channel.send(addr, packet).await {
                    debug!("could not push address table to {} at {:?}: {}", id, addr, e);
                }
            });
        }
        while sends.join_next().await.is_some() {}
    }

    async fn relay_forward_queue(&self, id: PeerId, addr: SocketAddr) {
        let Some(packets) = self.state.write().await.forward_queues.remove(&id) else {
            return;
        };

        info!("relaying {} forwarded packet(s) to {}", packets.len(), id);
        let packet = Packet::ForwardQueue { target_id: id.clone(), packets };
        if let Err(e) = self.channel.send(addr, packet.clone()).await {
            warn!("could not relay forwarded packets to {}, keeping them: {}", id, e);
            if let Packet::ForwardQueue { packets, .. } = packet {
                let mut state = self.state.write().await;
                let queue = state.forward_queues.entry(id).or_default();
                // packets that arrived in the meantime go after the ones that failed
                let newer = std::mem::replace(queue, packets);
                queue.extend(newer);
            }
        }
    }
}

/// Peers only ack what the service pushes, so anything sequenced that arrives at the push address
///  is unexpected. It is acked by the channel and dropped here. Returns the number of dropped
///  packets once the channel is closed.
async fn discard_inbound(mut inbound: InboundQueues) -> usize {
    let mut num_discarded = 0;
    loop {
        let (from, packet) = select! {
            Some(received) = inbound.peer.recv() => received,
            Some(received) = inbound.discovery.recv() => received,
            else => break,
        };
        debug!("ignoring {:?} from {:?}", packet, from);
        num_discarded += 1;
    }
    num_discarded
}
