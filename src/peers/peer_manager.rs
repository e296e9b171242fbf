use std::collections::{BTreeMap, BTreeSet};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::bail;
use rustc_hash::FxHashMap;
use tokio::sync::RwLock;
use tokio::task::JoinSet;
use tokio::time::{sleep, timeout};
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use crate::chat::backup::RoomBackup;
use crate::chat::chat_events::{ChatEvent, ChatEventNotifier};
use crate::chat::payload::Payload;
use crate::chat::room_registry::{PushOutcome, RoomRegistry};
use crate::config::ChatConfig;
use crate::discovery::discovery_client::Rendezvous;
use crate::messaging::packet::{Packet, PacketPlane};
use crate::messaging::peer_id::PeerId;
use crate::messaging::reliable_channel::PacketSender;
use crate::peers::peer_state::{PeerContext, PeerHandle, PeerLink, PeerSummary, Reachability};

/// Keeps track of remote peers and their reachability, sends outbound packets (or queues them
///  for unreachable peers), and dispatches inbound packets to chat rooms.
pub struct PeerManager {
    config: Arc<ChatConfig>,
    ctx: Arc<PeerContext>,
    rendezvous: Arc<dyn Rendezvous>,
    rooms: Arc<RoomRegistry>,
    backup: Arc<dyn RoomBackup>,
    peers: RwLock<FxHashMap<PeerId, PeerHandle>>,
    is_shut_down: AtomicBool,
}

impl PeerManager {
    pub fn new(
        config: Arc<ChatConfig>,
        sender: Arc<dyn PacketSender>,
        rendezvous: Arc<dyn Rendezvous>,
        rooms: Arc<RoomRegistry>,
        backup: Arc<dyn RoomBackup>,
        event_notifier: Arc<ChatEventNotifier>,
    ) -> PeerManager {
        let ctx = Arc::new(PeerContext {
            self_id: config.self_id.clone(),
            sender,
            event_notifier,
        });

        PeerManager {
            config,
            ctx,
            rendezvous,
            rooms,
            backup,
            peers: Default::default(),
            is_shut_down: AtomicBool::new(false),
        }
    }

    pub fn self_id(&self) -> &PeerId {
        &self.ctx.self_id
    }

    pub fn is_shut_down(&self) -> bool {
        self.is_shut_down.load(Ordering::Acquire)
    }

    fn notify(&self, event: ChatEvent) {
        self.ctx.event_notifier.send_event(event);
    }

    /// returns the peer's link, creating an (unreachable) entry for an unknown peer
    async fn link(&self, id: &PeerId) -> Arc<PeerLink> {
        if let Some(handle) = self.peers.read().await.get(id) {
            return handle.link().clone();
        }

        self.peers.write().await
            .entry(id.clone())
            .or_insert_with(|| PeerHandle::new(id.clone(), None, self.ctx.clone()))
            .link()
            .clone()
    }

    async fn known_link(&self, id: &PeerId) -> Option<Arc<PeerLink>> {
        self.peers.read().await
            .get(id)
            .map(|h| h.link().clone())
    }

    async fn links(&self) -> Vec<Arc<PeerLink>> {
        self.peers.read().await
            .values()
            .map(|h| h.link().clone())
            .collect()
    }

    async fn enqueue(&self, to: &PeerId, packet: Packet) {
        if to == self.self_id() {
            return;
        }

        if !self.peers.read().await.contains_key(to) {
            self.link(to).await;
        }
        if let Some(handle) = self.peers.read().await.get(to) {
            handle.enqueue(packet).await;
        }
    }

    async fn broadcast(&self, members: &BTreeSet<PeerId>, packet: Packet) {
        for member in members {
            self.enqueue(member, packet.clone()).await;
        }
    }

    /// Sets the peer's address and connects to it, returning `true` if it is connected afterwards
    pub async fn connect(&self, id: &PeerId, addr: SocketAddr) -> bool {
        let link = self.link(id).await;
        link.set_address(addr).await;
        link.connect().await
    }

    /// Updates peer addresses from the rendezvous service's table, connecting in the background
    ///  to peers that moved or are not connected
    pub async fn on_address_table(&self, addresses: &BTreeMap<PeerId, SocketAddr>) {
        for (id, &addr) in addresses {
            if id == self.self_id() {
                continue;
            }

            let link = self.link(id).await;
            let moved = link.set_address(addr).await;
            if moved || link.reachability().await == Reachability::Unreachable {
                tokio::spawn(async move {
                    link.try_reconnect().await;
                });
            }
        }
    }

    /// Starts a reconnect attempt for every unreachable peer with a known address. Returns the
    ///  number of attempts that were started.
    pub async fn reconnect_unreachable(&self) -> usize {
        if self.is_shut_down() {
            return 0;
        }

        let mut num_attempts = 0;
        for link in self.links().await {
            if link.reachability().await == Reachability::Unreachable && link.address().await.is_some() {
                num_attempts += 1;
                tokio::spawn(async move {
                    link.try_reconnect().await;
                });
            }
        }
        if num_attempts > 0 {
            debug!("trying to reconnect to {} unreachable peer(s)", num_attempts);
        }
        num_attempts
    }

    pub async fn peers(&self) -> Vec<PeerSummary> {
        let mut result = Vec::new();
        for link in self.links().await {
            result.push(link.summary().await);
        }
        result.sort_by(|a, b| a.id.cmp(&b.id));
        result
    }

    pub async fn create_room(&self, name: &str, members: impl IntoIterator<Item = PeerId>) -> anyhow::Result<Uuid> {
        if self.is_shut_down() {
            bail!("node is shut down");
        }

        let mut members = members.into_iter().collect::<BTreeSet<_>>();
        members.insert(self.self_id().clone());

        let room_id = Uuid::new_v4();
        self.rooms.create(room_id, name, members.clone()).await;
        info!("created room {} ({}) with members {:?}", name, room_id, members);
        self.notify(ChatEvent::RoomCreated { room_id, name: name.to_string() });

        self.broadcast(&members, Packet::CreateRoom { room_id, name: name.to_string(), member_ids: members.clone() }).await;
        Ok(room_id)
    }

    pub async fn delete_room(&self, room_id: Uuid) -> anyhow::Result<()> {
        let Some(room) = self.rooms.get(&room_id).await else {
            bail!("unknown room {}", room_id);
        };
        let members = room.read().await.members().clone();

        if self.rooms.close(&room_id).await {
            info!("deleted room {}", room_id);
            self.notify(ChatEvent::RoomDeleted { room_id });
            self.broadcast(&members, Packet::DeleteRoom { room_id }).await;
            self.delete_backup(room_id).await;
        }
        Ok(())
    }

    pub async fn send_to_room(&self, room_id: Uuid, text: &str) -> anyhow::Result<Payload> {
        let (payload, members) = self.send_locally(room_id, text).await?;
        self.broadcast(&members, Packet::Message { room_id, payload: payload.clone() }).await;
        Ok(payload)
    }

    /// Sends a message that receivers process only after `delay_seconds`, simulating a slow link
    ///  for this message
    pub async fn send_delayed_to_room(&self, room_id: Uuid, text: &str, delay_seconds: u32) -> anyhow::Result<Payload> {
        let (payload, members) = self.send_locally(room_id, text).await?;
        self.broadcast(&members, Packet::DelayedMessage { room_id, payload: payload.clone(), delay_seconds }).await;
        Ok(payload)
    }

    async fn send_locally(&self, room_id: Uuid, text: &str) -> anyhow::Result<(Payload, BTreeSet<PeerId>)> {
        if self.is_shut_down() {
            bail!("node is shut down");
        }
        let Some(room) = self.rooms.get(&room_id).await else {
            bail!("unknown room {}", room_id);
        };

        let (payload, members) = {
            let mut room = room.write().await;
            let payload = room.send(text, self.self_id())?;
            (payload, room.members().clone())
        };

        self.notify(ChatEvent::MessageDelivered { room_id, payload: payload.clone() });
        Ok((payload, members))
    }

    async fn delete_backup(&self, room_id: Uuid) {
        if let Err(e) = self.backup.delete_room_backup(self.self_id(), room_id).await {
            warn!("could not delete backup of room {}: {}", room_id, e);
        }
    }

    /// Entry point for everything the reliable channel receives. Packets from a peer with an
    ///  artificial delay are processed on a separate task after that delay.
    pub async fn on_inbound(self: &Arc<Self>, from: SocketAddr, packet: Packet) {
        if self.is_shut_down() {
            trace!("shut down - ignoring {:?} from {:?}", packet, from);
            return;
        }

        if !self.config.artificial_delays.is_empty() {
            if let Some(delay) = self.origin_of(from, &packet).await.and_then(|id| self.config.artificial_delay(&id)) {
                trace!("delaying {:?} from {:?} by {:?}", packet, from, delay);
                let manager = self.clone();
                tokio::spawn(async move {
                    sleep(delay).await;
                    manager.dispatch(from, packet).await;
                });
                return;
            }
        }

        self.dispatch(from, packet).await;
    }

    async fn origin_of(&self, from: SocketAddr, packet: &Packet) -> Option<PeerId> {
        match packet {
            Packet::Hello { sender_id } | Packet::Bye { sender_id } => Some(sender_id.clone()),
            Packet::Message { payload, .. } | Packet::DelayedMessage { payload, .. } => Some(payload.sender_id().clone()),
            _ => {
                for link in self.links().await {
                    if link.address().await == Some(from) {
                        return Some(link.id().clone());
                    }
                }
                None
            }
        }
    }

    async fn dispatch(&self, from: SocketAddr, packet: Packet) {
        match packet.plane() {
            PacketPlane::Peer => self.on_peer_packet(Some(from), packet).await,
            PacketPlane::Discovery => self.on_discovery_packet(packet).await,
        }
    }

    /// `from` is `None` for packets relayed by the rendezvous service
    pub async fn on_peer_packet(&self, from: Option<SocketAddr>, packet: Packet) {
        debug!("received {:?} from {:?}", packet, from);

        match packet {
            Packet::Hello { sender_id } => {
                if &sender_id == self.self_id() {
                    return;
                }
                let link = self.link(&sender_id).await;
                if let Some(from) = from {
                    link.set_address(from).await;
                }
                tokio::spawn(async move {
                    link.drain().await;
                });
            }
            Packet::Bye { sender_id } => {
                if let Some(link) = self.known_link(&sender_id).await {
                    link.mark_unreachable().await;
                }
            }
            Packet::Message { room_id, payload } => {
                push_to_room(&self.rooms, &self.ctx.event_notifier, room_id, payload).await;
            }
            Packet::DelayedMessage { room_id, payload, delay_seconds } => {
                let rooms = self.rooms.clone();
                let event_notifier = self.ctx.event_notifier.clone();
                tokio::spawn(async move {
                    sleep(Duration::from_secs(delay_seconds.into())).await;
                    push_to_room(&rooms, &event_notifier, room_id, payload).await;
                });
            }
            Packet::CreateRoom { room_id, name, member_ids } => {
                if let Some(newly_delivered) = self.rooms.create(room_id, &name, member_ids).await {
                    info!("peer created room {} ({})", name, room_id);
                    self.notify(ChatEvent::RoomCreated { room_id, name });
                    for payload in newly_delivered {
                        self.notify(ChatEvent::MessageDelivered { room_id, payload });
                    }
                }
            }
            Packet::DeleteRoom { room_id } => {
                if self.rooms.close(&room_id).await {
                    info!("peer deleted room {}", room_id);
                    self.notify(ChatEvent::RoomDeleted { room_id });
                    self.delete_backup(room_id).await;
                }
            }
            other => {
                warn!("unexpected packet from a peer - ignoring: {:?}", other);
            }
        }
    }

    pub async fn on_discovery_packet(&self, packet: Packet) {
        match packet {
            Packet::PeerAddressTable { addresses } => {
                debug!("received address table with {} entries", addresses.len());
                self.on_address_table(&addresses).await;
            }
            Packet::ForwardQueue { target_id, packets } => {
                if &target_id != self.self_id() {
                    warn!("received forwarded packets for {} - ignoring", target_id);
                    return;
                }
                debug!("received {} forwarded packet(s)", packets.len());
                for packet in packets {
                    self.on_peer_packet(None, packet).await;
                }
            }
            other => {
                warn!("unexpected packet from the rendezvous service - ignoring: {:?}", other);
            }
        }
    }

    /// Leaves the network. Each peer's outbox is flushed first (bounded by part of the shutdown
    ///  grace period), so that `Bye` goes out after everything sent before. A connected peer with
    ///  nothing left to send gets `Bye` directly. For all others, whatever could not be delivered
    ///  plus `Bye` is handed to the rendezvous service for forwarding. Peers are forgotten
    ///  afterwards, and no reconnects happen after this.
    pub async fn disconnect(&self) {
        if self.is_shut_down.swap(true, Ordering::AcqRel) {
            return;
        }
        info!("disconnecting from all peers");

        let handles = self.peers.write().await
            .drain()
            .map(|(_, handle)| handle)
            .collect::<Vec<_>>();
        let outbox_wait = self.config.shutdown_grace_period / 4;
        let bye_timeout = self.config.shutdown_grace_period / 4;

        let mut byes = JoinSet::new();
        for handle in handles {
            let sender = self.ctx.sender.clone();
            let rendezvous = self.rendezvous.clone();
            let bye = Packet::Bye { sender_id: self.self_id().clone() };

            byes.spawn(async move {
                let link = handle.shut_down(outbox_wait).await;
                let (reachability, address, mut leftovers) = link.take_for_shutdown().await;

                let bye_was_acked = match (reachability, address) {
                    (Reachability::Connected, Some(addr)) if leftovers.is_empty() => {
                        matches!(timeout(bye_timeout, sender.send_packet(addr, bye.clone())).await, Ok(Ok(())))
                    }
                    _ => false,
                };
                if !bye_was_acked {
                    leftovers.push(bye);
                    debug!("forwarding {} packet(s) for {} through the rendezvous service", leftovers.len(), link.id());
                    if let Err(e) = rendezvous.forward_queue(link.id(), leftovers).await {
                        warn!("could not forward packets for {}: {}", link.id(), e);
                    }
                }
                (link.id().clone(), reachability)
            });
        }

        while let Some(result) = byes.join_next().await {
            match result {
                Ok((id, Reachability::Connected)) => self.notify(ChatEvent::PeerDisconnected(id)),
                Ok(_) => {}
                Err(e) => warn!("error saying goodbye: {}", e),
            }
        }

        if let Err(e) = self.rendezvous.disconnect(self.self_id()).await {
            warn!("could not deregister from the rendezvous service: {}", e);
        }
    }
}

async fn push_to_room(rooms: &RoomRegistry, event_notifier: &ChatEventNotifier, room_id: Uuid, payload: Payload) {
    match rooms.push(room_id, payload).await {
        PushOutcome::Delivered(payloads) => {
            for payload in payloads {
                event_notifier.send_event(ChatEvent::MessageDelivered { room_id, payload });
            }
        }
        PushOutcome::RoomPending | PushOutcome::Dropped => {}
    }
}
