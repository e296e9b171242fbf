use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::bail;
use tokio::select;
use tokio::sync::{broadcast, Mutex};
use tokio::time::timeout;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::chat::backup::{FileRoomBackup, InMemoryRoomBackup, RoomBackup};
use crate::chat::chat_events::{ChatEvent, ChatEventNotifier};
use crate::chat::chat_room::ChatRoomSnapshot;
use crate::chat::payload::Payload;
use crate::chat::room_registry::{RoomInfo, RoomRegistry};
use crate::config::ChatConfig;
use crate::discovery::discovery_client::{DiscoveryClient, Rendezvous};
use crate::messaging::peer_id::PeerId;
use crate::messaging::reliable_channel::{InboundQueues, ReliableChannel};
use crate::peers::peer_manager::PeerManager;
use crate::peers::peer_state::PeerSummary;
use crate::peers::reconnect::run_reconnect_loop;

/// This is the chat node's public API
pub struct ChatNode {
    pub config: Arc<ChatConfig>,
    channel: Arc<ReliableChannel>,
    backup: Arc<dyn RoomBackup>,
    rooms: Arc<RoomRegistry>,
    peers: Arc<PeerManager>,
    event_notifier: Arc<ChatEventNotifier>,
    inbound: Mutex<Option<InboundQueues>>,
}

impl ChatNode {
    /// Starts a node with the TCP based discovery client, and a file based backup if the config
    ///  has a backup directory
    pub async fn start(config: ChatConfig) -> anyhow::Result<ChatNode> {
        let rendezvous = Arc::new(DiscoveryClient::new(&config));
        let backup: Arc<dyn RoomBackup> = match &config.backup_dir {
            Some(dir) => Arc::new(FileRoomBackup::new(dir)),
            None => Arc::new(InMemoryRoomBackup::new()),
        };
        ChatNode::start_with(config, rendezvous, backup).await
    }

    /// Binds the node's channel, restores rooms from the backup and registers with the rendezvous
    ///  service. The node does not process incoming packets before [ChatNode::run] is called.
    pub async fn start_with(config: ChatConfig, rendezvous: Arc<dyn Rendezvous>, backup: Arc<dyn RoomBackup>) -> anyhow::Result<ChatNode> {
        let config = Arc::new(config);
        let (channel, inbound) = ReliableChannel::bind(config.listen_addr, config.ack_timeout, config.max_datagram_size).await?;

        let rooms = Arc::new(RoomRegistry::with_pending_limit(config.max_pending_payloads));
        for snapshot in backup.load_rooms(&config.self_id).await? {
            debug!("restoring room {} ({})", snapshot.name, snapshot.id);
            rooms.restore(snapshot).await;
        }

        let event_notifier = Arc::new(ChatEventNotifier::new());
        let peers = Arc::new(PeerManager::new(
            config.clone(),
            channel.clone(),
            rendezvous.clone(),
            rooms.clone(),
            backup.clone(),
            event_notifier.clone(),
        ));

        let addresses = match rendezvous.register(&config.self_id, channel.local_addr().port()).await {
            Ok(addresses) => addresses,
            Err(e) => {
                error!("could not register with the rendezvous service: {}", e);
                channel.close().await;
                return Err(e.into());
            }
        };
        peers.on_address_table(&addresses).await;

        info!("peer {} started on {:?}", config.self_id, channel.local_addr());
        Ok(ChatNode {
            config,
            channel,
            backup,
            rooms,
            peers,
            event_notifier,
            inbound: Mutex::new(Some(inbound)),
        })
    }

    pub fn self_id(&self) -> &PeerId {
        &self.config.self_id
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.channel.local_addr()
    }

    /// Processes incoming packets and reconnects to unreachable peers until the node is shut down
    pub async fn run(&self) -> anyhow::Result<()> {
        let Some(inbound) = self.inbound.lock().await.take() else {
            bail!("node is running already");
        };

        select! {
            _ = run_inbound_loop(self.peers.clone(), inbound) => {
                debug!("inbound queues were closed");
            }
            _ = run_reconnect_loop(self.peers.clone(), self.config.reconnect_interval) => {
                debug!("reconnect loop stopped");
            }
        }
        Ok(())
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ChatEvent> {
        self.event_notifier.subscribe()
    }

    pub async fn create_room(&self, name: &str, members: impl IntoIterator<Item = PeerId>) -> anyhow::Result<Uuid> {
        self.peers.create_room(name, members).await
    }

    pub async fn delete_room(&self, room_id: Uuid) -> anyhow::Result<()> {
        self.peers.delete_room(room_id).await
    }

    pub async fn send_message(&self, room_id: Uuid, text: &str) -> anyhow::Result<Payload> {
        self.peers.send_to_room(room_id, text).await
    }

    pub async fn send_delayed_message(&self, room_id: Uuid, text: &str, delay_seconds: u32) -> anyhow::Result<Payload> {
        self.peers.send_delayed_to_room(room_id, text, delay_seconds).await
    }

    pub async fn rooms(&self) -> Vec<RoomInfo> {
        self.rooms.list().await
    }

    pub async fn room_snapshot(&self, room_id: Uuid) -> Option<ChatRoomSnapshot> {
        self.rooms.snapshot(&room_id).await
    }

    pub async fn peers(&self) -> Vec<PeerSummary> {
        self.peers.peers().await
    }

    /// Saves all rooms, leaves the network and closes the channel. Leaving the network is cut
    ///  short if it does not complete within the configured grace period.
    pub async fn shutdown(&self) -> anyhow::Result<()> {
        info!("shutting down peer {}", self.config.self_id);

        let save_result = self.backup.save_rooms(&self.config.self_id, self.rooms.open_room_snapshots().await).await;
        if let Err(e) = &save_result {
            error!("could not save rooms: {}", e);
        }

        if timeout(self.config.shutdown_grace_period, self.peers.disconnect()).await.is_err() {
            warn!("disconnecting did not finish within {:?}", self.config.shutdown_grace_period);
        }

        self.channel.close().await;
        save_result
    }
}

async fn run_inbound_loop(peers: Arc<PeerManager>, mut inbound: InboundQueues) {
    loop {
        select! {
            Some((from, packet)) = inbound.peer.recv() => {
                peers.on_inbound(from, packet).await;
            }
            Some((from, packet)) = inbound.discovery.recv() => {
                peers.on_inbound(from, packet).await;
            }
            else => break,
        }
    }
}
