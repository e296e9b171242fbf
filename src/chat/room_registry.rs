use std::collections::BTreeSet;
use std::sync::Arc;

use rustc_hash::FxHashMap;
use tokio::sync::RwLock;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::chat::chat_room::{ChatRoom, ChatRoomSnapshot};
use crate::chat::payload::Payload;
use crate::messaging::peer_id::PeerId;

#[derive(Debug, Eq, PartialEq)]
pub enum PushOutcome {
    /// The room exists; these payloads were delivered (possibly none)
    Delivered(Vec<Payload>),
    /// The room is not known (yet), and the payload was set aside until it is created
    RoomPending,
    /// The room is not known, and too many payloads are waiting for unknown rooms already
    Dropped,
}

/// Brief description of a room for listings
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct RoomInfo {
    pub id: Uuid,
    pub name: String,
    pub members: BTreeSet<PeerId>,
    pub num_delivered: usize,
    pub is_closed: bool,
}

/// All chat rooms of a node, each behind its own lock. Payloads for rooms that are not known yet
///  (because the room's `CreateRoom` packet is still on its way) are kept until the room is
///  created, up to a limit for all unknown rooms together.
///
/// Locks are always acquired in the order `rooms`, `pending`, individual room.
pub struct RoomRegistry {
    rooms: RwLock<FxHashMap<Uuid, Arc<RwLock<ChatRoom>>>>,
    pending: RwLock<FxHashMap<Uuid, Vec<Payload>>>,
    max_pending: usize,
}

pub const DEFAULT_MAX_PENDING_PAYLOADS: usize = 1024;

impl RoomRegistry {
    pub fn new() -> RoomRegistry {
        RoomRegistry::with_pending_limit(DEFAULT_MAX_PENDING_PAYLOADS)
    }

    pub fn with_pending_limit(max_pending: usize) -> RoomRegistry {
        RoomRegistry {
            rooms: Default::default(),
            pending: Default::default(),
            max_pending,
        }
    }

    /// Creates a room and feeds it any payloads that arrived for it before it was created.
    ///  Creating a room that exists already leaves it unchanged; the result is `None` in that
    ///  case, and the payloads delivered by creating it otherwise.
    pub async fn create(&self, id: Uuid, name: &str, members: BTreeSet<PeerId>) -> Option<Vec<Payload>> {
        let mut rooms = self.rooms.write().await;
        if rooms.contains_key(&id) {
            debug!("room {} exists already - ignoring", id);
            return None;
        }

        let mut room = ChatRoom::new(id, name, members);
        let mut newly_delivered = Vec::new();
        if let Some(early_payloads) = self.pending.write().await.remove(&id) {
            debug!("room {}: releasing {} payload(s) that arrived before the room was created", id, early_payloads.len());
            for payload in early_payloads {
                newly_delivered.extend(room.push(payload));
            }
        }

        rooms.insert(id, Arc::new(RwLock::new(room)));
        Some(newly_delivered)
    }

    /// Adds a room restored from a backup, replacing a room with the same id
    pub async fn restore(&self, snapshot: ChatRoomSnapshot) {
        let id = snapshot.id;
        self.rooms.write().await
            .insert(id, Arc::new(RwLock::new(ChatRoom::from_snapshot(snapshot))));
    }

    pub async fn get(&self, id: &Uuid) -> Option<Arc<RwLock<ChatRoom>>> {
        self.rooms.read().await
            .get(id)
            .cloned()
    }

    pub async fn push(&self, room_id: Uuid, payload: Payload) -> PushOutcome {
        let rooms = self.rooms.read().await;
        match rooms.get(&room_id) {
            Some(room) => {
                let room = room.clone();
                drop(rooms);
                let newly_delivered = room.write().await
                    .push(payload);
                PushOutcome::Delivered(newly_delivered)
            }
            None => {
                // still holding the `rooms` lock, so the room can not be created concurrently
                let mut pending = self.pending.write().await;
                let num_pending = pending.values().map(|p| p.len()).sum::<usize>();
                if num_pending >= self.max_pending {
                    warn!("{} payload(s) are waiting for unknown rooms already - dropping {:?} for room {}", num_pending, payload, room_id);
                    return PushOutcome::Dropped;
                }

                debug!("room {} is not known yet - buffering {:?}", room_id, payload);
                pending.entry(room_id)
                    .or_default()
                    .push(payload);
                PushOutcome::RoomPending
            }
        }
    }

    /// Closes a room, returning `true` if it existed and was open before
    pub async fn close(&self, id: &Uuid) -> bool {
        let Some(room) = self.get(id).await else {
            debug!("closing unknown room {} - ignoring", id);
            self.pending.write().await.remove(id);
            return false;
        };

        let mut room = room.write().await;
        let was_open = !room.is_closed();
        room.close();
        was_open
    }

    pub async fn list(&self) -> Vec<RoomInfo> {
        let rooms = self.rooms.read().await
            .values()
            .cloned()
            .collect::<Vec<_>>();

        let mut result = Vec::new();
        for room in rooms {
            let room = room.read().await;
            result.push(RoomInfo {
                id: room.id(),
                name: room.name().to_string(),
                members: room.members().clone(),
                num_delivered: room.delivered().len(),
                is_closed: room.is_closed(),
            });
        }
        result.sort_by(|a, b| a.name.cmp(&b.name).then(a.id.cmp(&b.id)));
        result
    }

    pub async fn snapshot(&self, id: &Uuid) -> Option<ChatRoomSnapshot> {
        let room = self.get(id).await?;
        let snapshot = room.read().await.snapshot();
        Some(snapshot)
    }

    /// snapshots of all rooms that were not deleted
    pub async fn open_room_snapshots(&self) -> Vec<ChatRoomSnapshot> {
        let rooms = self.rooms.read().await
            .values()
            .cloned()
            .collect::<Vec<_>>();

        let mut result = Vec::new();
        for room in rooms {
            let room = room.read().await;
            if !room.is_closed() {
                result.push(room.snapshot());
            }
        }
        result
    }

    pub async fn num_pending(&self) -> usize {
        self.pending.read().await
            .values()
            .map(|p| p.len())
            .sum()
    }
}
