use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, bail};
use async_trait::async_trait;
use bytes::{Buf, BufMut, BytesMut};
#[cfg(test)] use mockall::automock;
use rustc_hash::FxHashMap;
use tokio::fs;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::chat::chat_room::ChatRoomSnapshot;
use crate::messaging::peer_id::PeerId;

/// Persistence of chat rooms between runs. Snapshots contain a room's full state including
///  payloads that were not delivered yet.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait RoomBackup: Send + Sync + 'static {
    async fn load_rooms(&self, peer_id: &PeerId) -> anyhow::Result<Vec<ChatRoomSnapshot>>;
    async fn save_rooms(&self, peer_id: &PeerId, snapshots: Vec<ChatRoomSnapshot>) -> anyhow::Result<()>;
    async fn delete_room_backup(&self, peer_id: &PeerId, room_id: Uuid) -> anyhow::Result<()>;
}

const FILE_FORMAT_VERSION: u8 = 1;
const FILE_EXTENSION: &str = "room";

/// Stores every room in a file of its own: `<base dir>/<peer id>/<room id>.room`
pub struct FileRoomBackup {
    base_dir: PathBuf,
}

impl FileRoomBackup {
    pub fn new(base_dir: impl Into<PathBuf>) -> FileRoomBackup {
        FileRoomBackup {
            base_dir: base_dir.into(),
        }
    }

    fn peer_dir(&self, peer_id: &PeerId) -> anyhow::Result<PathBuf> {
        let id = peer_id.as_str();
        if id.is_empty() || id == "." || id == ".." || id.contains(&['/', '\\'][..]) {
            bail!("peer id {:?} can not be used as a directory name", peer_id);
        }
        Ok(self.base_dir.join(id))
    }

    fn room_file(dir: &Path, room_id: Uuid) -> PathBuf {
        dir.join(format!("{}.{}", room_id, FILE_EXTENSION))
    }

    fn encode(snapshot: &ChatRoomSnapshot) -> BytesMut {
        let mut buf = BytesMut::new();
        buf.put_u8(FILE_FORMAT_VERSION);
        snapshot.ser(&mut buf);
        buf
    }

    fn decode(mut buf: &[u8]) -> anyhow::Result<ChatRoomSnapshot> {
        let version = buf.try_get_u8()?;
        if version != FILE_FORMAT_VERSION {
            return Err(anyhow!("unsupported backup file version {}", version));
        }
        let snapshot = ChatRoomSnapshot::try_deser(&mut buf)?;
        if buf.has_remaining() {
            bail!("{} trailing bytes", buf.remaining());
        }
        Ok(snapshot)
    }
}

#[async_trait]
impl RoomBackup for FileRoomBackup {
    async fn load_rooms(&self, peer_id: &PeerId) -> anyhow::Result<Vec<ChatRoomSnapshot>> {
        let dir = self.peer_dir(peer_id)?;
        let mut entries = match fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                debug!("no backup directory {:?} - starting without rooms", dir);
                return Ok(Vec::new());
            }
            Err(e) => return Err(e.into()),
        };

        let mut result = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some(FILE_EXTENSION) {
                continue;
            }

            let raw = fs::read(&path).await?;
            match Self::decode(&raw) {
                Ok(snapshot) => result.push(snapshot),
                Err(e) => warn!("skipping corrupt backup file {:?}: {}", path, e),
            }
        }

        info!("loaded {} room(s) from {:?}", result.len(), dir);
        Ok(result)
    }

    async fn save_rooms(&self, peer_id: &PeerId, snapshots: Vec<ChatRoomSnapshot>) -> anyhow::Result<()> {
        let dir = self.peer_dir(peer_id)?;
        fs::create_dir_all(&dir).await?;

        for snapshot in &snapshots {
            let file = Self::room_file(&dir, snapshot.id);
            let tmp_file = file.with_extension("tmp");
            fs::write(&tmp_file, Self::encode(snapshot)).await?;
            fs::rename(&tmp_file, &file).await?;
        }

        info!("saved {} room(s) to {:?}", snapshots.len(), dir);
        Ok(())
    }

    async fn delete_room_backup(&self, peer_id: &PeerId, room_id: Uuid) -> anyhow::Result<()> {
        let file = Self::room_file(&self.peer_dir(peer_id)?, room_id);
        match fs::remove_file(&file).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// Keeps backups in memory only, e.g. for nodes without a backup directory
#[derive(Default)]
pub struct InMemoryRoomBackup {
    rooms: RwLock<FxHashMap<PeerId, FxHashMap<Uuid, ChatRoomSnapshot>>>,
}

impl InMemoryRoomBackup {
    pub fn new() -> InMemoryRoomBackup {
        Default::default()
    }
}

#[async_trait]
impl RoomBackup for InMemoryRoomBackup {
    async fn load_rooms(&self, peer_id: &PeerId) -> anyhow::Result<Vec<ChatRoomSnapshot>> {
        Ok(self.rooms.read().await
            .get(peer_id)
            .map(|rooms| rooms.values().cloned().collect())
            .unwrap_or_default())
    }

    async fn save_rooms(&self, peer_id: &PeerId, snapshots: Vec<ChatRoomSnapshot>) -> anyhow::Result<()> {
        let mut rooms = self.rooms.write().await;
        let peer_rooms = rooms.entry(peer_id.clone()).or_default();
        for snapshot in snapshots {
            peer_rooms.insert(snapshot.id, snapshot);
        }
        Ok(())
    }

    async fn delete_room_backup(&self, peer_id: &PeerId, room_id: Uuid) -> anyhow::Result<()> {
        if let Some(peer_rooms) = self.rooms.write().await.get_mut(peer_id) {
            peer_rooms.remove(&room_id);
        }
        Ok(())
    }
}
