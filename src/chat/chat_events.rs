use tokio::sync::broadcast;
use tracing::trace;
use uuid::Uuid;

use crate::chat::payload::Payload;
use crate::messaging::peer_id::PeerId;

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum ChatEvent {
    /// A peer became reachable, i.e. it answered and its queued packets were all delivered
    PeerConnected(PeerId),
    PeerDisconnected(PeerId),
    RoomCreated { room_id: Uuid, name: String },
    RoomDeleted { room_id: Uuid },
    /// A payload was appended to a room's delivered log. This includes the node's own messages.
    MessageDelivered { room_id: Uuid, payload: Payload },
}

pub struct ChatEventNotifier {
    sender: broadcast::Sender<ChatEvent>,
}
impl ChatEventNotifier {
    pub fn new() -> ChatEventNotifier {
        let (sender, _) = broadcast::channel(1024);

        ChatEventNotifier {
            sender
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ChatEvent> {
        self.sender.subscribe()
    }

    pub fn send_event(&self, event: ChatEvent) {
        trace!("event: {:?}", event);
        let _ = self.sender.send(event);
    }
}

impl Default for ChatEventNotifier {
    fn default() -> Self {
        ChatEventNotifier::new()
    }
}
