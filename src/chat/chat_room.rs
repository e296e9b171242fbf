use std::collections::BTreeSet;

use anyhow::bail;
use bytes::{Buf, BufMut};
use tracing::{debug, trace};
use uuid::Uuid;

use crate::chat::payload::Payload;
use crate::chat::vector_clock::{Delivery, VectorClock};
use crate::messaging::peer_id::PeerId;
use crate::util::buf::{put_len, put_string, put_uuid, try_get_len, try_get_string, try_get_uuid};

/// A chat room with causal delivery: a payload is appended to the `delivered` log only after
///  every payload it causally depends on, and payloads that arrive early wait in a buffer until
///  their predecessors show up.
///
/// Membership is fixed when the room is created. A deleted room is closed: it ignores pushed
///  payloads and rejects new messages, but its history stays readable.
#[derive(Debug)]
pub struct ChatRoom {
    id: Uuid,
    name: String,
    members: BTreeSet<PeerId>,
    vector_clock: VectorClock,
    delivered: Vec<Payload>,
    waiting: BTreeSet<Payload>,
    is_closed: bool,
}

impl ChatRoom {
    pub fn new(id: Uuid, name: impl Into<String>, members: BTreeSet<PeerId>) -> ChatRoom {
        ChatRoom {
            id,
            name: name.into(),
            members,
            vector_clock: VectorClock::new(),
            delivered: Vec::new(),
            waiting: BTreeSet::new(),
            is_closed: false,
        }
    }

    pub fn from_snapshot(snapshot: ChatRoomSnapshot) -> ChatRoom {
        ChatRoom {
            id: snapshot.id,
            name: snapshot.name,
            members: snapshot.members,
            vector_clock: snapshot.vector_clock,
            delivered: snapshot.delivered,
            waiting: snapshot.waiting.into_iter().collect(),
            is_closed: false,
        }
    }

    pub fn snapshot(&self) -> ChatRoomSnapshot {
        ChatRoomSnapshot {
            id: self.id,
            name: self.name.clone(),
            members: self.members.clone(),
            vector_clock: self.vector_clock.clone(),
            waiting: self.waiting.iter().cloned().collect(),
            delivered: self.delivered.clone(),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn members(&self) -> &BTreeSet<PeerId> {
        &self.members
    }

    pub fn vector_clock(&self) -> &VectorClock {
        &self.vector_clock
    }

    pub fn delivered(&self) -> &[Payload] {
        &self.delivered
    }

    pub fn num_waiting(&self) -> usize {
        self.waiting.len()
    }

    pub fn is_closed(&self) -> bool {
        self.is_closed
    }

    pub fn close(&mut self) {
        self.is_closed = true;
    }

    /// Creates a new payload from the local peer. Local messages are delivered immediately: they
    ///  depend on exactly what was delivered here so far.
    pub fn send(&mut self, text: impl Into<String>, sender_id: &PeerId) -> anyhow::Result<Payload> {
        if self.is_closed {
            bail!("room {} ({}) was deleted", self.name, self.id);
        }

        self.vector_clock.increment(sender_id);
        let payload = Payload::new(text, self.vector_clock.clone(), sender_id.clone());
        self.delivered.push(payload.clone());
        Ok(payload)
    }

    /// Hands a payload received from a remote peer to the room. Returns the payloads that were
    ///  delivered as a consequence, in delivery order: the pushed payload itself if it was
    ///  deliverable, followed by any waiting payloads it released.
    pub fn push(&mut self, payload: Payload) -> Vec<Payload> {
        let mut newly_delivered = Vec::new();

        if self.is_closed {
            debug!("room {} is closed - ignoring {:?}", self.id, payload);
            return newly_delivered;
        }

        match self.vector_clock.classify(payload.vector_clock(), &self.members) {
            Delivery::Duplicate => {
                debug!("room {}: discarding duplicate {:?}", self.id, payload);
                return newly_delivered;
            }
            Delivery::NotYetDeliverable => {
                trace!("room {}: {:?} is not yet deliverable, local clock is {:?}", self.id, payload, self.vector_clock);
                self.waiting.insert(payload);
                return newly_delivered;
            }
            Delivery::Deliverable(sender) => {
                self.deliver(&sender, payload, &mut newly_delivered);
            }
        }

        self.release_waiting(&mut newly_delivered);
        newly_delivered
    }

    fn deliver(&mut self, sender: &PeerId, payload: Payload, newly_delivered: &mut Vec<Payload>) {
        self.vector_clock.advance(sender, payload.vector_clock().get(sender));
        trace!("room {}: delivering {:?}", self.id, payload);
        self.delivered.push(payload.clone());
        newly_delivered.push(payload);
    }

    /// Re-scans the waiting payloads until a full pass delivers nothing. Every payload is
    ///  classified against the clock as it is at that point, so a payload delivered early in a
    ///  pass can release one that comes later in the same pass.
    fn release_waiting(&mut self, newly_delivered: &mut Vec<Payload>) {
        loop {
            let mut made_progress = false;

            for payload in std::mem::take(&mut self.waiting) {
                match self.vector_clock.classify(payload.vector_clock(), &self.members) {
                    Delivery::Deliverable(sender) => {
                        self.deliver(&sender, payload, newly_delivered);
                        made_progress = true;
                    }
                    Delivery::Duplicate => {
                        debug!("room {}: discarding waiting duplicate {:?}", self.id, payload);
                    }
                    Delivery::NotYetDeliverable => {
                        self.waiting.insert(payload);
                    }
                }
            }

            if !made_progress {
                break;
            }
        }
    }
}

/// A room's complete state, as it is handed to (and restored from) a backup
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ChatRoomSnapshot {
    pub id: Uuid,
    pub name: String,
    pub members: BTreeSet<PeerId>,
    pub vector_clock: VectorClock,
    pub waiting: Vec<Payload>,
    pub delivered: Vec<Payload>,
}

impl ChatRoomSnapshot {
    pub fn ser(&self, buf: &mut impl BufMut) {
        put_uuid(buf, &self.id);
        put_string(buf, &self.name);
        put_len(buf, self.members.len());
        for member in &self.members {
            member.ser(buf);
        }
        self.vector_clock.ser(buf);
        Self::ser_payloads(&self.waiting, buf);
        Self::ser_payloads(&self.delivered, buf);
    }

    fn ser_payloads(payloads: &[Payload], buf: &mut impl BufMut) {
        put_len(buf, payloads.len());
        for payload in payloads {
            payload.ser(buf);
        }
    }

    pub fn try_deser(buf: &mut impl Buf) -> anyhow::Result<ChatRoomSnapshot> {
        let id = try_get_uuid(buf)?;
        let name = try_get_string(buf)?;

        let num_members = try_get_len(buf)?;
        let mut members = BTreeSet::new();
        for _ in 0..num_members {
            members.insert(PeerId::try_deser(buf)?);
        }

        let vector_clock = VectorClock::try_deser(buf)?;
        let waiting = Self::try_deser_payloads(buf)?;
        let delivered = Self::try_deser_payloads(buf)?;

        Ok(ChatRoomSnapshot {
            id,
            name,
            members,
            vector_clock,
            waiting,
            delivered,
        })
    }

    fn try_deser_payloads(buf: &mut impl Buf) -> anyhow::Result<Vec<Payload>> {
        let len = try_get_len(buf)?;
        let mut result = Vec::with_capacity(len);
        for _ in 0..len {
            result.push(Payload::try_deser(buf)?);
        }
        Ok(result)
    }
}
