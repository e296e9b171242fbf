use std::collections::btree_map::Entry;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt::{Debug, Formatter};

use bytes::{Buf, BufMut};
use bytes_varint::{VarIntSupport, VarIntSupportMut};
use anyhow::anyhow;

use crate::messaging::peer_id::PeerId;
use crate::util::buf::{put_len, try_get_len};

/// A vector clock maps each peer to the number of messages it has sent (in a given room). Missing
///  entries are treated as zero, so a freshly created clock is the bottom element of the partial
///  order.
///
/// A clock is a value: payloads carry their own copy, which is never updated after the payload
///  was created.
#[derive(Clone, Default, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct VectorClock(BTreeMap<PeerId, u64>);

/// The outcome of comparing an incoming payload's clock against a room's local clock.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Delivery {
    /// Exactly one member is ahead of local knowledge, and by exactly one message: this is the
    ///  next message from that member, and all its causal predecessors were delivered.
    Deliverable(PeerId),
    /// No member is ahead of local knowledge: the message was seen before.
    Duplicate,
    /// Some causal predecessor is still missing. This includes the case of several members being
    ///  one ahead at the same time.
    NotYetDeliverable,
}

impl VectorClock {
    pub fn new() -> VectorClock {
        VectorClock::default()
    }

    pub fn get(&self, peer: &PeerId) -> u64 {
        self.0.get(peer).cloned().unwrap_or(0)
    }

    /// increments a peer's counter, returning the new value
    pub fn increment(&mut self, peer: &PeerId) -> u64 {
        let counter = self.0.entry(peer.clone()).or_insert(0);
        *counter += 1;
        *counter
    }

    /// Moves a peer's counter forward to `value`. Counters never move backward, so a smaller
    ///  value leaves the clock unchanged.
    pub fn advance(&mut self, peer: &PeerId, value: u64) {
        match self.0.entry(peer.clone()) {
            Entry::Occupied(mut e) => {
                if *e.get() < value {
                    e.insert(value);
                }
            }
            Entry::Vacant(e) => {
                e.insert(value);
            }
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&PeerId, &u64)> {
        self.0.iter()
    }

    /// `true` if every counter of `self` is <= the corresponding counter of `other`, and at least
    ///  one is strictly smaller
    pub fn happened_before(&self, other: &VectorClock) -> bool {
        let all_peers = self.0.keys().chain(other.0.keys()).collect::<BTreeSet<_>>();

        let mut strictly_smaller = false;
        for peer in all_peers {
            let mine = self.get(peer);
            let theirs = other.get(peer);
            if mine > theirs {
                return false;
            }
            if mine < theirs {
                strictly_smaller = true;
            }
        }
        strictly_smaller
    }

    /// Decides whether a payload with clock `incoming` can be delivered on top of `self` (the
    ///  local clock), looking at the counters of `members` only.
    ///
    /// This must be called against the *current* local clock every time: a payload that is not
    ///  yet deliverable may become deliverable after other payloads were delivered, never the
    ///  other way around.
    pub fn classify<'a>(&self, incoming: &VectorClock, members: impl IntoIterator<Item = &'a PeerId>) -> Delivery {
        let mut one_ahead = Vec::new();
        let mut further_ahead = false;

        for member in members {
            let local = self.get(member);
            let remote = incoming.get(member);

            if remote == local + 1 {
                one_ahead.push(member);
            }
            else if remote > local + 1 {
                further_ahead = true;
            }
        }

        match (further_ahead, one_ahead.as_slice()) {
            (false, []) => Delivery::Duplicate,
            (false, [sender]) => Delivery::Deliverable((*sender).clone()),
            _ => Delivery::NotYetDeliverable,
        }
    }

    pub fn ser(&self, buf: &mut impl BufMut) {
        put_len(buf, self.0.len());
        for (peer, &counter) in &self.0 {
            peer.ser(buf);
            buf.put_u64_varint(counter);
        }
    }

    pub fn try_deser(buf: &mut impl Buf) -> anyhow::Result<VectorClock> {
        let len = try_get_len(buf)?;
        let mut result = BTreeMap::new();
        for _ in 0..len {
            let peer = PeerId::try_deser(buf)?;
            let counter = buf.try_get_u64_varint()
                .map_err(|e| anyhow!("invalid varint counter: {:?}", e))?;
            result.insert(peer, counter);
        }
        Ok(VectorClock(result))
    }
}

impl Debug for VectorClock {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{{")?;
        for (i, (peer, counter)) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ",")?;
            }
            write!(f, "{}:{}", peer, counter)?;
        }
        write!(f, "}}")
    }
}

impl <const N: usize> From<[(&str, u64); N]> for VectorClock {
    fn from(value: [(&str, u64); N]) -> Self {
        VectorClock(
            value.into_iter()
                .map(|(peer, counter)| (PeerId::new(peer), counter))
                .collect()
        )
    }
}
