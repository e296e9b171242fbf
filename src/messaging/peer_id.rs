use std::fmt::{Debug, Display, Formatter};

use bytes::{Buf, BufMut};

use crate::util::buf::{put_string, try_get_string};

/// A peer's identity in the chat network. It is chosen by the user (or the application) and
///  registered with the rendezvous service; it is stable across restarts, while a peer's network
///  address is not.
///
/// Vector clocks are keyed by [PeerId], so its ordering defines the iteration order of clocks.
#[derive(Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct PeerId(String);

impl PeerId {
    pub fn new(id: impl Into<String>) -> PeerId {
        PeerId(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn ser(&self, buf: &mut impl BufMut) {
        put_string(buf, &self.0);
    }

    pub fn try_deser(buf: &mut impl Buf) -> anyhow::Result<PeerId> {
        Ok(PeerId(try_get_string(buf)?))
    }
}

impl Debug for PeerId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "<{}>", self.0)
    }
}

impl Display for PeerId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for PeerId {
    fn from(value: &str) -> Self {
        PeerId::new(value)
    }
}
