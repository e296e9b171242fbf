use std::fmt::{Debug, Formatter};

use bytes::{Buf, BufMut};

use crate::chat::vector_clock::VectorClock;
use crate::messaging::peer_id::PeerId;
use crate::util::buf::{put_string, try_get_string};

/// A single chat message. Payloads are immutable values: the vector clock is the sender's full
///  clock at the time of sending, copied into the payload.
#[derive(Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct Payload {
    text: String,
    vector_clock: VectorClock,
    sender_id: PeerId,
}

impl Payload {
    pub fn new(text: impl Into<String>, vector_clock: VectorClock, sender_id: PeerId) -> Payload {
        Payload {
            text: text.into(),
            vector_clock,
            sender_id,
        }
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn vector_clock(&self) -> &VectorClock {
        &self.vector_clock
    }

    pub fn sender_id(&self) -> &PeerId {
        &self.sender_id
    }

    pub fn ser(&self, buf: &mut impl BufMut) {
        put_string(buf, &self.text);
        self.vector_clock.ser(buf);
        self.sender_id.ser(buf);
    }

    pub fn try_deser(buf: &mut impl Buf) -> anyhow::Result<Payload> {
        let text = try_get_string(buf)?;
        let vector_clock = VectorClock::try_deser(buf)?;
        let sender_id = PeerId::try_deser(buf)?;
        Ok(Payload {
            text,
            vector_clock,
            sender_id,
        })
    }
}

impl Debug for Payload {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}@{:?}: {:?}", self.sender_id, self.vector_clock, self.text)
    }
}

#[cfg(test)]
mod tests {
    use bytes::BytesMut;
    use super::*;

    #[test]
    fn test_ser_deser() {
        let payload = Payload::new("hello ❤️", VectorClock::from([("a", 2), ("b", 1)]), PeerId::new("b"));

        let mut buf = BytesMut::new();
        payload.ser(&mut buf);
        let mut parse_buf: &[u8] = &buf;
        assert_eq!(Payload::try_deser(&mut parse_buf).unwrap(), payload);
        assert!(parse_buf.is_empty());
    }

    #[test]
    fn test_try_deser_truncated() {
        let payload = Payload::new("hello", VectorClock::from([("a", 2)]), PeerId::new("a"));
        let mut buf = BytesMut::new();
        payload.ser(&mut buf);

        let mut parse_buf: &[u8] = &buf[..buf.len() - 1];
        assert!(Payload::try_deser(&mut parse_buf).is_err());
    }
}
