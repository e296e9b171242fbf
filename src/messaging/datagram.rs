use anyhow::anyhow;
use bytes::{Buf, BufMut, BytesMut};
use crc::{Crc, CRC_32_ISCSI};

use crate::messaging::packet::Packet;

const KIND_SEQUENCED: u8 = 1;
const KIND_ACK: u8 = 2;

const CHECKSUM: Crc<u32> = Crc::<u32>::new(&CRC_32_ISCSI);

/// The unit of transmission on the wire: every UDP datagram carries exactly one [Datagram].
///
/// ```ascii
/// 0: kind (u8): 1 = sequenced envelope, 2 = ack
/// 1: CRC-32 (iSCSI polynomial) over all bytes starting at offset 5
/// 5: sequence number (u64)
/// 13: packet (sequenced envelopes only)
/// ```
///
/// Datagram boundaries are preserved by UDP, so there is no length prefix.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Datagram {
    Sequenced { seq: u64, packet: Packet },
    Ack { seq: u64 },
}

impl Datagram {
    pub const HEADER_LEN: usize = 1 + 4 + 8;

    pub fn seq(&self) -> u64 {
        match self {
            Datagram::Sequenced { seq, .. } => *seq,
            Datagram::Ack { seq } => *seq,
        }
    }

    pub fn ser(&self, buf: &mut BytesMut) {
        let (kind, seq) = match self {
            Datagram::Sequenced { seq, .. } => (KIND_SEQUENCED, *seq),
            Datagram::Ack { seq } => (KIND_ACK, *seq),
        };

        let start = buf.len();
        buf.put_u8(kind);
        buf.put_u32(0); // patched below
        buf.put_u64(seq);
        if let Datagram::Sequenced { packet, .. } = self {
            packet.ser(buf);
        }

        let checksum = CHECKSUM.checksum(&buf[start + 5..]);
        buf[start + 1..start + 5].copy_from_slice(&checksum.to_be_bytes());
    }

    /// Parses a complete datagram. Trailing bytes and checksum mismatches are errors, so that
    ///  mangled datagrams are rejected as a whole rather than partially interpreted.
    pub fn try_deser(datagram: &[u8]) -> anyhow::Result<Datagram> {
        let mut buf = datagram;
        let kind = buf.try_get_u8()?;
        let checksum = buf.try_get_u32()?;

        let actual_checksum = CHECKSUM.checksum(buf);
        if checksum != actual_checksum {
            return Err(anyhow!("checksum mismatch: expected {:08x}, was {:08x}", checksum, actual_checksum));
        }

        let seq = buf.try_get_u64()?;
        let result = match kind {
            KIND_SEQUENCED => Datagram::Sequenced { seq, packet: Packet::try_deser(&mut buf)? },
            KIND_ACK => Datagram::Ack { seq },
            k => return Err(anyhow!("invalid datagram kind {}", k)),
        };

        if buf.has_remaining() {
            return Err(anyhow!("{} trailing bytes after datagram #{}", buf.remaining(), seq));
        }
        Ok(result)
    }
}
