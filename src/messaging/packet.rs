use std::collections::{BTreeMap, BTreeSet};
use std::net::SocketAddr;

use anyhow::anyhow;
use bytes::{Buf, BufMut};
use uuid::Uuid;

use crate::chat::payload::Payload;
use crate::messaging::peer_id::PeerId;
use crate::util::buf::{put_len, put_socket_addr, put_string, put_uuid, try_get_len, try_get_socket_addr, try_get_string, try_get_uuid};

const ID_HELLO: u8 = 1;
const ID_BYE: u8 = 2;
const ID_MESSAGE: u8 = 3;
const ID_DELAYED_MESSAGE: u8 = 4;
const ID_CREATE_ROOM: u8 = 5;
const ID_DELETE_ROOM: u8 = 6;
const ID_REGISTER_ADDRESS: u8 = 20;
const ID_GOODBYE: u8 = 21;
const ID_FORWARD_QUEUE: u8 = 22;
const ID_PEER_ADDRESS_TABLE: u8 = 23;

/// Everything peers and the rendezvous service say to each other. The variants fall into two
///  planes (see [PacketPlane]): peer-to-peer traffic, and traffic with the rendezvous service.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Packet {
    /// A peer announces that it is (back) online and reachable at the packet's source address
    Hello { sender_id: PeerId },
    /// A peer leaves gracefully
    Bye { sender_id: PeerId },
    Message { room_id: Uuid, payload: Payload },
    /// This is a simulation aid: the receiver sleeps for the given time before handing the
    ///  payload to the chat room, emulating a slow link for this one message.
    DelayedMessage { room_id: Uuid, payload: Payload, delay_seconds: u32 },
    CreateRoom { room_id: Uuid, name: String, member_ids: BTreeSet<PeerId> },
    DeleteRoom { room_id: Uuid },

    RegisterAddress { id: PeerId, port: u16 },
    Goodbye { id: PeerId },
    /// Packets that could not be delivered directly to `target_id`. The rendezvous service keeps
    ///  them and relays them (wrapped in another [Packet::ForwardQueue]) once the target registers.
    ///  Forward queues do not nest.
    ForwardQueue { target_id: PeerId, packets: Vec<Packet> },
    PeerAddressTable { addresses: BTreeMap<PeerId, SocketAddr> },
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum PacketPlane {
    Peer,
    Discovery,
}

impl Packet {
    pub fn id(&self) -> u8 {
        match self {
            Packet::Hello { .. } => ID_HELLO,
            Packet::Bye { .. } => ID_BYE,
            Packet::Message { .. } => ID_MESSAGE,
            Packet::DelayedMessage { .. } => ID_DELAYED_MESSAGE,
            Packet::CreateRoom { .. } => ID_CREATE_ROOM,
            Packet::DeleteRoom { .. } => ID_DELETE_ROOM,
            Packet::RegisterAddress { .. } => ID_REGISTER_ADDRESS,
            Packet::Goodbye { .. } => ID_GOODBYE,
            Packet::ForwardQueue { .. } => ID_FORWARD_QUEUE,
            Packet::PeerAddressTable { .. } => ID_PEER_ADDRESS_TABLE,
        }
    }

    pub fn plane(&self) -> PacketPlane {
        match self {
            Packet::Hello { .. } |
            Packet::Bye { .. } |
            Packet::Message { .. } |
            Packet::DelayedMessage { .. } |
            Packet::CreateRoom { .. } |
            Packet::DeleteRoom { .. } => PacketPlane::Peer,

            Packet::RegisterAddress { .. } |
            Packet::Goodbye { .. } |
            Packet::ForwardQueue { .. } |
            Packet::PeerAddressTable { .. } => PacketPlane::Discovery,
        }
    }

    pub fn ser(&self, buf: &mut impl BufMut) {
        buf.put_u8(self.id());
        match self {
            Packet::Hello { sender_id } => sender_id.ser(buf),
            Packet::Bye { sender_id } => sender_id.ser(buf),
            Packet::Message { room_id, payload } => {
                put_uuid(buf, room_id);
                payload.ser(buf);
            }
            Packet::DelayedMessage { room_id, payload, delay_seconds } => {
                put_uuid(buf, room_id);
                payload.ser(buf);
                buf.put_u32(*delay_seconds);
            }
            Packet::CreateRoom { room_id, name, member_ids } => Self::ser_create_room(room_id, name, member_ids, buf),
            Packet::DeleteRoom { room_id } => put_uuid(buf, room_id),
            Packet::RegisterAddress { id, port } => {
                id.ser(buf);
                buf.put_u16(*port);
            }
            Packet::Goodbye { id } => id.ser(buf),
            Packet::ForwardQueue { target_id, packets } => Self::ser_forward_queue(target_id, packets, buf),
            Packet::PeerAddressTable { addresses } => Self::ser_peer_address_table(addresses, buf),
        }
    }

    fn ser_create_room(room_id: &Uuid, name: &str, member_ids: &BTreeSet<PeerId>, buf: &mut impl BufMut) {
        put_uuid(buf, room_id);
        put_string(buf, name);
        put_len(buf, member_ids.len());
        for member in member_ids {
            member.ser(buf);
        }
    }

    fn ser_forward_queue(target_id: &PeerId, packets: &[Packet], buf: &mut impl BufMut) {
        target_id.ser(buf);
        put_len(buf, packets.len());
        for packet in packets {
            packet.ser(buf);
        }
    }

    fn ser_peer_address_table(addresses: &BTreeMap<PeerId, SocketAddr>, buf: &mut impl BufMut) {
        put_len(buf, addresses.len());
        for (id, addr) in addresses {
            id.ser(buf);
            put_socket_addr(buf, addr);
        }
    }

    pub fn try_deser(buf: &mut impl Buf) -> anyhow::Result<Packet> {
        Self::try_deser_nested(buf, true)
    }

    fn try_deser_nested(buf: &mut impl Buf, allow_forward_queue: bool) -> anyhow::Result<Packet> {
        match buf.try_get_u8()? {
            ID_HELLO => Ok(Packet::Hello { sender_id: PeerId::try_deser(buf)? }),
            ID_BYE => Ok(Packet::Bye { sender_id: PeerId::try_deser(buf)? }),
            ID_MESSAGE => {
                let room_id = try_get_uuid(buf)?;
                let payload = Payload::try_deser(buf)?;
                Ok(Packet::Message { room_id, payload })
            }
            ID_DELAYED_MESSAGE => {
                let room_id = try_get_uuid(buf)?;
                let payload = Payload::try_deser(buf)?;
                let delay_seconds = buf.try_get_u32()?;
                Ok(Packet::DelayedMessage { room_id, payload, delay_seconds })
            }
            ID_CREATE_ROOM => Self::deser_create_room(buf),
            ID_DELETE_ROOM => Ok(Packet::DeleteRoom { room_id: try_get_uuid(buf)? }),
            ID_REGISTER_ADDRESS => {
                let id = PeerId::try_deser(buf)?;
                let port = buf.try_get_u16()?;
                Ok(Packet::RegisterAddress { id, port })
            }
            ID_GOODBYE => Ok(Packet::Goodbye { id: PeerId::try_deser(buf)? }),
            ID_FORWARD_QUEUE if allow_forward_queue => Self::deser_forward_queue(buf),
            ID_FORWARD_QUEUE => Err(anyhow!("nested forward queues are not allowed")),
            ID_PEER_ADDRESS_TABLE => Self::deser_peer_address_table(buf),
            id => Err(anyhow!("invalid packet discriminator {}", id)),
        }
    }

    fn deser_create_room(buf: &mut impl Buf) -> anyhow::Result<Packet> {
        let room_id = try_get_uuid(buf)?;
        let name = try_get_string(buf)?;
        let num_members = try_get_len(buf)?;
        let mut member_ids = BTreeSet::new();
        for _ in 0..num_members {
            member_ids.insert(PeerId::try_deser(buf)?);
        }
        Ok(Packet::CreateRoom { room_id, name, member_ids })
    }

    fn deser_forward_queue(buf: &mut impl Buf) -> anyhow::Result<Packet> {
        let target_id = PeerId::try_deser(buf)?;
        let num_packets = try_get_len(buf)?;
        let mut packets = Vec::with_capacity(num_packets);
        for _ in 0..num_packets {
            packets.push(Self::try_deser_nested(buf, false)?);
        }
        Ok(Packet::ForwardQueue { target_id, packets })
    }

    fn deser_peer_address_table(buf: &mut impl Buf) -> anyhow::Result<Packet> {
        let num_addresses = try_get_len(buf)?;
        let mut addresses = BTreeMap::new();
        for _ in 0..num_addresses {
            let id = PeerId::try_deser(buf)?;
            let addr = try_get_socket_addr(buf)?;
            addresses.insert(id, addr);
        }
        Ok(Packet::PeerAddressTable { addresses })
    }
}

#[cfg(test)]
mod tests {
    use bytes::BytesMut;
    use rstest::rstest;
    use crate::chat::vector_clock::VectorClock;
    use super::*;

    fn room_id() -> Uuid {
        Uuid::from_u128(0x1234_5678_9abc_def0_1234_5678_9abc_def0)
    }

    fn payload() -> Payload {
        Payload::new("TEST", VectorClock::from([("a", 1), ("b", 0)]), PeerId::new("a"))
    }

    #[rstest]
    #[case::hello(Packet::Hello { sender_id: PeerId::new("a") }, ID_HELLO, PacketPlane::Peer)]
    #[case::bye(Packet::Bye { sender_id: PeerId::new("a") }, ID_BYE, PacketPlane::Peer)]
    #[case::message(Packet::Message { room_id: room_id(), payload: payload() }, ID_MESSAGE, PacketPlane::Peer)]
    #[case::delayed_message(Packet::DelayedMessage { room_id: room_id(), payload: payload(), delay_seconds: 3 }, ID_DELAYED_MESSAGE, PacketPlane::Peer)]
    #[case::create_room(Packet::CreateRoom { room_id: room_id(), name: "lobby".to_string(), member_ids: [PeerId::new("a"), PeerId::new("b")].into() }, ID_CREATE_ROOM, PacketPlane::Peer)]
    #[case::delete_room(Packet::DeleteRoom { room_id: room_id() }, ID_DELETE_ROOM, PacketPlane::Peer)]
    #[case::register_address(Packet::RegisterAddress { id: PeerId::new("a"), port: 7001 }, ID_REGISTER_ADDRESS, PacketPlane::Discovery)]
    #[case::goodbye(Packet::Goodbye { id: PeerId::new("a") }, ID_GOODBYE, PacketPlane::Discovery)]
    #[case::forward_queue(Packet::ForwardQueue { target_id: PeerId::new("b"), packets: vec![
        Packet::Bye { sender_id: PeerId::new("a") },
        Packet::Message { room_id: room_id(), payload: payload() },
    ] }, ID_FORWARD_QUEUE, PacketPlane::Discovery)]
    #[case::peer_address_table(Packet::PeerAddressTable { addresses: [
        (PeerId::new("a"), "127.0.0.1:7001".parse().unwrap()),
        (PeerId::new("b"), "[::1]:7002".parse().unwrap()),
    ].into() }, ID_PEER_ADDRESS_TABLE, PacketPlane::Discovery)]
    fn test_ser_packet(#[case] packet: Packet, #[case] id: u8, #[case] plane: PacketPlane) {
        assert_eq!(packet.id(), id);
        assert_eq!(packet.plane(), plane);

        let mut buf = BytesMut::new();
        packet.ser(&mut buf);
        assert_eq!(buf[0], id);

        let mut parse_buf: &[u8] = &buf;
        assert_eq!(Packet::try_deser(&mut parse_buf).unwrap(), packet);
        assert!(parse_buf.is_empty());
    }

    #[test]
    fn test_deser_invalid_discriminator() {
        let mut parse_buf: &[u8] = b"\x63abc";
        assert!(Packet::try_deser(&mut parse_buf).is_err());
    }

    #[test]
    fn test_deser_nested_forward_queue() {
        let nested = Packet::ForwardQueue {
            target_id: PeerId::new("b"),
            packets: vec![Packet::ForwardQueue { target_id: PeerId::new("c"), packets: vec![] }],
        };
        let mut buf = BytesMut::new();
        nested.ser(&mut buf);

        let mut parse_buf: &[u8] = &buf;
        assert!(Packet::try_deser(&mut parse_buf).is_err());
    }

    #[test]
    fn test_deser_truncated() {
        let mut buf = BytesMut::new();
        Packet::CreateRoom { room_id: room_id(), name: "lobby".to_string(), member_ids: [PeerId::new("a")].into() }
            .ser(&mut buf);

        for len in 0..buf.len() {
            let mut parse_buf: &[u8] = &buf[..len];
            assert!(Packet::try_deser(&mut parse_buf).is_err(), "truncated to {} bytes", len);
        }
    }
}
