use std::net::{SocketAddr, SocketAddrV4, SocketAddrV6};

use anyhow::anyhow;
use bytes::{Buf, BufMut};
use bytes_varint::{VarIntSupport, VarIntSupportMut};
use uuid::Uuid;

pub fn put_len(buf: &mut impl BufMut, len: usize) {
    buf.put_u64_varint(len as u64);
}

/// Reads a varint length prefix, rejecting lengths that exceed the rest of the buffer
pub fn try_get_len(buf: &mut impl Buf) -> anyhow::Result<usize> {
    let len = buf.try_get_u64_varint()
        .map_err(|e| anyhow!("invalid varint length: {:?}", e))? as usize;
    if len > buf.remaining() {
        return Err(anyhow!("length {} exceeds remaining buffer of {} bytes", len, buf.remaining()));
    }
    Ok(len)
}

pub fn put_string(buf: &mut impl BufMut, s: &str) {
    put_len(buf, s.len());
    buf.put_slice(s.as_bytes());
}

pub fn try_get_string(buf: &mut impl Buf) -> anyhow::Result<String> {
    let len = try_get_len(buf)?;
    let mut result = vec![0u8; len];
    buf.try_copy_to_slice(&mut result)?;

    let s = String::from_utf8(result)?;
    Ok(s)
}

pub fn put_uuid(buf: &mut impl BufMut, uuid: &Uuid) {
    buf.put_u128(uuid.as_u128());
}

pub fn try_get_uuid(buf: &mut impl Buf) -> anyhow::Result<Uuid> {
    Ok(Uuid::from_u128(buf.try_get_u128()?))
}

pub fn put_socket_addr(buf: &mut impl BufMut, addr: &SocketAddr) {
    match addr {
        SocketAddr::V4(data) => {
            buf.put_u8(4);
            buf.put_u32(data.ip().to_bits());
            buf.put_u16(data.port());
        }
        SocketAddr::V6(data) => {
            buf.put_u8(6);
            buf.put_u128(data.ip().to_bits());
            buf.put_u16(data.port());
        }
    }
}

pub fn try_get_socket_addr(buf: &mut impl Buf) -> anyhow::Result<SocketAddr> {
    let addr = match buf.try_get_u8()? {
        4 => {
            let ip = buf.try_get_u32()?;
            let port = buf.try_get_u16()?;
            SocketAddr::V4(SocketAddrV4::new(ip.into(), port))
        }
        6 => {
            let ip = buf.try_get_u128()?;
            let port = buf.try_get_u16()?;
            SocketAddr::V6(SocketAddrV6::new(ip.into(), port, 0, 0))
        }
        n => {
            return Err(anyhow!("invalid socket address discriminator: {}", n));
        }
    };
    Ok(addr)
}

#[cfg(test)]
mod tests {
    use bytes::{Buf, BytesMut};
    use rstest::rstest;
    use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
    use crate::util::buf::*;

    #[rstest]
    #[case::empty("", vec![0])]
    #[case::a("a", vec![1,97])]
    #[case::abc("abc", vec![3,97,98,99])]
    #[case::umlaut("ä", vec![2,0xc3,0xa4])]
    #[case::heart("❤️", vec![6, 226,157,164,239,184,143])]
    fn test_put_string(#[case] s: &str, #[case] expected: Vec<u8>) {
        let mut buf = BytesMut::new();
        put_string(&mut buf, s);
        assert_eq!(&buf, &expected);

        let mut deser_buf: &[u8] = &buf;
        let deser = try_get_string(&mut deser_buf).unwrap();
        assert!(deser_buf.is_empty());
        assert_eq!(&deser, s);
    }

    #[test]
    fn test_try_get_string_remaining() {
        let mut deser_buf: &[u8] = b"\x01abc";
        let actual = try_get_string(&mut deser_buf).unwrap();
        assert_eq!(&actual, "a");
        assert_eq!(deser_buf.chunk(), b"bc");
    }

    #[test]
    fn test_try_get_string_too_short() {
        let mut deser_buf: &[u8] = b"\x02a";
        assert!(try_get_string(&mut deser_buf).is_err());
    }

    #[test]
    fn test_try_get_string_not_unicode() {
        let mut deser_buf: &[u8] = b"\x02\xc0\xaf";
        assert!(try_get_string(&mut deser_buf).is_err());
    }

    #[test]
    fn test_try_get_len_exceeding_buffer() {
        let mut deser_buf: &[u8] = b"\xff\xff\x03abc";
        assert!(try_get_len(&mut deser_buf).is_err());
    }

    #[rstest]
    #[case(SocketAddrV4::new(Ipv4Addr::LOCALHOST, 9876).into())]
    #[case("4.5.6.7:89".parse().unwrap())]
    #[case("[2001:db8::1]:8080".parse().unwrap())]
    fn test_socket_addr(#[case] addr: SocketAddr) {
        let mut buf = BytesMut::new();
        put_socket_addr(&mut buf, &addr);
        let mut deser_buf: &[u8] = &buf;
        assert_eq!(try_get_socket_addr(&mut deser_buf).unwrap(), addr);
        assert!(deser_buf.is_empty());
    }

    #[test]
    fn test_socket_addr_invalid_discriminator() {
        let mut deser_buf: &[u8] = b"\x05\0\0\0\0\0\0";
        assert!(try_get_socket_addr(&mut deser_buf).is_err());
    }
}
