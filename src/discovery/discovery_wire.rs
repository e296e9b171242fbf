use anyhow::bail;
use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::messaging::datagram::Datagram;

/// Requests to the rendezvous service and their replies travel over a stream connection, each
///  as a [Datagram] preceded by its length (u32, big endian):
///
/// * `Sequenced { RegisterAddress }` is answered with `Sequenced { PeerAddressTable }` carrying
///   the request's sequence number
/// * `Sequenced { Goodbye }` and `Sequenced { ForwardQueue }` are answered with `Ack`
pub async fn write_frame(stream: &mut (impl AsyncWrite + Unpin), datagram: &Datagram) -> anyhow::Result<()> {
    let mut buf = BytesMut::new();
    datagram.ser(&mut buf);

    stream.write_u32(buf.len() as u32).await?;
    stream.write_all(&buf).await?;
    stream.flush().await?;
    Ok(())
}

pub async fn read_frame(stream: &mut (impl AsyncRead + Unpin), max_len: usize) -> anyhow::Result<Datagram> {
    let len = stream.read_u32().await? as usize;
    if len > max_len {
        bail!("frame of {} bytes exceeds the maximum of {} bytes", len, max_len);
    }

    let mut buf = vec![0u8; len];
    stream.read_exact(&mut buf).await?;
    Datagram::try_deser(&buf)
}

#[cfg(test)]
mod tests {
    use crate::messaging::packet::Packet;
    use crate::messaging::peer_id::PeerId;
    use super::*;

    #[tokio::test]
    async fn test_frames() {
        let (mut client, mut server) = tokio::io::duplex(1024);

        let request = Datagram::Sequenced { seq: 7, packet: Packet::Goodbye { id: PeerId::new("a") } };
        write_frame(&mut client, &request).await.unwrap();
        write_frame(&mut client, &Datagram::Ack { seq: 7 }).await.unwrap();

        assert_eq!(read_frame(&mut server, 1024).await.unwrap(), request);
        assert_eq!(read_frame(&mut server, 1024).await.unwrap(), Datagram::Ack { seq: 7 });
    }

    #[tokio::test]
    async fn test_oversized_frame() {
        let (mut client, mut server) = tokio::io::duplex(1024);
        write_frame(&mut client, &Datagram::Ack { seq: 1 }).await.unwrap();
        assert!(read_frame(&mut server, 4).await.is_err());
    }

    #[tokio::test]
    async fn test_truncated_frame() {
        let (mut client, mut server) = tokio::io::duplex(1024);
        client.write_u32(100).await.unwrap();
        client.write_all(b"short").await.unwrap();
        drop(client);
        assert!(read_frame(&mut server, 1024).await.is_err());
    }
}
