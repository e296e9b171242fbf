use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rustc_hash::FxHashSet;
use tokio::sync::RwLock;
use tokio::time::sleep;

use crate::error::ChannelError;
use crate::messaging::packet::Packet;
use crate::messaging::reliable_channel::PacketSender;

/// A [PacketSender] that records every packet instead of sending it. Sends to addresses that were
///  marked unreachable fail with [ChannelError::AckTimeout] (and are recorded as attempts).
///
/// Each send takes the configured ack delay before it succeeds or fails, and a send that is
///  cancelled during that time is not recorded.
#[derive(Debug, Default)]
pub struct TrackingMockPacketSender {
    sent: Arc<RwLock<Vec<(SocketAddr, Packet)>>>,
    attempts_to_unreachable: Arc<RwLock<Vec<(SocketAddr, Packet)>>>,
    unreachable: Arc<RwLock<FxHashSet<SocketAddr>>>,
    ack_delay: Arc<RwLock<Duration>>,
}
impl TrackingMockPacketSender {
    pub fn new() -> TrackingMockPacketSender {
        Default::default()
    }

    pub async fn set_reachable(&self, addr: SocketAddr, is_reachable: bool) {
        let mut unreachable = self.unreachable.write().await;
        if is_reachable {
            unreachable.remove(&addr);
        }
        else {
            unreachable.insert(addr);
        }
    }

    pub async fn set_ack_delay(&self, ack_delay: Duration) {
        *self.ack_delay.write().await = ack_delay;
    }

    pub async fn assert_packet_sent(&self, to: SocketAddr, packet: Packet) {
        let mut lock = self.sent.write().await;
        if lock.is_empty() {
            panic!("no packet was sent, expected {:?} to {:?}", packet, to);
        }

        let (actual_to, actual_packet) = lock.remove(0);
        assert_eq!(actual_packet, packet);
        assert_eq!(actual_to, to);
    }

    /// successfully sent packets, in the order they were sent, without consuming them
    pub async fn sent_packets(&self) -> Vec<(SocketAddr, Packet)> {
        self.sent.read().await.clone()
    }

    pub async fn failed_attempts(&self) -> Vec<(SocketAddr, Packet)> {
        self.attempts_to_unreachable.read().await.clone()
    }

    pub async fn clear(&self) {
        self.sent.write().await.clear();
        self.attempts_to_unreachable.write().await.clear();
    }

    pub async fn assert_no_remaining_packets(&self) {
        let sent = self.sent.read().await;
        assert!(sent.is_empty(), "unexpected packets: {:?}", sent);
    }
}

#[async_trait]
impl PacketSender for TrackingMockPacketSender {
    async fn send_packet(&self, to: SocketAddr, packet: Packet) -> Result<(), ChannelError> {
        let ack_delay = *self.ack_delay.read().await;
        if !ack_delay.is_zero() {
            sleep(ack_delay).await;
        }

        if self.unreachable.read().await.contains(&to) {
            self.attempts_to_unreachable.write().await.push((to, packet));
            return Err(ChannelError::AckTimeout { seq: 0, to });
        }
        self.sent.write().await.push((to, packet));
        Ok(())
    }
}
