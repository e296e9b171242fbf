use std::net::SocketAddr;

use thiserror::Error;

/// Failure of a single [crate::messaging::reliable_channel::ReliableChannel] send. None of these
///  are retried by the channel itself: deciding what to do about a failed send is the peer
///  lifecycle's business.
#[derive(Debug, Error)]
pub enum ChannelError {
    /// No ack arrived within the configured timeout. This is indistinguishable from the peer's
    ///  ack being lost, or the peer closing while the ack was in flight.
    #[error("no ack for packet #{seq} to {to:?} within the ack timeout")]
    AckTimeout { seq: u64, to: SocketAddr },
    #[error("channel is closed")]
    Closed,
    #[error("error encoding packet: {0}")]
    Encode(anyhow::Error),
}

#[derive(Debug, Error)]
pub enum DiscoveryError {
    #[error("rendezvous service unreachable after {attempts} attempts: {last_error}")]
    Unreachable { attempts: usize, last_error: String },
}
