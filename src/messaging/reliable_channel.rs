use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::anyhow;
use async_trait::async_trait;
use bytes::BytesMut;
#[cfg(test)] use mockall::automock;
use rustc_hash::FxHashMap;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, error, info, span, trace, warn, Instrument, Level};
use uuid::Uuid;

use crate::error::ChannelError;
use crate::messaging::datagram::Datagram;
use crate::messaging::packet::{Packet, PacketPlane};

/// This is an abstraction for sending a packet and waiting for its ack, introduced to facilitate
///  mocking the network part away for testing
#[cfg_attr(test, automock)]
#[async_trait]
pub trait PacketSender: Send + Sync + 'static {
    async fn send_packet(&self, to: SocketAddr, packet: Packet) -> Result<(), ChannelError>;
}

/// Received packets, sorted by plane. The receive loop never waits for these queues to be
///  drained.
pub struct InboundQueues {
    pub peer: mpsc::UnboundedReceiver<(SocketAddr, Packet)>,
    pub discovery: mpsc::UnboundedReceiver<(SocketAddr, Packet)>,
}

struct OutgoingDatagram {
    to: SocketAddr,
    buf: BytesMut,
}

/// Sends that are waiting for their ack, keyed by sequence number
#[derive(Default)]
struct AckWaitTable {
    pending: tokio::sync::Mutex<FxHashMap<u64, oneshot::Sender<()>>>,
}
impl AckWaitTable {
    async fn register(&self, seq: u64) -> oneshot::Receiver<()> {
        let (send, recv) = oneshot::channel();
        self.pending.lock().await
            .insert(seq, send);
        recv
    }

    /// returns `false` if there was no send waiting for this ack
    async fn resolve(&self, seq: u64) -> bool {
        match self.pending.lock().await.remove(&seq) {
            Some(waiting) => {
                // the waiting send may have timed out in the meantime, which is fine
                let _ = waiting.send(());
                true
            }
            None => false,
        }
    }

    async fn remove(&self, seq: u64) {
        self.pending.lock().await
            .remove(&seq);
    }

    /// Dropping the completion handles wakes up all waiting sends with a receive error, which
    ///  they report as [ChannelError::Closed]
    async fn cancel_all(&self) {
        self.pending.lock().await
            .clear();
    }
}

/// A channel for sending [Packet]s over UDP with a per-packet acknowledgement.
///
/// Every packet is wrapped in a [Datagram::Sequenced] with a sequence number that is strictly
///  increasing for this channel, and the receiving channel answers with a [Datagram::Ack] for
///  that sequence number. A `send` returns once the ack arrives, or fails after a timeout.
///
/// There is no retransmission: the ack serves to detect whether a peer is reachable, and it is
///  up to the caller to decide what to do with a packet that was not acknowledged. Packets may
///  therefore arrive more than once if an ack gets lost and the caller sends again.
///
/// All datagrams (including acks) are written by a single writer task; a separate reader task
///  receives datagrams, resolves acks and puts received packets into [InboundQueues].
pub struct ReliableChannel {
    local_addr: SocketAddr,
    ack_timeout: Duration,
    max_datagram_size: usize,
    next_seq: AtomicU64,
    write_queue: mpsc::UnboundedSender<OutgoingDatagram>,
    ack_waits: Arc<AckWaitTable>,
    is_closed: AtomicBool,
    loops: Mutex<Vec<JoinHandle<()>>>,
}

impl ReliableChannel {
    pub async fn bind(addr: SocketAddr, ack_timeout: Duration, max_datagram_size: usize) -> anyhow::Result<(Arc<ReliableChannel>, InboundQueues)> {
        let socket = Arc::new(UdpSocket::bind(addr).await?);
        let local_addr = socket.local_addr()?;
        info!("bound reliable channel to {:?}", local_addr);

        let (write_queue, write_queue_recv) = mpsc::unbounded_channel();
        let (peer_send, peer_recv) = mpsc::unbounded_channel();
        let (discovery_send, discovery_recv) = mpsc::unbounded_channel();
        let ack_waits = Arc::new(AckWaitTable::default());

        let send_loop = tokio::spawn(send_loop(socket.clone(), write_queue_recv));
        let recv_loop = tokio::spawn(recv_loop(ReceiveContext {
            socket,
            max_datagram_size,
            write_queue: write_queue.clone(),
            ack_waits: ack_waits.clone(),
            peer_queue: peer_send,
            discovery_queue: discovery_send,
        }));

        let channel = ReliableChannel {
            local_addr,
            ack_timeout,
            max_datagram_size,
            next_seq: AtomicU64::new(1),
            write_queue,
            ack_waits,
            is_closed: AtomicBool::new(false),
            loops: Mutex::new(vec![send_loop, recv_loop]),
        };

        Ok((Arc::new(channel), InboundQueues { peer: peer_recv, discovery: discovery_recv }))
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn is_closed(&self) -> bool {
        self.is_closed.load(Ordering::Acquire)
    }

    /// Sends a packet and waits for the receiver's ack. This can be called concurrently.
    pub async fn send(&self, to: SocketAddr, packet: Packet) -> Result<(), ChannelError> {
        if self.is_closed() {
            return Err(ChannelError::Closed);
        }

        let seq = self.next_seq.fetch_add(1, Ordering::AcqRel);

        let mut buf = BytesMut::new();
        Datagram::Sequenced { seq, packet }.ser(&mut buf);
        if buf.len() > self.max_datagram_size {
            return Err(ChannelError::Encode(anyhow!("datagram of {} bytes exceeds the maximum of {} bytes", buf.len(), self.max_datagram_size)));
        }

        let ack = self.ack_waits.register(seq).await;
        // re-check after registering: `close()` may have cancelled all waits before we registered
        if self.is_closed() {
            self.ack_waits.remove(seq).await;
            return Err(ChannelError::Closed);
        }

        trace!(seq, ?to, "enqueueing packet");
        if self.write_queue.send(OutgoingDatagram { to, buf }).is_err() {
            self.ack_waits.remove(seq).await;
            return Err(ChannelError::Closed);
        }

        match timeout(self.ack_timeout, ack).await {
            Ok(Ok(())) => {
                trace!(seq, ?to, "packet was acked");
                Ok(())
            }
            Ok(Err(_)) => Err(ChannelError::Closed),
            Err(_) => {
                self.ack_waits.remove(seq).await;
                debug!(seq, ?to, "no ack within {:?}", self.ack_timeout);
                Err(ChannelError::AckTimeout { seq, to })
            }
        }
    }

    /// Stops both loops and releases the socket. Sends that are waiting for an ack fail with
    ///  [ChannelError::Closed]. Closing a closed channel does nothing.
    pub async fn close(&self) {
        if self.is_closed.swap(true, Ordering::AcqRel) {
            return;
        }
        info!("closing reliable channel on {:?}", self.local_addr);

        self.abort_loops();
        self.ack_waits.cancel_all().await;
    }

    fn abort_loops(&self) {
        if let Ok(mut loops) = self.loops.lock() {
            for handle in loops.drain(..) {
                handle.abort();
            }
        }
    }
}

impl Drop for ReliableChannel {
    fn drop(&mut self) {
        self.abort_loops();
    }
}

#[async_trait]
impl PacketSender for ReliableChannel {
    async fn send_packet(&self, to: SocketAddr, packet: Packet) -> Result<(), ChannelError> {
        self.send(to, packet).await
    }
}

async fn send_loop(socket: Arc<UdpSocket>, mut write_queue: mpsc::UnboundedReceiver<OutgoingDatagram>) {
    while let Some(datagram) = write_queue.recv().await {
        trace!("sending datagram to {:?}: {:?}", datagram.to, datagram.buf.as_ref());
        if let Err(e) = socket.send_to(&datagram.buf, datagram.to).await {
            // the sender will see an ack timeout
            warn!("error sending datagram to {:?}: {}", datagram.to, e);
        }
    }
    debug!("write queue closed - shutting down send loop");
}

struct ReceiveContext {
    socket: Arc<UdpSocket>,
    max_datagram_size: usize,
    write_queue: mpsc::UnboundedSender<OutgoingDatagram>,
    ack_waits: Arc<AckWaitTable>,
    peer_queue: mpsc::UnboundedSender<(SocketAddr, Packet)>,
    discovery_queue: mpsc::UnboundedSender<(SocketAddr, Packet)>,
}

async fn recv_loop(ctx: ReceiveContext) {
    info!("starting receive loop");

    // one byte more than the maximum to detect oversized datagrams
    let mut buf = vec![0u8; ctx.max_datagram_size + 1];
    loop {
        let (num_read, from) = match ctx.socket.recv_from(&mut buf).await {
            Ok(x) => x,
            Err(e) => {
                // e.g. ICMP 'port unreachable' reported on some platforms
                debug!("socket error: {}", e);
                continue;
            }
        };

        if num_read > ctx.max_datagram_size {
            warn!("received oversized datagram from {:?} - dropping", from);
            continue;
        }

        let correlation_id = Uuid::new_v4();
        let span = span!(Level::TRACE, "datagram_received", ?correlation_id);
        on_datagram(&ctx, &buf[..num_read], from)
            .instrument(span)
            .await;
    }
}

async fn on_datagram(ctx: &ReceiveContext, raw: &[u8], from: SocketAddr) {
    trace!("received datagram from {:?}: {:?}", from, raw);

    match Datagram::try_deser(raw) {
        Err(e) => {
            warn!("received malformed datagram from {:?} - dropping: {}", from, e);
        }
        Ok(Datagram::Ack { seq }) => {
            if !ctx.ack_waits.resolve(seq).await {
                debug!(seq, ?from, "received ack for a packet that is not (or no longer) waiting - ignoring");
            }
        }
        Ok(Datagram::Sequenced { seq, packet }) => {
            let mut ack = BytesMut::with_capacity(Datagram::HEADER_LEN);
            Datagram::Ack { seq }.ser(&mut ack);
            if ctx.write_queue.send(OutgoingDatagram { to: from, buf: ack }).is_err() {
                debug!("send loop is shut down - not acking #{}", seq);
            }

            let queue = match packet.plane() {
                PacketPlane::Peer => &ctx.peer_queue,
                PacketPlane::Discovery => &ctx.discovery_queue,
            };
            if queue.send((from, packet)).is_err() {
                error!("inbound queue is closed - dropping packet #{} from {:?}", seq, from);
            }
        }
    }
}
