use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::select;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, info, trace, warn};

use crate::chat::chat_events::{ChatEvent, ChatEventNotifier};
use crate::error::ChannelError;
use crate::messaging::packet::Packet;
use crate::messaging::peer_id::PeerId;
use crate::messaging::reliable_channel::PacketSender;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Reachability {
    Connected,
    Unreachable,
}

/// What this node knows about a remote peer's connection.
///
/// Packets are queued only while the peer is unreachable, and the peer becomes `Connected` only
///  once its queue is drained: a connected peer's queue is empty.
#[derive(Debug)]
pub struct PeerConnectionState {
    pub address: Option<SocketAddr>,
    pub reachability: Reachability,
    pub outbound_queue: VecDeque<Packet>,
}

/// for listings
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct PeerSummary {
    pub id: PeerId,
    pub address: Option<SocketAddr>,
    pub reachability: Reachability,
    pub num_queued: usize,
}

/// everything a peer link needs from the node
pub struct PeerContext {
    pub self_id: PeerId,
    pub sender: Arc<dyn PacketSender>,
    pub event_notifier: Arc<ChatEventNotifier>,
}

/// The connection to a single remote peer, shared between the peer's outbox worker and the
///  lifecycle manager.
pub struct PeerLink {
    id: PeerId,
    ctx: Arc<PeerContext>,
    state: Mutex<PeerConnectionState>,
    /// serializes draining the queue, which spans several sends
    drain_lock: Mutex<()>,
    is_reconnecting: AtomicBool,
}

impl PeerLink {
    fn new(id: PeerId, address: Option<SocketAddr>, ctx: Arc<PeerContext>) -> PeerLink {
        PeerLink {
            id,
            ctx,
            state: Mutex::new(PeerConnectionState {
                address,
                reachability: Reachability::Unreachable,
                outbound_queue: VecDeque::new(),
            }),
            drain_lock: Mutex::new(()),
            is_reconnecting: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> &PeerId {
        &self.id
    }

    pub async fn address(&self) -> Option<SocketAddr> {
        self.state.lock().await.address
    }

    /// returns `true` if the address changed
    pub async fn set_address(&self, address: SocketAddr) -> bool {
        let mut state = self.state.lock().await;
        let changed = state.address != Some(address);
        if changed {
            debug!("peer {} is at {:?} (was {:?})", self.id, address, state.address);
            state.address = Some(address);
        }
        changed
    }

    pub async fn reachability(&self) -> Reachability {
        self.state.lock().await.reachability
    }

    pub async fn summary(&self) -> PeerSummary {
        let state = self.state.lock().await;
        PeerSummary {
            id: self.id.clone(),
            address: state.address,
            reachability: state.reachability,
            num_queued: state.outbound_queue.len(),
        }
    }

    /// Sends a packet right away if the peer is connected, and queues it otherwise
    pub async fn send_or_queue(&self, packet: Packet) {
        let addr = {
            let mut state = self.state.lock().await;
            match (state.reachability, state.address) {
                (Reachability::Connected, Some(addr)) => addr,
                _ => {
                    trace!("peer {} is unreachable - queueing {:?}", self.id, packet);
                    state.outbound_queue.push_back(packet);
                    return;
                }
            }
        };

        if let Err(e) = self.ctx.sender.send_packet(addr, packet.clone()).await {
            self.on_send_failure(packet, e).await;
        }
    }

    pub async fn queue(&self, packet: Packet) {
        self.state.lock().await
            .outbound_queue.push_back(packet);
    }

    /// Marks the peer unreachable and queues the packet that could not be sent. This is the only
    ///  place where a packet that failed is put back, so it ends up in the queue exactly once.
    pub async fn on_send_failure(&self, packet: Packet, error: ChannelError) {
        warn!("sending to peer {} failed, marking it unreachable: {}", self.id, error);
        let mut state = self.state.lock().await;
        state.outbound_queue.push_back(packet);
        self.set_reachability(&mut state, Reachability::Unreachable);
    }

    /// e.g. when the peer says goodbye
    pub async fn mark_unreachable(&self) {
        let mut state = self.state.lock().await;
        self.set_reachability(&mut state, Reachability::Unreachable);
    }

    fn set_reachability(&self, state: &mut PeerConnectionState, reachability: Reachability) {
        let old = std::mem::replace(&mut state.reachability, reachability);
        if old == reachability {
            return;
        }

        match reachability {
            Reachability::Connected => {
                info!("peer {} connected", self.id);
                self.ctx.event_notifier.send_event(ChatEvent::PeerConnected(self.id.clone()));
            }
            Reachability::Unreachable => {
                info!("peer {} disconnected", self.id);
                self.ctx.event_notifier.send_event(ChatEvent::PeerDisconnected(self.id.clone()));
            }
        }
    }

    /// Sends `Hello` to the peer and, if that is acked, drains the queue. Returns `true` if the
    ///  peer is connected afterwards.
    pub async fn connect(&self) -> bool {
        let Some(addr) = self.address().await else {
            debug!("address of peer {} is not known - can not connect", self.id);
            return false;
        };

        let hello = Packet::Hello { sender_id: self.ctx.self_id.clone() };
        if let Err(e) = self.ctx.sender.send_packet(addr, hello).await {
            debug!("peer {} did not answer hello: {}", self.id, e);
            self.mark_unreachable().await;
            return false;
        }
        self.drain().await
    }

    /// Sends queued packets in FIFO order, stopping at the first failure: the failed packet and
    ///  everything after it stay queued. The peer is marked `Connected` once the queue is empty.
    pub async fn drain(&self) -> bool {
        let _drain_guard = self.drain_lock.lock().await;

        loop {
            let (addr, packet) = {
                let mut state = self.state.lock().await;
                let Some(addr) = state.address else {
                    return false;
                };
                match state.outbound_queue.front() {
                    None => {
                        self.set_reachability(&mut state, Reachability::Connected);
                        return true;
                    }
                    Some(packet) => (addr, packet.clone()),
                }
            };

            match self.ctx.sender.send_packet(addr, packet).await {
                Ok(()) => {
                    // drains are serialized and only they pop, so the head is still the packet that was sent
                    self.state.lock().await
                        .outbound_queue.pop_front();
                }
                Err(e) => {
                    debug!("draining queue of peer {} stopped: {}", self.id, e);
                    self.mark_unreachable().await;
                    return false;
                }
            }
        }
    }

    /// Runs [PeerLink::connect] unless a reconnect attempt is in progress already
    pub async fn try_reconnect(&self) -> bool {
        if self.is_reconnecting.swap(true, Ordering::AcqRel) {
            trace!("reconnect to peer {} is in progress already", self.id);
            return false;
        }
        let result = self.connect().await;
        self.is_reconnecting.store(false, Ordering::Release);
        result
    }

    /// Removes all queued packets and forgets the peer's reachability, for shutting down
    pub async fn take_for_shutdown(&self) -> (Reachability, Option<SocketAddr>, Vec<Packet>) {
        let mut state = self.state.lock().await;
        let queue = std::mem::take(&mut state.outbound_queue);
        let reachability = std::mem::replace(&mut state.reachability, Reachability::Unreachable);
        (reachability, state.address, queue.into())
    }
}

/// A peer link plus the sending end of the peer's outbox. Packets for a peer go through its outbox
///  and are processed by a worker task of its own, so that one peer waiting for acks does not
///  hold up others.
pub struct PeerHandle {
    link: Arc<PeerLink>,
    outbox: mpsc::UnboundedSender<Packet>,
    stop: oneshot::Sender<()>,
    worker: JoinHandle<()>,
}

impl PeerHandle {
    pub fn new(id: PeerId, address: Option<SocketAddr>, ctx: Arc<PeerContext>) -> PeerHandle {
        let link = Arc::new(PeerLink::new(id, address, ctx));
        let (outbox, outbox_recv) = mpsc::unbounded_channel();
        let (stop, stop_recv) = oneshot::channel();
        let worker = tokio::spawn(run_outbox_worker(link.clone(), outbox_recv, stop_recv));

        PeerHandle {
            link,
            outbox,
            stop,
            worker,
        }
    }

    pub fn link(&self) -> &Arc<PeerLink> {
        &self.link
    }

    pub async fn enqueue(&self, packet: Packet) {
        if let Err(e) = self.outbox.send(packet) {
            self.link.queue(e.0).await;
        }
    }

    /// Closes the outbox and waits for the worker to process what is in it. If that takes longer
    ///  than `max_wait`, the worker is stopped and everything it did not get acked is moved to the
    ///  link's queue, including the packet it was sending.
    pub async fn shut_down(self, max_wait: Duration) -> Arc<PeerLink> {
        let PeerHandle { link, outbox, stop, mut worker } = self;
        drop(outbox);

        if timeout(max_wait, &mut worker).await.is_err() {
            debug!("outbox of peer {} was not done after {:?} - stopping it", link.id(), max_wait);
            let _ = stop.send(());
            if let Err(e) = worker.await {
                warn!("outbox worker of peer {} failed: {}", link.id(), e);
            }
        }
        link
    }
}

async fn run_outbox_worker(link: Arc<PeerLink>, mut outbox: mpsc::UnboundedReceiver<Packet>, mut stop: oneshot::Receiver<()>) {
    while let Some(packet) = outbox.recv().await {
        select! {
            biased;
            _ = link.send_or_queue(packet.clone()) => {}
            _ = &mut stop => {
                // the packet may or may not have reached the peer; receivers discard duplicates
                link.queue(packet).await;
                outbox.close();
                while let Ok(packet) = outbox.try_recv() {
                    link.queue(packet).await;
                }
                debug!("outbox of peer {} stopped", link.id());
                return;
            }
        }
    }
    trace!("outbox of peer {} closed", link.id());
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::sync::broadcast;
    use tokio::time::timeout;

    use crate::messaging::reliable_channel::MockPacketSender;
    use crate::test_util::packet_sender::TrackingMockPacketSender;
    use crate::test_util::peer::test_addr_from_number;
    use super::*;

    fn bye(id: &str) -> Packet {
        Packet::Bye { sender_id: PeerId::new(id) }
    }

    fn hello_from_me() -> Packet {
        Packet::Hello { sender_id: PeerId::new("me") }
    }

    fn ctx(sender: Arc<dyn PacketSender>) -> (Arc<PeerContext>, broadcast::Receiver<ChatEvent>) {
        let event_notifier = Arc::new(ChatEventNotifier::new());
        let events = event_notifier.subscribe();
        (Arc::new(PeerContext { self_id: PeerId::new("me"), sender, event_notifier }), events)
    }

    async fn queue_of(link: &PeerLink) -> Vec<Packet> {
        link.state.lock().await.outbound_queue.iter().cloned().collect()
    }

    #[tokio::test]
    async fn test_connect_drains_queue_in_order() {
        let sender = Arc::new(TrackingMockPacketSender::new());
        let (ctx, mut events) = ctx(sender.clone());
        let addr = test_addr_from_number(1);
        let link = PeerLink::new(PeerId::new("p"), Some(addr), ctx);

        for i in 1..=3 {
            link.send_or_queue(bye(&format!("p{}", i))).await;
        }
        sender.assert_no_remaining_packets().await;
        assert_eq!(queue_of(&link).await.len(), 3);

        assert!(link.connect().await);

        sender.assert_packet_sent(addr, hello_from_me()).await;
        for i in 1..=3 {
            sender.assert_packet_sent(addr, bye(&format!("p{}", i))).await;
        }
        sender.assert_no_remaining_packets().await;
        assert_eq!(link.reachability().await, Reachability::Connected);
        assert_eq!(events.try_recv().unwrap(), ChatEvent::PeerConnected(PeerId::new("p")));
    }

    #[tokio::test]
    async fn test_drain_stops_at_first_failure() {
        let addr = test_addr_from_number(1);
        let mut sender = MockPacketSender::new();
        sender.expect_send_packet()
            .withf(|_, p| p == &bye("p1"))
            .times(1)
            .returning(|_, _| Ok(()));
        sender.expect_send_packet()
            .withf(|_, p| p == &bye("p2"))
            .times(1)
            .returning(|to, _| Err(ChannelError::AckTimeout { seq: 2, to }));

        let (ctx, mut events) = ctx(Arc::new(sender));
        let link = PeerLink::new(PeerId::new("p"), Some(addr), ctx);
        for i in 1..=3 {
            link.queue(bye(&format!("p{}", i))).await;
        }

        assert!(!link.drain().await);
        assert_eq!(queue_of(&link).await, vec![bye("p2"), bye("p3")]);
        assert_eq!(link.reachability().await, Reachability::Unreachable);
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_send_failure_queues_packet_exactly_once() {
        let sender = Arc::new(TrackingMockPacketSender::new());
        let (ctx, mut events) = ctx(sender.clone());
        let addr = test_addr_from_number(1);
        let link = PeerLink::new(PeerId::new("p"), Some(addr), ctx);
        assert!(link.connect().await);
        assert_eq!(events.try_recv().unwrap(), ChatEvent::PeerConnected(PeerId::new("p")));
        sender.clear().await;

        sender.set_reachable(addr, false).await;
        link.send_or_queue(bye("p1")).await;
        link.send_or_queue(bye("p2")).await;

        assert_eq!(link.reachability().await, Reachability::Unreachable);
        assert_eq!(queue_of(&link).await, vec![bye("p1"), bye("p2")]);
        // only the first packet was attempted, the second was queued right away
        assert_eq!(sender.failed_attempts().await, vec![(addr, bye("p1"))]);
        assert_eq!(events.try_recv().unwrap(), ChatEvent::PeerDisconnected(PeerId::new("p")));
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_failed_hello_keeps_queue() {
        let sender = Arc::new(TrackingMockPacketSender::new());
        let (ctx, mut events) = ctx(sender.clone());
        let addr = test_addr_from_number(1);
        sender.set_reachable(addr, false).await;

        let link = PeerLink::new(PeerId::new("p"), Some(addr), ctx);
        link.queue(bye("p1")).await;

        assert!(!link.connect().await);
        assert_eq!(queue_of(&link).await, vec![bye("p1")]);
        assert_eq!(sender.failed_attempts().await, vec![(addr, hello_from_me())]);
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_unknown_address() {
        let sender = Arc::new(TrackingMockPacketSender::new());
        let (ctx, _) = ctx(sender.clone());
        let link = PeerLink::new(PeerId::new("p"), None, ctx);

        link.send_or_queue(bye("p1")).await;
        assert!(!link.connect().await);
        assert!(!link.drain().await);
        sender.assert_no_remaining_packets().await;

        assert!(link.set_address(test_addr_from_number(1)).await);
        assert!(!link.set_address(test_addr_from_number(1)).await);
        assert!(link.connect().await);
        assert!(queue_of(&link).await.is_empty());
    }

    #[tokio::test]
    async fn test_handle_sends_through_worker() {
        let sender = Arc::new(TrackingMockPacketSender::new());
        let (ctx, _) = ctx(sender.clone());
        let addr = test_addr_from_number(1);
        let handle = PeerHandle::new(PeerId::new("p"), Some(addr), ctx);
        assert!(handle.link().connect().await);
        sender.clear().await;

        for i in 1..=5 {
            handle.enqueue(bye(&format!("p{}", i))).await;
        }

        timeout(Duration::from_secs(1), async {
            while sender.sent_packets().await.len() < 5 {
                tokio::task::yield_now().await;
            }
        }).await.unwrap();

        for i in 1..=5 {
            sender.assert_packet_sent(addr, bye(&format!("p{}", i))).await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_shut_down_flushes_outbox() {
        let sender = Arc::new(TrackingMockPacketSender::new());
        let (ctx, _) = ctx(sender.clone());
        let addr = test_addr_from_number(1);
        let handle = PeerHandle::new(PeerId::new("p"), Some(addr), ctx);
        assert!(handle.link().connect().await);
        sender.clear().await;

        sender.set_ack_delay(Duration::from_millis(100)).await;
        handle.enqueue(bye("p1")).await;
        handle.enqueue(bye("p2")).await;

        let link = handle.shut_down(Duration::from_secs(1)).await;
        assert_eq!(sender.sent_packets().await, vec![(addr, bye("p1")), (addr, bye("p2"))]);
        assert_eq!(link.take_for_shutdown().await, (Reachability::Connected, Some(addr), vec![]));
    }

    #[tokio::test(start_paused = true)]
    async fn test_shut_down_stops_worker_waiting_for_ack() {
        let sender = Arc::new(TrackingMockPacketSender::new());
        let (ctx, _) = ctx(sender.clone());
        let addr = test_addr_from_number(1);
        let handle = PeerHandle::new(PeerId::new("p"), Some(addr), ctx);
        assert!(handle.link().connect().await);
        sender.clear().await;

        sender.set_ack_delay(Duration::from_secs(3)).await;
        for i in 1..=3 {
            handle.enqueue(bye(&format!("p{}", i))).await;
        }

        let link = handle.shut_down(Duration::from_millis(500)).await;
        sender.assert_no_remaining_packets().await;
        assert_eq!(link.take_for_shutdown().await, (Reachability::Connected, Some(addr), vec![bye("p1"), bye("p2"), bye("p3")]));
    }

    #[tokio::test]
    async fn test_take_for_shutdown() {
        let sender = Arc::new(TrackingMockPacketSender::new());
        let (ctx, _) = ctx(sender.clone());
        let addr = test_addr_from_number(1);
        let link = PeerLink::new(PeerId::new("p"), Some(addr), ctx);
        link.queue(bye("p1")).await;

        assert_eq!(link.take_for_shutdown().await, (Reachability::Unreachable, Some(addr), vec![bye("p1")]));
        assert!(queue_of(&link).await.is_empty());
    }
}
