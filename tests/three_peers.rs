use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::time::{sleep, timeout, Instant};
use uuid::Uuid;

use peerchat::chat::chat_events::ChatEvent;
use peerchat::config::{ChatConfig, RendezvousConfig};
use peerchat::discovery::rendezvous_server::RendezvousServer;
use peerchat::messaging::peer_id::PeerId;
use peerchat::node::ChatNode;
use peerchat::peers::peer_state::Reachability;
use peerchat::test_util::peer::localhost;

async fn start_node(id: &str, server: &RendezvousServer, delays: &[(&str, Duration)]) -> Arc<ChatNode> {
    let mut config = ChatConfig::new(PeerId::new(id), localhost(0), server.local_addr().unwrap());
    config.ack_timeout = Duration::from_millis(500);
    config.reconnect_interval = Duration::from_millis(500);
    for (peer, delay) in delays {
        config.artificial_delays.insert(PeerId::new(*peer), *delay);
    }

    let node = Arc::new(ChatNode::start(config).await.unwrap());
    tokio::spawn({
        let node = node.clone();
        async move { node.run().await }
    });
    node
}

async fn await_fully_connected(nodes: &[&Arc<ChatNode>]) {
    let deadline = Instant::now() + Duration::from_secs(10);
    loop {
        let mut all_connected = true;
        for node in nodes {
            let peers = node.peers().await;
            all_connected &= peers.len() == nodes.len() - 1
                && peers.iter().all(|p| p.reachability == Reachability::Connected);
        }
        if all_connected {
            return;
        }
        assert!(Instant::now() < deadline, "peers did not connect");
        sleep(Duration::from_millis(50)).await;
    }
}

async fn next_delivered(events: &mut broadcast::Receiver<ChatEvent>, expected_room: Uuid) -> String {
    loop {
        let evt = timeout(Duration::from_secs(10), events.recv()).await
            .expect("no message was delivered")
            .unwrap();
        if let ChatEvent::MessageDelivered { room_id, payload } = evt {
            assert_eq!(room_id, expected_room);
            return payload.text().to_string();
        }
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_reply_is_not_delivered_before_the_message_it_answers() {
    tracing_subscriber::fmt()
        .with_test_writer()
        .try_init()
        .ok();

    let mut server_config = RendezvousConfig::new(localhost(0), localhost(0));
    server_config.ack_timeout = Duration::from_millis(500);
    let server = RendezvousServer::bind(server_config).await.unwrap();
    tokio::spawn(server.clone().run());

    let a = start_node("a", &server, &[]).await;
    let b = start_node("b", &server, &[]).await;
    // everything c receives from a is held back, so b's reply reaches c before a's message
    let c = start_node("c", &server, &[("a", Duration::from_secs(1))]).await;

    await_fully_connected(&[&a, &b, &c]).await;

    let mut a_events = a.subscribe();
    let mut b_events = b.subscribe();
    let mut c_events = c.subscribe();

    let room_id = a.create_room("abc", [PeerId::new("b"), PeerId::new("c")]).await.unwrap();
    a.send_message(room_id, "TEST").await.unwrap();

    assert_eq!(next_delivered(&mut b_events, room_id).await, "TEST");
    b.send_message(room_id, "TEST2").await.unwrap();

    assert_eq!(next_delivered(&mut c_events, room_id).await, "TEST");
    assert_eq!(next_delivered(&mut c_events, room_id).await, "TEST2");

    assert_eq!(next_delivered(&mut a_events, room_id).await, "TEST");
    assert_eq!(next_delivered(&mut a_events, room_id).await, "TEST2");

    for node in [&c, &b, &a] {
        let history = node.room_snapshot(room_id).await.unwrap();
        assert_eq!(history.delivered.iter().map(|p| p.text()).collect::<Vec<_>>(), vec!["TEST", "TEST2"]);
        assert!(history.waiting.is_empty());
    }

    c.shutdown().await.unwrap();
    b.shutdown().await.unwrap();
    a.shutdown().await.unwrap();
    server.close().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_departed_peer_is_removed_from_the_address_table() {
    let server = RendezvousServer::bind(RendezvousConfig::new(localhost(0), localhost(0))).await.unwrap();
    tokio::spawn(server.clone().run());

    let a = start_node("a", &server, &[]).await;
    let b = start_node("b", &server, &[]).await;
    await_fully_connected(&[&a, &b]).await;
    assert_eq!(server.addresses().await.len(), 2);

    b.shutdown().await.unwrap();
    assert_eq!(server.addresses().await.keys().cloned().collect::<Vec<_>>(), vec![PeerId::new("a")]);

    a.shutdown().await.unwrap();
    server.close().await;
}
