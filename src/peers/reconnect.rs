use std::sync::Arc;
use std::time::Duration;

use tokio::time;
use tracing::debug;

use crate::peers::peer_manager::PeerManager;

/// Periodically tries to reach unreachable peers, until the peer manager is shut down
pub async fn run_reconnect_loop(peers: Arc<PeerManager>, reconnect_interval: Duration) {
    let mut reconnect_ticks = time::interval(reconnect_interval);
    reconnect_ticks.set_missed_tick_behavior(time::MissedTickBehavior::Delay);
    // the first tick completes immediately
    reconnect_ticks.tick().await;

    loop {
        reconnect_ticks.tick().await;
        if peers.is_shut_down() {
            debug!("peer manager is shut down - stopping reconnect loop");
            break;
        }
        peers.reconnect_unreachable().await;
    }
}
