pub mod peer_manager;
pub mod peer_state;
pub mod reconnect;
