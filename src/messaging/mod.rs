pub mod datagram;
pub mod packet;
pub mod peer_id;
pub mod reliable_channel;
