pub mod discovery_client;
pub mod discovery_wire;
pub mod rendezvous_server;
