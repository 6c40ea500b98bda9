pub mod connection_context;
pub mod handshake;
pub mod message;
pub mod protocol_handler;
pub mod server;
pub mod sync_state;
pub mod transport;
pub mod wire;
