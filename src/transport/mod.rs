pub mod channel;
pub mod connection;
pub mod sip_addr;
pub mod stream;
pub mod tcp;
pub mod tcp_listener;
pub mod tls;
pub mod transport_layer;
pub mod udp;

pub use connection::{SipConnection, TransportEvent, TransportReceiver, TransportSender};
pub use sip_addr::SipAddr;
pub use transport_layer::{TransportLayer, TransportLayerOption};

#[cfg(test)]
mod tests;
