//! Transport seam
//!
//! The connection layer never touches sockets directly. It talks to a
//! [`Transport`], which moves raw datagrams to and from opaque endpoints
//! with a requested delivery guarantee. One transport instance may carry
//! many concurrent sessions (the owner relay shares one for all remotes).

mod memory;
mod udp;

use tidewire_shared::Endpoint;

use super::codec::OutgoingPacket;
use super::header::DeliveryMethod;

pub use memory::{MemoryNetwork, MemoryTransport, SendFault, SendRecord};
pub use udp::{DEFAULT_PORT, UdpTransport};

/// Something that happened on the transport
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// An unknown endpoint wants to talk to us
    ConnectionRequested(Endpoint),
    /// A datagram arrived
    Data { from: Endpoint, data: Vec<u8> },
    /// The transport lost its session with an endpoint
    Closed(Endpoint),
}

/// Transport errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("I/O error: {0}")]
    Io(String),

    #[error("endpoint {0} is not supported by this transport")]
    UnsupportedEndpoint(Endpoint),

    #[error("endpoint {0} is not reachable")]
    Unreachable(Endpoint),

    #[error("datagram of {size} bytes exceeds {max}")]
    TooLarge { size: usize, max: usize },

    #[error("send rejected")]
    Rejected,

    #[error("transport is shut down")]
    Shutdown,
}

/// Datagram transport used by [`Peer`](super::Peer) and
/// [`OwnerRelay`](super::OwnerRelay).
///
/// All methods are non-blocking. `poll` returns `None` once nothing more is
/// available right now.
pub trait Transport {
    /// Open a session to a host
    fn connect(&mut self, endpoint: &Endpoint) -> Result<(), TransportError>;

    /// Accept a session announced by [`TransportEvent::ConnectionRequested`]
    fn accept(&mut self, endpoint: &Endpoint) -> Result<(), TransportError>;

    fn send(&mut self, endpoint: &Endpoint, data: &[u8], delivery: DeliveryMethod) -> Result<(), TransportError>;

    fn poll(&mut self) -> Option<TransportEvent>;

    /// End the session with one endpoint
    fn close(&mut self, endpoint: &Endpoint);

    /// Release every native resource
    fn shutdown(&mut self);
}

/// Send a packet, escalating a failed unreliable send once to reliable.
///
/// Returns the number of bytes handed to the transport. Failures are logged
/// and otherwise swallowed.
pub fn send_packet<T: Transport + ?Sized>(transport: &mut T, endpoint: &Endpoint, packet: &OutgoingPacket) -> usize {
    match transport.send(endpoint, &packet.data, packet.delivery) {
        Ok(()) => packet.data.len(),
        Err(e) if !packet.delivery.is_reliable() => {
            tracing::debug!(endpoint = %endpoint, error = %e, "Unreliable send failed, retrying reliably");
            match transport.send(endpoint, &packet.data, packet.delivery.reliable()) {
                Ok(()) => packet.data.len(),
                Err(e) => {
                    tracing::warn!(endpoint = %endpoint, error = %e, "Failed to send packet");
                    0
                }
            }
        }
        Err(e) => {
            tracing::warn!(endpoint = %endpoint, error = %e, "Failed to send reliable packet");
            0
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup() -> (MemoryNetwork, MemoryTransport, MemoryTransport, Endpoint, Endpoint) {
        let network = MemoryNetwork::new();
        let a: Endpoint = "STEAM_1".parse().unwrap();
        let b: Endpoint = "STEAM_2".parse().unwrap();
        let ta = network.transport(a.clone());
        let tb = network.transport(b.clone());
        (network, ta, tb, a, b)
    }

    fn packet(delivery: DeliveryMethod) -> OutgoingPacket {
        OutgoingPacket {
            data: vec![1, 2, 3],
            delivery,
        }
    }

    #[test]
    fn test_unreliable_failure_escalates_once() {
        let (network, mut ta, mut tb, a, b) = setup();
        network.set_fault(&a, SendFault::FailUnreliable(1));

        assert_eq!(send_packet(&mut ta, &b, &packet(DeliveryMethod::Unreliable)), 3);

        let log = network.send_log();
        assert_eq!(log.len(), 2);
        assert!(!log[0].delivered && log[0].delivery == DeliveryMethod::Unreliable);
        assert!(log[1].delivered && log[1].delivery == DeliveryMethod::Reliable);
        assert!(matches!(tb.poll(), Some(TransportEvent::Data { .. })));
        assert!(tb.poll().is_none());
    }

    #[test]
    fn test_reliable_failure_is_not_retried() {
        let (network, mut ta, mut tb, a, b) = setup();
        network.set_fault(&a, SendFault::FailAll(1));

        assert_eq!(send_packet(&mut ta, &b, &packet(DeliveryMethod::ReliableOrdered)), 0);
        assert_eq!(network.send_log().len(), 1);
        assert!(tb.poll().is_none());
    }

    #[test]
    fn test_escalation_gives_up_after_one_retry() {
        let (network, mut ta, _tb, a, b) = setup();
        network.set_fault(&a, SendFault::FailAll(5));

        assert_eq!(send_packet(&mut ta, &b, &packet(DeliveryMethod::Unreliable)), 0);
        assert_eq!(network.send_log().len(), 2);
    }
}
