//! Direct UDP transport
//!
//! A non-blocking socket shared by every session. UDP has no handshake of
//! its own, so the first datagram from an unknown address is reported as a
//! connection request followed by the datagram itself. Delivery is best
//! effort for every [`DeliveryMethod`]; the handshake resends and the
//! reliable-only fragment path tolerate that.

use std::collections::{HashSet, VecDeque};
use std::io;
use std::net::{SocketAddr, UdpSocket};

use tidewire_shared::Endpoint;

use super::{Transport, TransportError, TransportEvent};
use crate::net::header::DeliveryMethod;

/// Buffer size for incoming datagrams
const RECV_BUFFER_SIZE: usize = 65_536;

/// Largest UDP payload over IPv4
const MAX_DATAGRAM_SIZE: usize = 65_507;

/// Default listen port
pub const DEFAULT_PORT: u16 = 7777;

/// UDP socket transport
pub struct UdpTransport {
    /// Underlying UDP socket, None after shutdown
    socket: Option<UdpSocket>,
    /// Local address
    local_addr: SocketAddr,
    /// Receive buffer
    recv_buf: Vec<u8>,
    /// Addresses with an open session
    connected: HashSet<SocketAddr>,
    /// Addresses announced as connection requests, not yet accepted
    requested: HashSet<SocketAddr>,
    /// Events received but not yet polled
    events: VecDeque<TransportEvent>,
}

impl UdpTransport {
    /// Bind to the specified address
    ///
    /// Creates a non-blocking UDP socket bound to the given address.
    pub fn bind(addr: SocketAddr) -> Result<Self, TransportError> {
        let socket = UdpSocket::bind(addr).map_err(|e| TransportError::Io(format!("Failed to bind {}: {}", addr, e)))?;

        socket
            .set_nonblocking(true)
            .map_err(|e| TransportError::Io(format!("Failed to set non-blocking: {}", e)))?;

        let local_addr = socket
            .local_addr()
            .map_err(|e| TransportError::Io(format!("Failed to get local addr: {}", e)))?;

        tracing::debug!(port = local_addr.port(), "UdpTransport bound");

        Ok(Self {
            socket: Some(socket),
            local_addr,
            recv_buf: vec![0u8; RECV_BUFFER_SIZE],
            connected: HashSet::new(),
            requested: HashSet::new(),
            events: VecDeque::new(),
        })
    }

    /// Bind to any available port on all interfaces
    pub fn bind_any() -> Result<Self, TransportError> {
        Self::bind(SocketAddr::from(([0, 0, 0, 0], 0)))
    }

    /// Get the local address this socket is bound to
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Get the port this socket is bound to
    pub fn port(&self) -> u16 {
        self.local_addr.port()
    }

    fn direct_addr(endpoint: &Endpoint) -> Result<SocketAddr, TransportError> {
        endpoint
            .socket_addr()
            .ok_or_else(|| TransportError::UnsupportedEndpoint(endpoint.clone()))
    }

    /// Receive all available datagrams from the socket
    fn recv_all(&mut self) {
        let Some(socket) = &self.socket else {
            return;
        };
        loop {
            match socket.recv_from(&mut self.recv_buf) {
                Ok((len, from)) => {
                    if !self.connected.contains(&from) && self.requested.insert(from) {
                        self.events.push_back(TransportEvent::ConnectionRequested(Endpoint::Direct(from)));
                    }
                    self.events.push_back(TransportEvent::Data {
                        from: Endpoint::Direct(from),
                        data: self.recv_buf[..len].to_vec(),
                    });
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    // No more data available
                    break;
                }
                Err(e) if e.kind() == io::ErrorKind::ConnectionReset => {
                    // ICMP port unreachable from an earlier send on some platforms
                    continue;
                }
                Err(e) => {
                    tracing::warn!(error = %e, "Receive error");
                    break;
                }
            }
        }
    }
}

impl Transport for UdpTransport {
    fn connect(&mut self, endpoint: &Endpoint) -> Result<(), TransportError> {
        let addr = Self::direct_addr(endpoint)?;
        if self.socket.is_none() {
            return Err(TransportError::Shutdown);
        }
        self.connected.insert(addr);
        Ok(())
    }

    fn accept(&mut self, endpoint: &Endpoint) -> Result<(), TransportError> {
        let addr = Self::direct_addr(endpoint)?;
        self.requested.remove(&addr);
        self.connected.insert(addr);
        Ok(())
    }

    fn send(&mut self, endpoint: &Endpoint, data: &[u8], _delivery: DeliveryMethod) -> Result<(), TransportError> {
        let addr = Self::direct_addr(endpoint)?;
        let socket = self.socket.as_ref().ok_or(TransportError::Shutdown)?;
        if data.len() > MAX_DATAGRAM_SIZE {
            return Err(TransportError::TooLarge {
                size: data.len(),
                max: MAX_DATAGRAM_SIZE,
            });
        }

        socket
            .send_to(data, addr)
            .map_err(|e| TransportError::Io(e.to_string()))?;
        tracing::trace!(to = %addr, len = data.len(), "Sent datagram");
        Ok(())
    }

    fn poll(&mut self) -> Option<TransportEvent> {
        if self.events.is_empty() {
            self.recv_all();
        }
        self.events.pop_front()
    }

    fn close(&mut self, endpoint: &Endpoint) {
        if let Some(addr) = endpoint.socket_addr() {
            self.connected.remove(&addr);
            self.requested.remove(&addr);
        }
    }

    fn shutdown(&mut self) {
        self.connected.clear();
        self.requested.clear();
        self.events.clear();
        self.socket = None;
    }
}

impl std::fmt::Debug for UdpTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UdpTransport")
            .field("local_addr", &self.local_addr)
            .field("connected", &self.connected.len())
            .field("queued_events", &self.events.len())
            .finish()
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration, Instant};

    fn localhost() -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], 0))
    }

    fn poll_until(transport: &mut UdpTransport, count: usize) -> Vec<TransportEvent> {
        let start = Instant::now();
        let mut events = Vec::new();
        while events.len() < count && start.elapsed() < Duration::from_secs(2) {
            match transport.poll() {
                Some(event) => events.push(event),
                None => std::thread::sleep(Duration::from_millis(1)),
            }
        }
        events
    }

    #[test]
    fn test_bind() {
        let transport = UdpTransport::bind(localhost()).unwrap();
        assert!(transport.port() > 0);
        assert_eq!(transport.local_addr().ip().to_string(), "127.0.0.1");
    }

    #[test]
    fn test_first_datagram_is_a_connection_request() {
        let mut host = UdpTransport::bind(localhost()).unwrap();
        let mut client = UdpTransport::bind(localhost()).unwrap();
        let host_ep = Endpoint::Direct(host.local_addr());
        let client_ep = Endpoint::Direct(client.local_addr());

        client.connect(&host_ep).unwrap();
        client.send(&host_ep, b"hello", DeliveryMethod::Reliable).unwrap();
        client.send(&host_ep, b"again", DeliveryMethod::Reliable).unwrap();

        let events = poll_until(&mut host, 3);
        assert_eq!(
            events,
            vec![
                TransportEvent::ConnectionRequested(client_ep.clone()),
                TransportEvent::Data {
                    from: client_ep.clone(),
                    data: b"hello".to_vec()
                },
                TransportEvent::Data {
                    from: client_ep.clone(),
                    data: b"again".to_vec()
                },
            ]
        );

        host.accept(&client_ep).unwrap();
        host.send(&client_ep, b"welcome", DeliveryMethod::Unreliable).unwrap();
        let events = poll_until(&mut client, 1);
        assert_eq!(
            events,
            vec![TransportEvent::Data {
                from: host_ep,
                data: b"welcome".to_vec()
            }]
        );
    }

    #[test]
    fn test_non_direct_endpoint_rejected() {
        let mut transport = UdpTransport::bind(localhost()).unwrap();
        let steam: Endpoint = "STEAM_1".parse().unwrap();
        assert_eq!(
            transport.send(&steam, b"x", DeliveryMethod::Reliable),
            Err(TransportError::UnsupportedEndpoint(steam.clone()))
        );
        assert!(transport.connect(&steam).is_err());
    }

    #[test]
    fn test_shutdown_stops_sends() {
        let mut transport = UdpTransport::bind(localhost()).unwrap();
        let target = Endpoint::Direct(SocketAddr::from(([127, 0, 0, 1], 9)));
        transport.shutdown();
        assert_eq!(
            transport.send(&target, b"x", DeliveryMethod::Reliable),
            Err(TransportError::Shutdown)
        );
        assert!(transport.poll().is_none());
    }

    #[test]
    fn test_debug() {
        let transport = UdpTransport::bind(localhost()).unwrap();
        let debug = format!("{:?}", transport);
        assert!(debug.contains("UdpTransport"));
        assert!(debug.contains("local_addr"));
    }
}
