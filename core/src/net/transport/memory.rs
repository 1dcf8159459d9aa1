//! In-process transport for tests and local sessions
//!
//! A [`MemoryNetwork`] is a shared switchboard. Each [`MemoryTransport`]
//! registers one endpoint on it and delivers datagrams straight into the
//! receiver's queue. Faults can be injected per sender.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

use tidewire_shared::Endpoint;

use super::{Transport, TransportError, TransportEvent};
use crate::net::header::DeliveryMethod;

/// Fault injected into a sender's outgoing datagrams
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SendFault {
    #[default]
    None,
    /// Fail the next N unreliable sends
    FailUnreliable(u32),
    /// Fail the next N sends of any kind
    FailAll(u32),
    /// Silently lose every unreliable datagram
    DropUnreliable,
    /// Deliver every unreliable datagram twice
    DuplicateUnreliable,
}

/// One attempted send, recorded for assertions
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendRecord {
    pub from: Endpoint,
    pub to: Endpoint,
    pub delivery: DeliveryMethod,
    pub len: usize,
    /// False if the send returned an error
    pub delivered: bool,
}

#[derive(Default)]
struct NetworkState {
    queues: HashMap<Endpoint, VecDeque<TransportEvent>>,
    faults: HashMap<Endpoint, SendFault>,
    log: Vec<SendRecord>,
}

/// Shared in-memory network
#[derive(Clone, Default)]
pub struct MemoryNetwork {
    state: Arc<Mutex<NetworkState>>,
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `local` on the network and return its transport
    pub fn transport(&self, local: Endpoint) -> MemoryTransport {
        self.lock().queues.entry(local.clone()).or_default();
        MemoryTransport {
            local,
            network: self.clone(),
            shut_down: false,
        }
    }

    pub fn set_fault(&self, endpoint: &Endpoint, fault: SendFault) {
        self.lock().faults.insert(endpoint.clone(), fault);
    }

    /// Every send attempted so far
    pub fn send_log(&self) -> Vec<SendRecord> {
        self.lock().log.clone()
    }

    /// Sends from `from` to `to` that reached the receiver
    pub fn delivered_between(&self, from: &Endpoint, to: &Endpoint) -> usize {
        self.lock()
            .log
            .iter()
            .filter(|r| r.delivered && &r.from == from && &r.to == to)
            .count()
    }

    fn lock(&self) -> MutexGuard<'_, NetworkState> {
        // A poisoned lock only means a test thread panicked mid-send
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl std::fmt::Debug for MemoryNetwork {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.lock();
        f.debug_struct("MemoryNetwork")
            .field("endpoints", &state.queues.len())
            .field("sends", &state.log.len())
            .finish()
    }
}

/// Transport attached to a [`MemoryNetwork`]
#[derive(Debug)]
pub struct MemoryTransport {
    local: Endpoint,
    network: MemoryNetwork,
    shut_down: bool,
}

impl MemoryTransport {
    pub fn local_endpoint(&self) -> &Endpoint {
        &self.local
    }

    fn push(&self, to: &Endpoint, event: TransportEvent) -> Result<(), TransportError> {
        let mut state = self.network.lock();
        let queue = state
            .queues
            .get_mut(to)
            .ok_or_else(|| TransportError::Unreachable(to.clone()))?;
        queue.push_back(event);
        Ok(())
    }
}

impl Transport for MemoryTransport {
    fn connect(&mut self, endpoint: &Endpoint) -> Result<(), TransportError> {
        if self.shut_down {
            return Err(TransportError::Shutdown);
        }
        self.push(endpoint, TransportEvent::ConnectionRequested(self.local.clone()))
    }

    fn accept(&mut self, endpoint: &Endpoint) -> Result<(), TransportError> {
        if self.network.lock().queues.contains_key(endpoint) {
            Ok(())
        } else {
            Err(TransportError::Unreachable(endpoint.clone()))
        }
    }

    fn send(&mut self, endpoint: &Endpoint, data: &[u8], delivery: DeliveryMethod) -> Result<(), TransportError> {
        if self.shut_down {
            return Err(TransportError::Shutdown);
        }

        let mut state = self.network.lock();
        let fault = state.faults.get(&self.local).copied().unwrap_or_default();
        let (result, copies, next_fault) = match fault {
            SendFault::FailAll(n) if n > 0 => (Err(TransportError::Rejected), 0, SendFault::FailAll(n - 1)),
            SendFault::FailUnreliable(n) if n > 0 && !delivery.is_reliable() => {
                (Err(TransportError::Rejected), 0, SendFault::FailUnreliable(n - 1))
            }
            SendFault::DropUnreliable if !delivery.is_reliable() => (Ok(()), 0, fault),
            SendFault::DuplicateUnreliable if !delivery.is_reliable() => (Ok(()), 2, fault),
            _ => (Ok(()), 1, fault),
        };
        state.faults.insert(self.local.clone(), next_fault);

        let result = result.and_then(|()| match state.queues.get_mut(endpoint) {
            Some(queue) => {
                for _ in 0..copies {
                    queue.push_back(TransportEvent::Data {
                        from: self.local.clone(),
                        data: data.to_vec(),
                    });
                }
                Ok(())
            }
            None => Err(TransportError::Unreachable(endpoint.clone())),
        });

        state.log.push(SendRecord {
            from: self.local.clone(),
            to: endpoint.clone(),
            delivery,
            len: data.len(),
            delivered: result.is_ok(),
        });
        result
    }

    fn poll(&mut self) -> Option<TransportEvent> {
        if self.shut_down {
            return None;
        }
        self.network.lock().queues.get_mut(&self.local)?.pop_front()
    }

    fn close(&mut self, endpoint: &Endpoint) {
        // The remote may already be gone
        let _ = self.push(endpoint, TransportEvent::Closed(self.local.clone()));
    }

    fn shutdown(&mut self) {
        if !self.shut_down {
            self.shut_down = true;
            self.network.lock().queues.remove(&self.local);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn endpoints() -> (Endpoint, Endpoint) {
        ("EOS_host".parse().unwrap(), "EOS_client".parse().unwrap())
    }

    #[test]
    fn test_connect_and_exchange() {
        let network = MemoryNetwork::new();
        let (host_ep, client_ep) = endpoints();
        let mut host = network.transport(host_ep.clone());
        let mut client = network.transport(client_ep.clone());

        client.connect(&host_ep).unwrap();
        assert_eq!(host.poll(), Some(TransportEvent::ConnectionRequested(client_ep.clone())));
        host.accept(&client_ep).unwrap();

        client.send(&host_ep, b"ping", DeliveryMethod::Reliable).unwrap();
        host.send(&client_ep, b"pong", DeliveryMethod::Unreliable).unwrap();

        assert_eq!(
            host.poll(),
            Some(TransportEvent::Data {
                from: client_ep,
                data: b"ping".to_vec()
            })
        );
        assert_eq!(
            client.poll(),
            Some(TransportEvent::Data {
                from: host_ep,
                data: b"pong".to_vec()
            })
        );
    }

    #[test]
    fn test_close_notifies_remote() {
        let network = MemoryNetwork::new();
        let (host_ep, client_ep) = endpoints();
        let mut host = network.transport(host_ep.clone());
        let mut client = network.transport(client_ep.clone());

        client.close(&host_ep);
        assert_eq!(host.poll(), Some(TransportEvent::Closed(client_ep)));

        host.shutdown();
        assert_eq!(
            client.send(&host_ep, b"x", DeliveryMethod::Reliable),
            Err(TransportError::Unreachable(host_ep))
        );
    }

    #[test]
    fn test_drop_and_duplicate_faults() {
        let network = MemoryNetwork::new();
        let (host_ep, client_ep) = endpoints();
        let mut host = network.transport(host_ep.clone());
        let mut client = network.transport(client_ep.clone());

        network.set_fault(&client_ep, SendFault::DropUnreliable);
        client.send(&host_ep, b"lost", DeliveryMethod::Unreliable).unwrap();
        client.send(&host_ep, b"kept", DeliveryMethod::Reliable).unwrap();
        assert!(matches!(host.poll(), Some(TransportEvent::Data { data, .. }) if data == b"kept"));
        assert!(host.poll().is_none());

        network.set_fault(&client_ep, SendFault::DuplicateUnreliable);
        client.send(&host_ep, b"twice", DeliveryMethod::Unreliable).unwrap();
        assert!(host.poll().is_some());
        assert!(host.poll().is_some());
        assert!(host.poll().is_none());
    }

    #[test]
    fn test_fail_fault_counts_down() {
        let network = MemoryNetwork::new();
        let (host_ep, client_ep) = endpoints();
        let _host = network.transport(host_ep.clone());
        let mut client = network.transport(client_ep.clone());

        network.set_fault(&client_ep, SendFault::FailAll(1));
        assert!(client.send(&host_ep, b"a", DeliveryMethod::Reliable).is_err());
        assert!(client.send(&host_ep, b"b", DeliveryMethod::Reliable).is_ok());
        assert_eq!(network.delivered_between(&client_ep, &host_ep), 1);
    }
}
