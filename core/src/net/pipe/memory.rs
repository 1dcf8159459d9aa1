//! In-process server pipe
//!
//! Both ends share a pair of queues. Every message is pushed through the
//! frame codec on the way, so tests exercise the same encoding as a real
//! subprocess link.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};

use super::{PipeError, PipeMessage, ServerPipe};

#[derive(Debug)]
struct Shared {
    to_server: VecDeque<PipeMessage>,
    to_relay: VecDeque<PipeMessage>,
    alive: bool,
}

fn lock(shared: &Mutex<Shared>) -> MutexGuard<'_, Shared> {
    shared.lock().unwrap_or_else(|e| e.into_inner())
}

fn through_codec(message: &PipeMessage) -> Result<PipeMessage, PipeError> {
    PipeMessage::decode(&message.encode()?)
}

/// Create a connected relay end and server end
pub fn memory_pipe() -> (MemoryPipe, MemoryServer) {
    let shared = Arc::new(Mutex::new(Shared {
        to_server: VecDeque::new(),
        to_relay: VecDeque::new(),
        alive: true,
    }));
    (
        MemoryPipe {
            shared: Arc::clone(&shared),
        },
        MemoryServer { shared },
    )
}

/// Relay end
#[derive(Debug, Clone)]
pub struct MemoryPipe {
    shared: Arc<Mutex<Shared>>,
}

impl ServerPipe for MemoryPipe {
    fn send(&mut self, message: &PipeMessage) -> Result<(), PipeError> {
        let message = through_codec(message)?;
        let mut shared = lock(&self.shared);
        if !shared.alive {
            return Err(PipeError::Closed);
        }
        shared.to_server.push_back(message);
        Ok(())
    }

    fn poll(&mut self) -> Option<PipeMessage> {
        lock(&self.shared).to_relay.pop_front()
    }

    fn is_alive(&mut self) -> bool {
        lock(&self.shared).alive
    }

    fn close(&mut self) {
        lock(&self.shared).alive = false;
    }
}

/// Server end, driven by tests or an embedded server
#[derive(Debug, Clone)]
pub struct MemoryServer {
    shared: Arc<Mutex<Shared>>,
}

impl MemoryServer {
    pub fn send(&self, message: &PipeMessage) -> Result<(), PipeError> {
        let message = through_codec(message)?;
        let mut shared = lock(&self.shared);
        if !shared.alive {
            return Err(PipeError::Closed);
        }
        shared.to_relay.push_back(message);
        Ok(())
    }

    pub fn recv(&self) -> Option<PipeMessage> {
        lock(&self.shared).to_server.pop_front()
    }

    /// Everything the relay sent since the last call
    pub fn drain(&self) -> Vec<PipeMessage> {
        lock(&self.shared).to_server.drain(..).collect()
    }

    /// Simulate the server process dying
    pub fn crash(&self) {
        lock(&self.shared).alive = false;
    }

    pub fn is_alive(&self) -> bool {
        lock(&self.shared).alive
    }
}
