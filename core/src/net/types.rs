//! Shared connection-layer types

use crate::config::ConfigError;

use super::auth::AuthError;
use super::codec::PacketError;
use super::pipe::PipeError;
use super::transport::TransportError;

/// Errors returned by the public `Peer` and `OwnerRelay` operations
#[derive(Debug, thiserror::Error)]
pub enum NetError {
    #[error("connection is not initialized yet")]
    NotInitialized,

    #[error("connection is not active")]
    Inactive,

    #[error("connection is already active")]
    AlreadyActive,

    #[error("no password prompt is outstanding")]
    NotAwaitingPassword,

    #[error("packet error: {0}")]
    Packet(#[from] PacketError),

    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("server pipe error: {0}")]
    Pipe(#[from] PipeError),

    #[error("authentication error: {0}")]
    Auth(#[from] AuthError),

    #[error("config error: {0}")]
    Config(#[from] ConfigError),
}

/// Byte and packet counters for one connection
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TrafficStats {
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub packets_sent: u64,
    pub packets_received: u64,
}

impl TrafficStats {
    pub fn record_sent(&mut self, bytes: usize) {
        if bytes > 0 {
            self.bytes_sent += bytes as u64;
            self.packets_sent += 1;
        }
    }

    pub fn record_received(&mut self, bytes: usize) {
        self.bytes_received += bytes as u64;
        self.packets_received += 1;
    }

    pub fn merge(&mut self, other: &TrafficStats) {
        self.bytes_sent += other.bytes_sent;
        self.bytes_received += other.bytes_received;
        self.packets_sent += other.packets_sent;
        self.packets_received += other.packets_received;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stats_counting() {
        let mut stats = TrafficStats::default();
        stats.record_sent(100);
        stats.record_sent(0);
        stats.record_received(40);

        assert_eq!(stats.bytes_sent, 100);
        assert_eq!(stats.packets_sent, 1);
        assert_eq!(stats.bytes_received, 40);
        assert_eq!(stats.packets_received, 1);

        let mut total = TrafficStats::default();
        total.merge(&stats);
        total.merge(&stats);
        assert_eq!(total.bytes_sent, 200);
        assert_eq!(total.packets_received, 2);
    }
}
