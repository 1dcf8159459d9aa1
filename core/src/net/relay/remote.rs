//! Per-remote state held by the owner relay

use std::collections::VecDeque;
use std::time::Duration;

use tidewire_shared::{AccountId, AccountInfo, Endpoint};

use crate::config::NetConfig;
use crate::net::codec::{OutgoingPacket, PacketCodec};
use crate::net::disconnect::DisconnectPacket;
use crate::net::header::InitStep;
use crate::net::init::HostHandshake;
use crate::net::transport::{Transport, send_packet};
use crate::net::types::TrafficStats;

/// Where a remote is in ticket verification
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthStatus {
    /// No ticket verified (yet, or none required)
    NotAuthenticated,
    /// Verification in flight; inbound packets are buffered
    Pending,
    Authenticated,
    /// Verification failed; the remote is being disconnected
    Failed,
}

/// Read-only snapshot of one remote
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemotePeerState {
    pub endpoint: Endpoint,
    pub auth_status: AuthStatus,
    pub init_step: InitStep,
    pub account: Option<AccountId>,
    /// Packets waiting for verification to finish
    pub buffered: usize,
    /// A disconnect packet was sent and the grace period is running
    pub disconnecting: bool,
    /// The server subprocess has been told about this remote
    pub announced: bool,
    pub stats: TrafficStats,
}

/// Disconnect sent to the remote, server not told yet
#[derive(Debug)]
pub(super) struct PendingDisconnect {
    pub remaining: Duration,
    pub packet: DisconnectPacket,
}

#[derive(Debug)]
pub(super) struct RemotePeer {
    pub endpoint: Endpoint,
    /// Distinguishes this entry from an earlier one for the same endpoint
    pub generation: u64,
    pub account: Option<AccountInfo>,
    pub auth_status: AuthStatus,
    pub handshake: HostHandshake,
    pub codec: PacketCodec,
    pub buffered: VecDeque<Vec<u8>>,
    pub pending_disconnect: Option<PendingDisconnect>,
    pub timeout_remaining: Duration,
    pub heartbeat_remaining: Duration,
    pub handshake_remaining: Duration,
    heartbeat_interval: Duration,
    pub announced: bool,
    pub stats: TrafficStats,
}

impl RemotePeer {
    pub fn new(endpoint: Endpoint, generation: u64, config: &NetConfig, round_active: bool) -> Self {
        Self {
            endpoint,
            generation,
            account: None,
            auth_status: AuthStatus::NotAuthenticated,
            handshake: HostHandshake::new(config.handshake.password_retries, config.handshake.max_init_messages),
            codec: PacketCodec::new(config, true),
            buffered: VecDeque::new(),
            pending_disconnect: None,
            timeout_remaining: config.timing.timeout(round_active),
            heartbeat_remaining: config.timing.heartbeat_interval(),
            handshake_remaining: config.timing.handshake_timeout(),
            heartbeat_interval: config.timing.heartbeat_interval(),
            announced: false,
            stats: TrafficStats::default(),
        }
    }

    pub fn is_disconnecting(&self) -> bool {
        self.pending_disconnect.is_some()
    }

    /// Initialized and not on its way out
    pub fn is_ready(&self) -> bool {
        self.handshake.is_complete() && !self.is_disconnecting()
    }

    /// Send packets to this remote, returning the bytes handed to the transport
    pub fn transmit<T: Transport>(&mut self, transport: &mut T, packets: &[OutgoingPacket]) -> usize {
        let mut total = 0;
        for packet in packets {
            let sent = send_packet(transport, &self.endpoint, packet);
            self.stats.record_sent(sent);
            total += sent;
        }
        self.heartbeat_remaining = self.heartbeat_interval;
        total
    }

    pub fn snapshot(&self) -> RemotePeerState {
        RemotePeerState {
            endpoint: self.endpoint.clone(),
            auth_status: self.auth_status,
            init_step: self.handshake.init_step(),
            account: self.account.as_ref().map(|a| a.id.clone()),
            buffered: self.buffered.len(),
            disconnecting: self.is_disconnecting(),
            announced: self.announced,
            stats: self.stats,
        }
    }
}
